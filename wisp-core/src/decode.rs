//! # Response Decoder
//!
//! Renders received messages as pretty-printed JSON, keeping the field names of the
//! `.proto` definition.
use prost_reflect::{DynamicMessage, MessageDescriptor, ReflectMessage, SerializeOptions};

/// What `google.protobuf.Empty` replies are rendered as.
pub const EMPTY_RESPONSE: &str = "google.protobuf.Empty";

const EMPTY_TYPE_NAME: &str = "google.protobuf.Empty";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Unsupported response type '{0}'")]
    UnsupportedType(String),
    #[error("Failed to render the response as JSON: '{0}'")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseDecoder;

impl ResponseDecoder {
    /// Decodes `message`, which must be of the `expected` output type of the call it was
    /// received on.
    pub fn decode(
        &self,
        message: &DynamicMessage,
        expected: &MessageDescriptor,
    ) -> Result<String, DecodeError> {
        let descriptor = message.descriptor();
        if descriptor.full_name() != expected.full_name() {
            return Err(DecodeError::UnsupportedType(
                descriptor.full_name().to_string(),
            ));
        }

        if descriptor.full_name() == EMPTY_TYPE_NAME {
            return Ok(EMPTY_RESPONSE.to_string());
        }

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"  ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        let options = SerializeOptions::new().use_proto_field_name(true);
        message.serialize_with_options(&mut serializer, &options)?;

        // serde_json only ever writes valid UTF-8.
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::{DescriptorPool, Value};

    fn pool() -> DescriptorPool {
        DescriptorPool::decode(echo_service::FILE_DESCRIPTOR_SET).unwrap()
    }

    #[test]
    fn renders_proto_field_names() {
        let pool = pool();
        let desc = pool.get_message_by_name("echo.Everything").unwrap();
        let mut message = DynamicMessage::new(desc.clone());
        message.set_field_by_name("text", Value::String("hi".into()));
        message.set_field_by_name("small", Value::I32(7));

        let json = ResponseDecoder.decode(&message, &desc).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["text"], "hi");
        assert_eq!(parsed["small"], 7);
        assert!(json.contains("\n  \"small\""));
    }

    #[test]
    fn empty_reply_is_a_sentinel() {
        let pool = pool();
        let desc = pool.get_message_by_name("google.protobuf.Empty").unwrap();
        let message = DynamicMessage::new(desc.clone());

        assert_eq!(
            ResponseDecoder.decode(&message, &desc).unwrap(),
            EMPTY_RESPONSE
        );
    }

    #[test]
    fn unexpected_type_is_rejected() {
        let pool = pool();
        let note = pool.get_message_by_name("echo.Note").unwrap();
        let point = pool.get_message_by_name("echo.Point").unwrap();

        let result = ResponseDecoder.decode(&DynamicMessage::new(point), &note);
        assert!(matches!(result, Err(DecodeError::UnsupportedType(name)) if name == "echo.Point"));
    }
}
