//! # Argument Marshaler
//!
//! Builds wire-ready [`DynamicMessage`]s out of loosely typed [`Record`]s, driven by the
//! expanded [`Field`] tree of a method's input.
//!
//! ## Input conventions
//!
//! * Fields are looked up by `proto_fqn` (e.g. `echo.Note.text`), falling back to the bare
//!   field name. Missing and blank inputs (see [`Value::is_blank`]) leave the field unset.
//! * Scalars may be given as text, numbers or booleans and are parsed into the exact width
//!   of the field. Singular fields accept a one-element list, repeated scalars accept a
//!   bare value.
//! * Enums take either the numeric value or the value name.
//! * Bytes take a literal string, `{"file": "<path>"}` (read from disk) or
//!   `{"value": "<text>"}`.
//! * Repeated messages drop elements that end up setting no field.
//!
//! Building never panics into the caller: a panic raised while walking the input is caught
//! and returned as [`MarshalError::Panicked`] together with a backtrace.
use crate::{
    grpc::client::{GrpcRequestError, build_metadata},
    schema::{EnumType, Field, FieldKind, MapType, MapValueType, Method, RpcMode, ScalarType},
    value::{Record, Value},
};
use prost_reflect::{DynamicMessage, MapKey, MessageDescriptor, Value as WireValue};
use std::{
    backtrace::Backtrace,
    borrow::Cow,
    cell::{Cell, RefCell},
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::Once,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;

#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    #[error("Field '{field}': expected {expected}, found {found}")]
    UnexpectedShape {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Field '{field}': cannot parse '{input}' as {scalar}: {reason}")]
    InvalidNumber {
        field: String,
        input: String,
        scalar: ScalarType,
        reason: String,
    },

    #[error("Field '{field}': '{input}' is not a value of enum '{enum_name}'")]
    UnknownEnumValue {
        field: String,
        input: String,
        enum_name: String,
    },

    #[error("Field '{field}': failed to read file '{path}': {source}")]
    ReadFile {
        field: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Field '{field}': {reason}")]
    SetField { field: String, reason: String },

    #[error(transparent)]
    InvalidMetadata(#[from] GrpcRequestError),

    #[error("Building the request message panicked: {message}\n{backtrace}")]
    Panicked { message: String, backtrace: String },
}

/// Everything needed to issue one call.
#[derive(Debug)]
pub struct PreparedCall {
    pub message: DynamicMessage,
    pub metadata: MetadataMap,
    /// Cancels the call this message is sent with.
    pub cancel: CancellationToken,
    /// Only ever set for unary calls.
    pub deadline: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageBuilder {
    request_timeout: Option<Duration>,
}

impl MessageBuilder {
    pub fn new(request_timeout: Option<Duration>) -> Self {
        Self { request_timeout }
    }

    pub fn build(
        &self,
        method: &Method,
        data: &Record,
        metadata: &[(String, String)],
    ) -> Result<PreparedCall, MarshalError> {
        let metadata = build_metadata(metadata)?;
        let input = method.descriptor().input();
        let (message, _) = guarded(|| build_message(input, method.input_fields(), data))?;

        // Streams may legitimately run forever.
        let deadline = match method.mode {
            RpcMode::Unary => self.request_timeout,
            _ => None,
        };

        Ok(PreparedCall {
            message,
            metadata,
            cancel: CancellationToken::new(),
            deadline,
        })
    }
}

thread_local! {
    static GUARDING: Cell<bool> = const { Cell::new(false) };
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Runs `build`, turning a panic into [`MarshalError::Panicked`].
fn guarded<T>(build: impl FnOnce() -> Result<T, MarshalError>) -> Result<T, MarshalError> {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARDING.with(Cell::get) {
                let backtrace = Backtrace::force_capture().to_string();
                LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            } else {
                previous(info);
            }
        }));
    });

    GUARDING.with(|guarding| guarding.set(true));
    let result = panic::catch_unwind(AssertUnwindSafe(build));
    GUARDING.with(|guarding| guarding.set(false));

    match result {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "unknown panic".to_string()
            };
            let backtrace = LAST_BACKTRACE
                .with(|slot| slot.borrow_mut().take())
                .unwrap_or_default();
            Err(MarshalError::Panicked { message, backtrace })
        }
    }
}

/// Builds one message, returning it with the number of fields that were set.
fn build_message(
    descriptor: MessageDescriptor,
    fields: &[Field],
    data: &Record,
) -> Result<(DynamicMessage, usize), MarshalError> {
    let mut message = DynamicMessage::new(descriptor);
    let mut set = 0;

    for field in fields {
        let Some(input) = data.get(&field.proto_fqn).or_else(|| data.get(&field.name)) else {
            continue;
        };
        if input.is_blank() {
            continue;
        }
        let Some(descriptor) = field.descriptor() else {
            continue;
        };

        let name = label(field);
        if let Some(value) = convert_field(field, name, input)? {
            message
                .try_set_field(descriptor, value)
                .map_err(|e| MarshalError::SetField {
                    field: name.to_string(),
                    reason: e.to_string(),
                })?;
            set += 1;
        }
    }

    Ok((message, set))
}

fn label(field: &Field) -> &str {
    if field.proto_fqn.is_empty() {
        &field.name
    } else {
        &field.proto_fqn
    }
}

/// Converts the input of one field, `None` meaning "leave it unset".
fn convert_field(
    field: &Field,
    label: &str,
    input: &Value,
) -> Result<Option<WireValue>, MarshalError> {
    match &field.kind {
        FieldKind::Scalar(scalar) if field.repeated => {
            let mut values = Vec::new();
            for item in items(input) {
                if is_empty_element(item, *scalar == ScalarType::String) {
                    continue;
                }
                values.push(convert_scalar(*scalar, label, item)?);
            }
            Ok(Some(WireValue::List(values)))
        }
        FieldKind::Scalar(scalar) => match singular(label, input)? {
            Some(item) => convert_scalar(*scalar, label, item).map(Some),
            None => Ok(None),
        },
        FieldKind::Enum(enum_type) if field.repeated => {
            let mut values = Vec::new();
            for item in items(input) {
                if is_empty_element(item, false) {
                    continue;
                }
                values.push(convert_enum(enum_type, label, item)?);
            }
            Ok(Some(WireValue::List(values)))
        }
        FieldKind::Enum(enum_type) => match singular(label, input)? {
            Some(item) => convert_enum(enum_type, label, item).map(Some),
            None => Ok(None),
        },
        FieldKind::Map(map) => convert_map(map, label, input).map(Some),
        FieldKind::Message(message) if field.repeated => {
            let mut values = Vec::new();
            for item in items(input) {
                let record = match item {
                    Value::Record(record) => record,
                    other if other.is_blank() => continue,
                    other => return Err(shape(label, "record", other)),
                };
                let (nested, set) = build_message(message.descriptor.clone(), &message.fields, record)?;
                // Blank rows of a form, not data.
                if set > 0 {
                    values.push(WireValue::Message(nested));
                }
            }
            Ok((!values.is_empty()).then_some(WireValue::List(values)))
        }
        FieldKind::Message(message) => {
            let record = match singular(label, input)? {
                Some(Value::Record(record)) => record,
                Some(other) => return Err(shape(label, "record", other)),
                None => return Ok(None),
            };
            let (nested, _) = build_message(message.descriptor.clone(), &message.fields, record)?;
            Ok(Some(WireValue::Message(nested)))
        }
    }
}

fn convert_map(map: &MapType, label: &str, input: &Value) -> Result<WireValue, MarshalError> {
    let record = match singular(label, input)? {
        Some(Value::Record(record)) => record,
        Some(other) => return Err(shape(label, "record", other)),
        None => return Ok(WireValue::Map(HashMap::new())),
    };

    let key_field = Field::anonymous(map.key);
    let mut entries = HashMap::with_capacity(record.len());

    for (key, value) in record {
        if key.is_empty() || value.is_blank() {
            continue;
        }

        let key = convert_field(&key_field, label, &Value::String(key.clone()))?
            .and_then(map_key)
            .ok_or_else(|| MarshalError::SetField {
                field: label.to_string(),
                reason: format!("'{key}' is not a valid {} map key", map.key),
            })?;

        let value = match &map.value {
            MapValueType::Scalar(scalar) => {
                match convert_field(&Field::anonymous(*scalar), label, value)? {
                    Some(value) => value,
                    None => continue,
                }
            }
            MapValueType::Enum(enum_type) => match singular(label, value)? {
                Some(item) => convert_enum(enum_type, label, item)?,
                None => continue,
            },
            MapValueType::Message { .. } => {
                let Some(descriptor) = map.value_descriptor.kind().as_message().cloned() else {
                    continue;
                };
                let record = match singular(label, value)? {
                    Some(Value::Record(record)) => record,
                    Some(other) => return Err(shape(label, "record", other)),
                    None => continue,
                };
                let (nested, _) = build_message(descriptor, &map.value_fields, record)?;
                WireValue::Message(nested)
            }
        };

        entries.insert(key, value);
    }

    Ok(WireValue::Map(entries))
}

fn map_key(value: WireValue) -> Option<MapKey> {
    match value {
        WireValue::Bool(b) => Some(MapKey::Bool(b)),
        WireValue::I32(n) => Some(MapKey::I32(n)),
        WireValue::I64(n) => Some(MapKey::I64(n)),
        WireValue::U32(n) => Some(MapKey::U32(n)),
        WireValue::U64(n) => Some(MapKey::U64(n)),
        WireValue::String(s) => Some(MapKey::String(s)),
        _ => None,
    }
}

/// The elements of a repeated input; a bare value counts as one element.
fn items(input: &Value) -> &[Value] {
    match input {
        Value::List(items) => items,
        other => std::slice::from_ref(other),
    }
}

/// Unwraps the single value of a singular input.
fn singular<'a>(label: &str, input: &'a Value) -> Result<Option<&'a Value>, MarshalError> {
    match input {
        Value::List(items) => match items.as_slice() {
            [] => Ok(None),
            [item] if item.is_blank() => Ok(None),
            [item] => Ok(Some(item)),
            _ => Err(shape(label, "a single value", input)),
        },
        other if other.is_blank() => Ok(None),
        other => Ok(Some(other)),
    }
}

fn is_empty_element(item: &Value, keep_empty_strings: bool) -> bool {
    match item {
        Value::Null => true,
        Value::String(s) => s.is_empty() && !keep_empty_strings,
        _ => false,
    }
}

fn shape(label: &str, expected: &'static str, found: &Value) -> MarshalError {
    MarshalError::UnexpectedShape {
        field: label.to_string(),
        expected,
        found: found.kind(),
    }
}

fn text<'a>(label: &str, input: &'a Value) -> Result<Cow<'a, str>, MarshalError> {
    match input {
        Value::String(s) => Ok(Cow::Borrowed(s.trim())),
        Value::Number(n) => Ok(Cow::Owned(n.to_string())),
        Value::Bool(b) => Ok(Cow::Owned(b.to_string())),
        other => Err(shape(label, "a scalar", other)),
    }
}

fn convert_scalar(
    scalar: ScalarType,
    label: &str,
    input: &Value,
) -> Result<WireValue, MarshalError> {
    let invalid = |input: &str, reason: String| MarshalError::InvalidNumber {
        field: label.to_string(),
        input: input.to_string(),
        scalar,
        reason,
    };

    let value = match scalar {
        ScalarType::String => match input {
            Value::String(s) => WireValue::String(s.clone()),
            other => WireValue::String(text(label, other)?.into_owned()),
        },
        ScalarType::Bytes => WireValue::Bytes(bytes(label, input)?.into()),
        ScalarType::Bool => match input {
            Value::Bool(b) => WireValue::Bool(*b),
            other => {
                let text = text(label, other)?;
                let parsed = text
                    .parse::<bool>()
                    .map_err(|e| invalid(&text, e.to_string()))?;
                WireValue::Bool(parsed)
            }
        },
        ScalarType::Int32 | ScalarType::Sint32 | ScalarType::Sfixed32 => {
            let text = text(label, input)?;
            WireValue::I32(text.parse().map_err(|e| invalid(&text, format!("{e}")))?)
        }
        ScalarType::Int64 | ScalarType::Sint64 | ScalarType::Sfixed64 => {
            let text = text(label, input)?;
            WireValue::I64(text.parse().map_err(|e| invalid(&text, format!("{e}")))?)
        }
        ScalarType::Uint32 | ScalarType::Fixed32 => {
            let text = text(label, input)?;
            WireValue::U32(text.parse().map_err(|e| invalid(&text, format!("{e}")))?)
        }
        ScalarType::Uint64 | ScalarType::Fixed64 => {
            let text = text(label, input)?;
            WireValue::U64(text.parse().map_err(|e| invalid(&text, format!("{e}")))?)
        }
        ScalarType::Float => {
            let text = text(label, input)?;
            let parsed: f32 = text.parse().map_err(|e| invalid(&text, format!("{e}")))?;
            if parsed.is_infinite() && !names_infinity(&text) {
                return Err(invalid(&text, "value out of range".to_string()));
            }
            WireValue::F32(parsed)
        }
        ScalarType::Double => {
            let text = text(label, input)?;
            let parsed: f64 = text.parse().map_err(|e| invalid(&text, format!("{e}")))?;
            if parsed.is_infinite() && !names_infinity(&text) {
                return Err(invalid(&text, "value out of range".to_string()));
            }
            WireValue::F64(parsed)
        }
    };

    Ok(value)
}

fn names_infinity(text: &str) -> bool {
    text.to_ascii_lowercase().contains("inf")
}

fn bytes(label: &str, input: &Value) -> Result<Vec<u8>, MarshalError> {
    match input {
        Value::String(s) => Ok(s.clone().into_bytes()),
        Value::Record(record) => {
            if let Some(path) = record.get("file").and_then(Value::as_str) {
                return std::fs::read(path).map_err(|source| MarshalError::ReadFile {
                    field: label.to_string(),
                    path: PathBuf::from(path),
                    source,
                });
            }
            match record.get("value") {
                Some(Value::String(s)) => Ok(s.clone().into_bytes()),
                _ => Err(MarshalError::UnexpectedShape {
                    field: label.to_string(),
                    expected: "a string, {\"file\": path} or {\"value\": string}",
                    found: input.kind(),
                }),
            }
        }
        other => Err(shape(label, "a string", other)),
    }
}

fn convert_enum(
    enum_type: &EnumType,
    label: &str,
    input: &Value,
) -> Result<WireValue, MarshalError> {
    let text = text(label, input)?;

    if let Ok(number) = text.parse::<i32>() {
        return Ok(WireValue::EnumNumber(number));
    }

    enum_type
        .number_of(&text)
        .map(WireValue::EnumNumber)
        .ok_or_else(|| MarshalError::UnknownEnumValue {
            field: label.to_string(),
            input: text.into_owned(),
            enum_name: enum_type.type_name.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_while_building_becomes_an_error() {
        let items: Vec<u32> = Vec::new();
        let index = items.len() + 3;

        let result = guarded(|| Ok(items[index]));

        match result {
            Err(MarshalError::Panicked { message, backtrace }) => {
                assert!(message.contains("index out of bounds"), "{message}");
                assert!(!backtrace.is_empty());
            }
            other => panic!("expected a caught panic, got {other:?}"),
        }
    }

    #[test]
    fn guard_passes_results_through() {
        assert_eq!(guarded(|| Ok(7)).unwrap(), 7);
        assert!(matches!(
            guarded::<()>(|| Err(MarshalError::ReadFile {
                field: "blob".to_string(),
                path: PathBuf::from("/missing"),
                source: std::io::ErrorKind::NotFound.into(),
            })),
            Err(MarshalError::ReadFile { .. })
        ));
    }
}
