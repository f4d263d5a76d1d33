//! # Generic gRPC Client
//!
//! Wraps `tonic::client::Grpc` so any method can be called given only its
//! [`MethodDescriptor`]. The HTTP/2 path (`/package.Service/Method`) is built at runtime and
//! messages go through the [`DynamicCodec`].
//!
//! Calls return the raw `tonic::Response`, headers and trailers included; the session layer
//! decides what to make of them.
use super::codec::DynamicCodec;
use crate::BoxError;
use futures_util::Stream;
use http_body::Body as HttpBody;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::str::FromStr;
use tonic::{
    Request, Response, Status, Streaming,
    client::GrpcService,
    metadata::{
        MetadataKey, MetadataMap, MetadataValue,
        errors::{InvalidMetadataKey, InvalidMetadataValue},
    },
    transport::Channel,
};

#[derive(thiserror::Error, Debug)]
pub enum GrpcRequestError {
    #[error("The client was not ready: '{0}'")]
    ClientNotReady(#[source] BoxError),
    #[error("Invalid metadata (header) key '{key}': '{source}'")]
    InvalidMetadataKey {
        key: String,
        source: InvalidMetadataKey,
    },
    #[error("Invalid metadata (header) value for key '{key}': '{source}'")]
    InvalidMetadataValue {
        key: String,
        source: InvalidMetadataValue,
    },
}

/// A dynamic gRPC client over any tonic transport.
#[derive(Debug, Clone)]
pub struct GrpcClient<S = Channel> {
    client: tonic::client::Grpc<S>,
}

impl<S> GrpcClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        let client = tonic::client::Grpc::new(service);
        Self { client }
    }

    /// Waits until the underlying transport can take a request.
    pub async fn ready(&mut self) -> Result<(), GrpcRequestError> {
        self.client
            .ready()
            .await
            .map_err(|e| GrpcRequestError::ClientNotReady(e.into()))
    }

    /// Single request, single response.
    pub async fn unary(
        &mut self,
        method: &MethodDescriptor,
        request: Request<DynamicMessage>,
    ) -> Result<Response<DynamicMessage>, Status> {
        self.ready_or_status().await?;
        let codec = DynamicCodec::new(method.output());
        let path = http_path(method)?;
        self.client.unary(request, path, codec).await
    }

    /// Single request, stream of responses.
    pub async fn server_streaming(
        &mut self,
        method: &MethodDescriptor,
        request: Request<DynamicMessage>,
    ) -> Result<Response<Streaming<DynamicMessage>>, Status> {
        self.ready_or_status().await?;
        let codec = DynamicCodec::new(method.output());
        let path = http_path(method)?;
        self.client.server_streaming(request, path, codec).await
    }

    /// Stream of requests, single response. The response only arrives once `request`'s
    /// stream ends.
    pub async fn client_streaming<St>(
        &mut self,
        method: &MethodDescriptor,
        request: Request<St>,
    ) -> Result<Response<DynamicMessage>, Status>
    where
        St: Stream<Item = DynamicMessage> + Send + 'static,
    {
        self.ready_or_status().await?;
        let codec = DynamicCodec::new(method.output());
        let path = http_path(method)?;
        self.client.client_streaming(request, path, codec).await
    }

    /// Stream of requests, stream of responses.
    pub async fn streaming<St>(
        &mut self,
        method: &MethodDescriptor,
        request: Request<St>,
    ) -> Result<Response<Streaming<DynamicMessage>>, Status>
    where
        St: Stream<Item = DynamicMessage> + Send + 'static,
    {
        self.ready_or_status().await?;
        let codec = DynamicCodec::new(method.output());
        let path = http_path(method)?;
        self.client.streaming(request, path, codec).await
    }

    async fn ready_or_status(&mut self) -> Result<(), Status> {
        self.ready()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))
    }
}

fn http_path(method: &MethodDescriptor) -> Result<http::uri::PathAndQuery, Status> {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    http::uri::PathAndQuery::try_from(path)
        .map_err(|e| Status::internal(format!("Invalid gRPC path: {e}")))
}

/// Converts `key: value` header pairs into gRPC metadata.
pub fn build_metadata(headers: &[(String, String)]) -> Result<MetadataMap, GrpcRequestError> {
    let mut metadata = MetadataMap::new();
    for (k, v) in headers {
        let key =
            MetadataKey::from_str(k).map_err(|source| GrpcRequestError::InvalidMetadataKey {
                key: k.clone(),
                source,
            })?;
        let val = MetadataValue::from_str(v).map_err(|source| {
            GrpcRequestError::InvalidMetadataValue {
                key: k.clone(),
                source,
            }
        })?;
        metadata.append(key, val);
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_pairs_are_appended() {
        let headers = vec![
            ("x-trace".to_string(), "1".to_string()),
            ("x-trace".to_string(), "2".to_string()),
        ];
        let metadata = build_metadata(&headers).unwrap();
        assert_eq!(metadata.get_all("x-trace").iter().count(), 2);
    }

    #[test]
    fn invalid_metadata_key_is_rejected() {
        let headers = vec![("bad key".to_string(), "1".to_string())];
        assert!(matches!(
            build_metadata(&headers),
            Err(GrpcRequestError::InvalidMetadataKey { key, .. }) if key == "bad key"
        ));
    }
}
