use std::time::{Duration, SystemTime};
use tonic::{Code, Status, metadata::MetadataMap};

/// A failed call, as reported to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryError {
    pub code: Code,
    pub message: String,
}

impl QueryError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn canceled() -> Self {
        Self::new(Code::Cancelled, "context canceled")
    }

    /// Human readable description of the status code.
    pub fn description(&self) -> &'static str {
        self.code.description()
    }
}

impl From<&Status> for QueryError {
    fn from(status: &Status) -> Self {
        Self::new(status.code(), status.message())
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({}): {}", self.code, self.description(), self.message)
    }
}

/// One event on the response channel.
///
/// Unary and client-stream calls produce one event. Server and bidi streams produce one
/// per received message, then a final one with `end_of_stream` set that carries the
/// trailers.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub timestamp: SystemTime,
    /// Pretty-printed JSON of the received message, empty when there is none.
    pub payload_json: String,
    pub elapsed: Option<Duration>,
    pub header: MetadataMap,
    pub trailer: MetadataMap,
    pub error: Option<QueryError>,
    pub end_of_stream: bool,
    pub sent: u64,
    pub received: u64,
}

impl QueryResponse {
    pub(crate) fn new(sent: u64, received: u64) -> Self {
        Self {
            timestamp: SystemTime::now(),
            payload_json: String::new(),
            elapsed: None,
            header: MetadataMap::new(),
            trailer: MetadataMap::new(),
            error: None,
            end_of_stream: false,
            sent,
            received,
        }
    }

    pub(crate) fn failed(error: QueryError, sent: u64, received: u64) -> Self {
        Self {
            error: Some(error),
            ..Self::new(sent, received)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether no further event will follow for the call this event belongs to.
    pub fn is_terminal(&self, server_streaming: bool) -> bool {
        self.is_error() || self.end_of_stream || !server_streaming
    }

    /// The elapsed time as displayed to users, e.g. `1.234s`.
    pub fn elapsed_text(&self) -> String {
        self.elapsed
            .map(|elapsed| format!("{:.3}s", elapsed.as_secs_f64()))
            .unwrap_or_default()
    }
}
