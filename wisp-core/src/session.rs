//! # Stream Session Controller
//!
//! Drives the four gRPC call shapes on top of a [`GrpcClient`] and reports every outcome
//! as a [`QueryResponse`] on one bounded channel.
//!
//! At most one session is live per controller. A session is identified by its
//! [`SessionKey`]; asking for a different key cancels whatever is running first.
//!
//! | Shape         | First `query`                       | Following `query` calls (same key) |
//! |---------------|-------------------------------------|------------------------------------|
//! | unary         | one round trip                      | replace the running call           |
//! | client-stream | open the upload, send the message   | enqueue on the open upload         |
//! | server-stream | open the download                   | ignored while it runs              |
//! | bidi-stream   | open both directions                | enqueue on the open upload         |
//!
//! The response channel is bounded: a consumer that falls behind stalls the receive
//! loops, which in turn stop reading from the network.
mod response;
mod stream;

pub use response::{QueryError, QueryResponse};

use crate::{
    BoxError,
    config::{ServerId, Settings},
    decode::ResponseDecoder,
    grpc::client::GrpcClient,
    marshal::{MessageBuilder, PreparedCall},
    schema::{Method, RpcMode},
    value::Record,
};
use http_body::Body as HttpBody;
use prost_reflect::DynamicMessage;
use std::sync::Arc;
use stream::{CallContext, Counters};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tonic::{Code, client::GrpcService};
use tracing::debug;

/// Identifies one logical call stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub server_id: ServerId,
    pub service: String,
    pub method: String,
}

impl SessionKey {
    pub fn new(server_id: ServerId, service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            server_id,
            service: service.into(),
            method: method.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Not connected: {0}")]
    NotConnected(String),
}

struct QuerySession {
    mode: RpcMode,
    cancel: CancellationToken,
    outbound: Option<mpsc::Sender<DynamicMessage>>,
    close: mpsc::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl QuerySession {
    fn is_live(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

impl Drop for QuerySession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Owns the current session and the client it runs on.
pub struct QueryController<S> {
    client: Option<GrpcClient<S>>,
    builder: MessageBuilder,
    decoder: ResponseDecoder,
    responses: mpsc::Sender<QueryResponse>,
    queue_capacity: usize,
    key: Option<SessionKey>,
    counters: Arc<Counters>,
    session: Option<QuerySession>,
}

impl<S> QueryController<S>
where
    S: GrpcService<tonic::body::Body> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    /// Creates a controller together with the receiving end of its response channel.
    pub fn new(settings: &Settings) -> (Self, mpsc::Receiver<QueryResponse>) {
        let (responses, rx) = mpsc::channel(settings.response_channel_capacity.max(1));
        let controller = Self {
            client: None,
            builder: MessageBuilder::new(settings.request_timeout()),
            decoder: ResponseDecoder,
            responses,
            queue_capacity: settings.request_queue_capacity.max(1),
            key: None,
            counters: Arc::default(),
            session: None,
        };
        (controller, rx)
    }

    /// Sets the client calls are made on, dropping the running session.
    pub fn attach(&mut self, client: GrpcClient<S>) {
        self.session = None;
        self.client = Some(client);
    }

    /// Forgets the client, so the next call reports [`CallError::NotConnected`].
    pub fn detach(&mut self) {
        self.session = None;
        self.client = None;
    }

    pub fn is_attached(&self) -> bool {
        self.client.is_some()
    }

    /// Issues `method` with `data`, or feeds it into the open stream of the same key.
    ///
    /// Failures to build the message are reported on the response channel. Only a missing
    /// or broken connection is returned, as it is worth reconnecting and trying again.
    pub async fn query(
        &mut self,
        key: SessionKey,
        method: &Method,
        data: &Record,
        metadata: &[(String, String)],
    ) -> Result<(), CallError> {
        if self.key.as_ref() != Some(&key) {
            self.cancel_query();
            self.session = None;
            self.counters = Arc::default();
            self.key = Some(key);
        }

        let client = self
            .client
            .as_mut()
            .ok_or_else(|| CallError::NotConnected("no connection".to_string()))?;
        client
            .ready()
            .await
            .map_err(|e| CallError::NotConnected(e.to_string()))?;

        if method.mode == RpcMode::Unary {
            self.counters = Arc::default();
        }

        let call = match self.builder.build(method, data, metadata) {
            Ok(call) => call,
            Err(e) => {
                let error = QueryError::new(Code::InvalidArgument, e.to_string());
                let event =
                    QueryResponse::failed(error, self.counters.sent(), self.counters.received());
                if self.responses.send(event).await.is_err() {
                    debug!("response channel closed, dropping event");
                }
                return Ok(());
            }
        };

        match method.mode {
            RpcMode::Unary => self.start_unary(method, call),
            RpcMode::ServerStream => {
                if self.session.as_ref().is_some_and(QuerySession::is_live) {
                    debug!(method = %method.name, "server stream already running");
                    return Ok(());
                }
                self.start_server_stream(method, call);
            }
            RpcMode::ClientStream | RpcMode::BidiStream => {
                let message = match self.enqueue(call.message).await {
                    Ok(()) => return Ok(()),
                    Err(message) => message,
                };
                self.start_upload(
                    method,
                    PreparedCall {
                        message,
                        ..call
                    },
                )
                .await;
            }
        }

        Ok(())
    }

    /// Cancels the running session, if any.
    pub fn cancel_query(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
    }

    /// Asks the running client or bidi stream to half-close.
    ///
    /// Returns `false` when there is no stream to close or a close is already pending.
    pub fn close_stream(&mut self) -> bool {
        match &self.session {
            Some(session) if session.mode.is_client_streaming() && session.is_live() => {
                session.close.try_send(()).is_ok()
            }
            _ => false,
        }
    }

    pub fn sent_count(&self) -> u64 {
        self.counters.sent()
    }

    pub fn received_count(&self) -> u64 {
        self.counters.received()
    }

    pub fn current_key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    /// Hands `message` to the live upload of the current session, giving it back if
    /// there is none.
    async fn enqueue(&mut self, message: DynamicMessage) -> Result<(), DynamicMessage> {
        let Some(session) = self.session.as_ref().filter(|s| s.is_live()) else {
            return Err(message);
        };
        let Some(outbound) = &session.outbound else {
            return Err(message);
        };

        outbound.send(message).await.map_err(|e| e.0)?;
        self.counters.add_sent();
        Ok(())
    }

    fn context(
        &self,
        method: &Method,
        cancel: CancellationToken,
    ) -> Option<(GrpcClient<S>, CallContext)> {
        let client = self.client.clone()?;
        let ctx = CallContext {
            method: method.descriptor().clone(),
            counters: self.counters.clone(),
            responses: self.responses.clone(),
            cancel,
            decoder: self.decoder,
        };
        Some((client, ctx))
    }

    fn start_unary(&mut self, method: &Method, call: PreparedCall) {
        let cancel = call.cancel.clone();
        let Some((client, ctx)) = self.context(method, cancel.clone()) else {
            return;
        };
        let (close, _) = mpsc::channel(1);

        // Replacing the session cancels a call still in flight.
        self.session = Some(QuerySession {
            mode: RpcMode::Unary,
            cancel,
            outbound: None,
            close,
            tasks: vec![tokio::spawn(stream::unary(client, ctx, call))],
        });
    }

    fn start_server_stream(&mut self, method: &Method, call: PreparedCall) {
        let cancel = call.cancel.clone();
        let Some((client, ctx)) = self.context(method, cancel.clone()) else {
            return;
        };
        let (close, _) = mpsc::channel(1);

        self.session = Some(QuerySession {
            mode: RpcMode::ServerStream,
            cancel,
            outbound: None,
            close,
            tasks: vec![tokio::spawn(stream::server_stream(client, ctx, call))],
        });
    }

    /// Opens a client or bidi stream with `call.message` as its first message.
    async fn start_upload(&mut self, method: &Method, call: PreparedCall) {
        self.session = None;

        let cancel = call.cancel.clone();
        let Some((client, ctx)) = self.context(method, cancel.clone()) else {
            return;
        };

        let (outbound, outbound_rx) = mpsc::channel(self.queue_capacity);
        let (close, close_rx) = mpsc::channel(1);

        if outbound.send(call.message).await.is_ok() {
            self.counters.add_sent();
        }

        let task = match method.mode {
            RpcMode::BidiStream => tokio::spawn(stream::bidi_stream(
                client,
                ctx,
                call.metadata,
                outbound_rx,
                close_rx,
            )),
            _ => tokio::spawn(stream::client_stream(
                client,
                ctx,
                call.metadata,
                outbound_rx,
                close_rx,
            )),
        };

        self.session = Some(QuerySession {
            mode: method.mode,
            cancel,
            outbound: Some(outbound),
            close,
            tasks: vec![task],
        });
    }
}
