//! The background tasks driving each call shape.
//!
//! Every task treats its session's cancellation token as a regular way out: it reports a
//! canceled event (unless it only sends) and stops.
use super::response::{QueryError, QueryResponse};
use crate::{BoxError, decode::ResponseDecoder, grpc::client::GrpcClient, marshal::PreparedCall};
use http_body::Body as HttpBody;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{
    Code, Request, Response, Status, Streaming, client::GrpcService, metadata::MetadataMap,
};
use tracing::{debug, error};

/// Sent and received message counts of one session.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl Counters {
    pub(crate) fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub(crate) fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub(crate) fn add_sent(&self) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }

    fn add_received(&self) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }
}

/// What every task needs to report on one call. The client travels separately so that
/// borrowing the context across an `.await` never requires the transport to be `Sync`.
pub(super) struct CallContext {
    pub method: MethodDescriptor,
    pub counters: Arc<Counters>,
    pub responses: mpsc::Sender<QueryResponse>,
    pub cancel: CancellationToken,
    pub decoder: ResponseDecoder,
}

impl CallContext {
    async fn emit(&self, event: QueryResponse) {
        if self.responses.send(event).await.is_err() {
            debug!("response channel closed, dropping event");
        }
    }

    fn event(&self) -> QueryResponse {
        QueryResponse::new(self.counters.sent(), self.counters.received())
    }

    async fn emit_error(&self, error: QueryError, started: Instant) {
        let mut event = QueryResponse::failed(error, self.counters.sent(), self.counters.received());
        event.elapsed = Some(started.elapsed());
        self.emit(event).await;
    }

    async fn emit_canceled(&self, started: Instant) {
        debug!("stream canceled");
        self.emit_error(QueryError::canceled(), started).await;
    }

    /// Decodes one received message and reports it.
    async fn emit_message(
        &self,
        message: &DynamicMessage,
        header: MetadataMap,
        trailer: MetadataMap,
        started: Instant,
    ) {
        match self.decoder.decode(message, &self.method.output()) {
            Ok(payload_json) => {
                let mut event = self.event();
                event.payload_json = payload_json;
                event.elapsed = Some(started.elapsed());
                event.header = header;
                event.trailer = trailer;
                self.emit(event).await;
            }
            Err(e) => {
                self.emit_error(QueryError::new(Code::Internal, e.to_string()), started)
                    .await
            }
        }
    }

    async fn emit_reply(&self, result: Result<Response<DynamicMessage>, Status>, started: Instant) {
        match result {
            Ok(response) => {
                self.counters.add_received();
                let (header, message, _) = response.into_parts();
                self.emit_message(&message, header, MetadataMap::new(), started)
                    .await;
            }
            Err(status) => self.emit_error(QueryError::from(&status), started).await,
        }
    }
}

pub(super) fn request<T>(metadata: MetadataMap, deadline: Option<Duration>, payload: T) -> Request<T> {
    let mut request = Request::from_parts(metadata, Default::default(), payload);
    if let Some(deadline) = deadline {
        request.set_timeout(deadline);
    }
    request
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    call: impl Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, call)
            .await
            .unwrap_or_else(|_| Err(Status::deadline_exceeded("context deadline exceeded"))),
        None => call.await,
    }
}

fn join_status(error: tokio::task::JoinError) -> Status {
    if error.is_cancelled() {
        Status::cancelled("call aborted")
    } else {
        Status::internal(format!("call task failed: {error}"))
    }
}

pub(super) async fn unary<S>(mut client: GrpcClient<S>, ctx: CallContext, call: PreparedCall)
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    let started = Instant::now();
    let request = request(call.metadata, call.deadline, call.message);
    ctx.counters.add_sent();

    let cancel = ctx.cancel.clone();
    let method = ctx.method.clone();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = with_deadline(call.deadline, client.unary(&method, request)) => Some(result),
    };

    match result {
        Some(result) => ctx.emit_reply(result, started).await,
        None => ctx.emit_canceled(started).await,
    }
}

pub(super) async fn client_stream<S>(
    mut client: GrpcClient<S>,
    ctx: CallContext,
    metadata: MetadataMap,
    mut outbound: mpsc::Receiver<DynamicMessage>,
    mut close: mpsc::Receiver<()>,
) where
    S: GrpcService<tonic::body::Body> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    let started = Instant::now();
    let (upstream_tx, upstream_rx) = mpsc::channel(1);
    let mut upstream = Some(upstream_tx);

    let request = request(metadata, None, ReceiverStream::new(upstream_rx));
    let method = ctx.method.clone();
    let mut call = tokio::spawn(async move { client.client_streaming(&method, request).await });

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                call.abort();
                ctx.emit_canceled(started).await;
                return;
            }
            message = outbound.recv() => match (message, upstream.as_ref()) {
                (Some(message), Some(tx)) => {
                    // A server that stops reading must not hide a cancellation.
                    tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => {
                            call.abort();
                            ctx.emit_canceled(started).await;
                            return;
                        }
                        sent = tx.send(message) => if sent.is_err() {
                            debug!("request stream closed by the call");
                        },
                    }
                }
                _ => {
                    call.abort();
                    return;
                }
            },
            Some(()) = close.recv() => {
                debug!("close & receive stream");
                // Dropping the sender ends the request stream.
                upstream.take();
                let result = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        call.abort();
                        ctx.emit_canceled(started).await;
                        return;
                    }
                    result = &mut call => result.unwrap_or_else(|e| Err(join_status(e))),
                };
                ctx.emit_reply(result, started).await;
                return;
            }
            result = &mut call => {
                // The server answered (or failed) before the stream was closed.
                let result = result.unwrap_or_else(|e| Err(join_status(e)));
                ctx.emit_reply(result, started).await;
                return;
            }
        }
    }
}

pub(super) async fn server_stream<S>(mut client: GrpcClient<S>, ctx: CallContext, call: PreparedCall)
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    let started = Instant::now();
    let request = request(call.metadata, None, call.message);
    ctx.counters.add_sent();

    let cancel = ctx.cancel.clone();
    let method = ctx.method.clone();
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            ctx.emit_canceled(started).await;
            return;
        }
        response = client.server_streaming(&method, request) => response,
    };

    match response {
        Ok(response) => {
            let (header, stream, _) = response.into_parts();
            receive_loop(&ctx, header, stream, started).await;
        }
        Err(status) => ctx.emit_error(QueryError::from(&status), started).await,
    }
}

/// Runs a bidi call as two independent tasks: one forwarding outbound messages, one
/// receiving. The sender never reports anything; the receiver owns every event.
pub(super) async fn bidi_stream<S>(
    mut client: GrpcClient<S>,
    ctx: CallContext,
    metadata: MetadataMap,
    outbound: mpsc::Receiver<DynamicMessage>,
    close: mpsc::Receiver<()>,
) where
    S: GrpcService<tonic::body::Body> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    let started = Instant::now();
    let (upstream_tx, upstream_rx) = mpsc::channel(1);
    let finished = CancellationToken::new();

    let sender = tokio::spawn(send_loop(
        ctx.cancel.clone(),
        finished.clone(),
        outbound,
        close,
        upstream_tx,
    ));

    let request = request(metadata, None, ReceiverStream::new(upstream_rx));
    let cancel = ctx.cancel.clone();
    let method = ctx.method.clone();
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        response = client.streaming(&method, request) => Some(response),
    };

    match response {
        None => ctx.emit_canceled(started).await,
        Some(Ok(response)) => {
            let (header, stream, _) = response.into_parts();
            receive_loop(&ctx, header, stream, started).await;
        }
        Some(Err(status)) => ctx.emit_error(QueryError::from(&status), started).await,
    }

    finished.cancel();
    if let Err(e) = sender.await {
        debug!("send loop failed: {e}");
    }
}

async fn send_loop(
    cancel: CancellationToken,
    finished: CancellationToken,
    mut outbound: mpsc::Receiver<DynamicMessage>,
    mut close: mpsc::Receiver<()>,
    upstream: mpsc::Sender<DynamicMessage>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = finished.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => {
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = finished.cancelled() => break,
                        sent = upstream.send(message) => sent,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
                None => break,
            },
            Some(()) = close.recv() => {
                debug!("close send");
                break;
            }
        }
    }
    // Dropping `upstream` half-closes the call.
}

async fn receive_loop(
    ctx: &CallContext,
    header: MetadataMap,
    mut stream: Streaming<DynamicMessage>,
    started: Instant,
) {
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                ctx.emit_canceled(started).await;
                return;
            }
            message = stream.message() => match message {
                Ok(Some(message)) => {
                    ctx.counters.add_received();
                    ctx.emit_message(&message, header.clone(), MetadataMap::new(), started)
                        .await;
                }
                Ok(None) => {
                    let trailer = stream.trailers().await.ok().flatten().unwrap_or_default();
                    let mut event = ctx.event();
                    event.elapsed = Some(started.elapsed());
                    event.header = header;
                    event.trailer = trailer;
                    event.end_of_stream = true;
                    ctx.emit(event).await;
                    return;
                }
                Err(status) if status.code() == Code::Cancelled => {
                    ctx.emit_canceled(started).await;
                    return;
                }
                Err(status) => {
                    error!(method = ctx.method.full_name(), %status, "failed to receive message");
                    ctx.emit_error(QueryError::from(&status), started).await;
                    return;
                }
            }
        }
    }
}
