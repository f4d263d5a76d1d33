//! # Engine
//!
//! The client instance callers talk to. It owns the connection to the current server, the
//! one schema snapshot loaded from it, the [`QueryController`] running calls, and the
//! port-forward cache when servers sit behind a tunnel.
//!
//! Besides the [`QueryResponse`] channel, an engine hands out two notification channels:
//! short-lived progress messages ("connecting to server") and errors that do not belong
//! to any query, such as a tunnel breaking.
use crate::{
    BoxError,
    config::{SchemaSource, ServerConfig, ServerId, Settings},
    credentials::{CredentialError, CredentialProvider},
    forward::{ConnectionMarker, ForwardError, PortForwardCache, PortForwarder},
    grpc::client::GrpcClient,
    schema::{LoadError, Method, ParseWarning, SchemaLoader, Service},
    session::{CallError, QueryController, QueryResponse, SessionKey},
    value::Record,
};
use http_body::Body as HttpBody;
use std::{future::Future, sync::Arc};
use tokio::sync::mpsc;
use tonic::{
    client::GrpcService,
    transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity},
};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Invalid server address '{address}': {source}")]
    InvalidAddress {
        address: String,
        source: tonic::transport::Error,
    },
    #[error("Failed to connect: {0}")]
    Transport(#[from] tonic::transport::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No server has been loaded")]
    NoServer,
    #[error("Server {0} is not the loaded server")]
    ServerNotLoaded(ServerId),
    #[error("Service '{0}' not found")]
    ServiceNotFound(String),
    #[error("Method '{method}' not found in service '{service}'")]
    MethodNotFound { service: String, method: String },
    #[error("The server needs a port forward but no port forwarder is configured")]
    NoPortForwarder,
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Forward(#[from] ForwardError),
    #[error(transparent)]
    Call(#[from] CallError),
}

/// Opens transports to servers.
pub trait Connector<S>: Send + Sync {
    fn connect(&self, server: &ServerConfig) -> impl Future<Output = Result<S, ConnectError>> + Send;
}

/// Connects over HTTP/2 with `tonic`'s [`Channel`].
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    settings: Settings,
}

impl ChannelConnector {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

impl Connector<Channel> for ChannelConnector {
    async fn connect(&self, server: &ServerConfig) -> Result<Channel, ConnectError> {
        let mut endpoint = Endpoint::from_shared(server.address.clone())
            .map_err(|source| ConnectError::InvalidAddress {
                address: server.address.clone(),
                source,
            })?
            .connect_timeout(self.settings.connect_timeout());

        if let Some(tls) = &server.tls {
            let mut config = match &tls.ca_certificate {
                Some(ca) => ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca)),
                None => ClientTlsConfig::new().with_webpki_roots(),
            };
            if let (Some(cert), Some(key)) = (&tls.client_certificate, &tls.client_key) {
                config = config.identity(Identity::from_pem(cert, key));
            }
            if let Some(domain) = &tls.domain_name {
                config = config.domain_name(domain.clone());
            }
            endpoint = endpoint.tls_config(config)?;
        }

        if self.settings.non_blocking_connection {
            Ok(endpoint.connect_lazy())
        } else {
            Ok(endpoint.connect().await?)
        }
    }
}

/// A transient progress message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoNotice {
    Message(String),
    /// The previous message no longer applies.
    Clear,
}

/// The receiving ends of everything an [`Engine`] reports.
pub struct EngineChannels {
    pub responses: mpsc::Receiver<QueryResponse>,
    pub info: mpsc::UnboundedReceiver<InfoNotice>,
    pub errors: mpsc::UnboundedReceiver<String>,
}

/// The schema of a freshly loaded server.
#[derive(Debug, Clone)]
pub struct LoadedSchema {
    pub services: Vec<Service>,
    pub warnings: Vec<ParseWarning>,
}

/// One call as requested by the caller.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub server_id: ServerId,
    pub service: String,
    pub method: String,
    pub data: Record,
    /// Extra `key: value` headers.
    pub metadata: Vec<(String, String)>,
}

pub struct Engine<S, C> {
    settings: Settings,
    connector: C,
    credentials: Arc<dyn CredentialProvider>,
    loader: SchemaLoader,
    controller: QueryController<S>,
    forwards: Option<PortForwardCache>,
    connected: ConnectionMarker,
    transport: Option<S>,
    server: Option<(ServerId, ServerConfig)>,
    services: Vec<Service>,
    info: mpsc::UnboundedSender<InfoNotice>,
    errors: mpsc::UnboundedSender<String>,
}

impl<S, C> Engine<S, C>
where
    S: GrpcService<tonic::body::Body> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
    C: Connector<S>,
{
    pub fn new(
        settings: Settings,
        connector: C,
        credentials: Arc<dyn CredentialProvider>,
    ) -> (Self, EngineChannels) {
        let (controller, responses) = QueryController::new(&settings);
        let (info, info_rx) = mpsc::unbounded_channel();
        let (errors, errors_rx) = mpsc::unbounded_channel();

        let engine = Self {
            loader: SchemaLoader::from_settings(&settings),
            settings,
            connector,
            credentials,
            controller,
            forwards: None,
            connected: ConnectionMarker::default(),
            transport: None,
            server: None,
            services: Vec::new(),
            info,
            errors,
        };

        let channels = EngineChannels {
            responses,
            info: info_rx,
            errors: errors_rx,
        };

        (engine, channels)
    }

    /// Enables servers that are reached through a port forward.
    pub fn with_port_forwarder(mut self, forwarder: Arc<dyn PortForwarder>) -> Self {
        self.forwards = Some(PortForwardCache::new(
            forwarder,
            Arc::clone(&self.connected),
            self.errors.clone(),
        ));
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Makes `server` the current server and loads its schema, discarding the previous one.
    pub async fn load_server(
        &mut self,
        id: ServerId,
        server: ServerConfig,
    ) -> Result<LoadedSchema, EngineError> {
        self.services.clear();
        self.controller.detach();
        self.transport = None;
        *self.connected.lock() = None;
        self.server = Some((id, server.clone()));

        let (services, warnings) = match &server.schema {
            SchemaSource::Reflection => {
                let transport = self.connect(id, &server).await?;
                self.notify("loading services using reflection");
                let services = self
                    .loader
                    .from_reflection(transport, self.settings.connect_timeout())
                    .await;
                self.clear_notice();
                (services?, Vec::new())
            }
            SchemaSource::ProtoFiles {
                files,
                import_paths,
            } => {
                let schema = self
                    .loader
                    .from_files(files, import_paths)
                    .map_err(LoadError::from)?;
                for warning in &schema.warnings {
                    warn!(%warning, "proto files loaded with warnings");
                }
                (schema.services, schema.warnings)
            }
            SchemaSource::DescriptorSet { path } => {
                (self.loader.from_descriptor_set_file(path)?, Vec::new())
            }
        };

        info!(server = id, services = services.len(), "schema loaded");
        self.services = services.clone();

        Ok(LoadedSchema { services, warnings })
    }

    /// The services of the current schema snapshot.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn method(&self, service: &str, method: &str) -> Result<&Method, EngineError> {
        self.services
            .iter()
            .find(|s| s.name == service)
            .ok_or_else(|| EngineError::ServiceNotFound(service.to_string()))?
            .method(method)
            .ok_or_else(|| EngineError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            })
    }

    /// Issues a call; replies arrive on the response channel.
    ///
    /// A lost connection is re-established and the call tried once more.
    pub async fn query(&mut self, request: QueryRequest) -> Result<(), EngineError> {
        let (id, server) = self.server.clone().ok_or(EngineError::NoServer)?;
        if request.server_id != id {
            return Err(EngineError::ServerNotLoaded(request.server_id));
        }

        let method = self.method(&request.service, &request.method)?.clone();

        let mut metadata = request.metadata;
        if let Some(credential) = self.credentials.credential(&server.auth)? {
            metadata.push(credential.into_pair());
        }

        if *self.connected.lock() != Some(id) || self.transport.is_none() {
            self.connect(id, &server).await?;
        }

        let key = SessionKey::new(id, &request.service, &request.method);
        match self
            .controller
            .query(key.clone(), &method, &request.data, &metadata)
            .await
        {
            Ok(()) => Ok(()),
            Err(CallError::NotConnected(reason)) => {
                warn!(%reason, "connection lost, reconnecting");
                self.connect(id, &server).await?;
                self.controller
                    .query(key, &method, &request.data, &metadata)
                    .await?;
                Ok(())
            }
        }
    }

    pub fn cancel_query(&mut self) {
        self.controller.cancel_query();
    }

    pub fn close_stream(&mut self) -> bool {
        self.controller.close_stream()
    }

    pub fn sent_count(&self) -> u64 {
        self.controller.sent_count()
    }

    pub fn received_count(&self) -> u64 {
        self.controller.received_count()
    }

    /// Tears down the tunnel of `local_port`, if this engine manages one.
    pub fn release_forward(&self, local_port: u16) -> bool {
        self.forwards
            .as_ref()
            .is_some_and(|forwards| forwards.release(local_port))
    }

    async fn connect(&mut self, id: ServerId, server: &ServerConfig) -> Result<S, EngineError> {
        if let Some(spec) = &server.forward {
            let forwards = self.forwards.as_ref().ok_or(EngineError::NoPortForwarder)?;
            self.notify("creating port forward");
            let forwarded = forwards.ensure_forward(spec, id);
            self.clear_notice();
            let handle = forwarded?;
            debug!(local_port = handle.local_port, reused = handle.reused, "port forward ready");
        }

        self.notify("connecting to server");
        let transport = self.connector.connect(server).await;
        self.clear_notice();

        let transport = transport.inspect_err(|e| {
            warn!(address = %server.address, error = %e, "failed to connect");
            let _ = self.errors.send(e.to_string());
        })?;

        self.controller.attach(GrpcClient::new(transport.clone()));
        self.transport = Some(transport.clone());
        *self.connected.lock() = Some(id);

        Ok(transport)
    }

    fn notify(&self, message: &str) {
        let _ = self.info.send(InfoNotice::Message(message.to_string()));
    }

    fn clear_notice(&self) {
        let _ = self.info.send(InfoNotice::Clear);
    }
}
