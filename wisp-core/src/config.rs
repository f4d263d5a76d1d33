//! # Configuration
//!
//! Engine-wide [`Settings`] and the read-only [`ServerConfig`] records supplied by the
//! workspace store. Both are plain serde types; persisting them is the caller's job.
use crate::forward::ForwardSpec;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

/// Identifier of a server record in the workspace store.
pub type ServerId = i64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read settings file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid settings file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Seconds to wait for a connection (and for a reflection pass) before giving up.
    pub connect_timeout_secs: u64,
    /// Deadline of unary calls in seconds, `0` disables it. Streams never get one.
    pub request_timeout_secs: u64,
    /// Connect lazily on first use instead of blocking until the server answers.
    pub non_blocking_connection: bool,
    pub sort_methods_by_name: bool,
    /// How many times a recursive message type may re-expand itself.
    pub max_loop_depth: usize,
    pub response_channel_capacity: usize,
    pub request_queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            non_blocking_connection: true,
            sort_methods_by_name: true,
            max_loop_depth: 10,
            response_channel_capacity: 10,
            request_queue_capacity: 10,
        }
    }
}

impl Settings {
    /// Loads settings from a JSON file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// The unary deadline, if one is configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

/// A server as described by the workspace store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The server URI (e.g. `http://localhost:50051`).
    pub address: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub schema: SchemaSource,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub forward: Option<ForwardSpec>,
}

impl ServerConfig {
    /// A plaintext server whose schema is loaded through reflection.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tls: None,
            schema: SchemaSource::default(),
            auth: AuthConfig::default(),
            forward: None,
        }
    }
}

/// PEM encoded material for a TLS connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub ca_certificate: Option<String>,
    pub client_certificate: Option<String>,
    pub client_key: Option<String>,
    /// Overrides the name the server certificate is verified against.
    pub domain_name: Option<String>,
}

/// Where the schema of a server comes from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchemaSource {
    #[default]
    Reflection,
    ProtoFiles {
        files: Vec<PathBuf>,
        #[serde(default)]
        import_paths: Vec<PathBuf>,
    },
    DescriptorSet {
        path: PathBuf,
    },
}

/// How calls to a server authenticate.
///
/// The engine only consumes finished credentials (see [`crate::credentials`]); the JWT and
/// GCE variants are descriptors for an external provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    Basic {
        login: String,
        password: String,
    },
    Bearer {
        token: String,
        #[serde(default)]
        header_prefix: Option<String>,
    },
    Jwt {
        algorithm: String,
        #[serde(default)]
        header_prefix: Option<String>,
        #[serde(default)]
        claims: serde_json::Map<String, serde_json::Value>,
    },
    Gce {
        #[serde(default)]
        scopes: Vec<String>,
    },
}

impl AuthConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthConfig::None => "none",
            AuthConfig::Basic { .. } => "basic",
            AuthConfig::Bearer { .. } => "bearer",
            AuthConfig::Jwt { .. } => "jwt",
            AuthConfig::Gce { .. } => "gce",
        }
    }
}
