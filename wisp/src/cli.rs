//! # CLI
//!
//! This module defines the command-line interface of `wisp` using `clap`.
//!
//! It is responsible for parsing user input and performing validation (e.g., ensuring headers are `key:value`),
//! and for turning the connection flags into the [`ServerConfig`] the engine works with.
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use wisp_core::config::{AuthConfig, SchemaSource, ServerConfig, TlsConfig};

#[derive(Parser)]
#[command(name = "wisp", version, about = "Dynamic gRPC client")]
pub struct Cli {
    /// The server URL to connect to (e.g. http://localhost:50051)
    pub url: String,

    #[command(flatten)]
    pub server: ServerArgs,

    /// Settings file, defaults to `settings.json` in the user's config directory
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// How to reach the server and where its schema comes from.
#[derive(Args)]
pub struct ServerArgs {
    /// Load the schema from these `.proto` files instead of server reflection
    #[arg(long = "proto", global = true)]
    pub protos: Vec<PathBuf>,

    /// Directories imports of the `.proto` files are resolved against
    #[arg(short = 'I', long = "import-path", global = true)]
    pub import_paths: Vec<PathBuf>,

    /// Load the schema from a compiled descriptor set (.bin)
    #[arg(long, global = true, conflicts_with = "protos")]
    pub file_descriptor_set: Option<PathBuf>,

    /// Connect over TLS, verifying the server against the system roots
    #[arg(long, global = true)]
    pub tls: bool,

    /// PEM encoded CA certificate to verify the server with (implies --tls)
    #[arg(long, global = true)]
    pub ca_cert: Option<PathBuf>,

    /// Send `authorization: Bearer <TOKEN>` with every call
    #[arg(long, global = true, conflicts_with = "basic")]
    pub bearer: Option<String>,

    /// Send basic credentials (`login:password`) with every call
    #[arg(long, global = true, value_parser = parse_basic)]
    pub basic: Option<(String, String)>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Perform a gRPC call to a server
    ///
    /// This command connects to a gRPC server and executes a method using a JSON body.
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// wisp http://localhost:50051 call my.pkg.Service/Method --body '{"key": "value"}'
    /// ```
    Call {
        /// Endpoint (package.Service/Method)
        #[arg(value_parser = parse_endpoint)]
        endpoint: (String, String),
        /// JSON body (Object, or an Array of objects for client streams)
        #[arg(long, value_parser = parse_body, default_value = "{}")]
        body: serde_json::Value,

        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },

    /// List the services of the server and their methods
    List,

    /// Describe the input of a method as the engine sees it
    Describe {
        /// Method name (e.g. my.package.Service/Method)
        #[arg(value_parser = parse_endpoint)]
        method: (String, String),
    },
}

impl ServerArgs {
    pub fn server_config(&self, url: &str) -> anyhow::Result<ServerConfig> {
        let schema = match (&self.file_descriptor_set, self.protos.is_empty()) {
            (Some(path), _) => SchemaSource::DescriptorSet { path: path.clone() },
            (None, false) => SchemaSource::ProtoFiles {
                files: self.protos.clone(),
                import_paths: self.import_paths.clone(),
            },
            (None, true) => SchemaSource::Reflection,
        };

        let tls = match &self.ca_cert {
            Some(path) => Some(TlsConfig {
                ca_certificate: Some(
                    std::fs::read_to_string(path)
                        .with_context(|| format!("Failed to read CA certificate {}", path.display()))?,
                ),
                ..TlsConfig::default()
            }),
            None if self.tls => Some(TlsConfig::default()),
            None => None,
        };

        let auth = match (&self.bearer, &self.basic) {
            (Some(token), _) => AuthConfig::Bearer {
                token: token.clone(),
                header_prefix: None,
            },
            (None, Some((login, password))) => AuthConfig::Basic {
                login: login.clone(),
                password: password.clone(),
            },
            (None, None) => AuthConfig::None,
        };

        Ok(ServerConfig {
            tls,
            schema,
            auth,
            ..ServerConfig::new(url)
        })
    }
}

fn parse_endpoint(value: &str) -> Result<(String, String), String> {
    let (service, method) = value.split_once('/').ok_or_else(|| {
        format!("Invalid endpoint format: '{value}'. Expected 'package.Service/Method'",)
    })?;

    if service.trim().is_empty() || method.trim().is_empty() {
        return Err("Service and Method names cannot be empty".to_string());
    }

    Ok((service.to_string(), method.to_string()))
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    s.split_once(':')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| "Format must be 'key:value'".to_string())
}

fn parse_basic(s: &str) -> Result<(String, String), String> {
    s.split_once(':')
        .map(|(login, password)| (login.to_string(), password.to_string()))
        .ok_or_else(|| "Format must be 'login:password'".to_string())
}

fn parse_body(value: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(value).map_err(|e| format!("Invalid JSON: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_needs_service_and_method() {
        assert_eq!(
            parse_endpoint("echo.EchoService/UnaryEcho").unwrap(),
            ("echo.EchoService".to_string(), "UnaryEcho".to_string())
        );
        assert!(parse_endpoint("echo.EchoService").is_err());
        assert!(parse_endpoint("/UnaryEcho").is_err());
    }

    #[test]
    fn schema_source_follows_flags() {
        let cli = Cli::parse_from([
            "wisp",
            "http://localhost:50051",
            "--proto",
            "api.proto",
            "-I",
            "protos",
            "--bearer",
            "t0k",
            "list",
        ]);
        let server = cli.server.server_config(&cli.url).unwrap();

        assert_eq!(
            server.schema,
            SchemaSource::ProtoFiles {
                files: vec![PathBuf::from("api.proto")],
                import_paths: vec![PathBuf::from("protos")],
            }
        );
        assert!(matches!(server.auth, AuthConfig::Bearer { token, .. } if token == "t0k"));
        assert!(server.tls.is_none());
    }

    #[test]
    fn reflection_is_the_default() {
        let cli = Cli::parse_from(["wisp", "https://api.example.com", "--tls", "list"]);
        let server = cli.server.server_config(&cli.url).unwrap();

        assert_eq!(server.schema, SchemaSource::Reflection);
        assert_eq!(server.tls, Some(TlsConfig::default()));
    }
}
