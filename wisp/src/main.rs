//! # Wisp CLI Entry Point
//!
//! The main executable for the Wisp tool. This file drives the application lifecycle:
//!
//! 1. **Initialization**: Parses command-line arguments using [`cli::Cli`], sets up logging and
//!    loads the user settings.
//! 2. **Loading**: Makes the target server the engine's current server, which loads its schema
//!    through reflection, `.proto` files or a descriptor set.
//! 3. **Execution**: Issues the call and drains the engine's response channel until the call
//!    is over.
//! 4. **Presentation**: Formats and prints the resulting data or error status to standard output/error.

mod cli;
mod formatter;

use anyhow::{Context, bail};
use clap::Parser;
use cli::{Cli, Commands};
use directories::ProjectDirs;
use formatter::{FormattedString, MethodInput, ServiceList};
use std::{path::PathBuf, process, sync::Arc};
use tracing_subscriber::EnvFilter;
use wisp_core::{
    config::{ServerConfig, ServerId, Settings},
    credentials::StaticCredentials,
    engine::{ChannelConnector, Engine, EngineChannels, InfoNotice, QueryRequest},
    tonic::transport::Channel,
    value::record_from_json,
};

/// The CLI talks to exactly one server per run.
const SERVER_ID: ServerId = 1;

type WispEngine = Engine<Channel, ChannelConnector>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    if let Err(err) = run(args).await {
        eprintln!("{}", FormattedString::from(err));
        process::exit(1);
    }
}

async fn run(args: Cli) -> anyhow::Result<()> {
    let settings = load_settings(args.settings)?;
    let server = args.server.server_config(&args.url)?;

    let (mut engine, channels) = connect(settings, server).await?;

    match args.command {
        Commands::List => {
            println!("{}", FormattedString::from(ServiceList(engine.services())));
        }
        Commands::Describe { method } => {
            let (service, method) = method;
            let method = engine.method(&service, &method)?;
            println!("{}", FormattedString::from(MethodInput(method)));
        }
        Commands::Call {
            endpoint,
            body,
            headers,
        } => {
            let (service, method) = endpoint;
            run_call(&mut engine, channels, service, method, body, headers).await?;
        }
    }

    Ok(())
}

fn load_settings(path: Option<PathBuf>) -> anyhow::Result<Settings> {
    let path = match path {
        Some(path) => path,
        None => match ProjectDirs::from("dev", "wisp", "wisp") {
            Some(dirs) => dirs.config_dir().join("settings.json"),
            None => return Ok(Settings::default()),
        },
    };

    Ok(Settings::load(&path)?)
}

async fn connect(
    settings: Settings,
    server: ServerConfig,
) -> anyhow::Result<(WispEngine, EngineChannels)> {
    let connector = ChannelConnector::new(settings.clone());
    let (mut engine, mut channels) = Engine::new(settings, connector, Arc::new(StaticCredentials));

    let loaded = engine
        .load_server(SERVER_ID, server)
        .await
        .context("Failed to load the server schema")?;

    for warning in &loaded.warnings {
        eprintln!("{}", FormattedString::from(warning));
    }
    report_notices(&mut channels);

    Ok((engine, channels))
}

/// Forwards the engine's side channels to the log.
fn report_notices(channels: &mut EngineChannels) {
    while let Ok(notice) = channels.info.try_recv() {
        if let InfoNotice::Message(message) = notice {
            tracing::info!("{message}");
        }
    }
    while let Ok(error) = channels.errors.try_recv() {
        tracing::error!("{error}");
    }
}

async fn run_call(
    engine: &mut WispEngine,
    mut channels: EngineChannels,
    service: String,
    method: String,
    body: serde_json::Value,
    headers: Vec<(String, String)>,
) -> anyhow::Result<()> {
    let mode = engine.method(&service, &method)?.mode;

    let bodies = match body {
        serde_json::Value::Array(items) if mode.is_client_streaming() => items,
        serde_json::Value::Array(_) => bail!("A JSON array body is only accepted by client streams"),
        other => vec![other],
    };

    for body in bodies {
        let data = record_from_json(body).context("Every message body must be a JSON object")?;
        engine
            .query(QueryRequest {
                server_id: SERVER_ID,
                service: service.clone(),
                method: method.clone(),
                data,
                metadata: headers.clone(),
            })
            .await?;
        report_notices(&mut channels);
    }

    if mode.is_client_streaming() {
        engine.close_stream();
    }

    let mut failed = false;
    while let Some(response) = channels.responses.recv().await {
        if response.is_error() {
            failed = true;
            eprintln!("{}", FormattedString::from(&response));
        } else {
            println!("{}", FormattedString::from(&response));
        }

        if response.is_terminal(mode.is_server_streaming()) {
            break;
        }
    }
    report_notices(&mut channels);

    if failed {
        bail!("The call failed");
    }
    Ok(())
}
