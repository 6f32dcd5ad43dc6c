//! # autobridge
//!
//! Command-line driver for the automation bridge: sends one request, prints
//! a status snapshot, or streams bridge events until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use autobridge_client::{AutomationBridge, BridgeEvent, RequestOptions};
use autobridge_settings::BridgeSettings;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

/// Automation bridge client.
#[derive(Parser, Debug)]
#[command(name = "autobridge", about = "Drive an automation peer over the bridge")]
struct Cli {
    /// Peer host (overrides settings).
    #[arg(long, global = true)]
    host: Option<String>,

    /// Peer port (overrides the configured port list).
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Capability token presented in the handshake.
    #[arg(long, global = true)]
    token: Option<String>,

    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Settings file (defaults to `~/.autobridge/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one automation request and print the response.
    Send {
        /// Action name.
        action: String,

        /// JSON payload.
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Per-request timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Connect and print a status snapshot.
    Status,
    /// Connect and print bridge events until Ctrl-C.
    Watch,
}

impl Cli {
    /// Load settings and apply command-line overrides on top.
    fn resolve_settings(&self) -> Result<BridgeSettings> {
        let mut settings = match &self.settings {
            Some(path) => autobridge_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => autobridge_settings::load_settings().context("Failed to load settings")?,
        };
        if let Some(host) = &self.host {
            settings.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.ports = vec![port];
        }
        if let Some(token) = &self.token {
            settings.capability_token = Some(token.clone());
        }
        if let Some(level) = &self.log_level {
            settings.log_level.clone_from(level);
        }
        autobridge_settings::validate(&settings).context("Invalid command-line override")?;
        Ok(settings)
    }
}

fn parse_payload(raw: &str) -> Result<Value> {
    let payload: Value = serde_json::from_str(raw).context("--payload is not valid JSON")?;
    if !payload.is_object() {
        bail!("--payload must be a JSON object");
    }
    Ok(payload)
}

/// One line per bridge event.
fn format_event(event: &BridgeEvent) -> String {
    match event {
        BridgeEvent::Connected {
            connection_id,
            port,
            version,
            ..
        } => format!(
            "connected {connection_id} port={port} version={}",
            version.peer_version.as_deref().unwrap_or("unknown")
        ),
        BridgeEvent::Disconnected {
            connection_id,
            code,
            reason,
        } => format!("disconnected {connection_id} code={code} reason={reason}"),
        BridgeEvent::HandshakeFailed { port, error } => {
            format!("handshake failed port={port}: {error}")
        }
        BridgeEvent::Error { message } => format!("error: {message}"),
        BridgeEvent::Message(frame) => {
            let body = frame
                .payload
                .as_ref()
                .or(frame.result.as_ref())
                .map_or_else(String::new, |v| format!(" {v}"));
            format!("message {}{body}", frame.event)
        }
    }
}

async fn send(
    bridge: &AutomationBridge,
    action: &str,
    payload: &str,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let payload = parse_payload(payload)?;
    let options = timeout_ms
        .map(|ms| RequestOptions::with_timeout(Duration::from_millis(ms)))
        .unwrap_or_default();
    let response = bridge
        .send_request(action, payload, options)
        .await
        .with_context(|| format!("Request '{action}' failed"))?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.success {
        bail!(
            "peer reported failure: {}",
            response
                .error
                .or(response.message)
                .unwrap_or_else(|| "no detail".to_string())
        );
    }
    Ok(())
}

async fn watch(bridge: &AutomationBridge) -> Result<()> {
    let mut events = bridge.subscribe();
    bridge.start().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", format_event(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.resolve_settings()?;
    autobridge_core::logging::init_subscriber(&settings.log_level);
    tracing::debug!(host = %settings.host, ports = ?settings.ports, "settings resolved");

    let bridge = AutomationBridge::websocket(settings);
    let outcome = match &cli.command {
        Command::Send {
            action,
            payload,
            timeout_ms,
        } => send(&bridge, action, payload, *timeout_ms).await,
        Command::Status => {
            bridge.start().await;
            let status = bridge.get_status();
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Watch => watch(&bridge).await,
    };

    bridge.stop();
    tracing::info!("Shutdown complete");
    outcome
}
