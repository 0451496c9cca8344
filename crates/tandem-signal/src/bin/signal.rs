//! Tandem Signal Server
//!
//! WebSocket signaling server for local discovery, device pairing and
//! WebRTC negotiation.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, or ~/.config/tandem/config.toml when present
//! tandem-signal --port 8080
//!
//! # Relay unknown message types for clients without WebRTC
//! tandem-signal --ws-fallback --rtc-config /etc/tandem/rtc.json
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tandem_core::Config;
use tandem_signal::SignalServer;

#[derive(Parser, Debug)]
#[command(name = "tandem-signal")]
#[command(about = "Tandem signaling server for peer discovery and pairing")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "TANDEM_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long, env = "TANDEM_BIND")]
    bind: Option<IpAddr>,

    /// Relay unknown message types between peers
    #[arg(long, env = "TANDEM_WS_FALLBACK")]
    ws_fallback: bool,

    /// JSON file with the WebRTC configuration handed to clients
    #[arg(long, env = "TANDEM_RTC_CONFIG")]
    rtc_config: Option<PathBuf>,

    /// Group IPv6 peers by their first N address groups (1-7)
    #[arg(long, env = "TANDEM_IPV6_LOCALIZE")]
    ipv6_localize: Option<u8>,

    /// Log as JSON lines
    #[arg(long, env = "TANDEM_LOG_JSON")]
    json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.json);

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load(),
    };

    let signal = &mut config.signal;
    if let Some(port) = args.port {
        signal.port = port;
    }
    if let Some(bind) = args.bind {
        signal.bind = bind;
    }
    if args.ws_fallback {
        signal.ws_fallback = true;
    }
    if let Some(path) = args.rtc_config {
        signal.rtc_config = Some(path);
    }
    if let Some(groups) = args.ipv6_localize {
        signal.ipv6_localize = Some(groups);
    }

    let addr = SocketAddr::new(signal.bind, signal.port);
    let server = SignalServer::new(signal).context("invalid signal configuration")?;

    info!("Starting Tandem Signal Server");
    if signal.ws_fallback {
        info!("WebSocket fallback relay enabled");
    }
    server.serve(addr).await?;

    Ok(())
}
