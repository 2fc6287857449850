use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use smbmux_transport::{
    Connector, RdmaConnector, Smb2Negotiator, TcpConnector, TransportConfig, TransportEngine,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Connects to an SMB2/3 server, negotiates and reports what was agreed.
#[derive(Debug, Parser)]
#[command(name = "smbmux-probe", version, about)]
struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "SMBMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Server address, e.g. 192.0.2.10:445.
    server: SocketAddr,

    /// Use the SMB Direct framed transport.
    #[arg(long)]
    rdma: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => TransportConfig::from_file(path)?,
        None => TransportConfig::default(),
    };
    if cli.rdma {
        config.rdma.allow_fallback = true;
    }

    let tcp = TcpConnector::from_config(&config);
    let connector: Arc<dyn Connector> = if cli.rdma {
        Arc::new(RdmaConnector::new(config.rdma.clone(), tcp))
    } else {
        Arc::new(tcp)
    };

    let connect_timeout = config.connect_timeout();
    let engine = TransportEngine::builder(cli.server)
        .name("probe")
        .config(config)
        .connector(connector)
        .negotiator(Arc::new(Smb2Negotiator::default()))
        .build();

    engine
        .connect(connect_timeout)
        .await
        .with_context(|| format!("connecting to {}", cli.server))?;

    let session = engine.session().context("no session after connect")?;
    println!("server:       {}", cli.server);
    println!("dialect:      0x{:04x}", session.dialect);
    println!("credits:      {}", session.initial_credits);
    println!("capabilities: 0x{:08x}", session.server_capabilities);
    println!("multichannel: {}", session.supports_multi_channel());
    if let Some(caps) = engine.capabilities() {
        println!("transport:    {}", serde_json::to_string(&caps)?);
    }

    engine.disconnect(true).await?;
    Ok(())
}
