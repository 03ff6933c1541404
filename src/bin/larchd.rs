//! The larch blob server daemon.
//!
//! Loads a JSON configuration, wires the storage/handler graph, and
//! serves the blob protocol plus search endpoints over HTTP. Exits 0 on
//! clean shutdown, 1 on configuration or startup errors (written to
//! stderr).

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use larch::build_app;
use larch::load_config;
use larch::Loader;

/// Default listen address when neither config nor flags name one.
const DEFAULT_LISTEN: &str = "127.0.0.1:3179";

#[derive(Parser, Debug)]
#[command(name = "larchd", about = "Content-addressable blob server")]
struct Args {
    /// Path to the JSON server configuration.
    #[arg(long, default_value = "larchd-config.json")]
    config: PathBuf,

    /// Listen address, overriding the config's `listen`.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("larch=info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;

    if config.tls_cert_file.is_some() {
        // TLS termination is expected to sit in front of this server.
        warn!("TLSCertFile/TLSKeyFile configured but TLS is handled externally; serving plain HTTP");
    }

    let mut loader = Loader::new(&config);
    loader.build_all().context("instantiating storage handlers")?;

    let app = build_app(&loader, config.password.clone());

    let addr = args
        .listen
        .or(config.listen.clone())
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, prefixes = config.prefixes.len(), "larchd serving");

    axum::serve(listener, app).await.context("serving HTTP")?;
    Ok(())
}
