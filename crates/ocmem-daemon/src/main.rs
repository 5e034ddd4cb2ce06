// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use clap::Parser;
use ocmem_config::{apply_env_overrides, load_config, MemoryConfig};
use ocmem_daemon::{build_app, AppState, DEFAULT_BIND_ADDR};
use ocmem_ingest::IngestorConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "oc-memory-daemon", version, about = "oc-memory worker process")]
struct Args {
    /// Bind address for the HTTP API.
    #[arg(long, default_value = DEFAULT_BIND_ADDR)]
    bind: String,

    /// Config file to load before environment overrides are applied.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose debug logging, equivalent to `CLAUDE_MEM_DEBUG=true`.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("ocmem=debug")
    } else {
        EnvFilter::new("ocmem=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config: MemoryConfig = load_config(args.config.as_deref())?;
    apply_env_overrides(&mut config);
    if args.debug {
        config.debug = true;
    }

    let state = Arc::new(AppState::new(config)?);

    let ingestor_cfg = IngestorConfig::new(state.global_root().to_path_buf());
    let ingestor_metrics = state.metrics().clone();
    tokio::spawn(async move {
        if let Err(e) = ocmem_ingest::run_forever(ingestor_cfg, ingestor_metrics).await {
            error!(error = %e, "ingestor exited");
        }
    });

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    info!(bind = %args.bind, "oc-memory-daemon listening");

    axum::serve(listener, app).await?;
    Ok(())
}
