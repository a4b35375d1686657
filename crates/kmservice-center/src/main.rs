// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! kmservice center
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port (8888) with an empty directory
//! kmservice-center
//!
//! # Seed services and subscriptions, archive traffic to SQLite
//! kmservice-center --directory directory.json --archive center.db
//!
//! # Everything from a config file
//! kmservice-center --config center.json
//! ```

use clap::Parser;
use kmservice_center::{Center, CenterConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// kmservice center - service registry and shared data hub
#[derive(Parser, Debug)]
#[command(name = "kmservice-center")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "8888")]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory seed: services, subscriptions and initial data (JSON)
    #[arg(short, long)]
    directory: Option<PathBuf>,

    /// SQLite archive of exchanged datagrams
    #[arg(long)]
    archive: Option<PathBuf>,

    /// Maximum number of pooled services
    #[arg(long, default_value = "1000")]
    max_pool_size: usize,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "30")]
    heartbeat: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        CenterConfig::from_file(&config_path)?
    } else {
        CenterConfig {
            bind_address: args.bind.parse()?,
            port: args.port,
            max_pool_size: args.max_pool_size,
            heartbeat_interval_secs: args.heartbeat,
            directory_path: args.directory,
            archive_path: args.archive,
            ..Default::default()
        }
    };

    info!("+----------------------------------------------------+");
    info!(
        "|       kmservice center v{}                      |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:      {:38} |", format!("{}:{}", config.bind_address, config.port));
    info!("|  Pool:      {:38} |", config.max_pool_size);
    info!("|  Heartbeat: {:38} |", format!("{}s", config.heartbeat_interval_secs));
    info!(
        "|  Archive:   {:38} |",
        config
            .archive_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string())
    );
    info!("+----------------------------------------------------+");

    let center = Center::new(config)?;

    let handle = center.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping center...");
        handle.shutdown();
    });

    center.run().await?;

    info!("Center stopped");
    Ok(())
}
