// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Run one shard of a Heleus deployment.
//!
//! Without a chat connection the shard still joins the coordination
//! channel, answers pings and remote calls, and keeps its plugins and
//! instance mode in line with the shared store.

use anyhow::Context;
use clap::Parser;
use figment::providers::{Format, Serialized, Toml};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use heleus_runtime::config::RuntimeConfig;
use heleus_runtime::error::StartupError;
use heleus_runtime::logging;
use heleus_runtime::store::{FileStore, KeyValueStore, MemoryStore};
use heleus_runtime::transport::{LocalBus, PubSubTransport};
use heleus_runtime::ShardRuntimeBuilder;

#[derive(Parser, Debug)]
#[command(name = "heleus-shard")]
#[command(about = "Run one shard of a Heleus deployment")]
struct Args {
    /// TOML file merged over defaults and the environment
    #[arg(long)]
    config: Option<PathBuf>,

    /// One-based index of this shard
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    shard_id: Option<u32>,

    /// Number of shards in the deployment
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    shard_count: Option<u32>,

    /// Plugins to load on first start, comma separated
    #[arg(long, value_delimiter = ',')]
    cogs: Vec<String>,

    /// Bootstrap plugin
    #[arg(long)]
    loader: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,

    /// Keep all state in memory
    #[arg(long)]
    stateless: bool,

    /// Settings document for the file-backed store
    #[arg(long, env = "HELEUS_STORE_PATH", default_value = "heleus.json")]
    store_path: PathBuf,
}

impl Args {
    fn runtime_config(&self) -> Result<RuntimeConfig, StartupError> {
        let mut figment = RuntimeConfig::figment();
        if let Some(path) = &self.config {
            figment = figment.merge(Toml::file(path));
        }
        if let Some(shard_id) = self.shard_id {
            figment = figment.merge(Serialized::default("shard_id", shard_id - 1));
        }
        if let Some(shard_count) = self.shard_count {
            figment = figment.merge(Serialized::default("shard_count", shard_count));
        }
        if !self.cogs.is_empty() {
            figment = figment.merge(Serialized::default("autoload", &self.cogs));
        }
        if let Some(loader) = &self.loader {
            figment = figment.merge(Serialized::default("loader", loader));
        }
        RuntimeConfig::extract_from(figment).map_err(|e| StartupError::Config(e.into()))
    }

    async fn store(&self) -> Result<Arc<dyn KeyValueStore>, StartupError> {
        if self.stateless {
            return Ok(Arc::new(MemoryStore::new()));
        }
        let store = FileStore::open(&self.store_path)
            .await
            .map_err(StartupError::StoreUnreachable)?;
        Ok(Arc::new(store))
    }
}

fn transport(config: &RuntimeConfig) -> Result<Arc<dyn PubSubTransport>, StartupError> {
    #[cfg(feature = "zmq")]
    if let Some(endpoint) = &config.zmq.publish_endpoint {
        let transport =
            heleus_runtime::zmq::ZmqPubSub::bind(endpoint, config.zmq.peer_endpoints.clone())
                .map_err(StartupError::TransportUnavailable)?;
        return Ok(Arc::new(transport));
    }

    if config.shard_count > 1 {
        warn!(
            shard_count = config.shard_count,
            "No pub/sub endpoint configured; other shards will be unreachable"
        );
    }
    Ok(Arc::new(LocalBus::default()))
}

async fn run(args: Args) -> Result<(), StartupError> {
    let config = args.runtime_config()?;
    info!(
        name = %config.name,
        shard = config.shard_id + 1,
        shard_count = config.shard_count,
        "Starting shard"
    );

    let runtime = ShardRuntimeBuilder::new(config.clone())
        .store(args.store().await?)
        .transport(transport(&config)?)
        .build()
        .await?;

    // The log gateway has no connection to wait for.
    runtime.signal_ready();
    if let Err(e) = runtime.boot().await {
        runtime.shutdown().await.context("shutting down after failed boot")?;
        return Err(StartupError::Other(e));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; halting shard");
            runtime.halt().await;
        }
        _ = runtime.stopped() => {}
    }

    runtime.shutdown().await.context("shutting down")?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logging::init(args.debug);

    if let Err(e) = run(args).await {
        error!(error = %e, "Shard exited with an error");
        std::process::exit(e.exit_code());
    }
}
