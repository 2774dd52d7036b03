// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Builder pattern for creating ShardRuntime instances.

use anyhow::Context;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::api::client::RemoteInvoker;
use crate::api::handler::{FunctionRegistry, RemoteFunction};
use crate::config::RuntimeConfig;
use crate::error::StartupError;
use crate::gateway::{Gateway, LogGateway};
use crate::runtime::admission::AdmissionPipeline;
use crate::runtime::aggregator::BroadcastAggregator;
use crate::runtime::context::{RuntimeStats, ShardContext, ShardInfo};
use crate::runtime::core_plugin::CorePlugin;
use crate::runtime::dispatcher::EnvelopeDispatcher;
use crate::runtime::manager::ShardRuntime;
use crate::runtime::mode::{InstanceMode, local_instance_id};
use crate::runtime::plugins::{PluginContext, PluginFactory, PluginManager, PluginRegistry, plugin_factory};
use crate::runtime::registry::CorrelationRegistry;
use crate::runtime::system_functions::register_system_functions;
use crate::runtime::worker::{RemoteWorker, Responder};
use crate::store::{Collection, KeyValueStore};
use crate::transport::{LocalBus, PubSubTransport};

/// Builder for creating ShardRuntime instances.
///
/// # Example
///
/// ```no_run
/// use heleus_runtime::{MemoryStore, RuntimeConfig, ShardRuntimeBuilder};
/// use std::sync::Arc;
///
/// # async fn example() -> anyhow::Result<()> {
/// let runtime = ShardRuntimeBuilder::new(RuntimeConfig::default())
///     .store(Arc::new(MemoryStore::new()))
///     .build()
///     .await?;
/// runtime.signal_ready();
/// runtime.boot().await?;
/// # Ok(())
/// # }
/// ```
pub struct ShardRuntimeBuilder {
    config: RuntimeConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    transport: Option<Arc<dyn PubSubTransport>>,
    gateway: Option<Arc<dyn Gateway>>,
    plugins: Vec<(String, PluginFactory)>,
    functions: Vec<(String, Arc<dyn RemoteFunction>)>,
    cancel_token: Option<CancellationToken>,
    instance_id: Option<String>,
}

impl ShardRuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            gateway: None,
            plugins: Vec::new(),
            functions: Vec::new(),
            cancel_token: None,
            instance_id: None,
        }
    }

    /// Settings store. Required.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Pub/sub transport. Defaults to a private in-process [`LocalBus`],
    /// which only reaches this shard.
    pub fn transport(mut self, transport: Arc<dyn PubSubTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Chat platform boundary. Defaults to [`LogGateway`].
    pub fn gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Make a plugin available for loading under `name`.
    pub fn plugin(mut self, name: impl Into<String>, factory: PluginFactory) -> Self {
        self.plugins.push((name.into(), factory));
        self
    }

    /// Register a remote function that lives for the whole runtime.
    pub fn function(mut self, name: impl Into<String>, function: Arc<dyn RemoteFunction>) -> Self {
        self.functions.push((name.into(), function));
        self
    }

    /// Set the cancellation token for graceful shutdown.
    ///
    /// If not provided, a fresh `CancellationToken` is created internally
    /// and can be retrieved later via `ShardRuntime::cancel_token()`.
    pub fn cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    /// Override the instance id derived from host, working directory and
    /// shard position. Lets several shards share one process in tests.
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Wire every component together and start the background tasks.
    ///
    /// Must be called from within a tokio runtime. A persisted `up` is
    /// demoted to `boot` before anything is subscribed, so no message is
    /// admitted until [`ShardRuntime::boot`] completes. The returned runtime
    /// answers remote requests immediately.
    pub async fn build(self) -> Result<ShardRuntime, StartupError> {
        let config = self.config;
        let store = self
            .store
            .ok_or_else(|| StartupError::Config(anyhow::anyhow!("a settings store is required")))?;
        store.ping().await.map_err(StartupError::StoreUnreachable)?;

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LocalBus::default()));
        let gateway = self
            .gateway
            .unwrap_or_else(|| Arc::new(LogGateway::new(config.name.clone())));
        let cancel_token = self.cancel_token.unwrap_or_default();

        let registry = PluginRegistry::new();
        for (name, factory) in self.plugins {
            registry.register(name, factory);
        }
        if !registry.contains(&config.loader) {
            registry.register(config.loader.clone(), plugin_factory(|| Ok(CorePlugin)));
        }

        let functions = FunctionRegistry::new();
        register_system_functions(&functions);
        for (name, function) in self.functions {
            functions.register(name, function);
        }

        let shard = ShardInfo {
            name: config.name.clone(),
            id: config.shard_id,
            count: config.shard_count,
        };
        let settings = Collection::new(store, config.store_prefix.clone());
        let correlation = Arc::new(CorrelationRegistry::new());
        let invoker = RemoteInvoker::new(
            transport.clone(),
            config.channel.clone(),
            correlation.clone(),
            config.shard_count,
            config.broadcast_timeout(),
        );
        let admission = Arc::new(AdmissionPipeline::new());
        let stats = Arc::new(RuntimeStats::default());

        let plugin_context = PluginContext::new(
            shard.clone(),
            settings.clone(),
            admission.clone(),
            functions.clone(),
            invoker.clone(),
            stats.clone(),
        );
        let plugins = Arc::new(PluginManager::new(
            registry,
            plugin_context,
            config.loader.clone(),
            config.autoload.clone(),
        ));

        let instance_id = match self.instance_id {
            Some(id) => id,
            None => local_instance_id(config.shard_id, config.shard_count)?,
        };
        let mode = InstanceMode::new(settings.clone(), instance_id);
        debug!(shard = shard.id, instance_id = mode.instance_id(), "Instance identified");
        // A previous run's `up` is demoted before the transport or gateway
        // can deliver anything.
        let boot_mode = mode.begin_boot().await.map_err(StartupError::StoreUnreachable)?;
        debug!(shard = shard.id, mode = %boot_mode, "Instance mode at start");

        let handle = Handle::current();
        let context = ShardContext::new(
            shard.clone(),
            settings,
            mode,
            plugins.clone(),
            invoker,
            stats,
            config.halt_grace(),
            handle.clone(),
            cancel_token.clone(),
        );

        let subscription = transport
            .subscribe(&config.channel)
            .await
            .map_err(StartupError::TransportUnavailable)?;

        let responder = Responder::new(transport, config.channel.clone());
        let (worker, worker_thread) =
            RemoteWorker::spawn(context.clone(), functions.clone(), responder.clone(), handle)
                .context("starting remote worker thread")?;

        let tasks = TaskTracker::new();
        let dispatcher = EnvelopeDispatcher::new(shard.id, correlation.clone(), responder, worker);
        tasks.spawn(dispatcher.run(subscription, cancel_token.clone()));
        let aggregator = BroadcastAggregator::new(correlation, config.aggregator_poll());
        tasks.spawn(aggregator.run(cancel_token.clone()));

        let started = async {
            plugins
                .load_bootstrap()
                .await
                .map_err(|e| StartupError::Other(e.into()))?;
            gateway.login().await.map_err(StartupError::LoginFailed)
        };
        if let Err(e) = started.await {
            cancel_token.cancel();
            return Err(e);
        }

        info!(
            shard = shard.id,
            shard_count = shard.count,
            channel = %config.channel,
            "Shard runtime started"
        );

        Ok(ShardRuntime::new(
            config,
            context,
            functions,
            admission,
            gateway,
            tasks,
            worker_thread,
        ))
    }
}
