// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result, bail};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::api::client::RemoteInvoker;
use crate::api::handler::{FunctionRegistry, RemoteArgs};
use crate::config::RuntimeConfig;
use crate::gateway::{ApplicationOwners, Gateway, InboundMessage, UserId};
use crate::protocol::{RemoteResult, ShardIndex, ShardReply};
use crate::runtime::admission::{AdmissionPipeline, OwnerSet, Verdict};
use crate::runtime::context::{ShardContext, ShardInfo};
use crate::runtime::mode::{CoreMode, InstanceMode};
use crate::runtime::plugins::PluginManager;
use crate::runtime::settings::{
    GuildSettingsStore, INFO_KEY, OWNERS_KEY, PREFIXES_KEY, load_or_init_prefixes, migrate_legacy,
    persisted_owners,
};
use crate::runtime::system_functions::{GATHER_INFO, HALT, SET_MODE, ShardStatus};
use crate::store::Collection;

/// One row of [`ShardRuntime::list_shards`].
#[derive(Debug, Clone, PartialEq)]
pub enum ShardListing {
    /// No answer before the broadcast deadline
    Down,
    Status(ShardStatus),
    /// The shard answered with an error or an unreadable payload
    Error(String),
}

/// A running shard: transport loop, broadcast aggregator, remote worker,
/// plugins, admission and the maintenance loops.
///
/// Use [`crate::ShardRuntimeBuilder`] to create an instance.
pub struct ShardRuntime {
    config: RuntimeConfig,
    context: ShardContext,
    functions: FunctionRegistry,
    admission: Arc<AdmissionPipeline>,
    gateway: Arc<dyn Gateway>,
    owners: OwnerSet,
    prefixes: Arc<RwLock<Vec<String>>>,
    ready: watch::Sender<bool>,
    tasks: TaskTracker,
    worker_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ShardRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRuntime")
            .field("shard", &self.context.shard)
            .field("instance_id", &self.context.mode.instance_id())
            .finish()
    }
}

impl ShardRuntime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: RuntimeConfig,
        context: ShardContext,
        functions: FunctionRegistry,
        admission: Arc<AdmissionPipeline>,
        gateway: Arc<dyn Gateway>,
        tasks: TaskTracker,
        worker_thread: JoinHandle<()>,
    ) -> Self {
        Self {
            config,
            context,
            functions,
            admission,
            gateway,
            owners: OwnerSet::new(),
            prefixes: Arc::new(RwLock::new(Vec::new())),
            ready: watch::channel(false).0,
            tasks,
            worker_thread: Mutex::new(Some(worker_thread)),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn shard(&self) -> &ShardInfo {
        &self.context.shard
    }

    pub fn context(&self) -> &ShardContext {
        &self.context
    }

    pub fn invoker(&self) -> &RemoteInvoker {
        &self.context.invoker
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.context.plugins
    }

    pub fn mode(&self) -> &InstanceMode {
        &self.context.mode
    }

    pub fn admission(&self) -> &Arc<AdmissionPipeline> {
        &self.admission
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn guilds(&self) -> GuildSettingsStore {
        GuildSettingsStore::new(self.context.settings.clone())
    }

    pub fn owners(&self) -> &OwnerSet {
        &self.owners
    }

    /// Current command prefixes.
    pub fn prefixes(&self) -> Vec<String> {
        self.prefixes.read().clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.context.cancel_token()
    }

    /// Tell the boot sequence the gateway is connected.
    pub fn signal_ready(&self) {
        self.ready.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Power-on self test.
    ///
    /// Loads prefixes, reconciles plugins, demotes a stale `up` to `boot`
    /// (already done by the builder unless the mode was set since),
    /// waits for [`ShardRuntime::signal_ready`], promotes `boot` to `up`,
    /// migrates legacy settings and starts the maintenance and owner loops.
    /// Returns early without error if the runtime is cancelled while waiting.
    pub async fn boot(&self) -> Result<()> {
        let shard = self.context.shard.id;
        self.owners.replace(Vec::new());

        let prefixes = load_or_init_prefixes(&self.context.settings).await?;
        info!(shard, prefixes = ?prefixes, "{}'s prefixes loaded", self.config.name);
        *self.prefixes.write() = prefixes;

        let report = self
            .context
            .plugins
            .reconcile()
            .await
            .context("initial plugin reconciliation")?;
        debug!(shard, loaded = ?report.loaded, evicted = ?report.evicted, "Initial reconciliation done");

        let mode = self.context.mode.begin_boot().await?;
        info!(shard, %mode, "Waiting for gateway");

        let mut ready = self.ready.subscribe();
        let gateway_ready = async move { ready.wait_for(|ready| *ready).await.map(|_| ()) };
        let cancel_token = self.cancel_token();
        tokio::select! {
            _ = cancel_token.cancelled() => return Ok(()),
            result = gateway_ready => result.context("ready signal dropped")?,
        }

        let mode = self.context.mode.mark_ready().await?;
        info!(shard, %mode, "Shard {} of {} ready", shard + 1, self.context.shard.count);

        let banner = format!(
            "This database is used by the {} bot, logged in as user {}.",
            self.config.name,
            self.gateway.bot_user()
        );
        self.context
            .settings
            .store()
            .set(INFO_KEY, Value::String(banner))
            .await
            .context("writing info banner")?;

        migrate_legacy(&self.context.settings).await?;

        self.spawn_maintenance_loop();
        self.spawn_owner_loop();
        Ok(())
    }

    fn spawn_maintenance_loop(&self) {
        let plugins = self.context.plugins.clone();
        let settings = self.context.settings.clone();
        let prefixes = self.prefixes.clone();
        let interval = self.config.reconcile_interval();
        let cancel_token = self.cancel_token();

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if plugins.is_reconcile_suspended() {
                    continue;
                }
                if let Err(e) = plugins.reconcile().await {
                    warn!(error = %e, "Plugin reconciliation failed");
                }
                match settings.get::<Vec<String>>(PREFIXES_KEY).await {
                    Ok(Some(latest)) => *prefixes.write() = latest,
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Failed to refresh prefixes"),
                }
            }
            debug!("Maintenance loop stopped");
        });
    }

    fn spawn_owner_loop(&self) {
        let gateway = self.gateway.clone();
        let settings = self.context.settings.clone();
        let owners = self.owners.clone();
        let interval = self.config.owner_refresh_interval();
        let cancel_token = self.cancel_token();

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = refresh_owners(gateway.as_ref(), &settings, &owners).await {
                    warn!(error = %e, "Owner refresh failed");
                }
            }
            debug!("Owner loop stopped");
        });
    }

    /// Re-read owners from the store and the gateway.
    pub async fn refresh_owners(&self) -> Result<Vec<UserId>> {
        refresh_owners(self.gateway.as_ref(), &self.context.settings, &self.owners).await?;
        Ok(self.owners.snapshot())
    }

    /// Run one inbound message through plugin hooks and admission, and hand
    /// it to the gateway if admitted.
    pub async fn handle_message(&self, message: &InboundMessage) -> Result<Verdict> {
        self.context.stats.record_message();
        self.context.plugins.dispatch_message(message).await;

        let mode = self.context.mode.current().await?;
        let verdict = self.admission.evaluate(message, mode, &self.owners).await;
        if verdict.is_dispatch() {
            self.gateway.process_commands(message).await?;
        } else {
            debug!(message_id = message.id, verdict = ?verdict, "Message dropped");
        }
        Ok(verdict)
    }

    /// Status of every shard in the deployment.
    pub async fn list_shards(&self) -> Result<BTreeMap<ShardIndex, ShardListing>> {
        let replies = self
            .context
            .invoker
            .broadcast(GATHER_INFO, RemoteArgs::new())
            .await?;

        Ok(replies
            .into_iter()
            .map(|(shard, reply)| {
                let listing = match reply {
                    ShardReply::NoResponse => ShardListing::Down,
                    ShardReply::Replied(Some(result)) => match result.into_typed::<ShardStatus>() {
                        Ok(status) => ShardListing::Status(status),
                        Err(e) => ShardListing::Error(e.to_string()),
                    },
                    ShardReply::Replied(None) => {
                        ShardListing::Error("unserializable response".to_string())
                    }
                };
                (shard, listing)
            })
            .collect())
    }

    async fn call_live_shard(&self, shard: ShardIndex, function: &str, args: RemoteArgs) -> Result<RemoteResult> {
        let timeout = self.config.broadcast_timeout();
        if !self.context.invoker.ping_shard(shard, timeout).await {
            bail!("shard {shard} is not responding");
        }
        match self
            .context
            .invoker
            .call(shard, function, args, timeout)
            .await?
        {
            None => bail!("shard {shard} did not answer {function}"),
            Some(None) => bail!("shard {shard} returned an unserializable result"),
            Some(Some(result)) => Ok(result),
        }
    }

    /// Set the mode of `shard`. Refuses to take the calling shard `down`
    /// or into `boot`, since that would silence the shard issuing the request.
    pub async fn set_shard_mode(&self, shard: ShardIndex, mode: CoreMode) -> Result<()> {
        if shard == self.context.shard.id && mode.drops_everything() {
            bail!("refusing to set mode {mode} on the shard handling this request");
        }
        let result = self
            .call_live_shard(shard, SET_MODE, RemoteArgs::new().arg(mode)?)
            .await?;
        result.into_typed::<CoreMode>()?;
        info!(shard, %mode, "Shard mode set");
        Ok(())
    }

    /// Halt one shard. Halting this shard goes through [`ShardRuntime::halt`].
    pub async fn halt_shard(&self, shard: ShardIndex) -> Result<()> {
        if shard == self.context.shard.id {
            self.halt().await;
            return Ok(());
        }
        self.call_live_shard(shard, HALT, RemoteArgs::new())
            .await?
            .into_typed::<bool>()?;
        Ok(())
    }

    /// Halt every other shard, then this one.
    pub async fn halt_all(&self) -> Result<()> {
        let replies = self
            .context
            .invoker
            .broadcast(HALT, RemoteArgs::new().kwarg("ignore", self.context.shard.id)?)
            .await?;
        let silent = replies.values().filter(|r| r.is_no_response()).count();
        if silent > 0 {
            warn!(silent, "Some shards did not acknowledge halt");
        }
        self.halt().await;
        Ok(())
    }

    /// Halt this shard: see [`ShardContext::halt`].
    pub async fn halt(&self) {
        self.context.halt().await;
    }

    /// Resolves once the runtime has been cancelled.
    pub async fn stopped(&self) {
        self.cancel_token().cancelled().await;
    }

    /// Cancel every background task and wait for them to finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel_token().cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let worker = self.worker_thread.lock().take();
        if let Some(worker) = worker {
            tokio::task::spawn_blocking(move || worker.join())
                .await
                .context("joining remote worker")?
                .map_err(|_| anyhow::anyhow!("remote worker panicked"))?;
        }
        info!(shard = self.context.shard.id, "Shard runtime stopped");
        Ok(())
    }
}

async fn refresh_owners(
    gateway: &dyn Gateway,
    settings: &Collection,
    owners: &OwnerSet,
) -> Result<()> {
    let mut current = persisted_owners(settings).await?;
    match gateway.application_owners().await? {
        ApplicationOwners::Team(members) => {
            for member in members {
                if !current.contains(&member) {
                    current.push(member);
                }
            }
        }
        ApplicationOwners::User(owner) => {
            if !current.contains(&owner) {
                current.push(owner);
                settings.set(OWNERS_KEY, &current).await?;
            }
        }
    }
    owners.replace(current);
    Ok(())
}
