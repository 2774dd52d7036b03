// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Plugin registry and lifecycle.
//!
//! Plugins are registered by stable dotted name (`cogs.core`,
//! `cogs.stats`) with a factory. Activating a plugin creates an instance and
//! runs its `setup`; deactivating runs `teardown` and then removes every
//! predicate and remote function the plugin registered, so a plugin is
//! never left half-loaded.
//!
//! The set of plugins that should be active is persisted under the `cogs`
//! key and reconciled periodically against what is actually running.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::client::RemoteInvoker;
use crate::api::handler::{FunctionRegistry, RemoteArgs, RemoteFunction};
use crate::error::PluginError;
use crate::gateway::InboundMessage;
use crate::protocol::BroadcastReplies;
use crate::runtime::admission::{AdmissionPipeline, Predicate, PredicateKind};
use crate::runtime::context::{RuntimeStats, ShardInfo};
use crate::runtime::settings::GuildSettingsStore;
use crate::runtime::system_functions::RELOAD_CORE;
use crate::store::Collection;

/// Key of the persisted plugin set.
pub const PLUGINS_KEY: &str = "cogs";

/// A unit of functionality that can be loaded and unloaded at runtime.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Register predicates, remote functions and background work.
    async fn setup(&self, ctx: &PluginContext) -> Result<()>;

    /// Release anything `setup` acquired that the runtime does not track.
    async fn teardown(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// Observe every inbound message, before and regardless of admission.
    async fn on_message(&self, _ctx: &PluginContext, _message: &InboundMessage) -> Result<()> {
        Ok(())
    }
}

pub type PluginFactory = Arc<dyn Fn() -> Result<Arc<dyn Plugin>> + Send + Sync>;

/// Wrap a constructor closure as a [`PluginFactory`].
pub fn plugin_factory<F, P>(f: F) -> PluginFactory
where
    F: Fn() -> Result<P> + Send + Sync + 'static,
    P: Plugin + 'static,
{
    Arc::new(move || Ok(Arc::new(f()?) as Arc<dyn Plugin>))
}

/// Services a plugin sees, scoped to the plugin's name so registrations
/// can be undone when it unloads.
#[derive(Clone)]
pub struct PluginContext {
    owner: String,
    pub shard: ShardInfo,
    pub settings: Collection,
    pub guilds: GuildSettingsStore,
    pub admission: Arc<AdmissionPipeline>,
    pub functions: FunctionRegistry,
    pub invoker: RemoteInvoker,
    pub stats: Arc<RuntimeStats>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("owner", &self.owner)
            .field("shard", &self.shard)
            .finish()
    }
}

impl PluginContext {
    pub fn new(
        shard: ShardInfo,
        settings: Collection,
        admission: Arc<AdmissionPipeline>,
        functions: FunctionRegistry,
        invoker: RemoteInvoker,
        stats: Arc<RuntimeStats>,
    ) -> Self {
        Self {
            owner: String::new(),
            guilds: GuildSettingsStore::new(settings.clone()),
            shard,
            settings,
            admission,
            functions,
            invoker,
            stats,
        }
    }

    fn for_plugin(&self, name: &str) -> Self {
        Self {
            owner: name.to_string(),
            ..self.clone()
        }
    }

    /// Name of the plugin this context belongs to.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn add_override(&self, name: impl Into<String>, predicate: Arc<dyn Predicate>) -> u64 {
        self.admission
            .add(PredicateKind::Override, name, Some(&self.owner), predicate)
    }

    pub fn add_precondition(&self, name: impl Into<String>, predicate: Arc<dyn Predicate>) -> u64 {
        self.admission
            .add(PredicateKind::Precondition, name, Some(&self.owner), predicate)
    }

    pub fn register_function(&self, name: impl Into<String>, function: Arc<dyn RemoteFunction>) {
        self.functions.register_owned(&self.owner, name, function);
    }
}

/// Name → factory table of every plugin this binary can load.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: Arc<DashMap<String, PluginFactory>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, factory: PluginFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Direct children of `namespace` (`cogs` → `cogs.a`, `cogs.b`, but
    /// not `cogs.a.b`).
    pub fn submodules(&self, namespace: &str) -> Vec<String> {
        let prefix = format!("{namespace}.");
        self.names()
            .into_iter()
            .filter(|name| {
                name.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('.'))
            })
            .collect()
    }

    /// Expand autoload entries; `ns.*` selects every direct child of `ns`.
    pub fn resolve(&self, entries: &[String]) -> Vec<String> {
        let mut resolved = Vec::new();
        for entry in entries {
            let names = match entry.strip_suffix(".*") {
                Some(namespace) => self.submodules(namespace),
                None => vec![entry.clone()],
            };
            for name in names {
                if !resolved.contains(&name) {
                    resolved.push(name);
                }
            }
        }
        resolved
    }

    fn create(&self, name: &str) -> Result<Arc<dyn Plugin>, PluginError> {
        let factory = self
            .factories
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PluginError::NotRegistered(name.to_string()))?;
        factory().map_err(|source| PluginError::SetupFailed {
            name: name.to_string(),
            source,
        })
    }
}

struct ActivePlugin {
    plugin: Arc<dyn Plugin>,
    ctx: PluginContext,
}

/// Result of [`PluginManager::reload`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReloadOutcome {
    /// Reloaded in place on this shard
    Reloaded,
    /// Bootstrap plugin: reload was broadcast; one reply slot per shard
    Dispatched(BroadcastReplies),
}

/// Actions taken by one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub loaded: Vec<String>,
    pub evicted: Vec<String>,
    pub unloaded: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty() && self.evicted.is_empty() && self.unloaded.is_empty()
    }
}

/// Owns the active plugin set and keeps it in line with the persisted one.
pub struct PluginManager {
    registry: PluginRegistry,
    context: PluginContext,
    bootstrap: String,
    autoload: Vec<String>,
    autoload_merged: AtomicBool,
    reconcile_suspended: AtomicBool,
    active: Mutex<BTreeMap<String, ActivePlugin>>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("bootstrap", &self.bootstrap)
            .field("autoload", &self.autoload)
            .field("suspended", &self.is_reconcile_suspended())
            .finish()
    }
}

impl PluginManager {
    pub fn new(
        registry: PluginRegistry,
        context: PluginContext,
        bootstrap: impl Into<String>,
        autoload: Vec<String>,
    ) -> Self {
        Self {
            registry,
            context,
            bootstrap: bootstrap.into(),
            autoload,
            autoload_merged: AtomicBool::new(false),
            reconcile_suspended: AtomicBool::new(false),
            active: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn bootstrap(&self) -> &str {
        &self.bootstrap
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    pub async fn active_names(&self) -> Vec<String> {
        self.active.lock().await.keys().cloned().collect()
    }

    pub async fn is_active(&self, name: &str) -> bool {
        self.active.lock().await.contains_key(name)
    }

    /// The persisted plugin set.
    pub async fn persisted(&self) -> Result<Vec<String>, PluginError> {
        self.context
            .settings
            .get_or(PLUGINS_KEY, Vec::new())
            .await
            .map_err(PluginError::Store)
    }

    async fn persist(&self, names: &[String]) -> Result<(), PluginError> {
        self.context
            .settings
            .set(PLUGINS_KEY, names)
            .await
            .map_err(PluginError::Store)
    }

    /// Drop everything `owner` registered with the runtime.
    fn release(&self, owner: &str) {
        let predicates = self.context.admission.remove_owned(owner);
        let functions = self.context.functions.deregister_owned(owner);
        if predicates + functions > 0 {
            debug!(plugin = owner, predicates, functions, "Released plugin registrations");
        }
    }

    async fn activate(
        &self,
        name: &str,
        active: &mut BTreeMap<String, ActivePlugin>,
    ) -> Result<(), PluginError> {
        let plugin = self.registry.create(name)?;
        let ctx = self.context.for_plugin(name);

        if let Err(source) = plugin.setup(&ctx).await {
            if let Err(e) = plugin.teardown(&ctx).await {
                debug!(plugin = name, error = %e, "Teardown after failed setup also failed");
            }
            self.release(name);
            return Err(PluginError::SetupFailed {
                name: name.to_string(),
                source,
            });
        }

        active.insert(name.to_string(), ActivePlugin { plugin, ctx });
        info!(plugin = name, "Plugin loaded");
        Ok(())
    }

    async fn deactivate(&self, name: &str, active: &mut BTreeMap<String, ActivePlugin>) -> bool {
        let Some(entry) = active.remove(name) else {
            return false;
        };
        if let Err(e) = entry.plugin.teardown(&entry.ctx).await {
            warn!(plugin = name, error = %e, "Plugin teardown failed");
        }
        self.release(name);
        info!(plugin = name, "Plugin unloaded");
        true
    }

    /// Activate the bootstrap plugin without recording it in the persisted
    /// set. Called once while the runtime is built.
    pub async fn load_bootstrap(&self) -> Result<(), PluginError> {
        let mut active = self.active.lock().await;
        if active.contains_key(&self.bootstrap) {
            return Ok(());
        }
        let bootstrap = self.bootstrap.clone();
        self.activate(&bootstrap, &mut active).await
    }

    /// Activate `name` and add it to the persisted set.
    ///
    /// Returns `false` without side effects when it is already active.
    pub async fn load(&self, name: &str) -> Result<bool, PluginError> {
        let mut active = self.active.lock().await;
        if active.contains_key(name) {
            debug!(plugin = name, "Plugin already loaded");
            return Ok(false);
        }

        self.activate(name, &mut active).await?;

        let mut persisted = self.persisted().await?;
        if !persisted.iter().any(|p| p == name) {
            persisted.push(name.to_string());
            self.persist(&persisted).await?;
        }
        Ok(true)
    }

    /// Deactivate `name` and remove it from the persisted set.
    pub async fn unload(&self, name: &str) -> Result<(), PluginError> {
        if name == self.bootstrap {
            return Err(PluginError::BootstrapProtected(name.to_string()));
        }

        let mut active = self.active.lock().await;
        if !self.deactivate(name, &mut active).await {
            return Err(PluginError::NotActive(name.to_string()));
        }

        let mut persisted = self.persisted().await?;
        let before = persisted.len();
        persisted.retain(|p| p != name);
        if persisted.len() != before {
            self.persist(&persisted).await?;
        }
        Ok(())
    }

    /// Reload `name`.
    ///
    /// The bootstrap plugin is never reloaded inline: the request goes out to
    /// every shard, this one included, through the remote worker.
    pub async fn reload(&self, name: &str) -> Result<ReloadOutcome, PluginError> {
        if name == self.bootstrap {
            let replies = self
                .context
                .invoker
                .broadcast(RELOAD_CORE, RemoteArgs::new())
                .await?;
            return Ok(ReloadOutcome::Dispatched(replies));
        }

        self.reload_local(name).await?;
        Ok(ReloadOutcome::Reloaded)
    }

    /// Deactivate then re-activate `name` on this shard. If re-activation
    /// fails the plugin stays unloaded.
    pub async fn reload_local(&self, name: &str) -> Result<(), PluginError> {
        let mut active = self.active.lock().await;
        if !self.deactivate(name, &mut active).await {
            return Err(PluginError::NotActive(name.to_string()));
        }

        self.activate(name, &mut active)
            .await
            .map_err(|e| match e {
                PluginError::SetupFailed { name, source } => {
                    PluginError::ReloadFailed { name, source }
                }
                other => other,
            })
    }

    /// Bring the active set in line with the persisted set.
    ///
    /// The autoload list is merged into the persisted set on the first run
    /// only. Plugins that fail to activate are dropped from the persisted set
    /// with a single warning.
    pub async fn reconcile(&self) -> Result<ReconcileReport, PluginError> {
        let mut report = ReconcileReport::default();
        if self.is_reconcile_suspended() {
            return Ok(report);
        }

        let mut target = self.persisted().await?;
        let mut edited = false;

        if !self.autoload_merged.swap(true, Ordering::AcqRel) {
            for name in self.registry.resolve(&self.autoload) {
                if name != self.bootstrap && !target.contains(&name) {
                    target.push(name);
                    edited = true;
                }
            }
        }

        let mut active = self.active.lock().await;

        for name in target.clone() {
            if active.contains_key(&name) {
                continue;
            }
            match self.activate(&name, &mut active).await {
                Ok(()) => report.loaded.push(name),
                Err(e) => {
                    warn!(
                        plugin = %name,
                        error = %e,
                        "{name:?} could not be loaded. This message will not be shown again."
                    );
                    target.retain(|t| t != &name);
                    edited = true;
                    report.evicted.push(name);
                }
            }
        }

        if edited {
            self.persist(&target).await?;
        }

        let extra: Vec<String> = active
            .keys()
            .filter(|name| **name != self.bootstrap && !target.contains(*name))
            .cloned()
            .collect();
        for name in extra {
            if self.deactivate(&name, &mut active).await {
                report.unloaded.push(name);
            }
        }

        if !report.is_empty() {
            debug!(
                loaded = report.loaded.len(),
                evicted = report.evicted.len(),
                unloaded = report.unloaded.len(),
                "Plugin reconciliation applied changes"
            );
        }
        Ok(report)
    }

    /// Deactivate every plugin, the bootstrap plugin last.
    pub async fn unload_all(&self) {
        let mut active = self.active.lock().await;
        let mut names: Vec<String> = active.keys().cloned().collect();
        names.sort_by_key(|name| *name == self.bootstrap);
        for name in names {
            self.deactivate(&name, &mut active).await;
        }
    }

    pub fn suspend_reconcile(&self) {
        self.reconcile_suspended.store(true, Ordering::Release);
    }

    pub fn resume_reconcile(&self) {
        self.reconcile_suspended.store(false, Ordering::Release);
    }

    pub fn is_reconcile_suspended(&self) -> bool {
        self.reconcile_suspended.load(Ordering::Acquire)
    }

    /// Fan a message out to every active plugin's `on_message` hook.
    pub async fn dispatch_message(&self, message: &InboundMessage) {
        let snapshot: Vec<(String, Arc<dyn Plugin>, PluginContext)> = self
            .active
            .lock()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.plugin.clone(), entry.ctx.clone()))
            .collect();

        for (name, plugin, ctx) in snapshot {
            if let Err(e) = plugin.on_message(&ctx, message).await {
                warn!(plugin = %name, message_id = message.id, error = %e, "Plugin message hook failed");
            }
        }
    }
}
