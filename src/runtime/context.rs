// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The local runtime handle given to remote functions.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::client::RemoteInvoker;
use crate::protocol::ShardIndex;
use crate::runtime::mode::InstanceMode;
use crate::runtime::plugins::PluginManager;
use crate::store::Collection;

/// Position of this process in the deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub name: String,
    pub id: ShardIndex,
    pub count: u32,
}

/// Counters reported by `gather_info`.
#[derive(Debug)]
pub struct RuntimeStats {
    messages_seen: AtomicU64,
    up_since: u64,
}

impl Default for RuntimeStats {
    fn default() -> Self {
        let up_since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            messages_seen: AtomicU64::new(0),
            up_since,
        }
    }
}

impl RuntimeStats {
    pub fn record_message(&self) -> u64 {
        self.messages_seen.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn messages_seen(&self) -> u64 {
        self.messages_seen.load(Ordering::Relaxed)
    }

    /// Process start, seconds since the Unix epoch.
    pub fn up_since(&self) -> u64 {
        self.up_since
    }
}

/// Everything a remote function may touch on the shard that runs it.
#[derive(Clone)]
pub struct ShardContext {
    pub shard: ShardInfo,
    pub settings: Collection,
    pub mode: InstanceMode,
    pub plugins: Arc<PluginManager>,
    pub invoker: RemoteInvoker,
    pub stats: Arc<RuntimeStats>,
    pub(crate) halt_grace: Duration,
    handle: Handle,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for ShardContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardContext")
            .field("shard", &self.shard)
            .field("instance_id", &self.mode.instance_id())
            .finish()
    }
}

impl ShardContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shard: ShardInfo,
        settings: Collection,
        mode: InstanceMode,
        plugins: Arc<PluginManager>,
        invoker: RemoteInvoker,
        stats: Arc<RuntimeStats>,
        halt_grace: Duration,
        handle: Handle,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            shard,
            settings,
            mode,
            plugins,
            invoker,
            stats,
            halt_grace,
            handle,
            cancel_token,
        }
    }

    /// Drive a future to completion from the remote worker thread.
    ///
    /// Must not be called from inside the async runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Run a future on the event loop without waiting for it.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Shut this shard down: stop reconciliation, unload every plugin, give
    /// in-flight work the grace period, then cancel all runtime tasks.
    pub async fn halt(&self) {
        info!(shard = self.shard.id, "Halting shard");
        self.plugins.suspend_reconcile();
        self.plugins.unload_all().await;
        tokio::time::sleep(self.halt_grace).await;
        self.cancel_token.cancel();
    }
}
