// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Remote functions every shard registers for shard administration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::handler::{FunctionRegistry, RemoteArgs, remote_fn};
use crate::protocol::ShardIndex;
use crate::runtime::context::ShardContext;
use crate::runtime::mode::CoreMode;

pub const GATHER_INFO: &str = "gather_info";
pub const SET_MODE: &str = "set_mode";
pub const HALT: &str = "halt";
pub const RELOAD_CORE: &str = "reload_core";

/// Status snapshot returned by `gather_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatus {
    pub shard_id: ShardIndex,
    pub status: CoreMode,
    pub messages_seen: u64,
    pub host: String,
    /// Seconds since the Unix epoch
    pub up_since: u64,
}

fn gather_info(ctx: &ShardContext, _args: RemoteArgs) -> Result<ShardStatus> {
    let status = ctx.block_on(ctx.mode.current())?;
    Ok(ShardStatus {
        shard_id: ctx.shard.id,
        status,
        messages_seen: ctx.stats.messages_seen(),
        host: whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into()),
        up_since: ctx.stats.up_since(),
    })
}

fn set_mode(ctx: &ShardContext, args: RemoteArgs) -> Result<CoreMode> {
    let mode: CoreMode = args.get(0).context("set_mode expects a mode")?;
    ctx.block_on(ctx.mode.set(mode))?;
    Ok(mode)
}

/// Halts this shard unless its id matches the `ignore` keyword argument.
fn halt(ctx: &ShardContext, args: RemoteArgs) -> Result<bool> {
    let ignore: Option<ShardIndex> = args.get_kwarg("ignore")?;
    if ignore == Some(ctx.shard.id) {
        return Ok(false);
    }
    let shard = ctx.clone();
    ctx.spawn(async move { shard.halt().await });
    Ok(true)
}

/// Reloads the bootstrap plugin on the event loop; the worker returns at once.
fn reload_core(ctx: &ShardContext, _args: RemoteArgs) -> Result<()> {
    let plugins = ctx.plugins.clone();
    ctx.spawn(async move {
        let name = plugins.bootstrap().to_string();
        match plugins.reload_local(&name).await {
            Ok(()) => info!(plugin = %name, "Bootstrap plugin reloaded"),
            Err(e) => warn!(plugin = %name, error = %e, "Bootstrap plugin reload failed"),
        }
    });
    Ok(())
}

/// Register the administration functions on `registry`.
pub fn register_system_functions(registry: &FunctionRegistry) {
    registry.register(GATHER_INFO, remote_fn(gather_info));
    registry.register(SET_MODE, remote_fn(set_mode));
    registry.register(HALT, remote_fn(halt));
    registry.register(RELOAD_CORE, remote_fn(reload_core));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_system_functions_are_registered() {
        let registry = FunctionRegistry::new();
        register_system_functions(&registry);
        assert_eq!(
            registry.names(),
            vec!["gather_info", "halt", "reload_core", "set_mode"]
        );
    }
}
