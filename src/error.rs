// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Typed errors for the runtime's public operations.

use thiserror::Error;

use crate::protocol::{RequestId, Target};

/// Failures while issuing a remote request.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("target {target} is outside the deployment of {shard_count} shard(s)")]
    InvalidTarget { target: Target, shard_count: u32 },

    #[error("failed to encode request {id}: {source}")]
    Encode {
        id: RequestId,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to publish request {id}: {source}")]
    Publish {
        id: RequestId,
        #[source]
        source: anyhow::Error,
    },

    #[error("request {0} was dropped before a response arrived")]
    Dropped(RequestId),

    #[error("request {0} expected a {1} reply")]
    UnexpectedReply(RequestId, &'static str),
}

/// Failures of plugin lifecycle operations.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {0:?} is not registered")]
    NotRegistered(String),

    #[error("plugin {0:?} is not loaded")]
    NotActive(String),

    #[error("plugin {0:?} is the bootstrap plugin and cannot be unloaded")]
    BootstrapProtected(String),

    #[error("plugin {name:?} failed to set up: {source}")]
    SetupFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("plugin {name:?} failed to reload and is now unloaded: {source}")]
    ReloadFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("plugin state could not be persisted: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Invoke(#[from] InvokeError),
}

/// Errors that abort process startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[source] anyhow::Error),

    #[error("unable to reach the settings store: {0}")]
    StoreUnreachable(#[source] anyhow::Error),

    #[error("unable to reach the pub/sub transport: {0}")]
    TransportUnavailable(#[source] anyhow::Error),

    #[error("gateway login failed: {0}")]
    LoginFailed(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StartupError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Other(_) => 1,
            StartupError::StoreUnreachable(_) | StartupError::TransportUnavailable(_) => 2,
            StartupError::LoginFailed(_) => 3,
            StartupError::Config(_) => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_cause() {
        let codes = [
            StartupError::Other(anyhow::anyhow!("x")).exit_code(),
            StartupError::StoreUnreachable(anyhow::anyhow!("x")).exit_code(),
            StartupError::LoginFailed(anyhow::anyhow!("x")).exit_code(),
            StartupError::Config(anyhow::anyhow!("x")).exit_code(),
        ];
        assert_eq!(codes, [1, 2, 3, 4]);
    }

    #[test]
    fn bootstrap_rejection_names_the_plugin() {
        let error = PluginError::BootstrapProtected("cogs.core".into());
        assert!(error.to_string().contains("cogs.core"));
    }
}
