// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. TOML file named by `HELEUS_CONFIG_PATH`
//! 3. `HELEUS_*` environment variables (`__` separates nested keys, e.g.
//!    `HELEUS_ZMQ__PUBLISH_ENDPOINT`)
//! 4. Programmatic overrides merged by the caller (the CLI)

use figment::{
    Figment, Provider,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::runtime::core_plugin::CORE_PLUGIN;

pub const CONFIG_PATH_ENV: &str = "HELEUS_CONFIG_PATH";
pub const ENV_PREFIX: &str = "HELEUS_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// ZeroMQ endpoints for the pub/sub channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZmqConfig {
    /// Endpoint this shard's PUB socket binds, e.g. `tcp://0.0.0.0:7100`
    pub publish_endpoint: Option<String>,
    /// PUB endpoints of every shard, this one included
    #[serde(default)]
    pub peer_endpoints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_shard_range"))]
pub struct RuntimeConfig {
    /// Display name of the bot
    pub name: String,

    /// Zero-based index of this shard
    pub shard_id: u32,

    #[validate(range(min = 1))]
    pub shard_count: u32,

    /// Plugins loaded on first start; `ns.*` selects every plugin under `ns`
    pub autoload: Vec<String>,

    /// Bootstrap plugin
    pub loader: String,

    /// Key prefix for all runtime state in the store
    pub store_prefix: String,

    /// Shared pub/sub channel name
    pub channel: String,

    #[validate(range(min = 1))]
    pub broadcast_timeout_ms: u64,

    #[validate(range(min = 1))]
    pub aggregator_poll_ms: u64,

    #[validate(range(min = 1))]
    pub reconcile_interval_ms: u64,

    #[validate(range(min = 1))]
    pub owner_refresh_interval_ms: u64,

    pub halt_grace_ms: u64,

    #[serde(default)]
    pub zmq: ZmqConfig,
}

fn validate_shard_range(config: &RuntimeConfig) -> Result<(), ValidationError> {
    if config.shard_id >= config.shard_count {
        return Err(ValidationError::new("shard_range").with_message(Cow::Owned(format!(
            "shard_id {} is outside 0..{}",
            config.shard_id, config.shard_count
        ))));
    }
    Ok(())
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "Heleus".to_string(),
            shard_id: 0,
            shard_count: 1,
            autoload: Vec::new(),
            loader: CORE_PLUGIN.to_string(),
            store_prefix: "settings".to_string(),
            channel: "heleus.0.pubsub.code".to_string(),
            broadcast_timeout_ms: 1000,
            aggregator_poll_ms: 10,
            reconcile_interval_ms: 1000,
            owner_refresh_interval_ms: 15_000,
            halt_grace_ms: 2000,
            zmq: ZmqConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults, then the optional TOML file, then environment variables.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(RuntimeConfig::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }

    pub fn aggregator_poll(&self) -> Duration {
        Duration::from_millis(self.aggregator_poll_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn owner_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.owner_refresh_interval_ms)
    }

    pub fn halt_grace(&self) -> Duration {
        Duration::from_millis(self.halt_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RuntimeConfig::extract_from(Serialized::defaults(RuntimeConfig::default()))
            .expect("defaults validate");
        assert_eq!(config.loader, "cogs.core");
        assert_eq!(config.broadcast_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn overrides_win_over_defaults() {
        let config = RuntimeConfig::extract_from(
            Figment::new()
                .merge(Serialized::defaults(RuntimeConfig::default()))
                .merge(("shard_count", 3u32))
                .merge(("shard_id", 2u32))
                .merge(("autoload", vec!["cogs.*"])),
        )
        .expect("valid overrides");
        assert_eq!(config.shard_id, 2);
        assert_eq!(config.autoload, vec!["cogs.*".to_string()]);
    }

    #[test]
    fn shard_id_must_be_below_count() {
        let result = RuntimeConfig::extract_from(
            Figment::new()
                .merge(Serialized::defaults(RuntimeConfig::default()))
                .merge(("shard_count", 2u32))
                .merge(("shard_id", 2u32)),
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let result = RuntimeConfig::extract_from(
            Figment::new()
                .merge(Serialized::defaults(RuntimeConfig::default()))
                .merge(("aggregator_poll_ms", 0u64)),
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn environment_nesting() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("HELEUS_SHARD_COUNT", "4");
            jail.set_env("HELEUS_ZMQ__PUBLISH_ENDPOINT", "tcp://127.0.0.1:7100");
            let config = RuntimeConfig::from_env().map_err(|e| e.to_string())?;
            assert_eq!(config.shard_count, 4);
            assert_eq!(
                config.zmq.publish_endpoint.as_deref(),
                Some("tcp://127.0.0.1:7100")
            );
            Ok(())
        });
    }
}
