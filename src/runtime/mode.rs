// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Persisted per-instance operating mode.
//!
//! ```text
//!   (start) ──► boot ──ready──► up
//!                ▲               │
//!                └───restart─────┘
//!   maintenance / down: entered and left only through explicit set_mode
//! ```
//!
//! The record lives at `instances:{instance_id}` in the settings collection
//! and survives restarts, except that a persisted `up` is demoted to `boot`
//! on the next start so the instance re-runs its self test.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::store::Collection;

/// Operating mode of one shard instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreMode {
    /// Every message is dropped
    Down,
    /// Self test running; every message is dropped
    Boot,
    /// Normal operation
    Up,
    /// Only owners get through
    Maintenance,
}

impl CoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreMode::Down => "down",
            CoreMode::Boot => "boot",
            CoreMode::Up => "up",
            CoreMode::Maintenance => "maintenance",
        }
    }

    /// Whether messages are dropped without consulting any predicate.
    pub fn drops_everything(&self) -> bool {
        matches!(self, CoreMode::Down | CoreMode::Boot)
    }
}

impl fmt::Display for CoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoreMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "down" => Ok(CoreMode::Down),
            "boot" => Ok(CoreMode::Boot),
            "up" => Ok(CoreMode::Up),
            "maintenance" => Ok(CoreMode::Maintenance),
            other => bail!("unknown mode {other:?}; expected down, boot, up or maintenance"),
        }
    }
}

/// Stored form of an instance's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub mode: CoreMode,
}

/// Stable identifier of a shard process: a digest of host, working
/// directory, shard index and shard count.
pub fn instance_id(host: &str, cwd: &Path, shard_id: u32, shard_count: u32) -> String {
    let seed = format!("{host}_{}_{shard_id}_{shard_count}", cwd.display());
    hex::encode(Sha256::digest(seed.as_bytes()))
}

/// Instance identifier for this process.
pub fn local_instance_id(shard_id: u32, shard_count: u32) -> Result<String> {
    let host = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into());
    let cwd = std::env::current_dir().context("reading working directory")?;
    Ok(instance_id(&host, &cwd, shard_id, shard_count))
}

/// Read/write access to one instance's persisted mode.
#[derive(Debug, Clone)]
pub struct InstanceMode {
    settings: Collection,
    instance_id: String,
}

impl InstanceMode {
    pub fn new(settings: Collection, instance_id: impl Into<String>) -> Self {
        Self {
            settings,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn key(&self) -> String {
        format!("instances:{}", self.instance_id)
    }

    pub async fn record(&self) -> Result<Option<InstanceRecord>> {
        self.settings.get(&self.key()).await
    }

    /// Current mode. An instance with no record reads as `down`.
    pub async fn current(&self) -> Result<CoreMode> {
        Ok(self
            .record()
            .await?
            .map(|record| record.mode)
            .unwrap_or(CoreMode::Down))
    }

    /// Persist `mode` unconditionally.
    pub async fn set(&self, mode: CoreMode) -> Result<()> {
        self.settings
            .set(&self.key(), &InstanceRecord { mode })
            .await
            .with_context(|| format!("persisting mode {mode} for instance {}", self.instance_id))?;
        info!(instance_id = %self.instance_id, %mode, "Instance mode changed");
        Ok(())
    }

    /// Start-of-boot transition: a persisted `up` becomes `boot`.
    ///
    /// Returns the mode the instance boots in; `boot` when nothing is stored.
    pub async fn begin_boot(&self) -> Result<CoreMode> {
        match self.record().await? {
            Some(InstanceRecord { mode: CoreMode::Up }) => {
                self.set(CoreMode::Boot).await?;
                Ok(CoreMode::Boot)
            }
            Some(record) => Ok(record.mode),
            None => Ok(CoreMode::Boot),
        }
    }

    /// End-of-boot transition: `boot` (stored or implied) becomes `up`.
    /// Any other mode is left as is.
    pub async fn mark_ready(&self) -> Result<CoreMode> {
        match self.record().await? {
            None | Some(InstanceRecord { mode: CoreMode::Boot }) => {
                self.set(CoreMode::Up).await?;
                Ok(CoreMode::Up)
            }
            Some(record) => Ok(record.mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn mode() -> InstanceMode {
        let settings = Collection::new(Arc::new(MemoryStore::new()), "settings");
        InstanceMode::new(settings, "abc")
    }

    #[test]
    fn instance_id_is_stable_and_distinct() {
        let cwd = PathBuf::from("/srv/bot");
        let a = instance_id("host", &cwd, 0, 2);
        assert_eq!(a, instance_id("host", &cwd, 0, 2));
        assert_ne!(a, instance_id("host", &cwd, 1, 2));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn parses_modes() {
        assert_eq!("Maintenance".parse::<CoreMode>().unwrap(), CoreMode::Maintenance);
        assert!("sideways".parse::<CoreMode>().is_err());
    }

    #[tokio::test]
    async fn missing_record_reads_down() -> Result<()> {
        assert_eq!(mode().current().await?, CoreMode::Down);
        Ok(())
    }

    #[tokio::test]
    async fn up_is_demoted_on_restart() -> Result<()> {
        let mode = mode();
        mode.set(CoreMode::Up).await?;

        assert_eq!(mode.begin_boot().await?, CoreMode::Boot);
        assert_eq!(mode.current().await?, CoreMode::Boot);
        assert_eq!(mode.mark_ready().await?, CoreMode::Up);
        Ok(())
    }

    #[tokio::test]
    async fn maintenance_survives_boot() -> Result<()> {
        let mode = mode();
        mode.set(CoreMode::Maintenance).await?;

        assert_eq!(mode.begin_boot().await?, CoreMode::Maintenance);
        assert_eq!(mode.mark_ready().await?, CoreMode::Maintenance);
        Ok(())
    }
}
