// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Persisted runtime settings: per-guild roles and ignores, owners,
//! command prefixes, and the one-shot migration of legacy layouts.

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::gateway::{GuildId, RoleId, UserId};
use crate::store::Collection;

pub const OWNERS_KEY: &str = "owners";
pub const PREFIXES_KEY: &str = "prefixes";
pub const INFO_KEY: &str = "__info__";
const LEGACY_ROLES_KEY: &str = "roles";
const LEGACY_IGNORES_KEY: &str = "ignores";

/// Role slots a guild can configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Admin,
    Moderator,
}

impl RoleKind {
    pub fn key(&self) -> &'static str {
        match self {
            RoleKind::Admin => "admin",
            RoleKind::Moderator => "mod",
        }
    }
}

/// Configured role ids for one guild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildRoles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<RoleId>,
    #[serde(default, rename = "mod", skip_serializing_if = "Option::is_none")]
    pub moderator: Option<RoleId>,
}

impl GuildRoles {
    pub fn get(&self, kind: RoleKind) -> Option<RoleId> {
        match kind {
            RoleKind::Admin => self.admin,
            RoleKind::Moderator => self.moderator,
        }
    }

    fn slot(&mut self, kind: RoleKind) -> &mut Option<RoleId> {
        match kind {
            RoleKind::Admin => &mut self.admin,
            RoleKind::Moderator => &mut self.moderator,
        }
    }
}

/// Document stored at `guilds:{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildSettings {
    #[serde(default)]
    pub roles: GuildRoles,
    /// User, channel and guild ids whose messages are ignored.
    #[serde(default)]
    pub ignores: Vec<u64>,
}

/// Typed access to per-guild settings.
#[derive(Debug, Clone)]
pub struct GuildSettingsStore {
    settings: Collection,
}

impl GuildSettingsStore {
    pub fn new(settings: Collection) -> Self {
        Self { settings }
    }

    fn key(guild: GuildId) -> String {
        format!("guilds:{guild}")
    }

    pub async fn get(&self, guild: GuildId) -> Result<GuildSettings> {
        self.settings
            .get_or(&Self::key(guild), GuildSettings::default())
            .await
    }

    pub async fn put(&self, guild: GuildId, settings: &GuildSettings) -> Result<()> {
        self.settings.set(&Self::key(guild), settings).await
    }

    pub async fn roles(&self, guild: GuildId) -> Result<GuildRoles> {
        Ok(self.get(guild).await?.roles)
    }

    pub async fn ignores(&self, guild: GuildId) -> Result<Vec<u64>> {
        Ok(self.get(guild).await?.ignores)
    }

    /// Set or clear (`None`) one role slot.
    pub async fn set_role(&self, guild: GuildId, kind: RoleKind, role: Option<RoleId>) -> Result<()> {
        let mut settings = self.get(guild).await?;
        *settings.roles.slot(kind) = role;
        self.put(guild, &settings).await
    }

    /// Add `id` to the ignore list, or remove it. Idempotent either way.
    ///
    /// The list holds channel ids, author ids and the guild id itself; a
    /// message is ignored when any of them matches.
    pub async fn set_ignored(&self, guild: GuildId, id: u64, ignored: bool) -> Result<()> {
        let mut settings = self.get(guild).await?;
        let present = settings.ignores.contains(&id);
        match (ignored, present) {
            (true, false) => settings.ignores.push(id),
            (false, true) => settings.ignores.retain(|entry| *entry != id),
            _ => {}
        }
        self.put(guild, &settings).await
    }
}

/// Stored command prefixes; generates and persists a random numeric one
/// when none exist.
pub async fn load_or_init_prefixes(settings: &Collection) -> Result<Vec<String>> {
    if let Some(prefixes) = settings.get::<Vec<String>>(PREFIXES_KEY).await? {
        return Ok(prefixes);
    }
    let prefix = rand::rng().random_range(1..=256u32).to_string();
    let prefixes = vec![prefix];
    settings
        .set(PREFIXES_KEY, &prefixes)
        .await
        .context("persisting generated prefix")?;
    Ok(prefixes)
}

pub async fn persisted_owners(settings: &Collection) -> Result<Vec<UserId>> {
    settings.get_or(OWNERS_KEY, Vec::new()).await
}

#[derive(Debug, Deserialize)]
struct LegacyIgnore {
    #[serde(default)]
    ignored_channels: Vec<Value>,
    #[serde(default)]
    server_ignore: bool,
}

fn as_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// What [`migrate_legacy`] moved.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub roles: usize,
    pub ignores: usize,
}

/// Move top-level `roles` / `ignores` documents into per-guild settings.
///
/// Keys are written one guild at a time and the legacy key is deleted last,
/// so an interrupted migration is retried on the next boot.
pub async fn migrate_legacy(settings: &Collection) -> Result<MigrationReport> {
    let guilds = GuildSettingsStore::new(settings.clone());
    let keys = settings.keys().await?;
    let mut report = MigrationReport::default();

    if keys.contains(LEGACY_ROLES_KEY) {
        let legacy: BTreeMap<String, BTreeMap<String, Value>> = settings
            .get_or(LEGACY_ROLES_KEY, BTreeMap::new())
            .await?;
        for (guild, entries) in legacy {
            let Ok(guild_id) = guild.parse::<GuildId>() else {
                warn!(guild = %guild, "Skipping legacy roles for malformed guild id");
                continue;
            };
            let mut current = guilds.get(guild_id).await?;
            for (name, value) in entries {
                let kind = match name.strip_suffix("_role").unwrap_or(&name) {
                    "admin" => RoleKind::Admin,
                    "mod" => RoleKind::Moderator,
                    other => {
                        warn!(guild_id, role = other, "Unknown legacy role dropped");
                        continue;
                    }
                };
                *current.roles.slot(kind) = as_id(&value);
            }
            guilds.put(guild_id, &current).await?;
            report.roles += 1;
        }
        settings.delete(LEGACY_ROLES_KEY).await?;
    }

    if keys.contains(LEGACY_IGNORES_KEY) {
        let legacy: BTreeMap<String, LegacyIgnore> = settings
            .get_or(LEGACY_IGNORES_KEY, BTreeMap::new())
            .await?;
        for (guild, entry) in legacy {
            let Ok(guild_id) = guild.parse::<GuildId>() else {
                warn!(guild = %guild, "Skipping legacy ignores for malformed guild id");
                continue;
            };
            let mut ignores: Vec<u64> = entry.ignored_channels.iter().filter_map(as_id).collect();
            if entry.server_ignore {
                ignores.push(guild_id);
            }
            let mut current = guilds.get(guild_id).await?;
            current.ignores = ignores;
            guilds.put(guild_id, &current).await?;
            report.ignores += 1;
        }
        settings.delete(LEGACY_IGNORES_KEY).await?;
    }

    if report != MigrationReport::default() {
        info!(roles = report.roles, ignores = report.ignores, "Migrated legacy guild settings");
    }
    Ok(report)
}
