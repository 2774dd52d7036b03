// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The bootstrap plugin and the admission predicates it installs.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::gateway::InboundMessage;
use crate::runtime::admission::Predicate;
use crate::runtime::plugins::{Plugin, PluginContext};
use crate::runtime::settings::GuildSettingsStore;

/// Default name of the bootstrap plugin.
pub const CORE_PLUGIN: &str = "cogs.core";

pub const GUILD_ADMIN_OVERRIDE: &str = "guild_admin";
pub const IGNORE_LIST_PRECONDITION: &str = "ignore_list";

/// Admits guild owners and holders of the guild's configured admin role.
pub struct GuildAdminOverride {
    guilds: GuildSettingsStore,
}

impl GuildAdminOverride {
    pub fn new(guilds: GuildSettingsStore) -> Self {
        Self { guilds }
    }
}

#[async_trait]
impl Predicate for GuildAdminOverride {
    async fn evaluate(&self, message: &InboundMessage) -> Result<bool> {
        let Some(guild) = &message.guild else {
            return Ok(false);
        };
        if guild.owner_id == message.author_id {
            return Ok(true);
        }
        let roles = self.guilds.roles(guild.guild_id).await?;
        Ok(roles
            .admin
            .is_some_and(|admin| guild.author_roles.contains(&admin)))
    }
}

/// Drops messages whose author, channel or guild is on the guild's ignore
/// list.
pub struct IgnoreListPrecondition {
    guilds: GuildSettingsStore,
}

impl IgnoreListPrecondition {
    pub fn new(guilds: GuildSettingsStore) -> Self {
        Self { guilds }
    }
}

#[async_trait]
impl Predicate for IgnoreListPrecondition {
    async fn evaluate(&self, message: &InboundMessage) -> Result<bool> {
        let Some(guild) = &message.guild else {
            return Ok(true);
        };
        let ignores = self.guilds.ignores(guild.guild_id).await?;
        let ignored = [message.author_id, message.channel_id, guild.guild_id]
            .iter()
            .any(|id| ignores.contains(id));
        Ok(!ignored)
    }
}

/// Bootstrap plugin. Loaded before anything else and never unloaded except
/// by a halt.
#[derive(Debug, Default)]
pub struct CorePlugin;

#[async_trait]
impl Plugin for CorePlugin {
    async fn setup(&self, ctx: &PluginContext) -> Result<()> {
        ctx.add_override(
            GUILD_ADMIN_OVERRIDE,
            Arc::new(GuildAdminOverride::new(ctx.guilds.clone())),
        );
        ctx.add_precondition(
            IGNORE_LIST_PRECONDITION,
            Arc::new(IgnoreListPrecondition::new(ctx.guilds.clone())),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GuildContext;
    use crate::runtime::settings::RoleKind;
    use crate::store::{Collection, MemoryStore};

    fn guilds() -> GuildSettingsStore {
        GuildSettingsStore::new(Collection::new(Arc::new(MemoryStore::new()), "settings"))
    }

    fn guild_message(author_id: u64, roles: Vec<u64>) -> InboundMessage {
        InboundMessage {
            id: 1,
            author_id,
            channel_id: 20,
            guild: Some(GuildContext {
                guild_id: 30,
                owner_id: 99,
                author_roles: roles,
            }),
            content: "!ping".into(),
        }
    }

    #[tokio::test]
    async fn guild_owner_and_admin_role_override() -> Result<()> {
        let guilds = guilds();
        let predicate = GuildAdminOverride::new(guilds.clone());

        assert!(predicate.evaluate(&guild_message(99, vec![])).await?);
        assert!(!predicate.evaluate(&guild_message(1, vec![5])).await?);

        guilds.set_role(30, RoleKind::Admin, Some(5)).await?;
        assert!(predicate.evaluate(&guild_message(1, vec![5])).await?);
        Ok(())
    }

    #[tokio::test]
    async fn ignore_list_matches_author_channel_or_guild() -> Result<()> {
        let guilds = guilds();
        let predicate = IgnoreListPrecondition::new(guilds.clone());
        assert!(predicate.evaluate(&guild_message(1, vec![])).await?);

        guilds.set_ignored(30, 20, true).await?;
        assert!(!predicate.evaluate(&guild_message(1, vec![])).await?);

        guilds.set_ignored(30, 20, false).await?;
        guilds.set_ignored(30, 30, true).await?;
        assert!(!predicate.evaluate(&guild_message(1, vec![])).await?);
        Ok(())
    }

    #[tokio::test]
    async fn direct_messages_pass_through() -> Result<()> {
        let message = InboundMessage {
            author_id: 1,
            ..Default::default()
        };
        assert!(!GuildAdminOverride::new(guilds()).evaluate(&message).await?);
        assert!(IgnoreListPrecondition::new(guilds()).evaluate(&message).await?);
        Ok(())
    }
}
