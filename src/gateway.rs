// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Boundary to the chat platform.
//!
//! The runtime never speaks the platform protocol itself. It receives
//! [`InboundMessage`]s from whoever owns the connection and hands admitted
//! ones back through [`Gateway::process_commands`].

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

pub type UserId = u64;
pub type ChannelId = u64;
pub type GuildId = u64;
pub type RoleId = u64;

/// Guild-side facts about a message, absent for direct messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildContext {
    pub guild_id: GuildId,
    pub owner_id: UserId,
    /// Roles held by the author in this guild.
    #[serde(default)]
    pub author_roles: Vec<RoleId>,
}

/// A message as seen by the admission pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: u64,
    pub author_id: UserId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild: Option<GuildContext>,
    #[serde(default)]
    pub content: String,
}

impl InboundMessage {
    pub fn guild_id(&self) -> Option<GuildId> {
        self.guild.as_ref().map(|guild| guild.guild_id)
    }
}

/// Who owns the bot application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationOwners {
    /// Team-owned: accepted members, not persisted
    Team(Vec<UserId>),
    /// Single owner: persisted to the owner set
    User(UserId),
}

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Authenticate with the platform. Failure aborts startup.
    async fn login(&self) -> Result<()> {
        Ok(())
    }

    /// Dispatch an admitted message to command processing.
    async fn process_commands(&self, message: &InboundMessage) -> Result<()>;

    /// Owners of the bot application as reported by the platform.
    async fn application_owners(&self) -> Result<ApplicationOwners>;

    /// Display name of the bot account, used in the boot banner.
    fn bot_user(&self) -> String;
}

/// Gateway for running without a chat connection: admitted messages are
/// only logged.
#[derive(Debug, Clone)]
pub struct LogGateway {
    name: String,
}

impl LogGateway {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Gateway for LogGateway {
    async fn process_commands(&self, message: &InboundMessage) -> Result<()> {
        info!(
            message_id = message.id,
            author_id = message.author_id,
            channel_id = message.channel_id,
            "Admitted message"
        );
        Ok(())
    }

    async fn application_owners(&self) -> Result<ApplicationOwners> {
        Ok(ApplicationOwners::Team(Vec::new()))
    }

    fn bot_user(&self) -> String {
        self.name.clone()
    }
}
