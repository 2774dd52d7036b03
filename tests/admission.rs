// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inbound message admission on a running shard.

mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::{Deployment, RecordingGateway, eventually, init_tracing, message};
use heleus_runtime::runtime::{AdmitReason, DropReason, RoleKind};
use heleus_runtime::{
    ApplicationOwners, CoreMode, GuildContext, InboundMessage, Plugin, PluginContext, Verdict,
    plugin_factory,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const GUILD: u64 = 900;
const GUILD_OWNER: u64 = 901;
const ADMIN_ROLE: u64 = 902;

fn guild_message(id: u64, author_id: u64, author_roles: Vec<u64>) -> InboundMessage {
    InboundMessage {
        guild: Some(GuildContext {
            guild_id: GUILD,
            owner_id: GUILD_OWNER,
            author_roles,
        }),
        ..message(id, author_id)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn messages_are_dropped_until_the_shard_is_up() -> Result<()> {
    init_tracing();
    let deployment = Deployment::new(1);
    let gateway = RecordingGateway::new(ApplicationOwners::Team(vec![7]));
    let shard = deployment.builder(0).gateway(gateway.clone()).build().await?;

    let verdict = shard.handle_message(&message(1, 7)).await?;
    assert_eq!(verdict, Verdict::Drop(DropReason::Mode(CoreMode::Down)));

    shard.signal_ready();
    shard.boot().await?;

    let verdict = shard.handle_message(&message(2, 100)).await?;
    assert_eq!(verdict, Verdict::Dispatch(AdmitReason::Passed));
    assert_eq!(gateway.processed(), vec![2]);

    shard.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn ignore_list_drops_channels_authors_and_guilds() -> Result<()> {
    init_tracing();
    let deployment = Deployment::new(1);
    let shard = deployment.start(0).await?;
    shard.signal_ready();
    shard.boot().await?;
    let guilds = shard.guilds();

    guilds.set_ignored(GUILD, 500, true).await?;
    let verdict = shard.handle_message(&guild_message(1, 100, vec![])).await?;
    assert_eq!(
        verdict,
        Verdict::Drop(DropReason::Precondition("ignore_list".to_string()))
    );

    // Direct messages never match a guild ignore list.
    let verdict = shard.handle_message(&message(2, 100)).await?;
    assert!(verdict.is_dispatch());

    guilds.set_ignored(GUILD, 500, false).await?;
    guilds.set_ignored(GUILD, 100, true).await?;
    let verdict = shard.handle_message(&guild_message(5, 100, vec![])).await?;
    assert!(!verdict.is_dispatch());
    assert!(shard.handle_message(&guild_message(6, 101, vec![])).await?.is_dispatch());

    guilds.set_ignored(GUILD, 100, false).await?;
    guilds.set_ignored(GUILD, GUILD, true).await?;
    let verdict = shard.handle_message(&guild_message(3, 100, vec![])).await?;
    assert!(!verdict.is_dispatch());

    // Guild admins bypass preconditions.
    let verdict = shard.handle_message(&guild_message(4, GUILD_OWNER, vec![])).await?;
    assert_eq!(
        verdict,
        Verdict::Dispatch(AdmitReason::Override("guild_admin".to_string()))
    );

    shard.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn maintenance_admits_only_owners() -> Result<()> {
    init_tracing();
    let deployment = Deployment::new(1);
    let gateway = RecordingGateway::new(ApplicationOwners::User(42));
    let shard = deployment.builder(0).gateway(gateway.clone()).build().await?;
    shard.signal_ready();
    shard.boot().await?;
    shard.guilds().set_role(GUILD, RoleKind::Admin, Some(ADMIN_ROLE)).await?;

    shard.set_shard_mode(0, CoreMode::Maintenance).await?;
    assert_eq!(shard.mode().current().await?, CoreMode::Maintenance);

    let verdict = shard.handle_message(&guild_message(1, 100, vec![])).await?;
    assert_eq!(verdict, Verdict::Drop(DropReason::Maintenance));

    // Guild admins are an override, and maintenance skips overrides.
    let verdict = shard.handle_message(&guild_message(2, 100, vec![ADMIN_ROLE])).await?;
    assert_eq!(verdict, Verdict::Drop(DropReason::Maintenance));
    let verdict = shard.handle_message(&guild_message(4, GUILD_OWNER, vec![])).await?;
    assert_eq!(verdict, Verdict::Drop(DropReason::Maintenance));

    let owners = shard.owners().clone();
    assert!(eventually(Duration::from_secs(2), || {
        let owners = owners.clone();
        async move { owners.contains(42) }
    })
    .await);
    let verdict = shard.handle_message(&message(3, 42)).await?;
    assert_eq!(verdict, Verdict::Dispatch(AdmitReason::Owner));
    assert_eq!(gateway.processed(), vec![3]);

    // A single application owner is persisted.
    let persisted: Vec<u64> = shard.context().settings.get_or("owners", Vec::new()).await?;
    assert_eq!(persisted, vec![42]);

    shard.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_predicates_are_removed() -> Result<()> {
    init_tracing();
    let deployment = Deployment::new(1);
    let shard = deployment.start(0).await?;
    shard.signal_ready();
    shard.boot().await?;

    shard.admission().add_precondition(
        "flaky",
        heleus_runtime::predicate_fn(|_msg| Err(anyhow::anyhow!("store unavailable"))),
    );
    let verdict = shard.handle_message(&message(1, 100)).await?;
    assert!(verdict.is_dispatch());
    assert_eq!(
        shard
            .admission()
            .names(heleus_runtime::runtime::PredicateKind::Precondition),
        vec!["ignore_list".to_string()]
    );

    shard.shutdown().await?;
    Ok(())
}

struct Observer {
    seen: Arc<AtomicUsize>,
}

#[async_trait]
impl Plugin for Observer {
    async fn setup(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    async fn on_message(&self, _ctx: &PluginContext, _message: &InboundMessage) -> Result<()> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn plugin_hooks_see_messages_admission_drops() -> Result<()> {
    init_tracing();
    let deployment = Deployment::new(1);
    let seen = Arc::new(AtomicUsize::new(0));
    let factory_seen = seen.clone();
    let shard = deployment
        .builder(0)
        .plugin(
            "cogs.observer",
            plugin_factory(move || {
                Ok(Observer {
                    seen: factory_seen.clone(),
                })
            }),
        )
        .build()
        .await?;
    shard.plugins().load("cogs.observer").await?;

    // Not booted: the record is missing and the shard reads as down.
    let verdict = shard.handle_message(&message(1, 100)).await?;
    assert!(!verdict.is_dispatch());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(shard.context().stats.messages_seen(), 1);

    shard.shutdown().await?;
    Ok(())
}
