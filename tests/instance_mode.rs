// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Boot sequence, persisted instance mode and shard administration.

mod common;

use anyhow::Result;
use common::{Deployment, eventually, init_tracing, message};
use heleus_runtime::runtime::{DropReason, ShardListing};
use heleus_runtime::{CoreMode, KeyValueStore, Verdict};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn restart_after_up_passes_through_boot() -> Result<()> {
    init_tracing();
    let deployment = Deployment::new(1);

    let first = deployment.start(0).await?;
    first.signal_ready();
    first.boot().await?;
    assert_eq!(first.mode().current().await?, CoreMode::Up);
    first.shutdown().await?;

    let second = Arc::new(deployment.start(0).await?);
    // Demoted as soon as the runtime exists, before boot() runs.
    assert_eq!(second.mode().current().await?, CoreMode::Boot);
    let verdict = second.handle_message(&message(0, 100)).await?;
    assert_eq!(verdict, Verdict::Drop(DropReason::Mode(CoreMode::Boot)));

    let booting = {
        let second = second.clone();
        tokio::spawn(async move { second.boot().await })
    };

    let mode = second.mode().clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            let mode = mode.clone();
            async move { matches!(mode.current().await, Ok(CoreMode::Boot)) }
        })
        .await
    );
    let verdict = second.handle_message(&message(1, 100)).await?;
    assert_eq!(verdict, Verdict::Drop(DropReason::Mode(CoreMode::Boot)));

    second.signal_ready();
    booting.await??;
    assert_eq!(second.mode().current().await?, CoreMode::Up);
    assert!(second.handle_message(&message(2, 100)).await?.is_dispatch());

    second.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn operator_modes_survive_a_restart() -> Result<()> {
    init_tracing();
    let deployment = Deployment::new(1);
    let shard = deployment.start(0).await?;
    shard.mode().set(CoreMode::Maintenance).await?;
    shard.signal_ready();
    shard.boot().await?;
    assert_eq!(shard.mode().current().await?, CoreMode::Maintenance);

    shard.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn boot_writes_banner_prefixes_and_migrates_legacy_settings() -> Result<()> {
    init_tracing();
    let deployment = Deployment::new(1);
    deployment
        .store
        .set("settings:roles", json!({ "77": { "admin_role": "7701", "mod_role": 7702 } }))
        .await?;
    deployment
        .store
        .set(
            "settings:ignores",
            json!({ "77": { "ignored_channels": ["5"], "server_ignore": true } }),
        )
        .await?;

    let shard = deployment.start(0).await?;
    shard.signal_ready();
    shard.boot().await?;

    let banner = deployment.store.get("__info__").await?;
    assert_eq!(
        banner,
        Some(json!(
            "This database is used by the Heleus bot, logged in as user Heleus."
        ))
    );

    let prefixes = shard.prefixes();
    assert_eq!(prefixes.len(), 1);
    let prefix: u32 = prefixes[0].parse()?;
    assert!((1..=256).contains(&prefix));

    let settings = shard.guilds().get(77).await?;
    assert_eq!(settings.roles.admin, Some(7701));
    assert_eq!(settings.roles.moderator, Some(7702));
    assert_eq!(settings.ignores, vec![5, 77]);
    assert_eq!(deployment.store.get("settings:roles").await?, None);
    assert_eq!(deployment.store.get("settings:ignores").await?, None);

    shard.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shard_modes_are_managed_remotely() -> Result<()> {
    init_tracing();
    let deployment = Deployment::new(3);
    let shard0 = deployment.start(0).await?;
    let shard1 = deployment.start(1).await?;
    for shard in [&shard0, &shard1] {
        shard.signal_ready();
        shard.boot().await?;
    }

    assert!(shard0.set_shard_mode(0, CoreMode::Down).await.is_err());
    assert!(shard0.set_shard_mode(0, CoreMode::Boot).await.is_err());
    assert!(shard0.set_shard_mode(2, CoreMode::Maintenance).await.is_err());

    shard0.set_shard_mode(1, CoreMode::Down).await?;
    assert_eq!(shard1.mode().current().await?, CoreMode::Down);

    let listing = shard0.list_shards().await?;
    assert!(matches!(&listing[&0], ShardListing::Status(s) if s.status == CoreMode::Up));
    assert!(matches!(&listing[&1], ShardListing::Status(s) if s.status == CoreMode::Down));
    assert_eq!(listing[&2], ShardListing::Down);

    shard0.shutdown().await?;
    shard1.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn halting_a_remote_shard_stops_it() -> Result<()> {
    init_tracing();
    let deployment = Deployment::new(2);
    let shard0 = deployment.start(0).await?;
    let shard1 = deployment.start(1).await?;

    shard0.halt_shard(1).await?;
    let cancel = shard1.cancel_token();
    assert!(
        eventually(Duration::from_secs(2), || {
            let cancel = cancel.clone();
            async move { cancel.is_cancelled() }
        })
        .await
    );
    assert!(shard1.plugins().active_names().await.is_empty());
    assert!(!shard0.cancel_token().is_cancelled());
    assert!(!shard0.invoker().ping_shard(1, Duration::from_millis(200)).await);

    // A stopped shard cannot be halted again.
    assert!(shard0.halt_shard(1).await.is_err());

    shard1.shutdown().await?;
    shard0.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn halt_all_stops_every_shard() -> Result<()> {
    init_tracing();
    let deployment = Deployment::new(2);
    let shard0 = deployment.start(0).await?;
    let shard1 = deployment.start(1).await?;

    shard0.halt_all().await?;
    assert!(shard0.cancel_token().is_cancelled());
    tokio::time::timeout(Duration::from_secs(2), shard1.stopped()).await?;

    shard0.shutdown().await?;
    shard1.shutdown().await?;
    Ok(())
}
