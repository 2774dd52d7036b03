// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared harness: several shards wired to one in-process bus and store.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use heleus_runtime::{
    ApplicationOwners, Gateway, InboundMessage, KeyValueStore, LocalBus, MemoryStore,
    PubSubTransport, RuntimeConfig, ShardRuntime, ShardRuntimeBuilder,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// Fast timings so broadcasts and maintenance loops finish within a test.
pub fn test_config(shard_id: u32, shard_count: u32) -> RuntimeConfig {
    RuntimeConfig {
        shard_id,
        shard_count,
        channel: "heleus.test.pubsub.code".to_string(),
        broadcast_timeout_ms: 300,
        aggregator_poll_ms: 5,
        reconcile_interval_ms: 25,
        owner_refresh_interval_ms: 25,
        halt_grace_ms: 0,
        ..RuntimeConfig::default()
    }
}

/// Gateway that records every admitted message.
#[derive(Debug)]
pub struct RecordingGateway {
    owners: ApplicationOwners,
    processed: Mutex<Vec<u64>>,
}

impl RecordingGateway {
    pub fn new(owners: ApplicationOwners) -> Arc<Self> {
        Arc::new(Self {
            owners,
            processed: Mutex::new(Vec::new()),
        })
    }

    pub fn processed(&self) -> Vec<u64> {
        self.processed.lock().clone()
    }
}

#[async_trait]
impl Gateway for RecordingGateway {
    async fn process_commands(&self, message: &InboundMessage) -> Result<()> {
        self.processed.lock().push(message.id);
        Ok(())
    }

    async fn application_owners(&self) -> Result<ApplicationOwners> {
        Ok(self.owners.clone())
    }

    fn bot_user(&self) -> String {
        "Heleus#0001".to_string()
    }
}

/// A simulated deployment: one bus, one store, any subset of shards running.
pub struct Deployment {
    pub shard_count: u32,
    pub bus: Arc<dyn PubSubTransport>,
    pub store: Arc<MemoryStore>,
}

impl Deployment {
    pub fn new(shard_count: u32) -> Self {
        Self {
            shard_count,
            bus: Arc::new(LocalBus::default()),
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Builder for `shard_id`, already wired to the shared bus and store.
    pub fn builder(&self, shard_id: u32) -> ShardRuntimeBuilder {
        ShardRuntimeBuilder::new(test_config(shard_id, self.shard_count))
            .store(self.store.clone() as Arc<dyn KeyValueStore>)
            .transport(self.bus.clone())
            .instance_id(format!("test-instance-{shard_id}"))
    }

    pub async fn start(&self, shard_id: u32) -> Result<ShardRuntime> {
        Ok(self.builder(shard_id).build().await?)
    }
}

pub fn message(id: u64, author_id: u64) -> InboundMessage {
    InboundMessage {
        id,
        author_id,
        channel_id: 500,
        ..InboundMessage::default()
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
