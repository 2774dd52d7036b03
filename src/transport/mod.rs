// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pub/sub transport abstraction for the shard coordination channel.
//!
//! The runtime publishes encoded envelopes on one shared channel and every
//! shard (the publisher included) receives everything published there.
//! Implementations are expected to behave like Redis pub/sub:
//!
//! - at-most-once delivery
//! - no ordering guarantee across publishers
//! - nothing is delivered to a subscriber that was not subscribed at publish time

mod local;

pub use local::LocalBus;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Stream of raw payloads received on a channel.
pub type Subscription = BoxStream<'static, Bytes>;

#[async_trait]
pub trait PubSubTransport: Send + Sync + std::fmt::Debug {
    /// Publish a payload to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to `channel`. The stream ends when the transport shuts down.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}
