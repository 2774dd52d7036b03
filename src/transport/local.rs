// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process pub/sub bus shared by shards running in the same process.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::{PubSubTransport, Subscription};

const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast-channel bus. Clones share channels, so handing a clone to each
/// shard's runtime wires them onto the same "deployment".
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

struct LocalBusInner {
    channels: RwLock<HashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl std::fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBus")
            .field("channels", &self.inner.channels.read().len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LocalBusInner {
                channels: RwLock::new(HashMap::new()),
                capacity,
            }),
        }
    }

    fn channel(&self, name: &str) -> broadcast::Sender<Bytes> {
        if let Some(tx) = self.inner.channels.read().get(name) {
            return tx.clone();
        }

        let mut channels = self.inner.channels.write();
        channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone()
    }
}

#[async_trait]
impl PubSubTransport for LocalBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        // No subscribers is not an error; the payload is simply lost.
        if self.channel(channel).send(payload).is_err() {
            debug!(channel, "Published with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let rx = self.channel(channel).subscribe();
        let channel = channel.to_string();

        // Lagged receivers skip what they missed.
        let stream = BroadcastStream::new(rx)
            .filter_map(move |result| {
                let channel = channel.clone();
                async move {
                    match result {
                        Ok(payload) => Some(payload),
                        Err(e) => {
                            debug!(channel = %channel, error = %e, "Subscriber lagged");
                            None
                        }
                    }
                }
            })
            .boxed();

        Ok(stream)
    }
}
