// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! ZMQ-based pub/sub transport for shards on separate hosts.
//!
//! Every shard binds one PUB socket and connects one SUB socket to each peer's
//! PUB endpoint, its own included, so a publish reaches the whole mesh:
//!
//! ```text
//! shard 0 PUB ──┬──> shard 0 SUB
//!               ├──> shard 1 SUB
//!               └──> shard 2 SUB
//! ```
//!
//! Frame format:
//! ```text
//! [channel (topic)] [payload]
//! ```

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tmq::{Context, Message, Multipart, publish::Publish};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::transport::{PubSubTransport, Subscription};

/// Full-mesh ZMQ PUB/SUB transport.
#[derive(Clone)]
pub struct ZmqPubSub {
    context: Arc<Context>,
    publisher: Arc<Mutex<Publish>>,
    publish_endpoint: String,
    peer_endpoints: Vec<String>,
}

impl std::fmt::Debug for ZmqPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZmqPubSub")
            .field("publish_endpoint", &self.publish_endpoint)
            .field("peer_endpoints", &self.peer_endpoints)
            .finish()
    }
}

impl ZmqPubSub {
    /// Bind the local PUB socket at `publish_endpoint`.
    ///
    /// `peer_endpoints` lists the PUB endpoints of every shard in the
    /// deployment; subscriptions connect to all of them.
    pub fn bind(publish_endpoint: &str, peer_endpoints: Vec<String>) -> Result<Self> {
        let context = Arc::new(Context::new());
        let publisher = tmq::publish::publish(&context).bind(publish_endpoint)?;

        debug!(
            publish_endpoint,
            peers = peer_endpoints.len(),
            "Bound ZMQ publisher"
        );

        Ok(Self {
            context,
            publisher: Arc::new(Mutex::new(publisher)),
            publish_endpoint: publish_endpoint.to_string(),
            peer_endpoints,
        })
    }

    fn create_multipart(channel: &str, payload: Bytes) -> Multipart {
        let mut parts = VecDeque::new();
        parts.push_back(Message::from(channel.as_bytes().to_vec()));
        parts.push_back(Message::from(payload.to_vec()));
        Multipart(parts)
    }

    /// Extract the payload of a multipart message on `channel`.
    ///
    /// ZMQ topic filtering is a prefix match, so the topic frame is checked
    /// for an exact match here.
    fn payload_for(channel: &str, mut multipart: Multipart) -> Option<Bytes> {
        if multipart.len() < 2 {
            warn!("Received malformed multipart message (too few frames)");
            return None;
        }
        let topic = multipart.pop_front()?;
        if &topic[..] != channel.as_bytes() {
            return None;
        }
        let payload = multipart.pop_front()?;
        Some(Bytes::copy_from_slice(&payload))
    }
}

#[async_trait]
impl PubSubTransport for ZmqPubSub {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let multipart = Self::create_multipart(channel, payload);
        self.publisher
            .lock()
            .await
            .send(multipart)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to publish on {}: {}", channel, e))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut sockets = Vec::with_capacity(self.peer_endpoints.len());
        for endpoint in &self.peer_endpoints {
            let socket = tmq::subscribe::subscribe(&self.context)
                .connect(endpoint)?
                .subscribe(channel.as_bytes())?;
            debug!(endpoint = %endpoint, channel, "Connected ZMQ subscriber");
            sockets.push(socket.boxed());
        }

        let channel = channel.to_string();
        let stream = stream::select_all(sockets)
            .filter_map(move |message| {
                let channel = channel.clone();
                async move {
                    match message {
                        Ok(multipart) => Self::payload_for(&channel, multipart),
                        Err(e) => {
                            warn!(error = %e, "ZMQ subscriber error");
                            None
                        }
                    }
                }
            })
            .boxed();

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_requires_exact_topic() {
        let multipart = ZmqPubSub::create_multipart("heleus.0", Bytes::from_static(b"x"));
        assert!(ZmqPubSub::payload_for("heleus.0.pubsub", multipart).is_none());

        let multipart = ZmqPubSub::create_multipart("heleus.0", Bytes::from_static(b"x"));
        assert_eq!(
            ZmqPubSub::payload_for("heleus.0", multipart),
            Some(Bytes::from_static(b"x"))
        );
    }
}
