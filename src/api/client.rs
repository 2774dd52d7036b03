// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Request side of remote invocation.
//!
//! [`RemoteInvoker`] publishes requests on the shared channel and hands back
//! a [`PendingReply`] correlated by request id. Single-target replies are
//! delivered by the dispatcher as soon as they arrive; broadcasts are
//! delivered by the aggregator once every shard answered or the deadline
//! passed.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::handler::RemoteArgs;
use crate::error::InvokeError;
use crate::protocol::{
    BroadcastReplies, Envelope, PONG, RemoteResult, Reply, RequestEnvelope, RequestId,
    RequestKind, ShardIndex, Target,
};
use crate::runtime::registry::CorrelationRegistry;
use crate::transport::PubSubTransport;

/// Default deadline for broadcast requests.
pub const DEFAULT_BROADCAST_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle to a request that has been published but not yet answered.
///
/// Dropping it without waiting leaves the registry entry to be cleaned up by
/// a later response or, for broadcasts, by the aggregator deadline.
#[must_use = "a pending reply does nothing unless awaited"]
pub struct PendingReply {
    id: RequestId,
    rx: oneshot::Receiver<Reply>,
    registry: Arc<CorrelationRegistry>,
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply").field("id", &self.id).finish()
    }
}

impl PendingReply {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait without a local timeout.
    ///
    /// Single-target requests to a shard that never answers wait forever;
    /// prefer [`PendingReply::wait_timeout`] for those.
    pub async fn wait(self) -> Result<Reply, InvokeError> {
        self.rx.await.map_err(|_| InvokeError::Dropped(self.id))
    }

    /// Wait up to `timeout`. On expiry the registry entry is removed and
    /// `Ok(None)` is returned; a late response is then ignored.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Option<Reply>, InvokeError> {
        let PendingReply { id, rx, registry } = self;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => Err(InvokeError::Dropped(id)),
            Err(_) => {
                registry.abandon(id);
                debug!(request_id = %id, timeout = ?timeout, "Request timed out");
                Ok(None)
            }
        }
    }
}

struct InvokerInner {
    transport: Arc<dyn PubSubTransport>,
    channel: String,
    registry: Arc<CorrelationRegistry>,
    shard_count: u32,
    broadcast_timeout: Duration,
}

/// Issues requests to one shard or all shards of the deployment.
#[derive(Clone)]
pub struct RemoteInvoker {
    inner: Arc<InvokerInner>,
}

impl std::fmt::Debug for RemoteInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteInvoker")
            .field("channel", &self.inner.channel)
            .field("shard_count", &self.inner.shard_count)
            .field("pending", &self.inner.registry.len())
            .finish()
    }
}

impl RemoteInvoker {
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        channel: impl Into<String>,
        registry: Arc<CorrelationRegistry>,
        shard_count: u32,
        broadcast_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(InvokerInner {
                transport,
                channel: channel.into(),
                registry,
                shard_count,
                broadcast_timeout,
            }),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.inner.shard_count
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.inner.registry
    }

    fn validate(&self, target: Target) -> Result<(), InvokeError> {
        match target {
            Target::Shard(index) if index >= self.inner.shard_count => {
                Err(InvokeError::InvalidTarget {
                    target,
                    shard_count: self.inner.shard_count,
                })
            }
            _ => Ok(()),
        }
    }

    /// Publish a request and register it for correlation.
    ///
    /// Broadcasts use the configured deadline.
    pub async fn request(
        &self,
        target: Target,
        kind: RequestKind,
    ) -> Result<PendingReply, InvokeError> {
        self.request_with_deadline(target, kind, self.inner.broadcast_timeout)
            .await
    }

    /// Like [`RemoteInvoker::request`] with an explicit broadcast deadline.
    pub async fn request_with_deadline(
        &self,
        target: Target,
        kind: RequestKind,
        broadcast_timeout: Duration,
    ) -> Result<PendingReply, InvokeError> {
        self.validate(target)?;

        let id = Uuid::new_v4();
        let registry = self.inner.registry.clone();
        let payload = Envelope::from(RequestEnvelope { id, target, kind })
            .encode()
            .map_err(|source| InvokeError::Encode { id, source })?;

        // Register before publishing so a fast local reply cannot be lost.
        let rx = match target {
            Target::All => {
                registry.register_broadcast(id, self.inner.shard_count, broadcast_timeout)
            }
            Target::Shard(_) => registry.register_single(id),
        };

        if let Err(source) = self
            .inner
            .transport
            .publish(&self.inner.channel, payload)
            .await
        {
            registry.abandon(id);
            warn!(request_id = %id, %target, error = %source, "Failed to publish request");
            return Err(InvokeError::Publish { id, source });
        }

        debug!(request_id = %id, %target, "Request published");
        Ok(PendingReply { id, rx, registry })
    }

    /// Invoke a registered remote function on one shard or on all shards and
    /// wait for the result.
    ///
    /// A broadcast resolves to one slot per shard, `NoResponse` for shards
    /// silent at the deadline. A single-target call waits for the one answer.
    pub async fn run_on_shard(
        &self,
        target: Target,
        function: &str,
        args: RemoteArgs,
    ) -> Result<Reply, InvokeError> {
        let (args, kwargs) = args.into_parts();
        self.request(
            target,
            RequestKind::CodeRequest {
                function: function.to_string(),
                args,
                kwargs,
            },
        )
        .await?
        .wait()
        .await
    }

    /// [`RemoteInvoker::run_on_shard`] for one shard with a local timeout.
    ///
    /// `Ok(None)` means no answer arrived in time; `Ok(Some(None))` means the
    /// shard answered with a null payload.
    pub async fn call(
        &self,
        shard: ShardIndex,
        function: &str,
        args: RemoteArgs,
        timeout: Duration,
    ) -> Result<Option<Option<RemoteResult>>, InvokeError> {
        let (args, kwargs) = args.into_parts();
        let pending = self
            .request(
                Target::Shard(shard),
                RequestKind::CodeRequest {
                    function: function.to_string(),
                    args,
                    kwargs,
                },
            )
            .await?;
        let id = pending.id();
        match pending.wait_timeout(timeout).await? {
            None => Ok(None),
            Some(reply) => reply
                .into_single()
                .map(Some)
                .ok_or(InvokeError::UnexpectedReply(id, "single")),
        }
    }

    /// [`RemoteInvoker::run_on_shard`] against every shard.
    pub async fn broadcast(
        &self,
        function: &str,
        args: RemoteArgs,
    ) -> Result<BroadcastReplies, InvokeError> {
        let (args, kwargs) = args.into_parts();
        let pending = self
            .request(
                Target::All,
                RequestKind::CodeRequest {
                    function: function.to_string(),
                    args,
                    kwargs,
                },
            )
            .await?;
        let id = pending.id();
        pending
            .wait()
            .await?
            .into_broadcast()
            .ok_or(InvokeError::UnexpectedReply(id, "broadcast"))
    }

    /// Probe a shard for liveness.
    ///
    /// Returns true only if the shard answered with the pong acknowledgement
    /// within `timeout`. Timeouts and transport failures read as "down".
    pub async fn ping_shard(&self, shard: ShardIndex, timeout: Duration) -> bool {
        let pending = match self.request(Target::Shard(shard), RequestKind::Ping).await {
            Ok(pending) => pending,
            Err(e) => {
                debug!(shard, error = %e, "Ping could not be sent");
                return false;
            }
        };

        match pending.wait_timeout(timeout).await {
            Ok(Some(Reply::Single(Some(RemoteResult::Success(Value::String(ack)))))) => {
                ack == PONG
            }
            _ => false,
        }
    }
}

/// Convenience for building keyword arguments.
pub fn kwargs<I, K>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalBus;

    fn invoker(shard_count: u32) -> RemoteInvoker {
        RemoteInvoker::new(
            Arc::new(LocalBus::default()),
            "test.pubsub",
            Arc::new(CorrelationRegistry::new()),
            shard_count,
            DEFAULT_BROADCAST_TIMEOUT,
        )
    }

    #[tokio::test]
    async fn out_of_range_target_is_rejected() {
        let invoker = invoker(2);
        let err = invoker
            .request(Target::Shard(2), RequestKind::Ping)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::InvalidTarget { shard_count: 2, .. }));
        assert!(invoker.registry().is_empty());
    }

    #[tokio::test]
    async fn ping_without_listener_times_out_and_cleans_up() {
        let invoker = invoker(1);
        assert!(!invoker.ping_shard(0, Duration::from_millis(50)).await);
        assert!(invoker.registry().is_empty());
    }

    #[test]
    fn kwargs_helper_builds_map() {
        let map = kwargs([("ignore", Value::from(2))]);
        assert_eq!(map["ignore"], Value::from(2));
    }
}
