// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Routing of envelopes received on the shared channel.
//!
//! - `ping` addressed to this shard: answered here, on the event loop
//! - `coderequest` addressed to this shard: queued to the remote worker
//! - `response` with `from`: merged into the matching broadcast entry
//! - `response` without `from`: resolves the matching single-target entry
//!
//! Payloads that fail to decode and requests for other shards are dropped
//! without a trace above `trace` level.

use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::api::handler::RemoteArgs;
use crate::protocol::{Envelope, PONG, RemoteResult, ResponseEnvelope, ShardIndex};
use crate::runtime::registry::CorrelationRegistry;
use crate::runtime::worker::{CodeRequest, RemoteWorker, Responder};
use crate::transport::Subscription;

/// Envelope router for one shard.
pub struct EnvelopeDispatcher {
    shard: ShardIndex,
    registry: Arc<CorrelationRegistry>,
    responder: Responder,
    worker: RemoteWorker,
}

impl EnvelopeDispatcher {
    pub fn new(
        shard: ShardIndex,
        registry: Arc<CorrelationRegistry>,
        responder: Responder,
        worker: RemoteWorker,
    ) -> Self {
        Self {
            shard,
            registry,
            responder,
            worker,
        }
    }

    /// Handle one raw payload from the channel.
    pub async fn dispatch(&self, payload: &[u8]) {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!(shard = self.shard, error = %e, "Discarding undecodable payload");
                return;
            }
        };

        match envelope {
            Envelope::Ping { id, target } if target.includes(self.shard) => {
                let from = target.is_broadcast().then_some(self.shard);
                debug!(request_id = %id, shard = self.shard, "Answering ping");
                self.responder
                    .respond(ResponseEnvelope::new(
                        id,
                        Some(RemoteResult::success(PONG)),
                        from,
                    ))
                    .await;
            }
            Envelope::CodeRequest {
                id,
                target,
                function,
                args,
                kwargs,
            } if target.includes(self.shard) => {
                debug!(request_id = %id, shard = self.shard, function = %function, "Queueing code request");
                self.worker.submit(CodeRequest {
                    id,
                    from: target.is_broadcast().then_some(self.shard),
                    function,
                    args: RemoteArgs::from_parts(args, kwargs),
                });
            }
            Envelope::Response(ResponseEnvelope { id, response, from }) => match from {
                Some(from) => {
                    self.registry.merge_broadcast(id, from, response);
                }
                None => {
                    self.registry.resolve_single(id, response);
                }
            },
            other => {
                trace!(request_id = %other.id(), shard = self.shard, "Request for another shard");
            }
        }
    }

    /// Consume `subscription` until it ends or `cancel_token` fires.
    pub async fn run(self, mut subscription: Subscription, cancel_token: CancellationToken) {
        debug!(shard = self.shard, "Envelope dispatcher started");
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                next = subscription.next() => match next {
                    Some(payload) => self.dispatch(&payload).await,
                    None => {
                        debug!(shard = self.shard, "Subscription closed");
                        break;
                    }
                },
            }
        }
        debug!(shard = self.shard, "Envelope dispatcher stopped");
    }
}
