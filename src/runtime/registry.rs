// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Correlation registry for in-flight requests.
//!
//! Each outstanding request id maps to exactly one entry:
//! - single-target requests hold a oneshot sender, completed by the first
//!   response without a `from` field
//! - broadcasts hold one slot per shard (pre-filled with `NoResponse`), a
//!   deadline, and a oneshot sender completed by the aggregator
//!
//! Responses for ids that are not registered (timed out, already completed,
//! or issued by another process) are ignored.

use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::protocol::{
    BroadcastReplies, RemoteResult, Reply, RequestId, ShardIndex, ShardReply,
};

enum PendingRequest {
    Single(oneshot::Sender<Reply>),
    Broadcast(BroadcastEntry),
}

struct BroadcastEntry {
    slots: BroadcastReplies,
    expires: Instant,
    tx: oneshot::Sender<Reply>,
}

impl BroadcastEntry {
    fn is_complete(&self) -> bool {
        self.slots.values().all(|slot| !slot.is_no_response())
    }

    fn is_ready(&self, now: Instant) -> bool {
        now >= self.expires || self.is_complete()
    }
}

/// Shared table of pending requests keyed by request id.
#[derive(Default)]
pub struct CorrelationRegistry {
    pending: DashMap<RequestId, PendingRequest>,
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single-target request.
    pub fn register_single(&self, id: RequestId) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, PendingRequest::Single(tx));
        rx
    }

    /// Register a broadcast expecting one answer per shard in `0..shard_count`.
    pub fn register_broadcast(
        &self,
        id: RequestId,
        shard_count: u32,
        timeout: Duration,
    ) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        let slots = (0..shard_count)
            .map(|shard| (shard, ShardReply::NoResponse))
            .collect();
        self.pending.insert(
            id,
            PendingRequest::Broadcast(BroadcastEntry {
                slots,
                expires: Instant::now() + timeout,
                tx,
            }),
        );
        rx
    }

    /// Complete a single-target request. Returns false when no single-target
    /// entry exists for `id`.
    pub fn resolve_single(&self, id: RequestId, response: Option<RemoteResult>) -> bool {
        let Some((_, entry)) = self
            .pending
            .remove_if(&id, |_, entry| matches!(entry, PendingRequest::Single(_)))
        else {
            trace!(request_id = %id, "Ignoring response for unknown request");
            return false;
        };

        if let PendingRequest::Single(tx) = entry {
            if tx.send(Reply::Single(response)).is_err() {
                debug!(request_id = %id, "Requester went away before the response arrived");
            }
        }
        true
    }

    /// File one shard's answer to a broadcast.
    ///
    /// The first answer per shard wins; duplicates and answers from shards
    /// outside the slot set are dropped.
    pub fn merge_broadcast(
        &self,
        id: RequestId,
        from: ShardIndex,
        response: Option<RemoteResult>,
    ) -> bool {
        let Some(mut entry) = self.pending.get_mut(&id) else {
            trace!(request_id = %id, from, "Ignoring broadcast reply for unknown request");
            return false;
        };

        let PendingRequest::Broadcast(broadcast) = entry.value_mut() else {
            return false;
        };

        match broadcast.slots.get_mut(&from) {
            Some(slot) if slot.is_no_response() => {
                *slot = ShardReply::Replied(response);
                true
            }
            Some(_) => {
                debug!(request_id = %id, from, "Duplicate broadcast reply ignored");
                false
            }
            None => {
                debug!(request_id = %id, from, "Broadcast reply from unexpected shard ignored");
                false
            }
        }
    }

    /// Deliver every broadcast that is complete or past its deadline.
    ///
    /// Returns the number of broadcasts finalized.
    pub fn finalize_ready(&self, now: Instant) -> usize {
        let ready: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| match entry.value() {
                PendingRequest::Broadcast(broadcast) => broadcast.is_ready(now),
                PendingRequest::Single(_) => false,
            })
            .map(|entry| *entry.key())
            .collect();

        let mut finalized = 0;
        for id in ready {
            let removed = self.pending.remove_if(&id, |_, entry| match entry {
                PendingRequest::Broadcast(broadcast) => broadcast.is_ready(now),
                PendingRequest::Single(_) => false,
            });

            if let Some((_, PendingRequest::Broadcast(broadcast))) = removed {
                let silent = broadcast
                    .slots
                    .values()
                    .filter(|slot| slot.is_no_response())
                    .count();
                debug!(request_id = %id, silent, "Finalizing broadcast");
                let _ = broadcast.tx.send(Reply::Broadcast(broadcast.slots));
                finalized += 1;
            }
        }
        finalized
    }

    /// Forget a request without completing it.
    pub fn abandon(&self, id: RequestId) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
