// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Periodic finalization of broadcast requests.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::registry::CorrelationRegistry;

/// Default interval between sweeps of the correlation registry.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sweeps the registry on a fixed cadence and completes every broadcast
/// that has either heard from all shards or passed its deadline.
pub struct BroadcastAggregator {
    registry: Arc<CorrelationRegistry>,
    poll_interval: Duration,
}

impl BroadcastAggregator {
    pub fn new(registry: Arc<CorrelationRegistry>, poll_interval: Duration) -> Self {
        Self {
            registry,
            poll_interval,
        }
    }

    /// Run one sweep; returns how many broadcasts were delivered.
    pub fn sweep(&self) -> usize {
        self.registry.finalize_ready(Instant::now())
    }

    /// Run the sweep loop until `cancel_token` fires.
    pub async fn run(self, cancel_token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(poll_interval = ?self.poll_interval, "Broadcast aggregator started");

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let finalized = self.sweep();
                    if finalized > 0 {
                        trace!(finalized, "Broadcasts delivered");
                    }
                }
            }
        }

        debug!("Broadcast aggregator stopped");
    }
}
