// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Gate in front of command processing.
//!
//! Evaluation order for one message:
//!
//! 1. instance mode `down` or `boot`: drop
//! 2. author is an owner: dispatch
//! 3. mode `maintenance`: drop, overrides are not consulted
//! 4. any override returns true: dispatch
//! 5. any precondition returns false: drop
//! 6. dispatch
//!
//! A predicate that errors is treated as "no opinion" for the message at
//! hand and is removed from the pipeline permanently.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::gateway::{InboundMessage, UserId};
use crate::runtime::mode::CoreMode;

/// A check consulted for every incoming message.
///
/// As an override, `true` admits the message. As a precondition, `false`
/// drops it.
#[async_trait]
pub trait Predicate: Send + Sync {
    async fn evaluate(&self, message: &InboundMessage) -> Result<bool>;
}

struct FnPredicate<F>(F);

#[async_trait]
impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&InboundMessage) -> Result<bool> + Send + Sync,
{
    async fn evaluate(&self, message: &InboundMessage) -> Result<bool> {
        (self.0)(message)
    }
}

/// Wrap a synchronous closure as a [`Predicate`].
pub fn predicate_fn<F>(f: F) -> Arc<dyn Predicate>
where
    F: Fn(&InboundMessage) -> Result<bool> + Send + Sync + 'static,
{
    Arc::new(FnPredicate(f))
}

/// Which list a predicate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateKind {
    Override,
    Precondition,
}

/// Why a message was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Mode(CoreMode),
    Maintenance,
    Precondition(String),
}

/// Why a message was admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitReason {
    Owner,
    Override(String),
    Passed,
}

/// Outcome of running the pipeline for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Dispatch(AdmitReason),
    Drop(DropReason),
}

impl Verdict {
    pub fn is_dispatch(&self) -> bool {
        matches!(self, Verdict::Dispatch(_))
    }
}

#[derive(Clone)]
struct Filter {
    id: u64,
    name: String,
    owner: Option<String>,
    predicate: Arc<dyn Predicate>,
}

/// Set of user ids that bypass the pipeline.
#[derive(Debug, Clone, Default)]
pub struct OwnerSet {
    inner: Arc<RwLock<HashSet<UserId>>>,
}

impl OwnerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.inner.read().contains(&user)
    }

    pub fn insert(&self, user: UserId) -> bool {
        self.inner.write().insert(user)
    }

    pub fn extend(&self, users: impl IntoIterator<Item = UserId>) {
        self.inner.write().extend(users);
    }

    pub fn replace(&self, users: impl IntoIterator<Item = UserId>) {
        *self.inner.write() = users.into_iter().collect();
    }

    pub fn snapshot(&self) -> Vec<UserId> {
        let mut owners: Vec<UserId> = self.inner.read().iter().copied().collect();
        owners.sort_unstable();
        owners
    }
}

/// Ordered override and precondition lists.
///
/// Lists are copy-on-write: evaluation iterates a snapshot, so predicates
/// added or removed mid-evaluation take effect from the next message.
#[derive(Default)]
pub struct AdmissionPipeline {
    overrides: RwLock<Arc<Vec<Filter>>>,
    preconditions: RwLock<Arc<Vec<Filter>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for AdmissionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPipeline")
            .field("overrides", &self.names(PredicateKind::Override))
            .field("preconditions", &self.names(PredicateKind::Precondition))
            .finish()
    }
}

impl AdmissionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, kind: PredicateKind) -> &RwLock<Arc<Vec<Filter>>> {
        match kind {
            PredicateKind::Override => &self.overrides,
            PredicateKind::Precondition => &self.preconditions,
        }
    }

    /// Append a predicate; returns an id usable with [`AdmissionPipeline::remove`].
    pub fn add(
        &self,
        kind: PredicateKind,
        name: impl Into<String>,
        owner: Option<&str>,
        predicate: Arc<dyn Predicate>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let filter = Filter {
            id,
            name: name.into(),
            owner: owner.map(str::to_string),
            predicate,
        };
        let mut list = self.list(kind).write();
        Arc::make_mut(&mut *list).push(filter);
        id
    }

    pub fn add_override(&self, name: impl Into<String>, predicate: Arc<dyn Predicate>) -> u64 {
        self.add(PredicateKind::Override, name, None, predicate)
    }

    pub fn add_precondition(&self, name: impl Into<String>, predicate: Arc<dyn Predicate>) -> u64 {
        self.add(PredicateKind::Precondition, name, None, predicate)
    }

    pub fn remove(&self, kind: PredicateKind, id: u64) -> bool {
        let mut list = self.list(kind).write();
        let before = list.len();
        Arc::make_mut(&mut *list).retain(|filter| filter.id != id);
        list.len() != before
    }

    /// Remove every predicate registered by `owner` from both lists.
    pub fn remove_owned(&self, owner: &str) -> usize {
        [PredicateKind::Override, PredicateKind::Precondition]
            .into_iter()
            .map(|kind| {
                let mut list = self.list(kind).write();
                let before = list.len();
                Arc::make_mut(&mut *list).retain(|filter| filter.owner.as_deref() != Some(owner));
                before - list.len()
            })
            .sum()
    }

    pub fn names(&self, kind: PredicateKind) -> Vec<String> {
        self.list(kind)
            .read()
            .iter()
            .map(|filter| filter.name.clone())
            .collect()
    }

    fn snapshot(&self, kind: PredicateKind) -> Arc<Vec<Filter>> {
        self.list(kind).read().clone()
    }

    async fn run(&self, kind: PredicateKind, filter: &Filter, message: &InboundMessage) -> Option<bool> {
        match filter.predicate.evaluate(message).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(
                    predicate = %filter.name,
                    kind = ?kind,
                    error = %e,
                    "Predicate failed and has been removed"
                );
                self.remove(kind, filter.id);
                None
            }
        }
    }

    /// Decide whether `message` reaches command processing.
    pub async fn evaluate(
        &self,
        message: &InboundMessage,
        mode: CoreMode,
        owners: &OwnerSet,
    ) -> Verdict {
        if mode.drops_everything() {
            return Verdict::Drop(DropReason::Mode(mode));
        }

        if owners.contains(message.author_id) {
            return Verdict::Dispatch(AdmitReason::Owner);
        }

        if mode == CoreMode::Maintenance {
            return Verdict::Drop(DropReason::Maintenance);
        }

        for filter in self.snapshot(PredicateKind::Override).iter() {
            if self.run(PredicateKind::Override, filter, message).await == Some(true) {
                debug!(message_id = message.id, predicate = %filter.name, "Admitted by override");
                return Verdict::Dispatch(AdmitReason::Override(filter.name.clone()));
            }
        }

        for filter in self.snapshot(PredicateKind::Precondition).iter() {
            if self.run(PredicateKind::Precondition, filter, message).await == Some(false) {
                debug!(message_id = message.id, predicate = %filter.name, "Dropped by precondition");
                return Verdict::Drop(DropReason::Precondition(filter.name.clone()));
            }
        }

        Verdict::Dispatch(AdmitReason::Passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    fn message(author_id: UserId) -> InboundMessage {
        InboundMessage {
            id: 1,
            author_id,
            channel_id: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn boot_drops_even_owners() {
        let pipeline = AdmissionPipeline::new();
        let owners = OwnerSet::new();
        owners.insert(7);

        let verdict = pipeline.evaluate(&message(7), CoreMode::Boot, &owners).await;
        assert_eq!(verdict, Verdict::Drop(DropReason::Mode(CoreMode::Boot)));
    }

    #[tokio::test]
    async fn owner_bypasses_preconditions() {
        let pipeline = AdmissionPipeline::new();
        pipeline.add_precondition("deny", predicate_fn(|_| Ok(false)));
        let owners = OwnerSet::new();
        owners.insert(7);

        let verdict = pipeline.evaluate(&message(7), CoreMode::Up, &owners).await;
        assert_eq!(verdict, Verdict::Dispatch(AdmitReason::Owner));
    }

    #[tokio::test]
    async fn maintenance_skips_overrides() {
        let pipeline = AdmissionPipeline::new();
        pipeline.add_override("always", predicate_fn(|_| Ok(true)));
        let owners = OwnerSet::new();
        owners.insert(7);

        assert_eq!(
            pipeline.evaluate(&message(5), CoreMode::Maintenance, &owners).await,
            Verdict::Drop(DropReason::Maintenance)
        );
        assert_eq!(
            pipeline.evaluate(&message(7), CoreMode::Maintenance, &owners).await,
            Verdict::Dispatch(AdmitReason::Owner)
        );
        assert_eq!(
            pipeline.evaluate(&message(5), CoreMode::Up, &owners).await,
            Verdict::Dispatch(AdmitReason::Override("always".into()))
        );
    }

    #[tokio::test]
    async fn failing_predicate_is_removed_once() {
        let pipeline = AdmissionPipeline::new();
        pipeline.add_precondition("broken", predicate_fn(|_| bail!("boom")));
        pipeline.add_precondition("deny", predicate_fn(|_| Ok(false)));
        let owners = OwnerSet::new();

        let verdict = pipeline.evaluate(&message(1), CoreMode::Up, &owners).await;
        assert_eq!(verdict, Verdict::Drop(DropReason::Precondition("deny".into())));
        assert_eq!(pipeline.names(PredicateKind::Precondition), vec!["deny".to_string()]);
    }

    #[test]
    fn owned_predicates_are_removed_together() {
        let pipeline = AdmissionPipeline::new();
        pipeline.add(PredicateKind::Override, "a", Some("cogs.core"), predicate_fn(|_| Ok(false)));
        pipeline.add(PredicateKind::Precondition, "b", Some("cogs.core"), predicate_fn(|_| Ok(true)));
        pipeline.add_precondition("c", predicate_fn(|_| Ok(true)));

        assert_eq!(pipeline.remove_owned("cogs.core"), 2);
        assert_eq!(pipeline.names(PredicateKind::Precondition), vec!["c".to_string()]);
    }
}
