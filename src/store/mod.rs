// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Durable key-value state shared by every shard of a deployment.
//!
//! The runtime only consumes the store through [`KeyValueStore`]; values are
//! JSON documents. [`Collection`] scopes a store under a key prefix, the way
//! all runtime state lives under `settings:*`.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Async mapping from string keys to JSON values.
///
/// There is no transaction across keys: a sequence of writes interrupted by
/// a crash may be partially applied.
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn keys(&self) -> Result<BTreeSet<String>>;

    /// Check the store is reachable. Used once at startup.
    async fn ping(&self) -> Result<()> {
        self.keys().await.map(|_| ())
    }
}

/// Prefix-namespaced, typed view over a [`KeyValueStore`].
#[derive(Debug, Clone)]
pub struct Collection {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl Collection {
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Read and deserialize `key`, or `None` if absent.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let full_key = self.full_key(key);
        match self.store.get(&full_key).await? {
            Some(value) => {
                let typed = serde_json::from_value(value)
                    .with_context(|| format!("malformed value under {full_key}"))?;
                Ok(Some(typed))
            }
            None => Ok(None),
        }
    }

    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<Value>> {
        self.store.get(&self.full_key(key)).await
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.store.set(&self.full_key(key), value).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(&self.full_key(key)).await
    }

    /// Keys in this collection, with the prefix stripped.
    pub async fn keys(&self) -> Result<BTreeSet<String>> {
        let prefix = format!("{}:", self.prefix);
        Ok(self
            .store
            .keys()
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}
