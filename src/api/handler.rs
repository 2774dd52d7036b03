// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Remote functions and the by-name registry they are invoked through.
//!
//! Code never crosses the wire: a request names a function, and the
//! receiving shard looks that name up in its own [`FunctionRegistry`]. Every
//! shard of a deployment must therefore register the same names.

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::runtime::context::ShardContext;

/// Positional and keyword arguments of a remote call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl RemoteArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Append a positional argument.
    pub fn arg<T: Serialize>(mut self, value: T) -> Result<Self> {
        self.args.push(serde_json::to_value(value)?);
        Ok(self)
    }

    /// Set a keyword argument.
    pub fn kwarg<T: Serialize>(mut self, name: &str, value: T) -> Result<Self> {
        self.kwargs
            .insert(name.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Deserialize the positional argument at `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self
            .args
            .get(index)
            .with_context(|| format!("missing positional argument {index}"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("invalid positional argument {index}"))
    }

    /// Deserialize the keyword argument `name`, if present and not null.
    pub fn get_kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.kwargs.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .with_context(|| format!("invalid keyword argument {name:?}")),
        }
    }

    pub fn into_parts(self) -> (Vec<Value>, Map<String, Value>) {
        (self.args, self.kwargs)
    }
}

/// Raised when a remote function ran but its return value could not be
/// serialized. The responder degrades such replies to a null payload.
#[derive(Debug, Error)]
#[error("failed to serialize remote function result: {0}")]
pub struct ResponseSerializationError(#[from] pub serde_json::Error);

/// A function that can be invoked on this shard by name.
///
/// Calls run on the dedicated remote worker thread, one at a time, never on
/// the event loop. Implementations may block; async work goes through
/// [`ShardContext::block_on`].
pub trait RemoteFunction: Send + Sync + 'static {
    fn call(&self, ctx: &ShardContext, args: RemoteArgs) -> Result<Value>;
}

struct TypedFunction<F> {
    f: F,
}

impl<F, R> RemoteFunction for TypedFunction<F>
where
    F: Fn(&ShardContext, RemoteArgs) -> Result<R> + Send + Sync + 'static,
    R: Serialize,
{
    fn call(&self, ctx: &ShardContext, args: RemoteArgs) -> Result<Value> {
        let output = (self.f)(ctx, args)?;
        serde_json::to_value(output).map_err(|e| ResponseSerializationError(e).into())
    }
}

/// Wrap a closure returning any serializable value as a [`RemoteFunction`].
pub fn remote_fn<F, R>(f: F) -> Arc<dyn RemoteFunction>
where
    F: Fn(&ShardContext, RemoteArgs) -> Result<R> + Send + Sync + 'static,
    R: Serialize + 'static,
{
    Arc::new(TypedFunction { f })
}

#[derive(Clone)]
struct RegisteredFunction {
    owner: Option<String>,
    function: Arc<dyn RemoteFunction>,
}

/// Name → function table consulted when a code request arrives.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<DashMap<String, RegisteredFunction>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runtime-level function. Replaces any previous registration.
    pub fn register(&self, name: impl Into<String>, function: Arc<dyn RemoteFunction>) {
        self.insert(name.into(), None, function);
    }

    /// Register a function owned by a plugin; it is removed with the plugin.
    pub fn register_owned(
        &self,
        owner: &str,
        name: impl Into<String>,
        function: Arc<dyn RemoteFunction>,
    ) {
        self.insert(name.into(), Some(owner.to_string()), function);
    }

    fn insert(&self, name: String, owner: Option<String>, function: Arc<dyn RemoteFunction>) {
        self.functions
            .insert(name, RegisteredFunction { owner, function });
    }

    pub fn deregister(&self, name: &str) -> bool {
        self.functions.remove(name).is_some()
    }

    /// Remove every function registered by `owner`; returns how many.
    pub fn deregister_owned(&self, owner: &str) -> usize {
        let before = self.functions.len();
        self.functions
            .retain(|_, entry| entry.owner.as_deref() != Some(owner));
        before - self.functions.len()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RemoteFunction>> {
        self.functions
            .get(name)
            .map(|entry| entry.function.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn args_builder_and_accessors() -> Result<()> {
        let args = RemoteArgs::new().arg("maintenance")?.kwarg("ignore", 2u32)?;

        assert_eq!(args.get::<String>(0)?, "maintenance");
        assert_eq!(args.get_kwarg::<u32>("ignore")?, Some(2));
        assert_eq!(args.get_kwarg::<u32>("missing")?, None);
        assert!(args.get::<String>(1).is_err());
        Ok(())
    }

    #[test]
    fn null_kwarg_reads_as_absent() -> Result<()> {
        let args = RemoteArgs::from_parts(vec![], Map::from_iter([("ignore".into(), json!(null))]));
        assert_eq!(args.get_kwarg::<u32>("ignore")?, None);
        Ok(())
    }

    #[test]
    fn owned_functions_are_removed_together() {
        let registry = FunctionRegistry::new();
        registry.register("gather_info", remote_fn(|_, _| Ok(1)));
        registry.register_owned("cogs.stats", "stats_a", remote_fn(|_, _| Ok(2)));
        registry.register_owned("cogs.stats", "stats_b", remote_fn(|_, _| Ok(3)));

        assert_eq!(registry.deregister_owned("cogs.stats"), 2);
        assert_eq!(registry.names(), vec!["gather_info".to_string()]);
    }
}
