// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Result types carried back to the requester.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::message::ShardIndex;

/// Outcome of a remote invocation, tagged so callers never have to guess
/// whether a value is a return value or a captured error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RemoteResult {
    /// The remote function returned normally
    Success(serde_json::Value),
    /// The remote function raised; the error travels as data
    Error(RemoteError),
}

impl RemoteResult {
    pub fn success(value: impl Into<serde_json::Value>) -> Self {
        Self::Success(value.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Success(value) => Some(value),
            Self::Error(_) => None,
        }
    }

    pub fn as_error(&self) -> Option<&RemoteError> {
        match self {
            Self::Success(_) => None,
            Self::Error(error) => Some(error),
        }
    }

    /// Deserialize a successful value, turning a remote error into a local one.
    pub fn into_typed<T: DeserializeOwned>(self) -> anyhow::Result<T> {
        match self {
            Self::Success(value) => Ok(serde_json::from_value(value)?),
            Self::Error(error) => Err(anyhow::Error::new(error)),
        }
    }
}

impl From<anyhow::Error> for RemoteResult {
    fn from(error: anyhow::Error) -> Self {
        Self::Error(RemoteError::from(&error))
    }
}

/// Serializable snapshot of an error raised on a remote shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            causes: Vec::new(),
        }
    }
}

impl From<&anyhow::Error> for RemoteError {
    fn from(error: &anyhow::Error) -> Self {
        Self {
            message: error.to_string(),
            causes: error.chain().skip(1).map(ToString::to_string).collect(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.causes {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

/// One shard's slot in a broadcast result.
///
/// `NoResponse` is its own variant, so it can never be confused with a shard
/// that answered with a null payload (`Replied(None)`).
#[derive(Debug, Clone, PartialEq)]
pub enum ShardReply {
    NoResponse,
    Replied(Option<RemoteResult>),
}

impl ShardReply {
    pub fn is_no_response(&self) -> bool {
        matches!(self, ShardReply::NoResponse)
    }

    pub fn result(&self) -> Option<&RemoteResult> {
        match self {
            ShardReply::Replied(Some(result)) => Some(result),
            _ => None,
        }
    }
}

impl fmt::Display for ShardReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardReply::NoResponse => write!(f, "<NoResponse>"),
            ShardReply::Replied(None) => write!(f, "null"),
            ShardReply::Replied(Some(RemoteResult::Success(value))) => write!(f, "{value}"),
            ShardReply::Replied(Some(RemoteResult::Error(error))) => write!(f, "error: {error}"),
        }
    }
}

/// Aggregated broadcast result, keyed by shard index.
pub type BroadcastReplies = BTreeMap<ShardIndex, ShardReply>;

/// What a request resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Answer from the single addressed shard (`None` for a null payload)
    Single(Option<RemoteResult>),
    /// Per-shard answers to a broadcast, with `NoResponse` for silent shards
    Broadcast(BroadcastReplies),
}

impl Reply {
    pub fn into_single(self) -> Option<Option<RemoteResult>> {
        match self {
            Reply::Single(result) => Some(result),
            Reply::Broadcast(_) => None,
        }
    }

    pub fn into_broadcast(self) -> Option<BroadcastReplies> {
        match self {
            Reply::Single(_) => None,
            Reply::Broadcast(replies) => Some(replies),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_kind_is_tagged_on_the_wire() {
        let ok = serde_json::to_value(RemoteResult::success(42)).unwrap();
        assert_eq!(ok, json!({"kind": "success", "value": 42}));

        let err = serde_json::to_value(RemoteResult::Error(RemoteError::new("x"))).unwrap();
        assert_eq!(err, json!({"kind": "error", "value": {"message": "x"}}));
    }

    #[test]
    fn null_success_is_not_an_error() {
        let result = RemoteResult::success(serde_json::Value::Null);
        assert!(result.is_success());
        assert_eq!(result.as_value(), Some(&serde_json::Value::Null));
    }

    #[test]
    fn anyhow_chain_is_preserved() {
        let error = anyhow::anyhow!("disk full").context("writing settings");
        let remote = RemoteError::from(&error);
        assert_eq!(remote.message, "writing settings");
        assert_eq!(remote.causes, vec!["disk full".to_string()]);
        assert_eq!(remote.to_string(), "writing settings: disk full");
    }

    #[test]
    fn no_response_differs_from_null_reply() {
        assert_ne!(ShardReply::NoResponse, ShardReply::Replied(None));
        assert!(ShardReply::NoResponse.is_no_response());
        assert!(!ShardReply::Replied(None).is_no_response());
    }

    #[test]
    fn typed_extraction_surfaces_remote_errors() {
        let value: u32 = RemoteResult::success(7).into_typed().unwrap();
        assert_eq!(value, 7);

        let failed = RemoteResult::Error(RemoteError::new("boom")).into_typed::<u32>();
        assert_eq!(failed.unwrap_err().to_string(), "boom");
    }
}
