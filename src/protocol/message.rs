// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Serde-compatible envelopes exchanged over the shared pub/sub channel.
//!
//! Every message on the channel is one [`Envelope`], JSON encoded and
//! discriminated by its `type` field:
//!
//! ```text
//! {"type":"ping","id":"…","target":2}
//! {"type":"coderequest","id":"…","target":"all","function":"gather_info","args":[],"kwargs":{}}
//! {"type":"response","id":"…","response":{"kind":"success","value":"Pong."},"from":1}
//! ```

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use super::response::RemoteResult;

/// Zero-based index of a shard within the deployment.
pub type ShardIndex = u32;

/// Correlation identifier shared by a request and all of its responses.
pub type RequestId = Uuid;

/// Fixed acknowledgement returned for liveness probes.
pub const PONG: &str = "Pong.";

/// Addressee of a request: one shard, or every shard on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "TargetRepr", into = "TargetRepr")]
pub enum Target {
    Shard(ShardIndex),
    All,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TargetRepr {
    Index(ShardIndex),
    Name(String),
}

impl TryFrom<TargetRepr> for Target {
    type Error = String;

    fn try_from(value: TargetRepr) -> Result<Self, Self::Error> {
        match value {
            TargetRepr::Index(index) => Ok(Target::Shard(index)),
            TargetRepr::Name(name) if name == "all" => Ok(Target::All),
            TargetRepr::Name(name) => Err(format!("unknown target {name:?}")),
        }
    }
}

impl From<Target> for TargetRepr {
    fn from(value: Target) -> Self {
        match value {
            Target::Shard(index) => TargetRepr::Index(index),
            Target::All => TargetRepr::Name("all".to_string()),
        }
    }
}

impl Target {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Target::All)
    }

    /// Whether a shard with the given index should act on a request for this target.
    pub fn includes(&self, shard: ShardIndex) -> bool {
        match self {
            Target::All => true,
            Target::Shard(index) => *index == shard,
        }
    }
}

impl From<ShardIndex> for Target {
    fn from(value: ShardIndex) -> Self {
        Target::Shard(value)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Shard(index) => write!(f, "shard {index}"),
            Target::All => write!(f, "all shards"),
        }
    }
}

/// Body of a request: what the addressed shard should do.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    /// Liveness probe, answered on the event loop with [`PONG`].
    Ping,
    /// Invoke a registered remote function by name.
    CodeRequest {
        function: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
}

/// A request as published by [`crate::RemoteInvoker`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub id: RequestId,
    pub target: Target,
    pub kind: RequestKind,
}

/// A response to one request from one shard.
///
/// `from` is only set when answering a broadcast, so the requester can file
/// the reply under the right shard slot. `response` is `None` when the
/// responder could not serialize its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: RequestId,
    #[serde(default)]
    pub response: Option<RemoteResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ShardIndex>,
}

impl ResponseEnvelope {
    pub fn new(id: RequestId, response: Option<RemoteResult>, from: Option<ShardIndex>) -> Self {
        Self { id, response, from }
    }
}

/// Wire-level union of everything that travels on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Ping {
        id: RequestId,
        target: Target,
    },
    #[serde(rename = "coderequest")]
    CodeRequest {
        id: RequestId,
        target: Target,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
    },
    Response(ResponseEnvelope),
}

impl Envelope {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a payload received from the channel.
    ///
    /// Foreign or malformed payloads produce an error; callers on the receive
    /// path drop those without surfacing them.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn id(&self) -> RequestId {
        match self {
            Envelope::Ping { id, .. } | Envelope::CodeRequest { id, .. } => *id,
            Envelope::Response(response) => response.id,
        }
    }
}

impl From<RequestEnvelope> for Envelope {
    fn from(request: RequestEnvelope) -> Self {
        let RequestEnvelope { id, target, kind } = request;
        match kind {
            RequestKind::Ping => Envelope::Ping { id, target },
            RequestKind::CodeRequest {
                function,
                args,
                kwargs,
            } => Envelope::CodeRequest {
                id,
                target,
                function,
                args,
                kwargs,
            },
        }
    }
}

impl From<ResponseEnvelope> for Envelope {
    fn from(response: ResponseEnvelope) -> Self {
        Envelope::Response(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn target_wire_format() {
        assert_eq!(serde_json::to_value(Target::All).unwrap(), json!("all"));
        assert_eq!(serde_json::to_value(Target::Shard(3)).unwrap(), json!(3));
        assert!(serde_json::from_value::<Target>(json!("some")).is_err());
    }

    #[test]
    fn coderequest_defaults_missing_arguments() {
        let id = Uuid::new_v4();
        let raw = json!({"type": "coderequest", "id": id, "target": 1, "function": "gather_info"});
        let envelope = Envelope::decode(raw.to_string().as_bytes()).unwrap();

        match envelope {
            Envelope::CodeRequest {
                target,
                function,
                args,
                kwargs,
                ..
            } => {
                assert_eq!(target, Target::Shard(1));
                assert_eq!(function, "gather_info");
                assert!(args.is_empty());
                assert!(kwargs.is_empty());
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn response_omits_from_for_single_target() {
        let envelope = Envelope::from(ResponseEnvelope::new(Uuid::new_v4(), None, None));
        let value: Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "response");
        assert!(value.get("from").is_none());
        assert!(value["response"].is_null());
    }

    #[test]
    fn foreign_payloads_fail_to_decode() {
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(br#"{"type":"unknown","id":"x"}"#).is_err());
        assert!(Envelope::decode(br#"{"hello":"world"}"#).is_err());
    }

    #[test]
    fn target_includes() {
        assert!(Target::All.includes(7));
        assert!(Target::Shard(2).includes(2));
        assert!(!Target::Shard(2).includes(1));
    }
}
