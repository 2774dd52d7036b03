// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod message;
pub mod response;

pub use message::{
    Envelope, PONG, RequestEnvelope, RequestId, RequestKind, ResponseEnvelope, ShardIndex, Target,
};
pub use response::{BroadcastReplies, RemoteError, RemoteResult, Reply, ShardReply};
