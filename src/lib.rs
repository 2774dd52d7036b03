// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Coordination runtime for a sharded chat bot.
//!
//! Every shard subscribes to one shared pub/sub channel. Over it a shard can
//! ping its peers, run named functions on one shard or all of them, and
//! collect the answers. On top of that sit the plugin lifecycle, the message
//! admission pipeline and the per-instance run mode, all persisted in a
//! key-value store shared by the deployment.

pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod protocol;
pub mod runtime;
pub mod store;
pub mod transport;

#[cfg(feature = "zmq")]
pub mod zmq;

pub use api::{FunctionRegistry, RemoteArgs, RemoteFunction, RemoteInvoker, kwargs, remote_fn};
pub use config::RuntimeConfig;
pub use error::{InvokeError, PluginError, StartupError};
pub use gateway::{ApplicationOwners, Gateway, GuildContext, InboundMessage, LogGateway};
pub use protocol::{RemoteError, RemoteResult, Reply, ShardIndex, ShardReply, Target};
pub use runtime::{
    CoreMode, Plugin, PluginContext, ShardContext, ShardListing, ShardRuntime,
    ShardRuntimeBuilder, Verdict, plugin_factory, predicate_fn,
};
pub use store::{Collection, FileStore, KeyValueStore, MemoryStore};
pub use transport::{LocalBus, PubSubTransport};
