// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod admission;
pub mod aggregator;
pub mod context;
pub mod core_plugin;
pub mod dispatcher;
pub mod manager;
pub mod manager_builder;
pub mod mode;
pub mod plugins;
pub mod registry;
pub mod settings;
pub mod system_functions;
pub mod worker;

pub use admission::{
    AdmissionPipeline, AdmitReason, DropReason, OwnerSet, Predicate, PredicateKind, Verdict,
    predicate_fn,
};
pub use aggregator::BroadcastAggregator;
pub use context::{RuntimeStats, ShardContext, ShardInfo};
pub use core_plugin::{CORE_PLUGIN, CorePlugin};
pub use manager::{ShardListing, ShardRuntime};
pub use manager_builder::ShardRuntimeBuilder;
pub use mode::{CoreMode, InstanceMode};
pub use plugins::{
    Plugin, PluginContext, PluginFactory, PluginManager, PluginRegistry, ReconcileReport,
    ReloadOutcome, plugin_factory,
};
pub use registry::CorrelationRegistry;
pub use settings::{GuildRoles, GuildSettings, GuildSettingsStore, RoleKind};
pub use system_functions::ShardStatus;
