// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod client;
pub mod handler;

pub use client::{PendingReply, RemoteInvoker, kwargs};
pub use handler::{FunctionRegistry, RemoteArgs, RemoteFunction, ResponseSerializationError, remote_fn};
