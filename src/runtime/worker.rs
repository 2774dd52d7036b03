// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Single-threaded executor for remote function calls.
//!
//! Code requests are queued to one dedicated OS thread and run strictly one
//! at a time in arrival order, so slow or blocking remote code never stalls
//! the event loop (ping handling and response routing stay responsive).

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::api::handler::{FunctionRegistry, RemoteArgs, ResponseSerializationError};
use crate::protocol::{
    Envelope, RemoteError, RemoteResult, RequestId, ResponseEnvelope, ShardIndex,
};
use crate::runtime::context::ShardContext;
use crate::transport::PubSubTransport;

/// Publishes responses on the shared channel.
#[derive(Debug, Clone)]
pub struct Responder {
    transport: Arc<dyn PubSubTransport>,
    channel: String,
}

impl Responder {
    pub fn new(transport: Arc<dyn PubSubTransport>, channel: impl Into<String>) -> Self {
        Self {
            transport,
            channel: channel.into(),
        }
    }

    /// Publish `response`. If it cannot be encoded, a null-payload response
    /// with the same id goes out instead so the requester is not left
    /// waiting.
    pub async fn respond(&self, response: ResponseEnvelope) {
        let id = response.id;
        let from = response.from;
        let payload = match Envelope::from(response).encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(request_id = %id, error = %e, "Response not encodable; sending null payload");
                match Envelope::from(ResponseEnvelope::new(id, None, from)).encode() {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(request_id = %id, error = %e, "Failed to encode null response");
                        return;
                    }
                }
            }
        };

        if let Err(e) = self.transport.publish(&self.channel, payload).await {
            warn!(request_id = %id, error = %e, "Failed to publish response");
        }
    }
}

/// A queued code request.
#[derive(Debug)]
pub struct CodeRequest {
    pub id: RequestId,
    /// Set when answering a broadcast.
    pub from: Option<ShardIndex>,
    pub function: String,
    pub args: RemoteArgs,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one request. `None` means the result could not be serialized.
pub fn execute(
    ctx: &ShardContext,
    functions: &FunctionRegistry,
    request: CodeRequest,
) -> Option<RemoteResult> {
    let Some(function) = functions.get(&request.function) else {
        warn!(request_id = %request.id, function = %request.function, "Unknown remote function");
        return Some(RemoteResult::Error(RemoteError::new(format!(
            "unknown remote function {:?}",
            request.function
        ))));
    };

    match catch_unwind(AssertUnwindSafe(|| function.call(ctx, request.args))) {
        Ok(Ok(value)) => Some(RemoteResult::Success(value)),
        Ok(Err(e)) if e.is::<ResponseSerializationError>() => {
            warn!(request_id = %request.id, function = %request.function, error = %e, "Dropping unserializable result");
            None
        }
        Ok(Err(e)) => {
            debug!(request_id = %request.id, function = %request.function, error = %e, "Remote function failed");
            Some(RemoteResult::from(e))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(request_id = %request.id, function = %request.function, panic = %message, "Remote function panicked");
            Some(RemoteResult::Error(RemoteError::new(format!(
                "remote function {:?} panicked: {message}",
                request.function
            ))))
        }
    }
}

/// Handle to the worker thread. Dropping every handle closes the queue and
/// lets the thread exit after its current job.
#[derive(Clone)]
pub struct RemoteWorker {
    tx: mpsc::Sender<CodeRequest>,
}

impl std::fmt::Debug for RemoteWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteWorker").finish_non_exhaustive()
    }
}

impl RemoteWorker {
    /// Start the worker thread.
    pub fn spawn(
        ctx: ShardContext,
        functions: FunctionRegistry,
        responder: Responder,
        handle: Handle,
    ) -> std::io::Result<(Self, JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel::<CodeRequest>();
        let thread = std::thread::Builder::new()
            .name(format!("remote-worker-{}", ctx.shard.id))
            .spawn(move || {
                debug!(shard = ctx.shard.id, "Remote worker started");
                while let Ok(request) = rx.recv() {
                    let id = request.id;
                    let from = request.from;
                    let response = execute(&ctx, &functions, request);
                    handle.block_on(responder.respond(ResponseEnvelope::new(id, response, from)));
                }
                debug!(shard = ctx.shard.id, "Remote worker stopped");
            })?;
        Ok((Self { tx }, thread))
    }

    /// Queue a request; false if the worker has stopped.
    pub fn submit(&self, request: CodeRequest) -> bool {
        match self.tx.send(request) {
            Ok(()) => true,
            Err(mpsc::SendError(request)) => {
                warn!(request_id = %request.id, "Remote worker stopped; request dropped");
                false
            }
        }
    }
}
