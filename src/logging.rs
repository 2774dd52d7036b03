// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide tracing subscriber.
//!
//! Filtering follows `RUST_LOG` when set; otherwise everything at `info`
//! (or `debug` when requested) and above is written to stderr.

use std::io::IsTerminal;
use std::sync::Once;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

static INIT: Once = Once::new();

/// Install the subscriber. Later calls are no-ops.
pub fn init(debug: bool) {
    INIT.call_once(|| setup_logging(debug));
}

fn setup_logging(debug: bool) {
    let default_level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter_layer = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let layer = fmt::layer()
        .with_ansi(std::io::stderr().is_terminal())
        .event_format(fmt::format().compact())
        .with_writer(std::io::stderr)
        .with_filter(filter_layer);

    // A host application may already have installed a subscriber.
    let _ = tracing_subscriber::registry().with(layer).try_init();
}
