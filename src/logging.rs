// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Log subscriber setup for binaries embedding the producer or consumer.

use crate::configs::RabbitMQConfigs;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence; otherwise the level is `debug` when the debug
/// flag is set and `info` when it is not. Calling it twice is a no-op.
pub fn setup_tracing(cfg: &RabbitMQConfigs) {
    let level = if cfg.debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
