// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnection Backoff
//!
//! A fixed-interval delay used between reconnection attempts. There is no
//! jitter, cap or attempt limit: a long-running service keeps retrying at the
//! same pace until it is shut down.

use crate::configs::DEFAULT_RECONNECT_INTERVAL_MS;
use std::time::Duration;
use tokio::sync::watch;

/// Fixed delay between two connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    interval: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS))
    }
}

impl Backoff {
    pub fn new(interval: Duration) -> Self {
        Backoff { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleeps for one interval.
    ///
    /// Returns `false` when `shutdown` flipped to `true` (or its sender went
    /// away) before the delay elapsed, `true` otherwise.
    pub async fn wait(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.interval) => true,
            _ = shutdown.wait_for(|stop| *stop) => false,
        }
    }
}
