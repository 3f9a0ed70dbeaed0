// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the lock manager.

use std::time::Duration;

/// Configuration for [`LockManager`](super::LockManager) initialization.
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Minimum interval between passes that return freed arena chunks to the
    /// system. Smaller values reclaim memory more aggressively.
    pub shrink_timer: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            shrink_timer: Duration::from_secs(120),
        }
    }
}

impl LockManagerConfig {
    /// Sets the arena shrink interval.
    pub fn with_shrink_timer(mut self, shrink_timer: Duration) -> Self {
        self.shrink_timer = shrink_timer;
        self
    }
}
