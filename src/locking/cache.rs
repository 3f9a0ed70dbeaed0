// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Per-thread memo of dataset-level intention locks.
//!
//! A worker thread services one job at a time, so the cache remembers the
//! intention modes the *current* job has already acquired per dataset and
//! short-circuits the repeated dataset-level lock calls that entity locking
//! would otherwise issue. The cache is advisory: a miss always falls back to
//! a real acquisition.

use std::collections::HashMap;

use crate::txn::JobId;

use super::matrix::LockMode;

#[derive(Default)]
pub(crate) struct DatasetLockCache {
    job_id: Option<JobId>,
    modes: HashMap<i32, LockMode>,
}

impl DatasetLockCache {
    /// True only if the cache is tracking `job_id` and has `dataset_id`
    /// memoized at exactly `mode`. Observing a different job clears the
    /// cache.
    pub fn contains(&mut self, job_id: JobId, dataset_id: i32, mode: LockMode) -> bool {
        if self.job_id == Some(job_id) {
            self.modes.get(&dataset_id) == Some(&mode)
        } else {
            self.job_id = None;
            self.modes.clear();
            false
        }
    }

    /// Memoizes `mode` for `dataset_id` under `job_id`.
    pub fn put(&mut self, job_id: JobId, dataset_id: i32, mode: LockMode) {
        self.job_id = Some(job_id);
        self.modes.insert(dataset_id, mode);
    }

    /// Forgets everything memoized for `job_id`. Called when the job's locks
    /// are bulk-released so a recycled job id never inherits stale entries.
    pub fn invalidate(&mut self, job_id: JobId) {
        if self.job_id == Some(job_id) {
            self.job_id = None;
            self.modes.clear();
        }
    }
}
