// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction context shared between job workers and the lock manager.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Unique job (transaction) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub i32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

impl TxnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Committed,
            2 => Self::Aborted,
            _ => unreachable!("invalid transaction state encoding: {value}"),
        }
    }
}

/// Shared handle to a job's transactional state.
///
/// The context is read by the lock manager on every operation and may be
/// flagged (timeout, abort) from other threads, so all state is atomic and
/// the handle is freely shareable behind an `Arc`.
#[derive(Debug)]
pub struct TxnContext {
    job_id: JobId,
    state: AtomicU8,
    timed_out: AtomicBool,
}

impl TxnContext {
    /// Creates an active context for `job_id`.
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            state: AtomicU8::new(TxnState::Active as u8),
            timed_out: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[inline]
    pub fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TxnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state() == TxnState::Active
    }

    /// True once the lock manager (or a timeout monitor) has decided this
    /// job must abort.
    #[inline]
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub fn set_timed_out(&self, timed_out: bool) {
        self.timed_out.store(timed_out, Ordering::Release);
    }
}
