// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! BariumDB: an embedded transactional data management engine.
//!
//! This crate provides the concurrency-control core: a hierarchical lock
//! manager with intention locking, online deadlock detection, and
//! arena-backed lock tables, together with the transaction context types it
//! shares with job workers.

pub mod locking;
pub mod txn;

pub use locking::{LockError, LockManager, LockManagerConfig, LockMode, Slot};
pub use txn::{JobId, TxnContext, TxnState};
