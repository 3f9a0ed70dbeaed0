// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Concurrent hierarchical lock manager.
//!
//! This module arbitrates access by concurrent jobs (transactions) to named
//! resources: datasets, and individual entities within datasets. It provides:
//! - Blocking acquisition ([`LockManager::lock`]) and non-blocking
//!   try-acquisition ([`LockManager::try_lock`])
//! - Instantaneous probes that acquire and immediately release
//!   ([`LockManager::instant_lock`], [`LockManager::instant_try_lock`])
//! - Lock upgrade (conversion) when a job strengthens a mode it already holds
//! - Online deadlock detection with the incoming requester as the victim
//! - Bulk release of a terminating job's locks ([`LockManager::release_locks`])
//!
//! # Key Concepts
//!
//! ## Multi-granularity locking
//!
//! Five modes cover two granularities: `Shared` and `Exclusive` apply at
//! either level, while `IntentShared` and `IntentExclusive` are taken at the
//! dataset level to announce entity-level S/X locks. An entity request
//! implicitly acquires the matching dataset intention lock first, and a
//! per-thread cache short-circuits the repeat acquisitions. The static
//! compatibility matrix decides grant, grant-and-raise, or wait.
//!
//! ## Slot arenas
//!
//! Resources, requests, and jobs live in chunked arenas addressed by opaque
//! slot ids, forming linked queues without owning references: each resource
//! heads a holder list and two wait queues, and each request is threaded
//! onto a per-job chain of the matching role. Arenas recycle slots on a
//! free list and return wholly-free chunks to the system on a timer.
//!
//! ## Resource groups
//!
//! Resources hash into a fixed table of 1024 groups. A group's mutex
//! serializes every queue and max-mode mutation for its resources, and its
//! condition variable parks blocked requests; a wake is a broadcast and the
//! woken request re-evaluates the matrix from scratch.
//!
//! # Example
//!
//! ```no_run
//! use bariumdb::locking::{LockManager, LockManagerConfig, LockMode};
//! use bariumdb::txn::{JobId, TxnContext};
//!
//! # fn example() -> Result<(), bariumdb::locking::LockError> {
//! let manager = LockManager::new(LockManagerConfig::default());
//! manager.start();
//!
//! let txn = TxnContext::new(JobId(1));
//!
//! // Exclusive lock on entity 42 of dataset 3; the dataset-level
//! // intention lock is acquired automatically.
//! manager.lock(3, 42, LockMode::Exclusive, &txn)?;
//!
//! // Probe the whole dataset without holding anything.
//! let free = manager.instant_try_lock(3, -1, LockMode::Shared, &txn)?;
//! println!("dataset shared-lockable: {free}");
//!
//! // End of job: release everything at once.
//! manager.release_locks(&txn)?;
//! # Ok(())
//! # }
//! ```

mod arena;
mod cache;
mod config;
mod error;
mod group;
mod manager;
mod matrix;
mod records;

pub use arena::Slot;
pub use config::LockManagerConfig;
pub use error::LockError;
pub use manager::LockManager;
pub use matrix::LockMode;
