// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction-facing types.
//!
//! A [`TxnContext`] is the handle a job worker shares with the lock manager:
//! it carries the job id, the transaction state, and the timeout flag the
//! manager raises when it decides a job must abort (timeout observed or
//! deadlock victim). All state is atomic so the context can be read and
//! flagged from any thread.

mod context;

pub use context::{JobId, TxnContext, TxnState};
