// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Lock modes and the static compatibility matrix.
//!
//! Five modes form the multi-granularity scheme: `None` (NL), `IntentShared`
//! (IS), `IntentExclusive` (IX), `Shared` (S), and `Exclusive` (X). Intent
//! modes are taken at the dataset level to announce entity-level S/X locks.
//!
//! `ACTION_MATRIX[current_max][requested]` yields the verdict for a request
//! against the dominant mode currently held on a resource.

use std::fmt;

/// A lock mode, encoded as a single byte on the wire and in request records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockMode {
    /// No lock (NL). The mode of a resource with no holders.
    None = 0,
    /// Intention-shared (IS): dataset-level announcement of entity S locks.
    IntentShared = 1,
    /// Intention-exclusive (IX): dataset-level announcement of entity X locks.
    IntentExclusive = 2,
    /// Shared (S): concurrent readers allowed.
    Shared = 3,
    /// Exclusive (X): single owner, no concurrent access.
    Exclusive = 4,
}

impl LockMode {
    /// Decodes a mode from its wire byte.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::IntentShared),
            2 => Some(Self::IntentExclusive),
            3 => Some(Self::Shared),
            4 => Some(Self::Exclusive),
            _ => None,
        }
    }

    /// Encodes this mode as its wire byte.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(code: u8) -> Self {
        match Self::from_code(code) {
            Some(mode) => mode,
            None => unreachable!("invalid lock mode encoding: {code}"),
        }
    }

    /// The dataset-level intention mode implied by an entity-level request.
    #[inline]
    pub fn intention(self) -> Self {
        if self == Self::Exclusive {
            Self::IntentExclusive
        } else {
            Self::IntentShared
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "NL",
            Self::IntentShared => "IS",
            Self::IntentExclusive => "IX",
            Self::Shared => "S",
            Self::Exclusive => "X",
        })
    }
}

/// Verdict for a lock request against a resource's current max mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockAction {
    /// Grant; the max mode is unchanged.
    Get,
    /// Grant and raise the max mode to the requested mode.
    Upd,
    /// Incompatible with some current holder; block (or fail a try-lock).
    Wait,
    /// The requesting job already holds the resource in a different mode;
    /// queue as an upgrader. Produced only by the same-job refinement,
    /// never by the matrix itself.
    Conv,
}

use LockAction::{Get, Upd, Wait};

/// Rows are the current max mode, columns the requested mode, both in
/// NL, IS, IX, S, X order.
pub(crate) const ACTION_MATRIX: [[LockAction; 5]; 5] = [
    [Get, Upd, Upd, Upd, Upd],   // NL
    [Get, Get, Upd, Upd, Wait],  // IS
    [Get, Get, Get, Wait, Wait], // IX
    [Get, Get, Wait, Get, Wait], // S
    [Get, Wait, Wait, Wait, Wait], // X
];

/// Looks up the verdict for `requested` against `current`.
#[inline]
pub(crate) fn action(current: LockMode, requested: LockMode) -> LockAction {
    ACTION_MATRIX[current as usize][requested as usize]
}
