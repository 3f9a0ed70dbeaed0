// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Resource groups and the fixed-size group table.
//!
//! Every lockable resource hashes into one of [`TABLE_SIZE`] groups. A group
//! owns the latch and condition variable for all resources chained into it,
//! plus the head of that chain. The table is never resized, so a group's
//! latch identity is stable for the lifetime of the manager.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::arena::Slot;

/// Number of resource groups. Collisions are resolved inside each group's
/// resource chain.
pub(crate) const TABLE_SIZE: usize = 1024;

/// One bucket of the lock table: a latch, its condition variable, and the
/// head of the chain of resources hashed into this group.
pub(crate) struct ResourceGroup {
    latch: Mutex<()>,
    condition: Condvar,
    first_resource: AtomicI64,
}

impl ResourceGroup {
    fn new() -> Self {
        Self {
            latch: Mutex::new(()),
            condition: Condvar::new(),
            first_resource: AtomicI64::new(Slot::NONE.raw()),
        }
    }

    /// Acquires the group latch. All queue and max-mode mutations on
    /// resources in this group happen under the returned guard.
    pub fn latch(&self) -> MutexGuard<'_, ()> {
        self.latch.lock()
    }

    /// Releases the latch, sleeps until [`wake_all`](Self::wake_all), and
    /// re-acquires it. Spurious wakeups are allowed; callers re-evaluate.
    pub fn wait(&self, guard: &mut MutexGuard<'_, ()>) {
        self.condition.wait(guard);
    }

    /// Wakes every thread blocked in [`wait`](Self::wait) on this group.
    pub fn wake_all(&self) {
        self.condition.notify_all();
    }

    #[inline]
    pub fn first_resource(&self) -> Slot {
        Slot::from_raw(self.first_resource.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_first_resource(&self, slot: Slot) {
        self.first_resource.store(slot.raw(), Ordering::Release);
    }
}

/// Fixed array of [`ResourceGroup`]s indexed by a hash of the resource
/// identity.
pub(crate) struct ResourceGroupTable {
    groups: Box<[ResourceGroup]>,
}

impl ResourceGroupTable {
    pub fn new() -> Self {
        Self {
            groups: (0..TABLE_SIZE).map(|_| ResourceGroup::new()).collect(),
        }
    }

    /// Maps `(dataset_id, entity_hash)` to its group.
    pub fn get(&self, dataset_id: i32, entity_hash: i32) -> &ResourceGroup {
        let hash = (dataset_id ^ entity_hash).unsigned_abs() as usize;
        &self.groups[hash % TABLE_SIZE]
    }

    /// Appends the non-empty groups to a diagnostic dump.
    pub fn append(&self, out: &mut String) {
        for (index, group) in self.groups.iter().enumerate() {
            let first = group.first_resource();
            if first.is_some() {
                let _ = writeln!(out, "{index} : {first}");
            }
        }
    }
}
