// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Record layouts and typed arenas for resources, requests, and jobs.
//!
//! The three record kinds form a linked mesh addressed entirely by slot ids:
//! a resource heads one holder list and two wait queues of requests, and each
//! request is additionally threaded onto a doubly-linked per-job chain of the
//! matching role. No record owns another; the arenas own everything.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::arena::{ArenaRecord, AtomicSlot, Slot, SlotArena};
use super::matrix::LockMode;

/// One actively-locked resource, identified by `(dataset_id, entity_hash)`
/// with `entity_hash == -1` denoting the dataset itself.
pub(crate) struct ResourceRecord {
    dataset_id: AtomicI32,
    entity_hash: AtomicI32,
    /// Dominant mode among current holders.
    max_mode: AtomicU8,
    /// Next resource in the owning group's chain.
    next: AtomicSlot,
    /// Head of the holder list (most recent grant first).
    last_holder: AtomicSlot,
    /// Head of the waiter queue (arrival order).
    first_waiter: AtomicSlot,
    /// Head of the upgrader queue (arrival order).
    first_upgrader: AtomicSlot,
}

impl Default for ResourceRecord {
    fn default() -> Self {
        Self {
            dataset_id: AtomicI32::new(-1),
            entity_hash: AtomicI32::new(-1),
            max_mode: AtomicU8::new(LockMode::None.code()),
            next: AtomicSlot::default(),
            last_holder: AtomicSlot::default(),
            first_waiter: AtomicSlot::default(),
            first_upgrader: AtomicSlot::default(),
        }
    }
}

impl ArenaRecord for ResourceRecord {
    fn reset(&self) {
        self.dataset_id.store(-1, Ordering::Release);
        self.entity_hash.store(-1, Ordering::Release);
        self.max_mode.store(LockMode::None.code(), Ordering::Release);
        self.next.store(Slot::NONE);
        self.last_holder.store(Slot::NONE);
        self.first_waiter.store(Slot::NONE);
        self.first_upgrader.store(Slot::NONE);
    }
}

/// One outstanding acquisition attempt: held, waiting, or upgrading.
#[derive(Default)]
pub(crate) struct RequestRecord {
    resource: AtomicSlot,
    job_slot: AtomicSlot,
    lock_mode: AtomicU8,
    /// Next request in the resource-side queue this request is linked on.
    next_request: AtomicSlot,
    /// Doubly-linked chain of the owning job's requests of the same role.
    prev_job_request: AtomicSlot,
    next_job_request: AtomicSlot,
}

impl ArenaRecord for RequestRecord {
    fn reset(&self) {
        self.resource.store(Slot::NONE);
        self.job_slot.store(Slot::NONE);
        self.lock_mode.store(LockMode::None.code(), Ordering::Release);
        self.next_request.store(Slot::NONE);
        self.prev_job_request.store(Slot::NONE);
        self.next_job_request.store(Slot::NONE);
    }
}

/// One job with any live lock interaction.
pub(crate) struct JobRecord {
    job_id: AtomicI32,
    last_holder: AtomicSlot,
    last_waiter: AtomicSlot,
    last_upgrader: AtomicSlot,
}

impl Default for JobRecord {
    fn default() -> Self {
        Self {
            job_id: AtomicI32::new(-1),
            last_holder: AtomicSlot::default(),
            last_waiter: AtomicSlot::default(),
            last_upgrader: AtomicSlot::default(),
        }
    }
}

impl ArenaRecord for JobRecord {
    fn reset(&self) {
        self.job_id.store(-1, Ordering::Release);
        self.last_holder.store(Slot::NONE);
        self.last_waiter.store(Slot::NONE);
        self.last_upgrader.store(Slot::NONE);
    }
}

macro_rules! slot_accessors {
    ($(($get:ident, $set:ident, $field:ident)),+ $(,)?) => {
        $(
            #[inline]
            pub fn $get(&self, slot: Slot) -> Slot {
                self.records.with(slot, |r| r.$field.load())
            }

            #[inline]
            pub fn $set(&self, slot: Slot, value: Slot) {
                self.records.with(slot, |r| r.$field.store(value));
            }
        )+
    };
}

/// Arena of [`ResourceRecord`]s.
pub(crate) struct ResourceArena {
    records: SlotArena<ResourceRecord>,
}

impl ResourceArena {
    pub fn new(shrink_timer: Duration) -> Self {
        Self {
            records: SlotArena::new(shrink_timer),
        }
    }

    pub fn allocate(&self) -> Slot {
        self.records.allocate()
    }

    pub fn deallocate(&self, slot: Slot) {
        self.records.deallocate(slot);
    }

    pub fn live(&self) -> usize {
        self.records.live()
    }

    #[inline]
    pub fn dataset_id(&self, slot: Slot) -> i32 {
        self.records.with(slot, |r| r.dataset_id.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_dataset_id(&self, slot: Slot, value: i32) {
        self.records
            .with(slot, |r| r.dataset_id.store(value, Ordering::Release));
    }

    #[inline]
    pub fn entity_hash(&self, slot: Slot) -> i32 {
        self.records
            .with(slot, |r| r.entity_hash.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_entity_hash(&self, slot: Slot, value: i32) {
        self.records
            .with(slot, |r| r.entity_hash.store(value, Ordering::Release));
    }

    #[inline]
    pub fn max_mode(&self, slot: Slot) -> LockMode {
        LockMode::from_u8(self.records.with(slot, |r| r.max_mode.load(Ordering::Acquire)))
    }

    #[inline]
    pub fn set_max_mode(&self, slot: Slot, mode: LockMode) {
        self.records
            .with(slot, |r| r.max_mode.store(mode.code(), Ordering::Release));
    }

    slot_accessors!(
        (next, set_next, next),
        (last_holder, set_last_holder, last_holder),
        (first_waiter, set_first_waiter, first_waiter),
        (first_upgrader, set_first_upgrader, first_upgrader),
    );

    pub fn append(&self, out: &mut String) {
        let _ = writeln!(out, "{} live resource(s)", self.live());
        self.records.for_each_live(|slot, r| {
            let _ = writeln!(
                out,
                "{slot} : {{ dataset : {}, entity : {}, max : {}, next : {}, \
                 last_holder : {}, first_waiter : {}, first_upgrader : {} }}",
                r.dataset_id.load(Ordering::Acquire),
                r.entity_hash.load(Ordering::Acquire),
                LockMode::from_u8(r.max_mode.load(Ordering::Acquire)),
                r.next.load(),
                r.last_holder.load(),
                r.first_waiter.load(),
                r.first_upgrader.load(),
            );
        });
    }
}

/// Arena of [`RequestRecord`]s.
pub(crate) struct RequestArena {
    records: SlotArena<RequestRecord>,
}

impl RequestArena {
    pub fn new(shrink_timer: Duration) -> Self {
        Self {
            records: SlotArena::new(shrink_timer),
        }
    }

    pub fn allocate(&self) -> Slot {
        self.records.allocate()
    }

    pub fn deallocate(&self, slot: Slot) {
        self.records.deallocate(slot);
    }

    pub fn live(&self) -> usize {
        self.records.live()
    }

    #[inline]
    pub fn lock_mode(&self, slot: Slot) -> LockMode {
        LockMode::from_u8(self.records.with(slot, |r| r.lock_mode.load(Ordering::Acquire)))
    }

    #[inline]
    pub fn set_lock_mode(&self, slot: Slot, mode: LockMode) {
        self.records
            .with(slot, |r| r.lock_mode.store(mode.code(), Ordering::Release));
    }

    slot_accessors!(
        (resource, set_resource, resource),
        (job_slot, set_job_slot, job_slot),
        (next_request, set_next_request, next_request),
        (prev_job_request, set_prev_job_request, prev_job_request),
        (next_job_request, set_next_job_request, next_job_request),
    );

    pub fn append(&self, out: &mut String) {
        let _ = writeln!(out, "{} live request(s)", self.live());
        self.records.for_each_live(|slot, r| {
            let _ = writeln!(
                out,
                "{slot} : {{ resource : {}, job : {}, mode : {}, next : {}, \
                 prev_job : {}, next_job : {} }}",
                r.resource.load(),
                r.job_slot.load(),
                LockMode::from_u8(r.lock_mode.load(Ordering::Acquire)),
                r.next_request.load(),
                r.prev_job_request.load(),
                r.next_job_request.load(),
            );
        });
    }
}

/// Arena of [`JobRecord`]s.
///
/// Per-job chains are mutated (and, during deadlock detection, read across
/// jobs) under a single process-wide monitor exposed by [`JobArena::monitor`].
pub(crate) struct JobArena {
    records: SlotArena<JobRecord>,
    monitor: Mutex<()>,
}

impl JobArena {
    pub fn new(shrink_timer: Duration) -> Self {
        Self {
            records: SlotArena::new(shrink_timer),
            monitor: Mutex::new(()),
        }
    }

    /// Serializes per-job list mutations and cross-job list reads.
    pub fn monitor(&self) -> MutexGuard<'_, ()> {
        self.monitor.lock()
    }

    pub fn allocate(&self) -> Slot {
        self.records.allocate()
    }

    pub fn deallocate(&self, slot: Slot) {
        self.records.deallocate(slot);
    }

    pub fn live(&self) -> usize {
        self.records.live()
    }

    #[inline]
    pub fn job_id(&self, slot: Slot) -> i32 {
        self.records.with(slot, |r| r.job_id.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_job_id(&self, slot: Slot, value: i32) {
        self.records
            .with(slot, |r| r.job_id.store(value, Ordering::Release));
    }

    slot_accessors!(
        (last_holder, set_last_holder, last_holder),
        (last_waiter, set_last_waiter, last_waiter),
        (last_upgrader, set_last_upgrader, last_upgrader),
    );

    pub fn append(&self, out: &mut String) {
        let _ = writeln!(out, "{} live job(s)", self.live());
        self.records.for_each_live(|slot, r| {
            let _ = writeln!(
                out,
                "{slot} : {{ job : {}, last_holder : {}, last_waiter : {}, \
                 last_upgrader : {} }}",
                r.job_id.load(Ordering::Acquire),
                r.last_holder.load(),
                r.last_waiter.load(),
                r.last_upgrader.load(),
            );
        });
    }
}
