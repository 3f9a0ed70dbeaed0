// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Chunked slot arena for fixed-shape records.
//!
//! An arena hands out stable 64-bit slot ids for records stored in
//! fixed-capacity chunks. Ids are opaque to callers; internally they decode
//! to a `(chunk, offset)` pair. Allocation and deallocation are serialized
//! by the arena itself; field access on individual records is *not* — record
//! fields are atomics and callers order their access through the owning
//! resource-group latch or the job-arena monitor.
//!
//! Freed slots go onto a LIFO free list. Wholly-free trailing chunks are
//! returned to the system at most once per `shrink_timer` interval.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

/// Records per chunk. Slot ids encode the chunk index in their upper half,
/// so capacity only bounds the offset part.
const CHUNK_CAPACITY: usize = 256;

/// Opaque identifier of a record in a [`SlotArena`].
///
/// All valid slots are non-negative; [`Slot::NONE`] (`-1`) is the sentinel
/// used for empty list heads and chain terminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(i64);

impl Slot {
    /// The "no slot" sentinel.
    pub const NONE: Slot = Slot(-1);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub fn is_some(self) -> bool {
        self.0 >= 0
    }

    /// The raw 64-bit id.
    #[inline]
    pub fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub(crate) fn from_raw(raw: i64) -> Self {
        Slot(raw)
    }

    #[inline]
    fn encode(chunk: usize, offset: usize) -> Self {
        Slot(((chunk as i64) << 32) | offset as i64)
    }

    #[inline]
    fn chunk_index(self) -> usize {
        debug_assert!(self.is_some());
        (self.0 >> 32) as usize
    }

    #[inline]
    fn offset(self) -> usize {
        debug_assert!(self.is_some());
        (self.0 & 0xFFFF_FFFF) as usize
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A slot-valued field of a record, readable and writable concurrently.
pub(crate) struct AtomicSlot(AtomicI64);

impl AtomicSlot {
    pub fn new(slot: Slot) -> Self {
        Self(AtomicI64::new(slot.raw()))
    }

    #[inline]
    pub fn load(&self) -> Slot {
        Slot::from_raw(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, slot: Slot) {
        self.0.store(slot.raw(), Ordering::Release);
    }
}

impl Default for AtomicSlot {
    fn default() -> Self {
        Self::new(Slot::NONE)
    }
}

/// A record type storable in a [`SlotArena`].
///
/// `reset` returns a record to its pristine state; it runs on deallocation so
/// a recycled slot never leaks the previous occupant's links.
pub(crate) trait ArenaRecord: Default + Send + Sync + 'static {
    fn reset(&self);
}

struct Chunk<T> {
    records: Box<[T]>,
}

impl<T: ArenaRecord> Chunk<T> {
    fn new() -> Self {
        Self {
            records: (0..CHUNK_CAPACITY).map(|_| T::default()).collect(),
        }
    }
}

struct AllocState {
    /// LIFO free list of recycled slots.
    free: Vec<Slot>,
    /// Next fresh offset in the last chunk; `CHUNK_CAPACITY` forces a new
    /// chunk on the next fresh allocation.
    next_offset: usize,
    live: usize,
    last_shrink: Instant,
}

/// Thread-safe pool of fixed-shape records addressed by [`Slot`] ids.
pub(crate) struct SlotArena<T> {
    chunks: RwLock<Vec<Arc<Chunk<T>>>>,
    state: Mutex<AllocState>,
    shrink_timer: Duration,
}

impl<T: ArenaRecord> SlotArena<T> {
    pub fn new(shrink_timer: Duration) -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
            state: Mutex::new(AllocState {
                free: Vec::new(),
                next_offset: CHUNK_CAPACITY,
                live: 0,
                last_shrink: Instant::now(),
            }),
            shrink_timer,
        }
    }

    /// Allocates a slot, recycling freed slots before growing.
    pub fn allocate(&self) -> Slot {
        let mut state = self.state.lock();
        state.live += 1;
        if let Some(slot) = state.free.pop() {
            return slot;
        }
        let mut chunks = self.chunks.write();
        if state.next_offset == CHUNK_CAPACITY {
            chunks.push(Arc::new(Chunk::new()));
            state.next_offset = 0;
        }
        let slot = Slot::encode(chunks.len() - 1, state.next_offset);
        state.next_offset += 1;
        slot
    }

    /// Returns a slot to the arena. The record is reset before it becomes
    /// recyclable. Accessing a deallocated slot is a logic error.
    pub fn deallocate(&self, slot: Slot) {
        self.with(slot, |record| record.reset());
        let mut state = self.state.lock();
        state.free.push(slot);
        state.live -= 1;
        if state.last_shrink.elapsed() >= self.shrink_timer {
            self.shrink(&mut state);
            state.last_shrink = Instant::now();
        }
    }

    /// Runs `f` against the record at `slot`.
    #[inline]
    pub fn with<R>(&self, slot: Slot, f: impl FnOnce(&T) -> R) -> R {
        debug_assert!(slot.is_some(), "access through the NONE sentinel");
        let chunks = self.chunks.read();
        f(&chunks[slot.chunk_index()].records[slot.offset()])
    }

    /// Number of live (allocated, not yet freed) records.
    pub fn live(&self) -> usize {
        self.state.lock().live
    }

    #[cfg(test)]
    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    /// Visits every live record. Intended for diagnostics; the caller must
    /// tolerate records mutating underneath if the arena is in active use.
    pub fn for_each_live(&self, mut f: impl FnMut(Slot, &T)) {
        let state = self.state.lock();
        let free: HashSet<i64> = state.free.iter().map(|s| s.raw()).collect();
        let chunks = self.chunks.read();
        for (index, chunk) in chunks.iter().enumerate() {
            let used = if index + 1 == chunks.len() {
                state.next_offset
            } else {
                CHUNK_CAPACITY
            };
            for offset in 0..used {
                let slot = Slot::encode(index, offset);
                if !free.contains(&slot.raw()) {
                    f(slot, &chunk.records[offset]);
                }
            }
        }
    }

    /// Pops trailing chunks whose every allocated slot has been freed.
    fn shrink(&self, state: &mut AllocState) {
        let mut chunks = self.chunks.write();
        while let Some(last) = chunks.len().checked_sub(1) {
            let used = state.next_offset;
            let freed = state
                .free
                .iter()
                .filter(|slot| slot.chunk_index() == last)
                .count();
            if freed < used {
                break;
            }
            chunks.pop();
            state.free.retain(|slot| slot.chunk_index() != last);
            state.next_offset = CHUNK_CAPACITY;
        }
    }
}
