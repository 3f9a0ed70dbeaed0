// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! The concurrent hierarchical lock manager.
//!
//! Arbitrates access by jobs to datasets and the entities within them using
//! five lock modes and intention locking. Requests resolve to a resource
//! group whose latch serializes all queue and max-mode mutations; blocked
//! requests sleep on the group's condition variable and re-evaluate the
//! compatibility matrix on every wake. Deadlocks are detected online by
//! walking the wait-for graph implied by the holder and per-job waiter
//! chains; the incoming requester is always the victim.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::txn::{JobId, TxnContext, TxnState};

use super::arena::Slot;
use super::cache::DatasetLockCache;
use super::config::LockManagerConfig;
use super::error::LockError;
use super::group::{ResourceGroup, ResourceGroupTable};
use super::matrix::{action, LockAction, LockMode};
use super::records::{JobArena, RequestArena, ResourceArena};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Dataset-lock caches for every manager this thread has used, keyed by
    /// manager instance id. Entries for dropped managers are tiny and die
    /// with the thread.
    static DATASET_LOCK_CACHES: RefCell<HashMap<u64, DatasetLockCache>> =
        RefCell::new(HashMap::new());
}

/// Transactional lock manager with hierarchical two-mode locking.
///
/// One instance serves the whole transactional subsystem; create it at
/// subsystem start and tear it down at stop. All operations take a shared
/// reference and are safe to call from any number of worker threads.
///
/// `entity_hash == -1` addresses the dataset itself; any other value
/// addresses one entity within the dataset. Entity-level requests implicitly
/// acquire the matching dataset-level intention lock first.
pub struct LockManager {
    table: ResourceGroupTable,
    resources: ResourceArena,
    requests: RequestArena,
    jobs: JobArena,
    job_slots: DashMap<JobId, Slot>,
    instance_id: u64,
}

impl LockManager {
    pub fn new(config: LockManagerConfig) -> Self {
        Self {
            table: ResourceGroupTable::new(),
            resources: ResourceArena::new(config.shrink_timer),
            requests: RequestArena::new(config.shrink_timer),
            jobs: JobArena::new(config.shrink_timer),
            job_slots: DashMap::new(),
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Lifecycle hook; the manager is ready as soon as it is constructed.
    pub fn start(&self) {
        debug!("lock manager started");
    }

    /// Lifecycle hook. With `dump_state`, writes the full diagnostic dump to
    /// `sink` before returning.
    pub fn stop(&self, dump_state: bool, sink: &mut dyn io::Write) -> io::Result<()> {
        debug!("lock manager stopped");
        if dump_state {
            sink.write_all(self.dump().as_bytes())?;
            sink.flush()?;
        }
        Ok(())
    }

    /// Blocking acquisition of `mode` on `(dataset_id, entity_hash)` for the
    /// calling job. Returns once the lock is held, or with an error if the
    /// job must abort (already aborted, timed out, or chosen as a deadlock
    /// victim).
    pub fn lock(
        &self,
        dataset_id: i32,
        entity_hash: i32,
        mode: LockMode,
        txn: &TxnContext,
    ) -> Result<(), LockError> {
        trace!(dataset_id, entity_hash, %mode, job = %txn.job_id(), "lock");

        self.ensure_dataset_intent(dataset_id, entity_hash, mode, txn)?;

        let job_slot = self.find_or_alloc_job_slot(txn.job_id());
        let group = self.table.get(dataset_id, entity_hash);
        let mut latch = group.latch();

        self.validate_job(txn)?;

        let res_slot = self.find_or_alloc_resource(group, dataset_id, entity_hash);
        let req_slot = self.alloc_request(res_slot, job_slot, mode);

        loop {
            let current = self.resources.max_mode(res_slot);
            let mut act = action(current, mode);
            if act == LockAction::Wait {
                act = self.action_for_same_job(res_slot, job_slot, mode);
            }
            match act {
                LockAction::Upd => {
                    self.resources.set_max_mode(res_slot, mode);
                    self.add_holder(req_slot, res_slot, job_slot);
                    return Ok(());
                }
                LockAction::Get => {
                    self.add_holder(req_slot, res_slot, job_slot);
                    return Ok(());
                }
                LockAction::Wait => {
                    if self.introduces_deadlock(res_slot, job_slot) {
                        self.discard_request(group, res_slot, req_slot);
                        return Err(self.request_abort(txn));
                    }
                    self.add_waiter(req_slot, res_slot, job_slot);
                    group.wait(&mut latch);
                    self.remove_waiter(req_slot, res_slot, job_slot)?;
                    if let Err(err) = self.validate_job(txn) {
                        self.discard_request(group, res_slot, req_slot);
                        return Err(err);
                    }
                }
                LockAction::Conv => {
                    if self.upgrade_grantable(res_slot, job_slot, mode) {
                        // The job's own weaker holding keeps the matrix at
                        // WAIT; the stronger of the two modes is the new max.
                        if mode > current {
                            self.resources.set_max_mode(res_slot, mode);
                        }
                        self.add_holder(req_slot, res_slot, job_slot);
                        return Ok(());
                    }
                    self.add_upgrader(req_slot, res_slot, job_slot);
                    group.wait(&mut latch);
                    self.remove_upgrader(req_slot, res_slot, job_slot)?;
                    if let Err(err) = self.validate_job(txn) {
                        self.discard_request(group, res_slot, req_slot);
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Non-blocking acquisition. One evaluation of the matrix: returns
    /// `true` and records the holder on an immediate grant, `false`
    /// otherwise. Dataset intention locks acquired on the way stay held on
    /// entity-lock failure and are cleaned up at job release.
    pub fn try_lock(
        &self,
        dataset_id: i32,
        entity_hash: i32,
        mode: LockMode,
        txn: &TxnContext,
    ) -> Result<bool, LockError> {
        trace!(dataset_id, entity_hash, %mode, job = %txn.job_id(), "try_lock");

        if entity_hash != -1 {
            let intent = mode.intention();
            let job_id = txn.job_id();
            if !self.with_cache(|cache| cache.contains(job_id, dataset_id, intent)) {
                if !self.try_lock(dataset_id, -1, intent, txn)? {
                    return Ok(false);
                }
                self.with_cache(|cache| cache.put(job_id, dataset_id, intent));
            }
        }

        let job_slot = self.find_or_alloc_job_slot(txn.job_id());
        let group = self.table.get(dataset_id, entity_hash);
        let _latch = group.latch();

        self.validate_job(txn)?;

        let res_slot = self.find_or_alloc_resource(group, dataset_id, entity_hash);
        let req_slot = self.alloc_request(res_slot, job_slot, mode);

        let current = self.resources.max_mode(res_slot);
        let mut act = action(current, mode);
        if act == LockAction::Wait {
            act = self.action_for_same_job(res_slot, job_slot, mode);
        }
        match act {
            LockAction::Upd => {
                self.resources.set_max_mode(res_slot, mode);
                self.add_holder(req_slot, res_slot, job_slot);
                Ok(true)
            }
            LockAction::Get => {
                self.add_holder(req_slot, res_slot, job_slot);
                Ok(true)
            }
            LockAction::Wait | LockAction::Conv => {
                self.discard_request(group, res_slot, req_slot);
                Ok(false)
            }
        }
    }

    /// Probes `mode` without holding it: acquires, then immediately
    /// releases.
    pub fn instant_lock(
        &self,
        dataset_id: i32,
        entity_hash: i32,
        mode: LockMode,
        txn: &TxnContext,
    ) -> Result<(), LockError> {
        trace!(dataset_id, entity_hash, %mode, job = %txn.job_id(), "instant_lock");

        self.lock(dataset_id, entity_hash, mode, txn)?;
        self.unlock(dataset_id, entity_hash, txn)
    }

    /// Non-blocking probe: returns whether `mode` was momentarily
    /// acquirable.
    pub fn instant_try_lock(
        &self,
        dataset_id: i32,
        entity_hash: i32,
        mode: LockMode,
        txn: &TxnContext,
    ) -> Result<bool, LockError> {
        trace!(dataset_id, entity_hash, %mode, job = %txn.job_id(), "instant_try_lock");

        if self.try_lock(dataset_id, entity_hash, mode, txn)? {
            self.unlock(dataset_id, entity_hash, txn)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Releases the calling job's most recent lock on
    /// `(dataset_id, entity_hash)`. Locking is properly nested within a job,
    /// so holders are removed in LIFO order.
    pub fn unlock(
        &self,
        dataset_id: i32,
        entity_hash: i32,
        txn: &TxnContext,
    ) -> Result<(), LockError> {
        trace!(dataset_id, entity_hash, job = %txn.job_id(), "unlock");

        let group = self.table.get(dataset_id, entity_hash);
        let _latch = group.latch();

        let res_slot = self.find_resource_in_group(group, dataset_id, entity_hash);
        if res_slot.is_none() {
            return Err(LockError::ResourceNotFound {
                dataset_id,
                entity_hash,
            });
        }

        let Some(job_slot) = self.job_slot_for(txn.job_id()) else {
            return Err(LockError::Corrupted {
                reason: "unlock by a job that holds no locks",
            });
        };

        let holder = self.remove_last_holder(res_slot, job_slot)?;
        self.requests.deallocate(holder);

        if self.resource_unused(res_slot) {
            self.unlink_resource(group, res_slot)?;
            self.resources.deallocate(res_slot);
        } else {
            let old_max = self.resources.max_mode(res_slot);
            let new_max = self.recompute_max_mode(res_slot, old_max)?;
            self.resources.set_max_mode(res_slot, new_max);
            // An unchanged max cannot unblock a waiter, but it can unblock
            // an upgrader whose blockers were the other holders.
            if old_max != new_max || self.resources.first_upgrader(res_slot).is_some() {
                group.wake_all();
            }
        }
        Ok(())

        // Dataset intention locks are released at the end of the job.
    }

    /// Releases every lock held by the job, in reverse acquisition order,
    /// then retires the job itself. Safe to call for a job that never
    /// locked anything.
    pub fn release_locks(&self, txn: &TxnContext) -> Result<(), LockError> {
        trace!(job = %txn.job_id(), "release_locks");

        let job_id = txn.job_id();
        let Some(job_slot) = self.job_slot_for(job_id) else {
            return Ok(());
        };
        debug_assert_eq!(self.jobs.job_id(job_slot), job_id.0);
        loop {
            let holder = {
                let _jobs = self.jobs.monitor();
                self.jobs.last_holder(job_slot)
            };
            if holder.is_none() {
                break;
            }
            let res_slot = self.requests.resource(holder);
            let dataset_id = self.resources.dataset_id(res_slot);
            let entity_hash = self.resources.entity_hash(res_slot);
            self.unlock(dataset_id, entity_hash, txn)?;
        }
        self.jobs.deallocate(job_slot);
        self.job_slots.remove(&job_id);
        self.with_cache(|cache| cache.invalidate(job_id));
        Ok(())
    }

    /// Renders a human-readable dump of all lock tables.
    pub fn pretty_print(&self) -> String {
        format!("\n########### LockManager Status #############\n{self}\n")
    }

    // ---- hierarchical acquisition ------------------------------------

    /// Ensures the dataset-level intention lock implied by an entity-level
    /// request is held, consulting the per-thread cache first.
    fn ensure_dataset_intent(
        &self,
        dataset_id: i32,
        entity_hash: i32,
        mode: LockMode,
        txn: &TxnContext,
    ) -> Result<(), LockError> {
        if entity_hash == -1 {
            return Ok(());
        }
        let intent = mode.intention();
        let job_id = txn.job_id();
        if !self.with_cache(|cache| cache.contains(job_id, dataset_id, intent)) {
            self.lock(dataset_id, -1, intent, txn)?;
            self.with_cache(|cache| cache.put(job_id, dataset_id, intent));
        }
        Ok(())
    }

    fn with_cache<R>(&self, f: impl FnOnce(&mut DatasetLockCache) -> R) -> R {
        DATASET_LOCK_CACHES
            .with(|caches| f(caches.borrow_mut().entry(self.instance_id).or_default()))
    }

    // ---- slot management ---------------------------------------------

    fn job_slot_for(&self, job_id: JobId) -> Option<Slot> {
        self.job_slots.get(&job_id).map(|entry| *entry)
    }

    fn find_or_alloc_job_slot(&self, job_id: JobId) -> Slot {
        if let Some(slot) = self.job_slot_for(job_id) {
            return slot;
        }
        let fresh = self.jobs.allocate();
        self.jobs.set_job_id(fresh, job_id.0);
        match self.job_slots.entry(job_id) {
            Entry::Occupied(entry) => {
                // Another thread registered this job between the lookup and
                // the insert; ours loses.
                self.jobs.deallocate(fresh);
                *entry.get()
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
                fresh
            }
        }
    }

    fn find_resource_in_group(
        &self,
        group: &ResourceGroup,
        dataset_id: i32,
        entity_hash: i32,
    ) -> Slot {
        let mut res = group.first_resource();
        while res.is_some() {
            if self.resources.dataset_id(res) == dataset_id
                && self.resources.entity_hash(res) == entity_hash
            {
                return res;
            }
            res = self.resources.next(res);
        }
        Slot::NONE
    }

    fn find_or_alloc_resource(
        &self,
        group: &ResourceGroup,
        dataset_id: i32,
        entity_hash: i32,
    ) -> Slot {
        let found = self.find_resource_in_group(group, dataset_id, entity_hash);
        if found.is_some() {
            return found;
        }
        let res = self.resources.allocate();
        self.resources.set_dataset_id(res, dataset_id);
        self.resources.set_entity_hash(res, entity_hash);
        self.resources.set_next(res, group.first_resource());
        group.set_first_resource(res);
        res
    }

    fn alloc_request(&self, res_slot: Slot, job_slot: Slot, mode: LockMode) -> Slot {
        let req = self.requests.allocate();
        self.requests.set_resource(req, res_slot);
        self.requests.set_job_slot(req, job_slot);
        self.requests.set_lock_mode(req, mode);
        req
    }

    /// Drops a request that never became a holder, and the resource too if
    /// nothing references it anymore.
    fn discard_request(&self, group: &ResourceGroup, res_slot: Slot, req_slot: Slot) {
        self.requests.deallocate(req_slot);
        if self.resource_unused(res_slot) {
            // A freshly allocated resource with no requests; unlinking
            // cannot fail to find it.
            let _ = self.unlink_resource(group, res_slot);
            self.resources.deallocate(res_slot);
        }
    }

    fn unlink_resource(&self, group: &ResourceGroup, res_slot: Slot) -> Result<(), LockError> {
        let head = group.first_resource();
        if head == res_slot {
            group.set_first_resource(self.resources.next(res_slot));
            return Ok(());
        }
        let mut prev = head;
        while prev.is_some() {
            let next = self.resources.next(prev);
            if next == res_slot {
                self.resources.set_next(prev, self.resources.next(res_slot));
                return Ok(());
            }
            prev = next;
        }
        Err(LockError::Corrupted {
            reason: "resource missing from its group chain",
        })
    }

    fn resource_unused(&self, res_slot: Slot) -> bool {
        self.resources.last_holder(res_slot).is_none()
            && self.resources.first_waiter(res_slot).is_none()
            && self.resources.first_upgrader(res_slot).is_none()
    }

    // ---- verdict refinement ------------------------------------------

    /// Refines a WAIT verdict for requests whose job already holds the
    /// resource: an equal-mode holding grants outright, a different-mode
    /// holding turns the request into a conversion.
    fn action_for_same_job(&self, res_slot: Slot, job_slot: Slot, mode: LockMode) -> LockAction {
        let mut verdict = LockAction::Wait;
        let mut holder = self.resources.last_holder(res_slot);
        while holder.is_some() {
            if self.requests.job_slot(holder) == job_slot {
                if self.requests.lock_mode(holder) == mode {
                    return LockAction::Get;
                }
                verdict = LockAction::Conv;
            }
            holder = self.requests.next_request(holder);
        }
        verdict
    }

    /// A conversion can complete once the requested mode is compatible with
    /// the folded max mode of the *other* jobs' holdings.
    fn upgrade_grantable(&self, res_slot: Slot, job_slot: Slot, mode: LockMode) -> bool {
        let mut foreign_max = LockMode::None;
        let mut holder = self.resources.last_holder(res_slot);
        while holder.is_some() {
            if self.requests.job_slot(holder) != job_slot {
                let held = self.requests.lock_mode(holder);
                match action(foreign_max, held) {
                    LockAction::Upd => foreign_max = held,
                    LockAction::Get => {}
                    _ => return false,
                }
            }
            holder = self.requests.next_request(holder);
        }
        matches!(action(foreign_max, mode), LockAction::Get | LockAction::Upd)
    }

    /// Folds the remaining holders' modes into the resource's new max mode.
    /// A holder still at the old max pins it there. Holders of one job fold
    /// by strength; holders of different jobs must be matrix-compatible.
    fn recompute_max_mode(&self, res_slot: Slot, old_max: LockMode) -> Result<LockMode, LockError> {
        let mut per_job: Vec<(Slot, LockMode)> = Vec::new();
        let mut holder = self.resources.last_holder(res_slot);
        while holder.is_some() {
            let held = self.requests.lock_mode(holder);
            if held == old_max {
                return Ok(old_max);
            }
            let job = self.requests.job_slot(holder);
            match per_job.iter_mut().find(|(j, _)| *j == job) {
                Some((_, strongest)) => {
                    if held > *strongest {
                        *strongest = held;
                    }
                }
                None => per_job.push((job, held)),
            }
            holder = self.requests.next_request(holder);
        }
        let mut new_max = LockMode::None;
        for (_, held) in per_job {
            match action(new_max, held) {
                LockAction::Upd => new_max = held,
                LockAction::Get => {}
                _ => {
                    return Err(LockError::Corrupted {
                        reason: "incompatible lock modes in holder queue",
                    })
                }
            }
        }
        Ok(new_max)
    }

    // ---- deadlock detection ------------------------------------------

    /// Decides whether queueing `job_slot` as a waiter of `res_slot` would
    /// close a cycle in the wait-for graph, i.e. make the job transitively
    /// wait on itself.
    fn introduces_deadlock(&self, res_slot: Slot, job_slot: Slot) -> bool {
        let _jobs = self.jobs.monitor();
        self.waits_on_itself(res_slot, job_slot)
    }

    fn waits_on_itself(&self, res_slot: Slot, job_slot: Slot) -> bool {
        let mut req = self.resources.last_holder(res_slot);
        while req.is_some() {
            let holder_job = self.requests.job_slot(req);
            if holder_job == job_slot {
                return true;
            }
            let mut waiter = self.jobs.last_waiter(holder_job);
            while waiter.is_some() {
                let waits_on = self.requests.resource(waiter);
                if self.waits_on_itself(waits_on, job_slot) {
                    return true;
                }
                waiter = self.requests.next_job_request(waiter);
            }
            req = self.requests.next_request(req);
        }
        false
    }

    // ---- queue maintenance -------------------------------------------

    fn add_holder(&self, req: Slot, res: Slot, job: Slot) {
        self.requests
            .set_next_request(req, self.resources.last_holder(res));
        self.resources.set_last_holder(res, req);

        let _jobs = self.jobs.monitor();
        let old_head = self.jobs.last_holder(job);
        self.link_job_request(req, old_head);
        self.jobs.set_last_holder(job, req);
    }

    /// Unlinks the job's most recent holder on `res` from both the
    /// resource-side list and the per-job chain, returning its slot.
    fn remove_last_holder(&self, res: Slot, job: Slot) -> Result<Slot, LockError> {
        let head = self.resources.last_holder(res);
        if head.is_none() {
            return Err(LockError::Corrupted {
                reason: "resource has no holders",
            });
        }
        let removed = if self.requests.job_slot(head) == job {
            self.resources
                .set_last_holder(res, self.requests.next_request(head));
            head
        } else {
            self.remove_first_request_for_job(head, job)?
        };

        let _jobs = self.jobs.monitor();
        if let Some(new_head) = self.unlink_job_request(removed) {
            self.jobs.set_last_holder(job, new_head);
        }
        Ok(removed)
    }

    fn add_waiter(&self, req: Slot, res: Slot, job: Slot) {
        self.requests.set_next_request(req, Slot::NONE);
        let head = self.resources.first_waiter(res);
        if head.is_none() {
            self.resources.set_first_waiter(res, req);
        } else {
            self.append_to_queue(head, req);
        }

        let _jobs = self.jobs.monitor();
        let old_head = self.jobs.last_waiter(job);
        self.link_job_request(req, old_head);
        self.jobs.set_last_waiter(job, req);
    }

    fn remove_waiter(&self, req: Slot, res: Slot, job: Slot) -> Result<(), LockError> {
        let head = self.resources.first_waiter(res);
        if head == req {
            self.resources
                .set_first_waiter(res, self.requests.next_request(req));
        } else {
            self.unlink_queued_request(head, req)?;
        }

        let _jobs = self.jobs.monitor();
        if let Some(new_head) = self.unlink_job_request(req) {
            self.jobs.set_last_waiter(job, new_head);
        }
        Ok(())
    }

    fn add_upgrader(&self, req: Slot, res: Slot, job: Slot) {
        self.requests.set_next_request(req, Slot::NONE);
        let head = self.resources.first_upgrader(res);
        if head.is_none() {
            self.resources.set_first_upgrader(res, req);
        } else {
            self.append_to_queue(head, req);
        }

        let _jobs = self.jobs.monitor();
        let old_head = self.jobs.last_upgrader(job);
        self.link_job_request(req, old_head);
        self.jobs.set_last_upgrader(job, req);
    }

    fn remove_upgrader(&self, req: Slot, res: Slot, job: Slot) -> Result<(), LockError> {
        let head = self.resources.first_upgrader(res);
        if head == req {
            self.resources
                .set_first_upgrader(res, self.requests.next_request(req));
        } else {
            self.unlink_queued_request(head, req)?;
        }

        let _jobs = self.jobs.monitor();
        if let Some(new_head) = self.unlink_job_request(req) {
            self.jobs.set_last_upgrader(job, new_head);
        }
        Ok(())
    }

    /// Pushes `req` onto the front of the per-job chain headed by
    /// `old_head`. Callers hold the job monitor.
    fn link_job_request(&self, req: Slot, old_head: Slot) {
        self.requests.set_next_job_request(req, old_head);
        self.requests.set_prev_job_request(req, Slot::NONE);
        if old_head.is_some() {
            self.requests.set_prev_job_request(old_head, req);
        }
    }

    /// Unlinks `req` from its per-job chain. Returns the new chain head if
    /// `req` was the head, `None` if the head is unchanged. Callers hold
    /// the job monitor.
    fn unlink_job_request(&self, req: Slot) -> Option<Slot> {
        let prev = self.requests.prev_job_request(req);
        let next = self.requests.next_job_request(req);
        if next.is_some() {
            self.requests.set_prev_job_request(next, prev);
        }
        if prev.is_none() {
            Some(next)
        } else {
            self.requests.set_next_job_request(prev, next);
            None
        }
    }

    fn append_to_queue(&self, head: Slot, req: Slot) {
        let mut tail = head;
        loop {
            let next = self.requests.next_request(tail);
            if next.is_none() {
                break;
            }
            tail = next;
        }
        self.requests.set_next_request(tail, req);
    }

    /// Removes `req` from the singly-linked queue headed by `head`; `req`
    /// is known not to be the head.
    fn unlink_queued_request(&self, head: Slot, req: Slot) -> Result<(), LockError> {
        let mut prev = head;
        loop {
            let cur = self.requests.next_request(prev);
            if cur.is_none() {
                return Err(LockError::Corrupted {
                    reason: "request missing from its queue",
                });
            }
            if cur == req {
                self.requests
                    .set_next_request(prev, self.requests.next_request(cur));
                return Ok(());
            }
            prev = cur;
        }
    }

    /// Removes and returns the first request belonging to `job` in the
    /// queue headed by `head`; the head itself is known not to match.
    fn remove_first_request_for_job(&self, head: Slot, job: Slot) -> Result<Slot, LockError> {
        let mut prev = head;
        loop {
            let cur = self.requests.next_request(prev);
            if cur.is_none() {
                return Err(LockError::Corrupted {
                    reason: "job has no request in this queue",
                });
            }
            if self.requests.job_slot(cur) == job {
                self.requests
                    .set_next_request(prev, self.requests.next_request(cur));
                return Ok(cur);
            }
            prev = cur;
        }
    }

    // ---- job validation ----------------------------------------------

    fn validate_job(&self, txn: &TxnContext) -> Result<(), LockError> {
        if txn.state() == TxnState::Aborted {
            Err(LockError::Aborted {
                job_id: txn.job_id().0,
            })
        } else if txn.is_timed_out() {
            Err(self.request_abort(txn))
        } else {
            Ok(())
        }
    }

    fn request_abort(&self, txn: &TxnContext) -> LockError {
        txn.set_timed_out(true);
        LockError::AbortRequested {
            job_id: txn.job_id().0,
        }
    }

    // ---- diagnostics -------------------------------------------------

    fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "----- [resource groups] -----");
        self.table.append(&mut out);
        let _ = writeln!(out, "----- [resources] -----");
        self.resources.append(&mut out);
        let _ = writeln!(out, "----- [requests] -----");
        self.requests.append(&mut out);
        let _ = writeln!(out, "----- [job slot map] -----");
        for entry in self.job_slots.iter() {
            let _ = writeln!(out, "{} : {}", entry.key(), entry.value());
        }
        let _ = writeln!(out, "----- [jobs] -----");
        self.jobs.append(&mut out);
        out
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(LockManagerConfig::default())
    }
}

impl fmt::Display for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use LockMode::{Exclusive, IntentExclusive, IntentShared, Shared};

    fn mgr() -> LockManager {
        LockManager::default()
    }

    fn resource_slot(mgr: &LockManager, dataset_id: i32, entity_hash: i32) -> Slot {
        let group = mgr.table.get(dataset_id, entity_hash);
        mgr.find_resource_in_group(group, dataset_id, entity_hash)
    }

    fn holder_count(mgr: &LockManager, dataset_id: i32, entity_hash: i32) -> usize {
        let res = resource_slot(mgr, dataset_id, entity_hash);
        if res.is_none() {
            return 0;
        }
        let mut count = 0;
        let mut holder = mgr.resources.last_holder(res);
        while holder.is_some() {
            count += 1;
            holder = mgr.requests.next_request(holder);
        }
        count
    }

    fn assert_empty(mgr: &LockManager) {
        assert_eq!(mgr.resources.live(), 0, "leaked resource records");
        assert_eq!(mgr.requests.live(), 0, "leaked request records");
        assert_eq!(mgr.jobs.live(), 0, "leaked job records");
        assert!(mgr.job_slots.is_empty(), "leaked job slot map entries");
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_shared_locks_coexist() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));
        let j2 = TxnContext::new(JobId(2));

        m.lock(7, -1, Shared, &j1).unwrap();
        m.lock(7, -1, Shared, &j2).unwrap();

        let res = resource_slot(&m, 7, -1);
        assert!(res.is_some());
        assert_eq!(m.resources.max_mode(res), Shared);
        assert_eq!(holder_count(&m, 7, -1), 2);

        m.unlock(7, -1, &j1).unwrap();
        assert_eq!(holder_count(&m, 7, -1), 1);
        m.unlock(7, -1, &j2).unwrap();
        assert!(resource_slot(&m, 7, -1).is_none());

        m.release_locks(&j1).unwrap();
        m.release_locks(&j2).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_exclusive_blocks_shared_try_lock() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));
        let j2 = TxnContext::new(JobId(2));

        m.lock(7, -1, Exclusive, &j1).unwrap();
        assert!(!m.try_lock(7, -1, Shared, &j2).unwrap());
        assert_eq!(holder_count(&m, 7, -1), 1);

        m.unlock(7, -1, &j1).unwrap();
        assert!(m.try_lock(7, -1, Shared, &j2).unwrap());
        assert_eq!(holder_count(&m, 7, -1), 1);

        m.release_locks(&j1).unwrap();
        m.release_locks(&j2).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_hierarchical_grant_uses_cache() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));

        m.lock(3, 42, Exclusive, &j1).unwrap();
        let dataset = resource_slot(&m, 3, -1);
        let entity = resource_slot(&m, 3, 42);
        assert!(dataset.is_some());
        assert!(entity.is_some());
        assert_eq!(m.resources.max_mode(dataset), IntentExclusive);
        assert_eq!(m.resources.max_mode(entity), Exclusive);
        assert_eq!(holder_count(&m, 3, -1), 1);

        // Second entity lock under the same dataset reuses the cached
        // intention lock instead of acquiring another.
        m.lock(3, 99, Exclusive, &j1).unwrap();
        assert_eq!(holder_count(&m, 3, -1), 1);
        assert_eq!(holder_count(&m, 3, 99), 1);

        m.release_locks(&j1).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_upgrade_completes_after_holder_drains() {
        let m = Arc::new(mgr());
        let j1 = Arc::new(TxnContext::new(JobId(1)));
        let j2 = TxnContext::new(JobId(2));

        m.lock(7, -1, Shared, &j1).unwrap();
        m.lock(7, -1, Shared, &j2).unwrap();
        let res = resource_slot(&m, 7, -1);

        let upgrader = {
            let m = Arc::clone(&m);
            let j1 = Arc::clone(&j1);
            thread::spawn(move || m.lock(7, -1, Exclusive, &j1))
        };

        wait_until("upgrader to queue", || {
            m.resources.first_upgrader(res).is_some()
        });
        m.unlock(7, -1, &j2).unwrap();
        upgrader.join().expect("upgrader panicked").unwrap();

        assert_eq!(m.resources.max_mode(res), Exclusive);
        assert_eq!(holder_count(&m, 7, -1), 2);
        assert!(m.resources.first_upgrader(res).is_none());

        m.unlock(7, -1, &j1).unwrap();
        assert_eq!(m.resources.max_mode(res), Shared);
        m.unlock(7, -1, &j1).unwrap();
        assert!(resource_slot(&m, 7, -1).is_none());

        m.release_locks(&j1).unwrap();
        m.release_locks(&j2).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_deadlock_aborts_requester() {
        let m = Arc::new(mgr());
        let j1 = Arc::new(TxnContext::new(JobId(1)));
        let j2 = TxnContext::new(JobId(2));

        m.lock(1, -1, Exclusive, &j1).unwrap();
        m.lock(2, -1, Exclusive, &j2).unwrap();

        let blocked = {
            let m = Arc::clone(&m);
            let j1 = Arc::clone(&j1);
            thread::spawn(move || m.lock(2, -1, Exclusive, &j1))
        };

        // The detector walks the per-job waiter chains, so wait for J1's
        // request to appear there, not just on the resource-side queue.
        let j1_slot = m.job_slot_for(JobId(1)).unwrap();
        wait_until("waiter to queue", || {
            let _jobs = m.jobs.monitor();
            m.jobs.last_waiter(j1_slot).is_some()
        });

        // J1 holds A and waits on B; J2 holds B and now asks for A.
        let err = m.lock(1, -1, Exclusive, &j2).unwrap_err();
        assert!(matches!(err, LockError::AbortRequested { job_id: 2 }));
        assert!(j2.is_timed_out());

        m.release_locks(&j2).unwrap();
        blocked.join().expect("blocked thread panicked").unwrap();

        m.release_locks(&j1).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_bulk_release_leaves_foreign_jobs_intact() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));
        let j2 = TxnContext::new(JobId(2));

        m.lock(99, -1, Exclusive, &j2).unwrap();
        m.lock(98, 7, Shared, &j2).unwrap();

        for i in 0..50i32 {
            let dataset = 10 + (i % 5);
            let entity = 100 + i;
            let mode = if i % 3 == 0 { Exclusive } else { Shared };
            m.lock(dataset, entity, mode, &j1).unwrap();
        }
        assert!(m.requests.live() > 50);

        m.release_locks(&j1).unwrap();
        assert!(m.job_slot_for(JobId(1)).is_none());

        // J2's exclusive dataset lock and hierarchical entity lock survive.
        assert_eq!(holder_count(&m, 99, -1), 1);
        assert_eq!(holder_count(&m, 98, -1), 1);
        assert_eq!(holder_count(&m, 98, 7), 1);
        assert_eq!(m.requests.live(), 3);

        m.release_locks(&j2).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_relock_same_mode_needs_two_unlocks() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));

        m.lock(7, -1, Exclusive, &j1).unwrap();
        // Matrix says WAIT for X on X; the same-job refinement grants.
        m.lock(7, -1, Exclusive, &j1).unwrap();
        assert_eq!(holder_count(&m, 7, -1), 2);

        m.unlock(7, -1, &j1).unwrap();
        assert_eq!(holder_count(&m, 7, -1), 1);
        m.unlock(7, -1, &j1).unwrap();
        assert!(resource_slot(&m, 7, -1).is_none());

        m.release_locks(&j1).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_lock_unlock_restores_observable_state() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));
        let j2 = TxnContext::new(JobId(2));

        m.lock(7, -1, Shared, &j2).unwrap();
        let res = resource_slot(&m, 7, -1);

        m.lock(7, -1, Shared, &j1).unwrap();
        m.unlock(7, -1, &j1).unwrap();

        assert_eq!(resource_slot(&m, 7, -1), res);
        assert_eq!(m.resources.max_mode(res), Shared);
        assert_eq!(holder_count(&m, 7, -1), 1);

        m.release_locks(&j1).unwrap();
        m.release_locks(&j2).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_instant_lock_leaves_no_net_state() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));
        let j2 = TxnContext::new(JobId(2));

        m.lock(7, -1, Shared, &j2).unwrap();
        m.instant_lock(7, -1, Shared, &j1).unwrap();
        assert_eq!(holder_count(&m, 7, -1), 1);
        assert_eq!(m.resources.max_mode(resource_slot(&m, 7, -1)), Shared);

        // Probing a free resource leaves nothing behind either.
        m.instant_lock(8, -1, Exclusive, &j1).unwrap();
        assert!(resource_slot(&m, 8, -1).is_none());

        m.release_locks(&j1).unwrap();
        m.release_locks(&j2).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_instant_try_lock_probe() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));
        let j2 = TxnContext::new(JobId(2));

        m.lock(7, -1, Shared, &j1).unwrap();
        assert!(!m.instant_try_lock(7, -1, Exclusive, &j2).unwrap());
        assert!(m.instant_try_lock(7, -1, Shared, &j2).unwrap());
        assert_eq!(holder_count(&m, 7, -1), 1);

        m.release_locks(&j1).unwrap();
        m.release_locks(&j2).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_try_lock_retains_dataset_intents_on_failure() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));
        let j2 = TxnContext::new(JobId(2));

        m.lock(5, 77, Exclusive, &j1).unwrap();
        assert!(!m.try_lock(5, 77, Shared, &j2).unwrap());

        // J2's dataset-level IS stays held even though the entity lock
        // failed; only the failed request itself was released.
        assert_eq!(holder_count(&m, 5, -1), 2);
        assert_eq!(holder_count(&m, 5, 77), 1);
        assert_eq!(m.requests.live(), 3);

        m.release_locks(&j1).unwrap();
        m.release_locks(&j2).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_try_lock_conversion_fails_without_blocking() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));

        m.lock(7, -1, Shared, &j1).unwrap();
        assert!(!m.try_lock(7, -1, Exclusive, &j1).unwrap());
        assert_eq!(holder_count(&m, 7, -1), 1);

        m.release_locks(&j1).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_unlock_unknown_resource_fails() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));

        let err = m.unlock(123, -1, &j1).unwrap_err();
        assert!(matches!(
            err,
            LockError::ResourceNotFound {
                dataset_id: 123,
                entity_hash: -1
            }
        ));
    }

    #[test]
    fn test_blocked_waiter_resumes_after_unlock() {
        let m = Arc::new(mgr());
        let j1 = TxnContext::new(JobId(1));
        let j2 = Arc::new(TxnContext::new(JobId(2)));

        m.lock(9, -1, Exclusive, &j1).unwrap();
        let res = resource_slot(&m, 9, -1);

        let waiter = {
            let m = Arc::clone(&m);
            let j2 = Arc::clone(&j2);
            thread::spawn(move || m.lock(9, -1, Shared, &j2))
        };

        wait_until("waiter to queue", || {
            m.resources.first_waiter(res).is_some()
        });
        m.unlock(9, -1, &j1).unwrap();
        waiter.join().expect("waiter panicked").unwrap();

        assert_eq!(m.resources.max_mode(res), Shared);
        assert!(m.resources.first_waiter(res).is_none());

        m.release_locks(&j1).unwrap();
        m.release_locks(&j2).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_max_mode_recomputed_on_unlock() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));
        let j2 = TxnContext::new(JobId(2));

        m.lock(7, -1, Shared, &j1).unwrap();
        m.lock(7, -1, IntentShared, &j2).unwrap();
        let res = resource_slot(&m, 7, -1);
        assert_eq!(m.resources.max_mode(res), Shared);

        m.unlock(7, -1, &j1).unwrap();
        assert_eq!(m.resources.max_mode(res), IntentShared);

        m.release_locks(&j1).unwrap();
        m.release_locks(&j2).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_aborted_job_rejected() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));
        j1.set_state(TxnState::Aborted);

        let err = m.lock(1, -1, Shared, &j1).unwrap_err();
        assert!(matches!(err, LockError::Aborted { job_id: 1 }));

        m.release_locks(&j1).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_timed_out_job_rejected() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));
        j1.set_timed_out(true);

        let err = m.lock(1, -1, Shared, &j1).unwrap_err();
        assert!(matches!(err, LockError::AbortRequested { job_id: 1 }));
        assert!(j1.is_timed_out());

        m.release_locks(&j1).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_release_locks_without_locks() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));
        m.release_locks(&j1).unwrap();
        m.release_locks(&j1).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_release_invalidates_dataset_cache() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));

        m.lock(3, 42, Exclusive, &j1).unwrap();
        m.release_locks(&j1).unwrap();
        assert_empty(&m);

        // A recycled job id on the same thread must re-acquire the dataset
        // intention lock rather than trust the stale cache entry.
        m.lock(3, 43, Exclusive, &j1).unwrap();
        assert!(resource_slot(&m, 3, -1).is_some());
        assert_eq!(holder_count(&m, 3, -1), 1);

        m.release_locks(&j1).unwrap();
        assert_empty(&m);
    }

    #[test]
    fn test_pretty_print_sections() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));
        m.lock(7, -1, Shared, &j1).unwrap();

        let dump = m.pretty_print();
        assert!(dump.contains("LockManager Status"));
        assert!(dump.contains("[resources]"));
        assert!(dump.contains("dataset : 7"));
        assert!(dump.contains("[job slot map]"));

        m.release_locks(&j1).unwrap();
    }

    #[test]
    fn test_stop_writes_dump_on_request() {
        let m = mgr();
        let j1 = TxnContext::new(JobId(1));
        m.lock(7, -1, Shared, &j1).unwrap();

        let mut sink = Vec::new();
        m.stop(false, &mut sink).unwrap();
        assert!(sink.is_empty());

        m.start();
        m.stop(true, &mut sink).unwrap();
        let dump = String::from_utf8(sink).unwrap();
        assert!(dump.contains("[requests]"));

        m.release_locks(&j1).unwrap();
    }

    #[test]
    fn stress_exclusive_handoff_across_threads() {
        let m = Arc::new(mgr());

        let workers: Vec<_> = (0..4)
            .map(|t| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    let txn = TxnContext::new(JobId(100 + t));
                    for _ in 0..50 {
                        m.lock(50, -1, Exclusive, &txn).unwrap();
                        m.unlock(50, -1, &txn).unwrap();
                    }
                    m.release_locks(&txn).unwrap();
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("worker panicked");
        }
        assert_empty(&m);
    }
}
