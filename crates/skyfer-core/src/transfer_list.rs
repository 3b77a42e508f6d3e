//! Priority-ordered transfer queues and the dispatch selector.
//!
//! Two sequences (one per direction) sorted ascending by priority, sharing a
//! monotonically increasing priority counter for appends. Moves compute the
//! midpoint of the neighbours; when integer space runs out, everything up to
//! the anchor is renumbered. Moving a transfer above an active one demotes
//! the lowest-priority active transfer; moving an active transfer below a
//! ready one surrenders its slot.

use crate::cache::CacheBatch;
use crate::ds::Ds;
use crate::engine::{Engine, TransferPool};
use crate::error::ErrorCode;
use crate::transfer::{
    Direction, SizeClass, Transfer, TransferCategory, TransferId, TransferState,
};

pub const PRIORITY_START: u64 = 0x0000_8000_0000_0000;
pub const PRIORITY_STEP: u64 = 0x0000_0000_0001_0000;

/// Per-direction sequences of `(priority, id)`, sorted ascending.
pub struct TransferList {
    entries: [Vec<(u64, TransferId)>; 2],
    pub currentpriority: u64,
}

impl Default for TransferList {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferList {
    pub fn new() -> Self {
        TransferList {
            entries: [Vec::new(), Vec::new()],
            currentpriority: PRIORITY_START,
        }
    }

    pub fn len(&self, direction: Direction) -> usize {
        self.entries[direction.index()].len()
    }

    pub fn is_empty(&self, direction: Direction) -> bool {
        self.entries[direction.index()].is_empty()
    }

    /// Ids in priority order.
    pub fn ids(&self, direction: Direction) -> Vec<TransferId> {
        self.entries[direction.index()]
            .iter()
            .map(|&(_, id)| id)
            .collect()
    }

    /// Priorities in queue order (test and diagnostics helper).
    pub fn priorities(&self, direction: Direction) -> Vec<u64> {
        self.entries[direction.index()]
            .iter()
            .map(|&(p, _)| p)
            .collect()
    }

    pub fn transfer_at(&self, direction: Direction, position: usize) -> Option<TransferId> {
        self.entries[direction.index()]
            .get(position)
            .map(|&(_, id)| id)
    }

    pub fn index_of(&self, direction: Direction, id: TransferId) -> Option<usize> {
        self.entries[direction.index()]
            .iter()
            .position(|&(_, i)| i == id)
    }

    pub(crate) fn insert_sorted(&mut self, direction: Direction, priority: u64, id: TransferId) {
        let seq = &mut self.entries[direction.index()];
        let at = seq.partition_point(|&(p, _)| p < priority);
        debug_assert!(seq.get(at).map_or(true, |&(p, _)| p != priority));
        seq.insert(at, (priority, id));
    }

    pub(crate) fn remove(&mut self, direction: Direction, id: TransferId) {
        self.entries[direction.index()].retain(|&(_, i)| i != id);
    }

    /// Re-insert a deserialized transfer at its persisted priority.
    pub fn insert_restored(&mut self, pool: &mut TransferPool, direction: Direction, id: TransferId) {
        let Some(t) = pool.get(id) else { return };
        let priority = t.priority;
        if priority == 0 {
            self.currentpriority += PRIORITY_STEP;
            if let Some(t) = pool.get_mut(id) {
                t.priority = self.currentpriority;
            }
            let p = self.currentpriority;
            self.entries[direction.index()].push((p, id));
        } else {
            self.currentpriority = self.currentpriority.max(priority);
            self.insert_sorted(direction, priority, id);
        }
    }

    fn set_priority(&mut self, direction: Direction, id: TransferId, priority: u64) {
        for e in &mut self.entries[direction.index()] {
            if e.1 == id {
                e.0 = priority;
            }
        }
    }
}

impl Engine {
    /// Append a transfer to its queue. Without a priority it lands at the
    /// tail (or, with `start_first`, one step before the current head).
    /// Restored transfers with a priority are inserted in place.
    pub fn addtransfer(&mut self, id: TransferId, start_first: bool, batch: &mut CacheBatch) {
        let Some(t) = self.pool.get_mut(id) else { return };
        if t.state != TransferState::Paused {
            t.state = TransferState::Queued;
        }
        let direction = t.direction;
        let priority = t.priority;

        if priority == 0 {
            if start_first && !self.list.is_empty(direction) {
                let head = self.list.entries[direction.index()][0].0;
                let new_priority = head - PRIORITY_STEP;
                if let Some(t) = self.pool.get_mut(id) {
                    t.priority = new_priority;
                }
                self.prepare_increase_priority(id, batch);
                self.list.entries[direction.index()].insert(0, (new_priority, id));
            } else {
                self.list.currentpriority += PRIORITY_STEP;
                let new_priority = self.list.currentpriority;
                if let Some(t) = self.pool.get_mut(id) {
                    t.priority = new_priority;
                }
                debug_assert!(self.list.entries[direction.index()]
                    .last()
                    .map_or(true, |&(p, _)| p < new_priority));
                self.list.entries[direction.index()].push((new_priority, id));
            }
            self.transfer_cache_add(id, batch);
        } else {
            self.list.insert_sorted(direction, priority, id);
        }
        self.index_fingerprint(id);
    }

    /// Move `id` immediately before the transfer at `dst_pos` (`None` moves
    /// to the tail).
    pub fn movetransfer_to_pos(
        &mut self,
        id: TransferId,
        dst_pos: Option<usize>,
        now: Ds,
        batch: &mut CacheBatch,
    ) {
        let Some(t) = self.pool.get(id) else { return };
        let direction = t.direction;
        let Some(src_idx) = self.list.index_of(direction, id) else {
            return;
        };
        let d = direction.index();
        let len = self.list.entries[d].len();
        let dst_idx = dst_pos.filter(|&p| p < len);

        let Some(mut dst_idx) = dst_idx else {
            // move to the last position
            if src_idx + 1 == len {
                tracing::warn!("trying to move to the same position");
                return;
            }
            self.prepare_decrease_priority(id, src_idx, None, now);
            self.list.entries[d].retain(|&(_, i)| i != id);
            self.list.currentpriority += PRIORITY_STEP;
            let new_priority = self.list.currentpriority;
            if let Some(t) = self.pool.get_mut(id) {
                t.priority = new_priority;
            }
            self.list.entries[d].push((new_priority, id));
            self.transfer_cache_add(id, batch);
            if let Some(t) = self.pool.get(id) {
                self.app.transfer_update(t);
            }
            return;
        };

        if dst_idx == src_idx {
            tracing::warn!("trying to move before the same transfer");
            return;
        }
        if src_idx + 1 == dst_idx {
            tracing::warn!("trying to move to the same position");
            return;
        }

        tracing::debug!(from = src_idx, to = dst_idx, "moving transfer");
        let nextpriority = self.list.entries[d][dst_idx].0;
        let prevpriority = if dst_idx > 0 {
            self.list.entries[d][dst_idx - 1].0
        } else {
            nextpriority - 2 * PRIORITY_STEP
        };
        let mut newpriority = (prevpriority + nextpriority) / 2;
        tracing::debug!(prevpriority, nextpriority, newpriority, "computed move priority");

        if prevpriority == newpriority {
            // no integer space left; renumber everything up to the anchor
            tracing::warn!("no space for the move; adjusting priorities");
            let positions = dst_idx;
            let mut fixed = self.list.entries[d][0].0 - PRIORITY_STEP * (positions as u64 + 1);
            for i in 0..positions {
                let tid = self.list.entries[d][i].1;
                tracing::debug!(position = i, priority = fixed, "adjusting transfer priority");
                if let Some(t) = self.pool.get_mut(tid) {
                    t.priority = fixed;
                }
                self.list.entries[d][i].0 = fixed;
                self.transfer_cache_add(tid, batch);
                if let Some(t) = self.pool.get(tid) {
                    self.app.transfer_update(t);
                }
                fixed += PRIORITY_STEP;
            }
            newpriority = fixed;
        }

        if let Some(t) = self.pool.get_mut(id) {
            t.priority = newpriority;
        }
        self.list.set_priority(direction, id, newpriority);
        if src_idx > dst_idx {
            self.prepare_increase_priority(id, batch);
        } else {
            self.prepare_decrease_priority(id, src_idx, Some(dst_idx), now);
            dst_idx -= 1;
        }

        self.list.entries[d].retain(|&(_, i)| i != id);
        debug_assert!(self.list.entries[d]
            .get(dst_idx)
            .map_or(true, |&(p, _)| p != newpriority));
        self.list.entries[d].insert(dst_idx, (newpriority, id));
        self.transfer_cache_add(id, batch);
        if let Some(t) = self.pool.get(id) {
            self.app.transfer_update(t);
        }
    }

    /// Move `id` immediately before `anchor`.
    pub fn movetransfer_before(
        &mut self,
        id: TransferId,
        anchor: TransferId,
        now: Ds,
        batch: &mut CacheBatch,
    ) {
        let Some(t) = self.pool.get(id) else { return };
        let direction = t.direction;
        if let Some(dst) = self.list.index_of(direction, anchor) {
            self.movetransfer_to_pos(id, Some(dst), now, batch);
        }
    }

    pub fn movetofirst(&mut self, id: TransferId, now: Ds, batch: &mut CacheBatch) {
        self.movetransfer_to_pos(id, Some(0), now, batch);
    }

    pub fn movetolast(&mut self, id: TransferId, now: Ds, batch: &mut CacheBatch) {
        self.movetransfer_to_pos(id, None, now, batch);
    }

    pub fn moveup(&mut self, id: TransferId, now: Ds, batch: &mut CacheBatch) {
        let Some(t) = self.pool.get(id) else { return };
        let direction = t.direction;
        let Some(idx) = self.list.index_of(direction, id) else {
            return;
        };
        if idx == 0 {
            return;
        }
        self.movetransfer_to_pos(id, Some(idx - 1), now, batch);
    }

    pub fn movedown(&mut self, id: TransferId, now: Ds, batch: &mut CacheBatch) {
        let Some(t) = self.pool.get(id) else { return };
        let direction = t.direction;
        let Some(idx) = self.list.index_of(direction, id) else {
            return;
        };
        let len = self.list.len(direction);
        if idx + 1 >= len {
            return;
        }
        let dst = if idx + 2 >= len { None } else { Some(idx + 2) };
        self.movetransfer_to_pos(id, dst, now, batch);
    }

    /// Pause or resume one transfer.
    pub fn pause_transfer(
        &mut self,
        id: TransferId,
        enable: bool,
        now: Ds,
        batch: &mut CacheBatch,
    ) -> Result<(), ErrorCode> {
        let Some(t) = self.pool.get(id) else {
            return Err(ErrorCode::NotFound);
        };
        let state = t.state;
        let direction = t.direction;

        if (enable && state == TransferState::Paused)
            || (!enable && state != TransferState::Paused)
        {
            return Ok(());
        }

        if !enable {
            if let Some(t) = self.pool.get_mut(id) {
                t.state = TransferState::Queued;
            }
            if self.list.index_of(direction, id).is_some() {
                self.prepare_increase_priority(id, batch);
            }
            self.transfer_cache_add(id, batch);
            if let Some(t) = self.pool.get(id) {
                self.app.transfer_update(t);
            }
            return Ok(());
        }

        if matches!(
            state,
            TransferState::Active | TransferState::Queued | TransferState::Retrying
        ) {
            if let Some(t) = self.pool.get_mut(id) {
                if t.slot.is_some() {
                    if !self.storage_red || direction == Direction::Get {
                        t.bt.arm();
                    }
                    t.slot = None;
                }
                t.state = TransferState::Paused;
            }
            self.transfer_cache_add(id, batch);
            if let Some(t) = self.pool.get(id) {
                self.app.transfer_update(t);
            }
            return Ok(());
        }

        // a completing or finished transfer cannot be paused
        Err(ErrorCode::Failed)
    }

    /// Moving `id` up may leave a lower-priority transfer holding a slot it
    /// no longer deserves: demote the last active transfer above it.
    pub(crate) fn prepare_increase_priority(&mut self, id: TransferId, batch: &mut CacheBatch) {
        let Some(t) = self.pool.get(id) else { return };
        if t.slot.is_some() || t.state == TransferState::Paused {
            return;
        }
        let direction = t.direction;
        let priority = t.priority;

        let last_active = self
            .pool
            .iter()
            .filter(|c| {
                c.direction == direction
                    && c.slot.is_some()
                    && c.state == TransferState::Active
                    && c.priority > priority
            })
            .max_by_key(|c| c.priority)
            .map(|c| c.id);

        if let Some(cid) = last_active {
            if let Some(c) = self.pool.get_mut(cid) {
                if !self.storage_red || c.direction == Direction::Get {
                    c.bt.arm();
                }
                c.slot = None;
                c.state = TransferState::Queued;
            }
            self.transfer_cache_add(cid, batch);
            if let Some(c) = self.pool.get(cid) {
                self.app.transfer_update(c);
            }
        }
    }

    /// Moving an active transfer down surrenders its slot when some
    /// lower-priority transfer between source and destination is ready.
    pub(crate) fn prepare_decrease_priority(
        &mut self,
        id: TransferId,
        src_idx: usize,
        dst_idx: Option<usize>,
        now: Ds,
    ) {
        let Some(t) = self.pool.get(id) else { return };
        if t.slot.is_none() || t.state != TransferState::Active {
            return;
        }
        let direction = t.direction;
        let d = direction.index();

        let mut cit = src_idx + 1;
        while cit < self.list.entries[d].len() {
            let cid = self.list.entries[d][cit].1;
            let ready = self
                .pool
                .get(cid)
                .map(|c| c.slot.is_none() && c.is_ready(now))
                .unwrap_or(false);
            if ready {
                if let Some(t) = self.pool.get_mut(id) {
                    if !self.storage_red || t.direction == Direction::Get {
                        t.bt.arm();
                    }
                    t.slot = None;
                    t.state = TransferState::Queued;
                }
                break;
            }
            if Some(cit) == dst_idx {
                break;
            }
            cit += 1;
        }
    }

    /// Remove files whose cancel token fired; destroy the transfer when all
    /// its files are gone. Returns true when the transfer was destroyed.
    pub fn reap_cancelled_files(&mut self, id: TransferId, batch: &mut CacheBatch) -> bool {
        let Some(t) = self.pool.get(id) else {
            return false;
        };
        if t.slot.is_some() {
            return false;
        }
        loop {
            let Some(t) = self.pool.get(id) else {
                return false;
            };
            let Some(idx) = t
                .files
                .iter()
                .position(|f| f.cancel_token.is_cancelled())
            else {
                break;
            };
            self.remove_transfer_file(id, idx, ErrorCode::Incomplete, batch);
        }
        let empty = self.pool.get(id).map(|t| t.files.is_empty()).unwrap_or(false);
        if empty {
            self.remove_and_destroy(id, TransferState::Cancelled, batch);
            return true;
        }
        false
    }

    /// Drop one file from a transfer, notifying the app.
    pub(crate) fn remove_transfer_file(
        &mut self,
        id: TransferId,
        idx: usize,
        e: ErrorCode,
        batch: &mut CacheBatch,
    ) {
        let f = match self.pool.get_mut(id) {
            Some(t) if idx < t.files.len() => Some(t.files.remove(idx)),
            _ => None,
        };
        if let Some(mut f) = f {
            self.app.file_removed(&f, e.into());
            f.terminated(e);
        }
        self.transfer_cache_add(id, batch);
    }

    /// Mark terminal, notify removal and destroy.
    pub fn remove_and_destroy(
        &mut self,
        id: TransferId,
        final_state: TransferState,
        batch: &mut CacheBatch,
    ) {
        if let Some(mut t) = self.pool.take(id) {
            t.finished = true;
            t.state = final_state;
            self.app.transfer_removed(&t);
            self.destroy_transfer(t, batch);
        }
    }

    /// Select the next transfers to activate, bucketed by `(direction,
    /// size-class)`. `continue_fn` caps admission per candidate;
    /// `direction_continue_fn` stops a whole direction early. Cancelled
    /// files are reaped before a transfer is considered.
    pub fn nexttransfers(
        &mut self,
        continue_fn: &mut dyn FnMut(&Transfer) -> bool,
        direction_continue_fn: &mut dyn FnMut(Direction) -> bool,
        now: Ds,
        batch: &mut CacheBatch,
    ) -> [Vec<TransferId>; 6] {
        let mut chosen: [Vec<TransferId>; 6] = Default::default();

        for direction in [Direction::Put, Direction::Get] {
            let ids = self.list.ids(direction);
            for id in ids {
                let has_slot = self
                    .pool
                    .get(id)
                    .map(|t| t.slot.is_some())
                    .unwrap_or(true);
                if !has_slot {
                    // reap cancellations before going to the trouble of
                    // requesting an upload/download URL
                    if self.reap_cancelled_files(id, batch) {
                        continue;
                    }
                }

                // don't traverse the whole list once this direction is full
                if !direction_continue_fn(direction) {
                    break;
                }

                let Some(t) = self.pool.get(id) else { continue };
                if t.slot.is_none() && t.is_ready(now) {
                    let tc = TransferCategory::of(t);
                    let cont = continue_fn(t);
                    if cont {
                        chosen[tc.index()].push(id);
                    }
                }
            }
        }
        chosen
    }

    /// Size class of the bucket at `index` (diagnostics helper).
    pub fn bucket_size_class(index: usize) -> Option<SizeClass> {
        match index {
            2 | 4 => Some(SizeClass::Large),
            3 | 5 => Some(SizeClass::Small),
            _ => None,
        }
    }
}
