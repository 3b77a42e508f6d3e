//! Process-wide engine state: the transfer pool and list, the read-node map
//! and queue, overquota mode, and the capability seams (app callbacks, sync
//! bridge, node metadata, filesystem, URL commands).
//!
//! Everything runs on one thread; mutation happens only inside `exec` and
//! the explicit queue operations. No ambient globals: state that the
//! original kept process-wide lives in named fields here.

use std::collections::{HashMap, VecDeque};

use anyhow::Result;

use crate::cache::CacheBatch;
use crate::config::EngineConfig;
use crate::direct_read::node::ReadStep;
use crate::direct_read::{DirectRead, DirectReadNode, DirectReadSlot, NodeKey, ReadId, ReadSink};
use crate::direct_read::slot::TIMEOUT_DS;
use crate::ds::{ever, Ds, NEVER};
use crate::error::{ApiError, ErrorCode};
use crate::fingerprint::{FileFingerprint, FingerprintKey};
use crate::fsaccess::{FsAccess, StdFs};
use crate::http::HttpIo;
use crate::localpath::LocalPath;
use crate::raid::RAIDPARTS;
use crate::record::NodeHandle;
use crate::transfer::{Direction, File, Transfer, TransferId};
use crate::transfer_list::TransferList;

/// Application-facing notifications. All methods default to no-ops so an
/// embedder implements only what it observes.
pub trait AppListener {
    fn transfer_failed(&mut self, _t: &Transfer, _e: ApiError, _timeleft: Ds) {}
    fn transfer_update(&mut self, _t: &Transfer) {}
    fn transfer_complete(&mut self, _t: &Transfer) {}
    fn transfer_removed(&mut self, _t: &Transfer) {}
    fn file_removed(&mut self, _f: &File, _e: ApiError) {}
    fn file_complete(&mut self, _f: &File) {}
    /// Upload verified; the metadata channel should complete it (putnodes).
    fn upload_completing(&mut self, _t: &Transfer) {}
}

/// Default listener: observes nothing.
pub struct NullApp;
impl AppListener for NullApp {}

/// Hooks into the sync engine. No-ops by default.
pub trait SyncBridge {
    /// Fatal account state: all syncs must stop.
    fn disable_syncs(&mut self, _e: ErrorCode) {}
    /// Ask the sync to rescan a parent folder so a failed transfer is not
    /// immediately recreated.
    fn trigger_scan(&mut self, _path: &LocalPath, _is_upload: bool) {}
    /// Hand a completed sync download (and the distributor that owns the
    /// local file) over to the sync thread.
    fn handoff_download(&mut self, _f: &File) {}
}

pub struct NullSync;
impl SyncBridge for NullSync {}

/// Node metadata lookups consumed during completion.
pub trait NodeStore {
    fn node_fingerprint(&self, _h: NodeHandle) -> Option<FileFingerprint> {
        None
    }
    /// Issue an attribute update setting the node's fingerprint.
    fn update_node_fingerprint(&mut self, _h: NodeHandle, _fp: FileFingerprint) {}
}

pub struct NullNodeStore;
impl NodeStore for NullNodeStore {}

/// Out-of-band command channel used to obtain fresh temp URLs for a
/// streaming file. The application answers via `Engine::drn_cmdresult`.
pub trait CommandChannel {
    fn request_direct_read_urls(&mut self, _key: NodeKey) {}
}

pub struct NullCommands;
impl CommandChannel for NullCommands {}

/// Owning pool of transfers, addressed by stable ids.
#[derive(Default)]
pub struct TransferPool {
    map: HashMap<TransferId, Transfer>,
    next_id: TransferId,
}

impl TransferPool {
    pub fn alloc_id(&mut self) -> TransferId {
        self.next_id += 1;
        self.next_id
    }

    /// Bump the id counter past restored records.
    pub fn reserve_id(&mut self, id: TransferId) {
        self.next_id = self.next_id.max(id);
    }

    pub fn insert(&mut self, t: Transfer) {
        self.map.insert(t.id, t);
    }

    pub fn get(&self, id: TransferId) -> Option<&Transfer> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: TransferId) -> Option<&mut Transfer> {
        self.map.get_mut(&id)
    }

    pub fn take(&mut self, id: TransferId) -> Option<Transfer> {
        self.map.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transfer> {
        self.map.values()
    }
}

pub struct Engine {
    pub config: EngineConfig,
    pub pool: TransferPool,
    pub list: TransferList,
    /// Per-direction multimap from content identity to queued transfers.
    pub by_fingerprint: [HashMap<FingerprintKey, Vec<TransferId>>; 2],

    pub nodes: HashMap<NodeKey, DirectReadNode>,
    /// Global queue of reads awaiting a slot.
    pub drq: VecDeque<(NodeKey, ReadId)>,

    /// Decisecond stamp until which quota-limited retries are blocked.
    pub overquota_until: Ds,
    pub paywalled: bool,
    pub usealtdownport: bool,
    /// Storage state is in the red zone (uploads must not re-arm).
    pub storage_red: bool,

    pub app: Box<dyn AppListener>,
    pub sync: Box<dyn SyncBridge>,
    pub node_store: Box<dyn NodeStore>,
    pub fs: Box<dyn FsAccess>,
    pub commands: Box<dyn CommandChannel>,

    next_read_id: ReadId,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine {
            config,
            pool: TransferPool::default(),
            list: TransferList::new(),
            by_fingerprint: [HashMap::new(), HashMap::new()],
            nodes: HashMap::new(),
            drq: VecDeque::new(),
            overquota_until: 0,
            paywalled: false,
            usealtdownport: false,
            storage_red: false,
            app: Box::new(NullApp),
            sync: Box::new(NullSync),
            node_store: Box::new(NullNodeStore),
            fs: Box::new(StdFs::new()),
            commands: Box::new(NullCommands),
            next_read_id: 0,
        }
    }

    // ---- transfer pool plumbing ----

    /// Create a fresh transfer owned by the pool.
    pub fn create_transfer(&mut self, direction: Direction) -> TransferId {
        let id = self.pool.alloc_id();
        let t = Transfer::new(id, direction, &self.config);
        self.pool.insert(t);
        id
    }

    /// Restore a persisted record into the pool, the fingerprint multimap
    /// and the priority list.
    pub fn restore_transfer(&mut self, id: TransferId, record: &[u8]) -> Result<TransferId> {
        let t = Transfer::unserialize(id, record, &self.config)?;
        self.pool.reserve_id(id);
        let dir = t.direction;
        self.by_fingerprint[dir.index()]
            .entry(t.fingerprint.key())
            .or_default()
            .push(id);
        self.pool.insert(t);
        self.list.insert_restored(&mut self.pool, dir, id);
        Ok(id)
    }

    /// Append the transfer's serialized record to the cache batch.
    pub fn transfer_cache_add(&mut self, id: TransferId, batch: &mut CacheBatch) {
        if let Some(t) = self.pool.get(id) {
            batch.put(t.id, t.direction.tag(), t.serialize());
        }
    }

    pub(crate) fn index_fingerprint(&mut self, id: TransferId) {
        if let Some(t) = self.pool.get(id) {
            self.by_fingerprint[t.direction.index()]
                .entry(t.fingerprint.key())
                .or_default()
                .push(id);
        }
    }

    /// Queued transfers matching a fingerprint in a direction.
    pub fn transfers_with_fingerprint(
        &self,
        direction: Direction,
        key: FingerprintKey,
    ) -> &[TransferId] {
        self.by_fingerprint[direction.index()]
            .get(&key)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Final teardown: notify remaining files, drop indices, clean up the
    /// on-disk artifacts of a finished download, delete the cache row.
    pub(crate) fn destroy_transfer(&mut self, mut t: Transfer, batch: &mut CacheBatch) {
        for f in &mut t.files {
            let e = f.terminated_err.unwrap_or(ErrorCode::Ok);
            f.terminated(e);
        }
        self.list.remove(t.direction, t.id);
        if let Some(ids) = self.by_fingerprint[t.direction.index()].get_mut(&t.fingerprint.key())
        {
            ids.retain(|&i| i != t.id);
            if ids.is_empty() {
                self.by_fingerprint[t.direction.index()].remove(&t.fingerprint.key());
            }
        }
        if t.finished {
            if t.direction == Direction::Get && !t.localfilename.is_empty() {
                self.fs.unlink(&t.localfilename);
            }
            batch.del(t.id);
        }
        tracing::debug!(transfer = t.id, state = ?t.state, "transfer destroyed");
    }

    // ---- overquota mode ----

    /// Enter overquota mode: bandwidth (with a deadline) or storage/paywall
    /// (until the account state changes).
    pub fn activate_overquota(&mut self, now: Ds, timeleft: Ds, paywall: bool) {
        if timeleft != 0 {
            tracing::warn!(timeleft, "bandwidth overquota");
            self.overquota_until = now.saturating_add(timeleft);
        } else if paywall {
            tracing::warn!("paywall: transfers blocked until the account is unblocked");
            self.paywalled = true;
            self.overquota_until = NEVER;
        } else {
            tracing::warn!("storage overquota");
            self.overquota_until = NEVER;
        }
    }

    pub fn clear_overquota(&mut self) {
        self.overquota_until = 0;
        self.paywalled = false;
    }

    // ---- streaming direct reads ----

    /// Queue a range read of a streaming file. If the node already holds
    /// temp URLs the read goes straight to the fetch queue; otherwise the
    /// node is scheduled to request them.
    pub fn enqueue_read(
        &mut self,
        handle: NodeHandle,
        private: bool,
        node_size: u64,
        offset: u64,
        count: u64,
        reqtag: i32,
        sink: Box<dyn ReadSink>,
        now: Ds,
    ) -> ReadId {
        let key = NodeKey { handle, private };
        self.next_read_id += 1;
        let id = self.next_read_id;

        let node = self
            .nodes
            .entry(key)
            .or_insert_with(|| DirectReadNode::new(key, node_size));
        node.size = node_size.max(node.size);

        let mut read = DirectRead::new(id, offset, count, reqtag, sink);
        if !node.tempurls.is_empty() {
            let max_req = read.max_req_size(node.size, node.tempurls.len());
            read.buffer.set_is_raid(
                &node.tempurls,
                offset,
                offset + count,
                node.size,
                max_req,
                false,
            );
            node.reads.push(read);
            self.drq.push_back((key, id));
        } else {
            node.reads.push(read);
            node.schedule(now, 0);
        }
        tracing::debug!(?key, read = id, offset, count, "direct read enqueued");
        id
    }

    /// Abort one read (consumer went away): tear down its slot, remove it
    /// from the queue and its node.
    pub fn abort_read(&mut self, key: NodeKey, id: ReadId, io: &mut dyn HttpIo) {
        self.drq.retain(|&(k, r)| !(k == key && r == id));
        let mut schedule_cleanup = false;
        if let Some(node) = self.nodes.get_mut(&key) {
            if let Some(idx) = node.read_index(id) {
                let mut read = node.reads.remove(idx);
                if let Some(mut slot) = read.slot.take() {
                    slot.disconnect_all(io);
                }
                read.sink.revoke();
            }
            schedule_cleanup = node.reads.is_empty();
        }
        if schedule_cleanup {
            if let Some(node) = self.nodes.get_mut(&key) {
                node.schedule(0, 0);
            }
        }
    }

    /// Node dispatch: destroy an empty node, otherwise arm the timeout and
    /// request fresh temp URLs if none are on the way.
    pub fn drn_dispatch(&mut self, key: NodeKey, now: Ds) {
        let Some(node) = self.nodes.get_mut(&key) else {
            return;
        };
        if node.reads.is_empty() {
            tracing::debug!(?key, "removing direct read node");
            self.nodes.remove(&key);
            self.drq.retain(|&(k, _)| k != key);
            return;
        }
        node.schedule(now, TIMEOUT_DS);
        if !node.pending_cmd {
            node.pending_cmd = true;
            self.commands.request_direct_read_urls(key);
        }
    }

    /// Result of the URL command. On success all pending reads are fed to
    /// the fetch queue; on failure the node retries.
    pub fn drn_cmdresult(
        &mut self,
        key: NodeKey,
        result: Result<(Vec<String>, u64), (ApiError, Ds)>,
        io: &mut dyn HttpIo,
        now: Ds,
    ) {
        let Some(node) = self.nodes.get_mut(&key) else {
            return;
        };
        node.pending_cmd = false;
        match result {
            Ok((urls, size)) => {
                if urls.is_empty() || (urls.len() != 1 && urls.len() != RAIDPARTS) {
                    tracing::error!(count = urls.len(), "bad temp URL count");
                    self.drn_retry(key, ErrorCode::Failed.into(), 0, io, now);
                    return;
                }
                node.tempurls = urls;
                node.size = size;
                let urls = node.tempurls.clone();
                let node_size = node.size;
                for read in &mut node.reads {
                    if !read.buffer.is_initialized() {
                        let max_req = read.max_req_size(node_size, urls.len());
                        read.buffer.set_is_raid(
                            &urls,
                            read.offset + read.progress,
                            read.offset + read.count,
                            node_size,
                            max_req,
                            read.progress > 0,
                        );
                    } else {
                        // URLs re-requested (e.g. expiry): keep progress
                        read.buffer.update_urls_and_reset_pos(&urls);
                    }
                }
                let ids: Vec<ReadId> = node.reads.iter().map(|r| r.id).collect();
                node.schedule(now, TIMEOUT_DS);
                for id in ids {
                    if !self.drq.contains(&(key, id)) {
                        self.drq.push_back((key, id));
                    }
                }
            }
            Err((e, timeleft)) => {
                self.drn_retry(key, e, timeleft, io, now);
            }
        }
    }

    /// Abort all of the node's reads and reschedule with the minimum delay
    /// the sinks ask for.
    pub fn drn_retry(
        &mut self,
        key: NodeKey,
        e: ApiError,
        timeleft: Ds,
        io: &mut dyn HttpIo,
        now: Ds,
    ) {
        let mut destroy = false;
        let mut minretry = NEVER;
        {
            let Some(node) = self.nodes.get_mut(&key) else {
                return;
            };
            if node.reads.is_empty() {
                destroy = true;
            } else {
                node.retries += 1;
                tracing::warn!(?key, %e, retries = node.retries, "streaming transfer retry");
                if self.config.auto_down_port {
                    self.usealtdownport = !self.usealtdownport;
                }

                let retries = node.retries;
                let mut i = 0;
                while i < node.reads.len() {
                    let read = &mut node.reads[i];
                    if read.sink.is_valid() {
                        if let Some(mut slot) = read.slot.take() {
                            slot.disconnect_all(io);
                        }
                        self.drq.retain(|&(k, r)| !(k == key && r == read.id));
                        if !e.is_ok() {
                            let retryds = read.sink.on_failure(e, retries, timeleft);
                            if retryds < minretry
                                && !(e.code == ErrorCode::TooMany && e.extra_info)
                            {
                                minretry = retryds;
                            }
                        }
                    }
                    if !node.reads[i].sink.is_valid() {
                        tracing::warn!("read's consumer gone during retry; dropping it");
                        let id = node.reads[i].id;
                        self.drq.retain(|&(k, r)| !(k == key && r == id));
                        node.reads.remove(i);
                    } else {
                        i += 1;
                    }
                }

                if node.reads.is_empty() {
                    destroy = true;
                } else {
                    if e.code == ErrorCode::OverQuota && timeleft > 0 {
                        // don't retry until the end of the overquota state
                        self.overquota_until = now.saturating_add(timeleft);
                        if minretry < timeleft {
                            minretry = timeleft;
                        }
                    } else if e.code == ErrorCode::Paywall {
                        minretry = NEVER;
                    }
                    node.tempurls.clear();
                }
            }
        }

        if destroy {
            tracing::debug!(?key, "removing direct read node; no reads left to retry");
            self.nodes.remove(&key);
            self.drq.retain(|&(k, _)| k != key);
            return;
        }

        if e.is_ok() || minretry == 0 {
            self.drn_dispatch(key, now);
        } else if ever(minretry) {
            if let Some(node) = self.nodes.get_mut(&key) {
                node.schedule(now, minretry);
            }
        } else {
            tracing::debug!(?key, "removing direct read node; cancellation requested");
            self.nodes.remove(&key);
            self.drq.retain(|&(k, _)| k != key);
        }
    }

    /// One event-loop pass over the streaming subsystem: fire due node
    /// timers, start queued reads, then step every active slot.
    pub fn exec(&mut self, io: &mut dyn HttpIo, now_ds: Ds, now_ms: u64) -> Result<()> {
        io.perform()?;

        // timed node actions
        let due: Vec<NodeKey> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.sched.map_or(false, |d| d <= now_ds))
            .map(|(k, _)| *k)
            .collect();
        for key in due {
            let timed_out_midstream = self
                .nodes
                .get(&key)
                .map(|n| !n.tempurls.is_empty() || n.pending_cmd)
                .unwrap_or(false);
            if let Some(n) = self.nodes.get_mut(&key) {
                n.sched = None;
            }
            if timed_out_midstream {
                self.drn_retry(key, ErrorCode::Again.into(), 0, io, now_ds);
            } else {
                self.drn_dispatch(key, now_ds);
            }
        }

        // start queued reads
        while let Some((key, id)) = self.drq.pop_front() {
            let Some(node) = self.nodes.get_mut(&key) else {
                continue;
            };
            let Some(idx) = node.read_index(id) else {
                continue;
            };
            let read = &mut node.reads[idx];
            if read.slot.is_none() {
                let slot = DirectReadSlot::new(read, io, now_ms);
                read.slot = Some(slot);
                node.watch.partiallen = 0;
                node.watch.partialstarttime = now_ds;
            }
        }

        // step active slots
        let keys: Vec<NodeKey> = self.nodes.keys().copied().collect();
        for key in keys {
            self.step_node(key, io, now_ds, now_ms);
        }
        Ok(())
    }

    fn step_node(&mut self, key: NodeKey, io: &mut dyn HttpIo, now_ds: Ds, now_ms: u64) {
        let mut idx = 0;
        loop {
            let step = {
                let Some(node) = self.nodes.get_mut(&key) else {
                    return;
                };
                if idx >= node.reads.len() {
                    return;
                }
                if node.reads[idx].slot.is_none() {
                    idx += 1;
                    continue;
                }
                node.exec_read(
                    idx,
                    io,
                    self.config.min_streaming_rate,
                    self.usealtdownport,
                    now_ds,
                    now_ms,
                )
            };
            match step {
                ReadStep::Continue => idx += 1,
                ReadStep::DestroyRead(id) => {
                    self.drq.retain(|&(k, r)| !(k == key && r == id));
                    if let Some(node) = self.nodes.get_mut(&key) {
                        if let Some(i) = node.read_index(id) {
                            node.reads.remove(i);
                        }
                        if node.reads.is_empty() {
                            node.schedule(now_ds, 0);
                        }
                    }
                    // don't advance idx: the vector shifted
                }
                ReadStep::Retry { e, timeleft } => {
                    self.drn_retry(key, e, timeleft, io, now_ds);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overquota_modes() {
        let mut eng = Engine::new(EngineConfig::default());
        eng.activate_overquota(100, 50, false);
        assert_eq!(eng.overquota_until, 150);
        assert!(!eng.paywalled);

        eng.activate_overquota(100, 0, true);
        assert!(eng.paywalled);
        assert_eq!(eng.overquota_until, NEVER);

        eng.clear_overquota();
        assert_eq!(eng.overquota_until, 0);
        assert!(!eng.paywalled);
    }

    #[test]
    fn pool_ids_are_stable_and_unique() {
        let mut eng = Engine::new(EngineConfig::default());
        let a = eng.create_transfer(Direction::Get);
        let b = eng.create_transfer(Direction::Put);
        assert_ne!(a, b);
        assert_eq!(eng.pool.get(a).unwrap().direction, Direction::Get);
        assert_eq!(eng.pool.get(b).unwrap().direction, Direction::Put);
    }
}
