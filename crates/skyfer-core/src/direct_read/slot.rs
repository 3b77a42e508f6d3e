//! The parallel-connection engine behind one direct read.
//!
//! Drives up to six ranged requests, feeds their bytes to the RAID buffer,
//! delivers assembled output in file order, and polices connection health:
//! the slowest part can be swapped for the intentionally idle one, failed
//! parts are parked with their error recorded, and a watchdog retries the
//! whole transfer when aggregate speed falls below the configured floor.

use std::collections::{BTreeSet, VecDeque};

use crate::ds::Ds;
use crate::error::{ApiError, ErrorCode};
use crate::http::{HttpIo, HttpReq, ReqStatus};
use crate::raid::{FilePiece, EFFECTIVE_RAIDPARTS, RAIDPARTS, RAIDSECTOR};

use super::node::NodeWatch;
use super::read::DirectRead;

/// Node-level timeout for URL acquisition and stuck transfers.
pub const TIMEOUT_DS: Ds = 100;
/// Inactivity horizon while data is flowing.
pub const TEMPURL_TIMEOUT_DS: Ds = 1200;
/// Per-request byte-range cap in non-RAID mode.
pub const MAX_DELIVERY_CHUNK: u64 = 32 * 1024 * 1024;
/// Floor for direct-read request sizing.
pub const MAX_REQ_SIZE: u64 = 16 * 1024 * 1024;
/// Default minimum acceptable aggregate streaming rate.
pub const MIN_BYTES_PER_SECOND: u64 = 1024 * 15;
/// Watchdog window in deciseconds.
pub const MEAN_SPEED_INTERVAL_DS: Ds = 100;
/// A connection is "too slow" when `fastest * RATIO.0 > slowest * RATIO.1`,
/// i.e. the fastest exceeds the slowest by more than 25%. Fixed so
/// replacement decisions are reproducible.
pub const SLOWEST_TO_FASTEST_THROUGHPUT_RATIO: (u64, u64) = (4, 5);
pub const MAX_SIMULTANEOUS_SLOW_RAIDED_CONNS: usize = 1;
pub const MAX_CONN_SWITCHES_SLOWEST_PART: u32 = 6;
pub const MAX_CONN_SWITCHES_BELOW_SPEED_THRESHOLD: u32 = 6;
/// Window after which the switch budgets reset.
pub const CONNECTION_SWITCHES_LIMIT_RESET_MS: u64 = 60_000;
/// Bytes a connection must have moved before its throughput is comparable.
pub const DEFAULT_MIN_COMPARABLE_THROUGHPUT: u64 = 64 * 1024;
pub const DEFAULT_UNUSED_CONN_INDEX: usize = 0;
/// Withhold new requests while all six parts are in flight.
pub const WAIT_FOR_PARTS_IN_FLIGHT: bool = true;
/// Backoff applied when the storage server reports bandwidth overquota.
pub const OVERQUOTA_BACKOFF_DS: Ds = 3600;

/// Why a connection is the idle one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedReason {
    NotErr,
    /// The storage server refused the part definitively; this connection
    /// must not be brought back for this attempt.
    DefinitiveErr,
}

impl UnusedReason {
    /// Classify an HTTP status on a raided part. Definitive refusals park
    /// the connection; anything else escalates to a whole-transfer retry.
    pub fn from_http_status(status: u32) -> UnusedReason {
        match status {
            403 | 404 | 429 | 500..=599 => UnusedReason::DefinitiveErr,
            _ => UnusedReason::NotErr,
        }
    }
}

/// Why a replacement was performed, for budget accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementReason {
    OnRaidedError,
    SlowestPart,
    UnderThreshold,
}

/// Tracks which of the six parts is intentionally idle.
#[derive(Debug, Clone, Copy)]
pub struct UnusedConn {
    num: usize,
    reason: UnusedReason,
}

impl Default for UnusedConn {
    fn default() -> Self {
        UnusedConn {
            num: 0,
            reason: UnusedReason::NotErr,
        }
    }
}

impl UnusedConn {
    pub fn num(&self) -> usize {
        self.num
    }

    pub fn can_be_reused(&self) -> bool {
        self.reason == UnusedReason::NotErr
    }

    pub fn set_unused(&mut self, num: usize, reason: UnusedReason) -> bool {
        if num == self.num {
            return false;
        }
        self.num = num;
        self.reason = reason;
        true
    }

    pub fn clear(&mut self) {
        self.num = 0;
        self.reason = UnusedReason::NotErr;
    }
}

/// What the caller must do after a `doio` step.
#[derive(Debug)]
pub enum SlotAction {
    Continue,
    /// The read finished (or its sink vanished); destroy it.
    DestroyRead,
    /// Abort all the node's reads and retry with fresh URLs.
    RetryTransfer { e: ApiError, timeleft: Ds },
}

/// Per-step context handed down from the engine.
pub struct SlotCtx<'a> {
    pub io: &'a mut dyn HttpIo,
    /// Configured minimum streaming rate: 0 = no limit, <0 = default.
    pub min_streaming_rate: i64,
    pub usealtdownport: bool,
    pub now_ds: Ds,
    pub now_ms: u64,
    /// Set by the slot when activity warrants pushing the node timeout out.
    pub reschedule: Option<Ds>,
}

/// Instantaneous and mean delivery speed, both in bytes/sec.
#[derive(Debug, Default)]
struct SpeedMeter {
    total: u64,
    start_ms: u64,
    started: bool,
    window: VecDeque<(u64, u64)>,
}

impl SpeedMeter {
    fn note(&mut self, len: u64, now_ms: u64) -> (u64, u64) {
        if !self.started {
            self.start_ms = now_ms;
            self.started = true;
        }
        self.total += len;
        self.window.push_back((now_ms, len));
        while let Some(&(t, _)) = self.window.front() {
            if now_ms.saturating_sub(t) > 1000 {
                self.window.pop_front();
            } else {
                break;
            }
        }
        let wbytes: u64 = self.window.iter().map(|&(_, l)| l).sum();
        let wspan = now_ms - self.window.front().map(|&(t, _)| t).unwrap_or(now_ms);
        let speed = if wspan > 0 { wbytes * 1000 / wspan } else { wbytes };
        let elapsed = now_ms.saturating_sub(self.start_ms);
        let mean = if elapsed > 0 {
            self.total * 1000 / elapsed
        } else {
            self.total
        };
        (speed, mean)
    }
}

pub struct DirectReadSlot {
    raid: bool,
    reqs: Vec<Option<HttpReq>>,
    /// Per-connection (bytes submitted, elapsed ms).
    throughput: Vec<(u64, u64)>,
    unused: UnusedConn,
    num_reqs_inflight: usize,
    /// The unused connection was virtually counted for parity restoration.
    unused_conn_incremented_inflight: bool,
    wait_for_parts: bool,
    max_chunk_submitted: u64,
    max_chunk_size: u64,
    min_comparable_throughput: u64,
    num_switches_slowest: u32,
    num_switches_below_threshold: u32,
    switch_window_start_ms: u64,
    slot_start_ms: u64,
    slot_throughput: (u64, u64),
    speed: SpeedMeter,
    /// Next output offset expected by the sink.
    pos: u64,
}

impl DirectReadSlot {
    pub fn new(read: &mut DirectRead, io: &mut dyn HttpIo, now_ms: u64) -> Self {
        let raid = read.buffer.is_raid();
        let num_reqs = if raid { RAIDPARTS } else { 1 };
        let pos = read.offset + read.progress;
        read.next_request_pos = pos;

        let mut reqs = Vec::with_capacity(num_reqs);
        for _ in 0..num_reqs {
            reqs.push(Some(io.new_req()));
        }

        let mut unused = UnusedConn::default();
        let aux = if raid {
            let un = read.buffer.unused_raid_connection();
            let aux = if un < num_reqs {
                un
            } else {
                DEFAULT_UNUSED_CONN_INDEX
            };
            read.buffer.set_unused_raid_connection(aux);
            aux
        } else {
            num_reqs
        };
        unused.set_unused(aux, UnusedReason::NotErr);
        tracing::debug!(read = read.id, raid, unused = aux, "new direct read slot");

        let mut max_chunk_size = MAX_DELIVERY_CHUNK
            / (if num_reqs == RAIDPARTS {
                EFFECTIVE_RAIDPARTS
            } else {
                num_reqs
            }) as u64;
        if raid {
            max_chunk_size -= max_chunk_size % RAIDSECTOR as u64;
        }

        DirectReadSlot {
            raid,
            throughput: vec![(0, 0); num_reqs],
            reqs,
            unused,
            num_reqs_inflight: 0,
            unused_conn_incremented_inflight: false,
            wait_for_parts: false,
            max_chunk_submitted: 0,
            max_chunk_size,
            min_comparable_throughput: DEFAULT_MIN_COMPARABLE_THROUGHPUT,
            num_switches_slowest: 0,
            num_switches_below_threshold: 0,
            switch_window_start_ms: now_ms,
            slot_start_ms: now_ms,
            slot_throughput: (0, 0),
            speed: SpeedMeter::default(),
            pos,
        }
    }

    pub fn num_reqs_inflight(&self) -> usize {
        self.num_reqs_inflight
    }

    pub fn unused_connection(&self) -> usize {
        self.unused.num()
    }

    pub fn switches_below_threshold(&self) -> u32 {
        self.num_switches_below_threshold
    }

    pub fn switches_slowest_part(&self) -> u32 {
        self.num_switches_slowest
    }

    /// Tear down all connections (read aborted or finished).
    pub fn disconnect_all(&mut self, io: &mut dyn HttpIo) {
        for req in self.reqs.iter_mut().flatten() {
            io.disconnect(req);
        }
    }

    /// One polling step: drain in-flight bytes, deliver assembled output,
    /// issue next requests, handle failures, run the watchdog. Connections
    /// are visited highest index first.
    pub fn doio(
        &mut self,
        read: &mut DirectRead,
        watch: &mut NodeWatch,
        ctx: &mut SlotCtx,
    ) -> SlotAction {
        let is_raid = self.raid;
        let mut min_speed_conn = self.min_speed_per_conn_bps(ctx.min_streaming_rate);
        if min_speed_conn == 0 {
            min_speed_conn = 1; // no limit
        }
        if is_raid {
            // round up to a RAIDSECTOR-divisible value
            let sector = RAIDSECTOR as u64;
            min_speed_conn = (min_speed_conn + sector - 1) & !(sector - 1);
        }

        self.reset_switch_counters_if_expired(ctx.now_ms);

        for conn in (0..self.reqs.len()).rev() {
            if let Some(req) = self.reqs[conn].as_mut() {
                ctx.io.update(req);
            }

            let is_not_unused = !is_raid || conn != self.unused.num();

            // drain buffered input into the raid buffer
            let mut took = self.reqs[conn].take();
            let mut finished_during_drain = false;
            if let Some(req) = took.as_mut() {
                if is_not_unused
                    && matches!(req.status, ReqStatus::Inflight | ReqStatus::Success)
                {
                    if !req.in_buf.is_empty() {
                        let n = self.drain_req(conn, req, read, is_raid, min_speed_conn, ctx);
                        req.lastdata = ctx.now_ds;
                        if n > 0 && !self.process_output(read, watch, ctx) {
                            finished_during_drain = true;
                        }
                        ctx.reschedule = Some(TEMPURL_TIMEOUT_DS);
                    }
                    if !finished_during_drain
                        && req.status == ReqStatus::Success
                        && req.in_buf.is_empty()
                    {
                        self.decrease_reqs_inflight();
                        req.status = ReqStatus::Ready;
                    }
                }
            }
            self.reqs[conn] = took;
            if finished_during_drain {
                tracing::debug!(conn, "read finished while delivering output pieces");
                return SlotAction::DestroyRead;
            }

            // issue the next request when idle
            let ready = self.reqs[conn]
                .as_ref()
                .map_or(true, |r| r.status == ReqStatus::Ready);
            if ready && !(is_raid && self.wait_for_parts_in_flight()) {
                if self.search_and_disconnect_slowest(conn, read, ctx.io) {
                    tracing::debug!(
                        conn,
                        unused = self.unused.num(),
                        "continuing after parking slow connection"
                    );
                }

                let mut new_buffer_supplied = false;
                let mut pause_for_raid = false;
                let (pfrom, pto) = read.buffer.next_pos_for_connection(
                    conn,
                    &mut new_buffer_supplied,
                    &mut pause_for_raid,
                );
                if new_buffer_supplied {
                    if conn == self.unused.num() {
                        // count the parity-restored connection as in flight
                        // so the wait-for-parts rule sees all six accounted
                        self.increase_reqs_inflight(watch, ctx.now_ds);
                        self.unused_conn_incremented_inflight = true;
                    }
                    if !self.process_output(read, watch, ctx) {
                        return SlotAction::DestroyRead;
                    }
                } else if !pause_for_raid {
                    if pfrom >= pto {
                        if let Some(req) = self.reqs[conn].as_mut() {
                            req.status = ReqStatus::Done;
                        }
                        let all_done = self
                            .reqs
                            .iter()
                            .all(|r| r.as_ref().map_or(true, |r| r.status == ReqStatus::Done));
                        if all_done {
                            tracing::debug!("all requests done; read complete");
                            return SlotAction::DestroyRead;
                        }
                    } else {
                        if !read.sink.is_valid() {
                            tracing::error!(
                                conn,
                                "chunk wanted but the read's consumer is gone"
                            );
                            return SlotAction::DestroyRead;
                        }
                        debug_assert!(
                            !is_raid || conn != self.unused.num(),
                            "issuing a request on the unused connection"
                        );
                        if self.reqs[conn].is_none() {
                            self.reqs[conn] = Some(ctx.io.new_req());
                        }
                        let mut pto = pto;
                        if !is_raid {
                            pto = pto.min(pfrom + MAX_DELIVERY_CHUNK);
                        }
                        let url = adjust_url_port(
                            read.buffer.temp_url(conn),
                            ctx.usealtdownport,
                        );
                        self.throughput[conn] = (0, 0);
                        let reserve = (self.max_chunk_size + self.max_chunk_size / 2) as usize;
                        if let Some(req) = self.reqs[conn].as_mut() {
                            req.pos = pfrom;
                            req.posturl = format!("{}/{}-{}", url, pfrom, pto - 1);
                            req.post_start_ms = ctx.now_ms;
                            req.lastdata = ctx.now_ds;
                            req.in_buf.reserve(reserve);
                            tracing::debug!(
                                conn,
                                size = pto - pfrom,
                                url = %req.posturl,
                                "requesting chunk"
                            );
                            if let Err(e) = ctx.io.post(req) {
                                tracing::warn!(conn, "post failed: {}", e);
                                req.status = ReqStatus::Failure;
                            }
                        }
                        read.buffer.set_transfer_pos(conn, pto);
                        self.increase_reqs_inflight(watch, ctx.now_ds);
                    }
                }
            }

            if let Some(req) = self.reqs[conn].as_ref() {
                if req.status == ReqStatus::Failure {
                    let httpstatus = req.httpstatus;
                    tracing::warn!(conn, httpstatus, "request failed");
                    if !read.sink.is_valid() {
                        return SlotAction::DestroyRead;
                    }
                    if httpstatus == 509 {
                        tracing::warn!("bandwidth overquota from storage server");
                        return self.retry_entire(
                            ErrorCode::OverQuota.into(),
                            OVERQUOTA_BACKOFF_DS,
                            ctx.now_ms,
                        );
                    }
                    return self.retry_on_error(conn, httpstatus, read, ctx);
                }
            }

            if let Some(action) = self.watch_performance(read, watch, ctx) {
                return action;
            }
        }

        SlotAction::Continue
    }

    /// Pick a submit size from the request's buffered bytes and hand it to
    /// the raid buffer. Returns the number of bytes submitted.
    fn drain_req(
        &mut self,
        conn: usize,
        req: &mut HttpReq,
        read: &mut DirectRead,
        is_raid: bool,
        min_speed_conn: u64,
        ctx: &SlotCtx,
    ) -> u64 {
        let avail = req.in_buf.len() as u64;
        let last_data_ms = ctx.now_ms.saturating_sub(req.post_start_ms);
        let chunk_time = last_data_ms.saturating_sub(self.throughput[conn].1);

        let n = if req.status == ReqStatus::Inflight {
            let updated = calc_throughput(
                self.throughput[conn].0 + avail,
                self.throughput[conn].1 + chunk_time,
            ) * 1000;
            let chunk_tp = calc_throughput(avail, chunk_time) * 1000;
            let aggregated = (chunk_tp + updated) / 2;
            let mut max_chunk = aggregated;
            // 16KB minimum submit granule; if the connection is even slower
            // than that, fall back to the per-connection minimum so small
            // fragments don't get assembled and delivered
            let min_chunk_divisible = if max_chunk < 16 * 1024 {
                min_speed_conn
            } else {
                16 * 1024 // divisible by RAIDSECTOR, works raid and non-raid
            };
            if self.max_chunk_submitted != 0
                && max_chunk != 0
                && max_chunk.max(self.max_chunk_submitted)
                    / max_chunk.min(self.max_chunk_submitted)
                    == 1
            {
                // suppress fragmentation from drifting but similar sizes
                max_chunk = self.max_chunk_submitted;
            }
            let min_chunk = max_chunk.max(min_chunk_divisible);
            if avail >= min_chunk {
                (avail / min_chunk_divisible) * min_chunk_divisible
            } else {
                0
            }
        } else {
            avail // terminal flush
        };

        if is_raid && req.status != ReqStatus::Success && n % RAIDSECTOR as u64 != 0 {
            tracing::error!(
                conn,
                n,
                avail,
                "raid submit size not sector aligned"
            );
            debug_assert!(false, "raid submit must be sector aligned");
        }

        if n > 0 {
            self.throughput[conn].0 += n;
            self.throughput[conn].1 += chunk_time;
            let piece = FilePiece {
                pos: req.pos,
                buf: req.in_buf[..n as usize].to_vec(),
            };
            req.in_buf.drain(..n as usize);
            req.contentlength -= n as i64;
            req.pos += n;
            let submitting = if is_raid { conn } else { 0 };
            read.buffer.submit_buffer(submitting, piece);
            if n > self.max_chunk_submitted {
                self.max_chunk_submitted = n;
            }
        }
        n
    }

    /// Deliver assembled pieces to the sink in file order. Returns false
    /// when the read is finished (sink declined more data or went away).
    fn process_output(
        &mut self,
        read: &mut DirectRead,
        watch: &mut NodeWatch,
        ctx: &mut SlotCtx,
    ) -> bool {
        while let Some(piece) = read.buffer.pop_output() {
            let len = piece.buf.len() as u64;
            let (speed, mean) = self.speed.note(len, ctx.now_ms);
            if !read.sink.is_valid() {
                tracing::error!("assembled piece ready but the read's consumer is gone");
                read.buffer.output_write_completed(true);
                return false;
            }
            self.slot_throughput.0 += len;
            self.slot_throughput.1 = ctx.now_ms.saturating_sub(self.slot_start_ms);
            tracing::trace!(
                len,
                offset = piece.pos,
                speed,
                mean,
                "delivering assembled piece"
            );
            let keep_going = read.sink.on_data(&piece.buf, piece.pos, speed, mean);
            read.buffer.output_write_completed(true);
            if !keep_going {
                return false;
            }
            self.pos = piece.pos + len;
            watch.partiallen += len;
            read.progress += len;
            self.min_comparable_throughput = len.max(1);
        }
        true
    }

    fn wait_for_parts_in_flight(&self) -> bool {
        WAIT_FOR_PARTS_IN_FLIGHT && self.raid && self.wait_for_parts
    }

    fn used_connections(&self) -> usize {
        self.reqs.len() - usize::from(self.unused.num() != self.reqs.len())
    }

    fn increase_reqs_inflight(&mut self, watch: &mut NodeWatch, now_ds: Ds) -> bool {
        if !self.raid {
            return false;
        }
        debug_assert!(self.num_reqs_inflight < self.reqs.len());
        self.num_reqs_inflight += 1;
        if self.num_reqs_inflight == self.reqs.len() {
            debug_assert!(!self.wait_for_parts);
            self.wait_for_parts = true;
            watch.partiallen = 0;
            watch.partialstarttime = now_ds;
        }
        true
    }

    fn decrease_reqs_inflight(&mut self) -> bool {
        if !self.raid {
            return false;
        }
        if self.num_reqs_inflight == 0 {
            // the counter is zeroed early once only the virtually-counted
            // unused connection remains; a late terminal drain lands here
            tracing::trace!("inflight counter already zero");
            return true;
        }
        self.num_reqs_inflight -= 1;
        if self.unused.num() < self.reqs.len()
            && self.reqs[self.unused.num()]
                .as_ref()
                .map_or(false, |r| r.status != ReqStatus::Done)
            && self.num_reqs_inflight == self.reqs.len() - self.used_connections()
        {
            self.num_reqs_inflight = 0;
            self.unused_conn_incremented_inflight = false;
        }
        if self.num_reqs_inflight == 0 {
            self.wait_for_parts = false;
            self.max_chunk_submitted = 0;
        }
        true
    }

    fn is_connection_done(&self, read: &DirectRead, i: usize) -> bool {
        self.reqs[i].as_ref().map_or(false, |r| {
            r.status == ReqStatus::Done || r.pos == read.buffer.transfer_size(i)
        })
    }

    fn any_part_failed(&self) -> bool {
        self.raid
            && self
                .reqs
                .iter()
                .flatten()
                .any(|r| r.status == ReqStatus::Failure)
    }

    fn all_ready_or_inflight(&self) -> bool {
        self.reqs.iter().all(|r| {
            r.as_ref().map_or(false, |r| {
                matches!(r.status, ReqStatus::Ready | ReqStatus::Inflight)
            })
        })
    }

    /// Per-connection minimum speed in bytes/sec derived from the configured
    /// streaming floor. 0 means no limit is set.
    fn min_speed_per_conn_bps(&self, min_streaming_rate: i64) -> u64 {
        let parts = if self.raid {
            EFFECTIVE_RAIDPARTS as u64
        } else {
            1
        };
        if min_streaming_rate < 0 {
            MIN_BYTES_PER_SECOND / parts
        } else if min_streaming_rate == 0 {
            0
        } else if (min_streaming_rate as u64) < parts {
            1
        } else {
            min_streaming_rate as u64 / parts
        }
    }

    fn throughput_of(&self, i: usize) -> u64 {
        calc_throughput(self.throughput[i].0, self.throughput[i].1)
    }

    fn is_comparable(&self, i: usize) -> bool {
        self.throughput[i].0 >= self.min_comparable_throughput
    }

    fn reset_switch_counters(&mut self, now_ms: u64) {
        self.num_switches_slowest = 0;
        self.num_switches_below_threshold = 0;
        self.switch_window_start_ms = now_ms;
    }

    fn reset_switch_counters_if_expired(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.switch_window_start_ms)
            > CONNECTION_SWITCHES_LIMIT_RESET_MS
        {
            self.reset_switch_counters(now_ms);
        }
    }

    fn max_switches_reached(&self, reason: ReplacementReason) -> bool {
        match reason {
            ReplacementReason::OnRaidedError => false,
            ReplacementReason::SlowestPart => {
                self.num_switches_slowest >= MAX_CONN_SWITCHES_SLOWEST_PART
            }
            ReplacementReason::UnderThreshold => {
                self.num_switches_below_threshold >= MAX_CONN_SWITCHES_BELOW_SPEED_THRESHOLD
            }
        }
    }

    fn increase_switches(&mut self, reason: ReplacementReason) {
        match reason {
            ReplacementReason::OnRaidedError => {}
            ReplacementReason::SlowestPart => self.num_switches_slowest += 1,
            ReplacementReason::UnderThreshold => self.num_switches_below_threshold += 1,
        }
    }

    fn retry_entire(&mut self, e: ApiError, timeleft: Ds, now_ms: u64) -> SlotAction {
        self.reset_switch_counters(now_ms);
        self.unused.clear();
        SlotAction::RetryTransfer { e, timeleft }
    }

    /// Disconnect connection `i` and discard its unconsumed buffer data so
    /// the next fetch restarts at the assembly front.
    fn reset_connection(
        &mut self,
        i: usize,
        read: &mut DirectRead,
        io: &mut dyn HttpIo,
    ) -> bool {
        if i >= self.reqs.len() {
            debug_assert!(false, "resetConnection out of bounds");
            return false;
        }
        tracing::debug!(conn = i, "reset connection");
        if let Some(req) = self.reqs[i].as_mut() {
            io.disconnect(req);
            req.status = ReqStatus::Ready;
            self.throughput[i] = (0, 0);
        }
        read.buffer.reset_part(i);
        true
    }

    fn replace_connection_by_unused(
        &mut self,
        read: &mut DirectRead,
        io: &mut dyn HttpIo,
        new_unused: usize,
        reason: ReplacementReason,
        unused_reason: UnusedReason,
    ) -> bool {
        if !self.raid
            || !self.unused.can_be_reused()
            || self.max_switches_reached(reason)
            || new_unused >= self.reqs.len()
            || self.reqs[new_unused].is_none()
        {
            tracing::error!(new_unused, "cannot replace unused connection");
            return false;
        }
        let prev = self.unused.num();
        tracing::debug!(
            new_unused,
            prev_unused = prev,
            ?reason,
            ?unused_reason,
            "replacing connection by unused"
        );
        self.increase_switches(reason);
        read.buffer.set_unused_raid_connection(new_unused);
        self.reset_connection(prev, read, io);
        self.unused.set_unused(new_unused, unused_reason);
        self.reset_connection(new_unused, read, io);
        true
    }

    fn replace_connection_by_unused_inflight(
        &mut self,
        read: &mut DirectRead,
        io: &mut dyn HttpIo,
        new_unused: usize,
        reason: ReplacementReason,
        unused_reason: UnusedReason,
    ) {
        if !self.replace_connection_by_unused(read, io, new_unused, reason, unused_reason) {
            return;
        }
        self.decrease_reqs_inflight();
        if self.unused_conn_incremented_inflight {
            if self.num_reqs_inflight > 0 {
                self.decrease_reqs_inflight();
            }
            self.unused_conn_incremented_inflight = false;
        }
    }

    /// No switches while any connection is mid-flight; disconnecting a peer
    /// we might keep would throw its bytes away.
    fn exit_due_reqs_inflight(&self) -> bool {
        if self.num_reqs_inflight == 0 {
            return false;
        }
        if self.num_reqs_inflight > 1 {
            return true;
        }
        self.reqs
            .iter()
            .any(|r| r.as_ref().map_or(true, |r| r.status != ReqStatus::Ready))
    }

    /// Find the slowest and fastest comparable peers of `conn`. Returns
    /// `reqs.len()` for both when any peer lacks comparable data or is done.
    fn search_slowest_and_fastest(
        &self,
        read: &DirectRead,
        conn: usize,
    ) -> (usize, usize) {
        let n = self.reqs.len();
        let mut slowest = conn;
        let mut fastest = conn;
        for other in (0..n).rev() {
            if other == conn || other == self.unused.num() {
                continue;
            }
            let done = self.is_connection_done(read, other);
            if !self.is_comparable(other) || done {
                return (n, n);
            }
            if self.throughput_of(other) < self.throughput_of(slowest) {
                slowest = other;
            }
            if self.throughput_of(other) > self.throughput_of(fastest) {
                fastest = other;
            }
        }
        (slowest, fastest)
    }

    fn slowest_too_slow_vs_fastest(
        &self,
        conn: usize,
        slowest: usize,
        fastest: usize,
    ) -> bool {
        let n = self.reqs.len();
        let slowest_is_candidate = slowest == conn
            || (slowest != n
                && self.reqs[slowest]
                    .as_ref()
                    .map_or(false, |r| r.status == ReqStatus::Ready));
        if slowest_is_candidate && fastest != slowest && fastest != n {
            let s = self.throughput_of(slowest);
            let f = self.throughput_of(fastest);
            if f * SLOWEST_TO_FASTEST_THROUGHPUT_RATIO.0
                > s * SLOWEST_TO_FASTEST_THROUGHPUT_RATIO.1
            {
                tracing::warn!(
                    conn,
                    slowest,
                    slowest_bps = s * 1000,
                    fastest_bps = f * 1000,
                    switches = self.num_switches_slowest,
                    "slow raided connection detected"
                );
                return true;
            }
        }
        false
    }

    /// Adaptive replacement: when this connection's peers show one clearly
    /// lagging part, park it and wake the idle one.
    fn search_and_disconnect_slowest(
        &mut self,
        conn: usize,
        read: &mut DirectRead,
        io: &mut dyn HttpIo,
    ) -> bool {
        if !self.raid
            || !self.unused.can_be_reused()
            || self.exit_due_reqs_inflight()
            || self.reqs[conn].is_none()
            || conn == self.unused.num()
            || !self.is_comparable(conn)
        {
            return false;
        }
        if self.max_switches_reached(ReplacementReason::SlowestPart) {
            return false;
        }
        let (slowest, fastest) = self.search_slowest_and_fastest(read, conn);
        if self.slowest_too_slow_vs_fastest(conn, slowest, fastest) {
            return self.replace_connection_by_unused(
                read,
                io,
                slowest,
                ReplacementReason::SlowestPart,
                UnusedReason::NotErr,
            );
        }
        false
    }

    /// Connections currently under the per-connection speed floor, plus the
    /// slowest among them (`reqs.len()` when none).
    fn search_slow_conns_under_threshold(
        &self,
        min_streaming_rate: i64,
    ) -> (BTreeSet<usize>, usize) {
        let min_bps = self.min_speed_per_conn_bps(min_streaming_rate);
        if min_bps == 0 || !self.raid {
            return (BTreeSet::new(), self.reqs.len());
        }
        let mut slow = BTreeSet::new();
        let mut slowest = self.reqs.len();
        let mut slowest_tp = 0u64;
        for i in 0..self.reqs.len() {
            if i == self.unused.num() {
                continue;
            }
            let Some(req) = self.reqs[i].as_ref() else {
                continue;
            };
            if req.status != ReqStatus::Inflight {
                continue;
            }
            let tp = self.throughput_of(i);
            if tp * 1000 < min_bps {
                slow.insert(i);
                if slowest_tp == 0 || tp < slowest_tp {
                    slowest = i;
                    slowest_tp = tp;
                }
            }
        }
        (slow, slowest)
    }

    /// Watchdog: once per window, compare aggregate and per-connection
    /// delivery speed against the configured floor.
    fn watch_performance(
        &mut self,
        read: &mut DirectRead,
        watch: &mut NodeWatch,
        ctx: &mut SlotCtx,
    ) -> Option<SlotAction> {
        let ds_since = ctx.now_ds.saturating_sub(watch.partialstarttime);
        if ds_since <= MEAN_SPEED_INTERVAL_DS {
            return None;
        }

        let meanspeed = (10 * watch.partiallen) / ds_since;
        let minspeed = if ctx.min_streaming_rate < 0 {
            MIN_BYTES_PER_SECOND
        } else {
            ctx.min_streaming_rate as u64
        };

        if !read.sink.is_valid() {
            tracing::error!("watchdog: read's consumer is gone");
            return Some(SlotAction::DestroyRead);
        }

        if ctx.min_streaming_rate == 0 {
            // no floor configured; nothing to police
            watch.partiallen = 0;
            watch.partialstarttime = ctx.now_ds;
            return None;
        }

        if self.any_part_failed() {
            // the failure path owns this situation
            watch.partiallen = 0;
            watch.partialstarttime = ctx.now_ds;
            return None;
        }

        let (slow_conns, slowest) =
            self.search_slow_conns_under_threshold(ctx.min_streaming_rate);
        tracing::debug!(
            slow = slow_conns.len(),
            meanspeed,
            minspeed,
            "watchdog check"
        );

        if slow_conns.is_empty() {
            if meanspeed < minspeed {
                tracing::warn!(meanspeed, minspeed, "aggregate speed under floor");
                return Some(self.retry_entire(ErrorCode::Again.into(), 0, ctx.now_ms));
            }
            watch.partiallen = 0;
            watch.partialstarttime = ctx.now_ds;
            return None;
        }

        if slow_conns.len() <= MAX_SIMULTANEOUS_SLOW_RAIDED_CONNS {
            let unused_not_reusable = !self.unused.can_be_reused()
                || self.max_switches_reached(ReplacementReason::UnderThreshold);
            if unused_not_reusable || self.num_reqs_inflight < EFFECTIVE_RAIDPARTS {
                if self.num_reqs_inflight < EFFECTIVE_RAIDPARTS && self.all_ready_or_inflight()
                {
                    // wait for inflight requests to settle; charge the budget
                    // so this cannot repeat indefinitely
                    self.num_switches_below_threshold += 1;
                    watch.partiallen = 0;
                    watch.partialstarttime = ctx.now_ds;
                    return None;
                }
                tracing::error!(
                    slowest,
                    "cannot park slow connection; retrying whole transfer"
                );
                return Some(self.retry_entire(ErrorCode::Again.into(), 0, ctx.now_ms));
            }

            self.replace_connection_by_unused_inflight(
                read,
                ctx.io,
                slowest,
                ReplacementReason::UnderThreshold,
                UnusedReason::NotErr,
            );
            watch.partiallen = 0;
            watch.partialstarttime = ctx.now_ds;
            return None;
        }

        tracing::error!(
            slow = slow_conns.len(),
            "too many slow connections; retrying whole transfer"
        );
        Some(self.retry_entire(ErrorCode::Again.into(), 0, ctx.now_ms))
    }

    /// A request ended in FAILURE. Non-RAID retries the whole transfer; a
    /// raided part with a definitive refusal swaps places with the idle
    /// connection instead.
    fn retry_on_error(
        &mut self,
        conn: usize,
        httpstatus: u32,
        read: &mut DirectRead,
        ctx: &mut SlotCtx,
    ) -> SlotAction {
        if !self.raid {
            tracing::debug!("retrying non-raid transfer");
            return self.retry_entire(ErrorCode::Read.into(), 0, ctx.now_ms);
        }

        debug_assert_eq!(self.reqs.len(), RAIDPARTS);
        if conn >= self.reqs.len() || self.reqs[conn].is_none() {
            debug_assert!(false, "retry_on_error: bad connection index");
            return self.retry_entire(ErrorCode::Read.into(), 0, ctx.now_ms);
        }

        if conn == self.unused.num() {
            tracing::error!(conn, "failure reported on the unused connection");
            debug_assert!(false, "failure on unused connection");
            return self.retry_entire(ErrorCode::Read.into(), 0, ctx.now_ms);
        }

        let reason = UnusedReason::from_http_status(httpstatus);
        if reason != UnusedReason::DefinitiveErr {
            tracing::error!(conn, httpstatus, "non-definitive part failure");
            return self.retry_entire(ErrorCode::Read.into(), 0, ctx.now_ms);
        }

        if !self.unused.can_be_reused() {
            tracing::debug!(
                conn,
                "unused connection also failed; retrying whole transfer"
            );
            return self.retry_entire(ErrorCode::Read.into(), 0, ctx.now_ms);
        }

        self.replace_connection_by_unused_inflight(
            read,
            ctx.io,
            conn,
            ReplacementReason::OnRaidedError,
            reason,
        );
        SlotAction::Continue
    }
}

fn calc_throughput(bytes: u64, time_ms: u64) -> u64 {
    if bytes != 0 && time_ms != 0 {
        bytes / time_ms
    } else {
        0
    }
}

/// Flip the explicit `:8080` alternative port on plain-http URLs, used to
/// get past middleboxes that break one of the ports.
pub fn adjust_url_port(url: &str, use_alt: bool) -> String {
    let mut url = url.to_string();
    if url.starts_with("http:") && url.len() > 8 {
        let portend = url[8..].find('/').map(|i| i + 8);
        let portstart = url[8..].find(':').map(|i| i + 8);
        if let Some(pe) = portend {
            match portstart {
                None => {
                    if use_alt {
                        tracing::debug!("enabling alternative port for streaming transfer");
                        url.insert_str(pe, ":8080");
                    }
                }
                Some(ps) if ps < pe => {
                    if !use_alt {
                        tracing::debug!("disabling alternative port for streaming transfer");
                        url.replace_range(ps..pe, "");
                    }
                }
                Some(_) => {}
            }
        }
    }
    url
}
