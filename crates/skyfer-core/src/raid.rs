//! Buffer manager for direct reads: six-way parity reassembly and the
//! single-connection passthrough.
//!
//! RAID layout: file data is split into 80-byte lines; parts 1..=5 each hold
//! one 16-byte sector per line, part 0 holds the XOR of the five data
//! sectors. Any five parts reconstruct the sixth, which is what lets the
//! slot leave one connection intentionally idle. Sectors past the end of the
//! file are zero for parity purposes.
//!
//! The slot feeds per-connection pieces in with `submit_buffer` and pulls
//! file-ordered output with `pop_output`; output offsets are strictly
//! contiguous from the requested start.

use std::collections::{BTreeMap, VecDeque};

pub const RAIDPARTS: usize = 6;
pub const EFFECTIVE_RAIDPARTS: usize = 5;
pub const RAIDSECTOR: usize = 16;
pub const RAIDLINE: usize = EFFECTIVE_RAIDPARTS * RAIDSECTOR;

const SECTOR: u64 = RAIDSECTOR as u64;
const LINE: u64 = RAIDLINE as u64;

/// One contiguous run of bytes at a position (part-relative on input,
/// absolute file offset on output).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePiece {
    pub pos: u64,
    pub buf: Vec<u8>,
}

/// Byte length of raid part `part` for a file of `size` bytes.
///
/// Every part carries one sector per full line; the residual line at the
/// tail contributes a (possibly partial) sector to the parity part and to
/// as many data parts as it reaches into.
pub fn raid_part_size(part: usize, size: u64) -> u64 {
    let r = size % LINE;
    let step = if part == 0 { 0 } else { part as u64 - 1 };
    let t = (r as i64 - (step * SECTOR) as i64).clamp(0, SECTOR as i64) as u64;
    (size - r) / EFFECTIVE_RAIDPARTS as u64 + t
}

/// Reassembly state for one direct read.
///
/// Constructed empty; `set_is_raid` establishes geometry once temp URLs are
/// known. `unused == RAIDPARTS` means no connection is parked (non-RAID, or
/// RAID before the slot picks one).
#[derive(Debug)]
pub struct DirectReadBuffer {
    urls: Vec<String>,
    raid: bool,
    file_size: u64,
    from: u64,
    to: u64,
    max_req: u64,
    unused: usize,

    // raid state; part offsets are part-relative
    part_from: u64,
    part_to: [u64; RAIDPARTS],
    part_pos: [u64; RAIDPARTS],
    avail: [u64; RAIDPARTS],
    queues: [BTreeMap<u64, Vec<u8>>; RAIDPARTS],
    /// Absolute file offset of the next byte to assemble (line-aligned).
    assemble_pos: u64,

    // non-raid state
    nr_pos: u64,

    out: VecDeque<FilePiece>,
    /// Absolute file offset of the next byte to deliver.
    delivered: u64,
}

impl Default for DirectReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectReadBuffer {
    pub fn new() -> Self {
        DirectReadBuffer {
            urls: Vec::new(),
            raid: false,
            file_size: 0,
            from: 0,
            to: 0,
            max_req: 0,
            unused: RAIDPARTS,
            part_from: 0,
            part_to: [0; RAIDPARTS],
            part_pos: [0; RAIDPARTS],
            avail: [0; RAIDPARTS],
            queues: std::array::from_fn(|_| BTreeMap::new()),
            assemble_pos: 0,
            nr_pos: 0,
            out: VecDeque::new(),
            delivered: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.urls.is_empty()
    }

    pub fn is_raid(&self) -> bool {
        self.raid
    }

    pub fn temp_url(&self, i: usize) -> &str {
        &self.urls[i]
    }

    pub fn temp_urls(&self) -> &[String] {
        &self.urls
    }

    /// End of the byte space connection `i` fetches from: the part window
    /// end in RAID mode, the requested file end otherwise.
    pub fn transfer_size(&self, i: usize) -> u64 {
        if self.raid {
            self.part_to[i]
        } else {
            self.to
        }
    }

    pub fn transfer_pos(&self, i: usize) -> u64 {
        if self.raid {
            self.part_pos[i]
        } else {
            self.nr_pos
        }
    }

    pub fn set_transfer_pos(&mut self, i: usize, pos: u64) {
        if self.raid {
            self.part_pos[i] = pos;
        } else {
            self.nr_pos = pos;
        }
    }

    pub fn unused_raid_connection(&self) -> usize {
        self.unused
    }

    pub fn set_unused_raid_connection(&mut self, i: usize) {
        self.unused = i;
    }

    /// Establish geometry for the output range `[from, to)` of a file of
    /// `size` bytes, fetched through `urls` (1 = plain, 6 = RAID).
    pub fn set_is_raid(
        &mut self,
        urls: &[String],
        from: u64,
        to: u64,
        size: u64,
        max_req: u64,
        is_resume: bool,
    ) {
        debug_assert!(urls.len() == 1 || urls.len() == RAIDPARTS);
        self.urls = urls.to_vec();
        self.raid = urls.len() == RAIDPARTS;
        self.file_size = size;
        self.from = from;
        self.to = to.min(size);
        self.max_req = max_req.max(SECTOR);
        self.delivered = from;
        self.out.clear();
        for q in &mut self.queues {
            q.clear();
        }

        if self.raid {
            let from_line = from / LINE;
            let to_line = self.to.div_ceil(LINE);
            self.part_from = from_line * SECTOR;
            self.assemble_pos = from_line * LINE;
            for i in 0..RAIDPARTS {
                self.part_to[i] = raid_part_size(i, size).min(to_line * SECTOR);
                self.part_pos[i] = self.part_from.min(self.part_to[i]);
                self.avail[i] = self.part_pos[i];
            }
        } else {
            self.nr_pos = from;
            self.unused = RAIDPARTS;
        }
        tracing::debug!(
            raid = self.raid,
            from,
            to = self.to,
            size,
            is_resume,
            "direct read buffer configured"
        );
    }

    /// Swap in re-requested temp URLs, keeping everything downloaded so far.
    /// A change in URL count (raid <-> plain transition between attempts)
    /// rebuilds geometry from the next undelivered offset instead.
    pub fn update_urls_and_reset_pos(&mut self, urls: &[String]) {
        if urls.len() != self.urls.len() {
            tracing::debug!(
                old = self.urls.len(),
                new = urls.len(),
                "temp URL count changed; rebuilding buffer from delivery front"
            );
            let (from, to, size, max_req) = (self.delivered, self.to, self.file_size, self.max_req);
            self.set_is_raid(urls, from, to, size, max_req, true);
            return;
        }
        self.urls = urls.to_vec();
        if self.raid {
            for i in 0..RAIDPARTS {
                self.part_pos[i] = self.avail[i];
            }
        }
        // non-raid keeps nr_pos: the single connection resumes at its frontier
    }

    /// Discard connection `i`'s unconsumed data; the next fetch restarts at
    /// the assembly front.
    pub fn reset_part(&mut self, i: usize) {
        if !self.raid {
            return;
        }
        self.queues[i].clear();
        let front = self
            .consumed_sector()
            .max(self.part_from)
            .min(self.part_to[i]);
        self.avail[i] = front;
        self.part_pos[i] = front;
    }

    /// Accept bytes for connection `i`. `piece.pos` is part-relative in
    /// RAID mode and an absolute file offset otherwise.
    pub fn submit_buffer(&mut self, i: usize, piece: FilePiece) {
        if !self.raid {
            let limit = self.to;
            let mut piece = piece;
            if piece.pos + piece.buf.len() as u64 > limit {
                piece.buf.truncate((limit - piece.pos.min(limit)) as usize);
            }
            if !piece.buf.is_empty() {
                self.out.push_back(piece);
            }
            return;
        }

        debug_assert!(i < RAIDPARTS);
        if piece.buf.is_empty() {
            return;
        }
        self.queues[i].insert(piece.pos, piece.buf);
        // advance the contiguous frontier over any adjoining pieces
        while let Some(buf) = self.queues[i].get(&self.avail[i]) {
            self.avail[i] += buf.len() as u64;
        }
        self.assemble();
    }

    /// Next assembled output piece, in strict file order.
    pub fn pop_output(&mut self) -> Option<FilePiece> {
        let piece = self.out.pop_front()?;
        self.delivered = piece.pos + piece.buf.len() as u64;
        Some(piece)
    }

    /// Ack for the piece most recently popped. Kept for interface parity
    /// with asynchronous writers; a failed write would be retried by the
    /// slot's failure path, not here.
    pub fn output_write_completed(&mut self, _ok: bool) {}

    /// Next range connection `i` should fetch, `(from, to)` half-open in the
    /// connection's byte space. An empty range means the connection is done.
    ///
    /// `new_buffer_supplied` is set when the unused connection's data was
    /// produced by parity instead (no HTTP needed); `pause_for_raid` when
    /// the connection must idle, either because it has run too far ahead of
    /// the assembly front or because parity has not caught up yet.
    pub fn next_pos_for_connection(
        &mut self,
        i: usize,
        new_buffer_supplied: &mut bool,
        pause_for_raid: &mut bool,
    ) -> (u64, u64) {
        *new_buffer_supplied = false;
        *pause_for_raid = false;

        if !self.raid {
            return (self.nr_pos, self.to);
        }

        if i == self.unused {
            self.assemble();
            if self.part_pos[i] >= self.part_to[i] {
                return (self.part_pos[i], self.part_pos[i]);
            }
            let restored = self.consumed_sector().min(self.part_to[i]);
            if restored > self.part_pos[i] {
                self.part_pos[i] = restored;
                *new_buffer_supplied = true;
            } else {
                *pause_for_raid = true;
            }
            return (self.part_pos[i], self.part_pos[i]);
        }

        if self.part_pos[i] >= self.part_to[i] {
            return (self.part_pos[i], self.part_pos[i]);
        }

        let part_max_req = self.part_max_req();
        if self.part_pos[i] > self.consumed_sector() + 2 * part_max_req {
            *pause_for_raid = true;
            return (self.part_pos[i], self.part_pos[i]);
        }

        let end = (self.part_pos[i] + part_max_req).min(self.part_to[i]);
        (self.part_pos[i], end)
    }

    fn part_max_req(&self) -> u64 {
        let per_part = self.max_req / EFFECTIVE_RAIDPARTS as u64;
        (per_part.max(SECTOR) + SECTOR - 1) / SECTOR * SECTOR
    }

    /// Part-relative offset of the first sector the assembler still needs.
    fn consumed_sector(&self) -> u64 {
        (self.assemble_pos / LINE) * SECTOR
    }

    fn sector_available(&self, part: usize, po: u64) -> bool {
        let need = (po + SECTOR).min(self.part_to[part]);
        self.avail[part] >= need
    }

    /// Copy sector bytes at part offset `po` into `buf`, zero-padding past
    /// the part's logical end.
    fn read_sector(&self, part: usize, po: u64, buf: &mut [u8; RAIDSECTOR]) {
        buf.fill(0);
        let logical = raid_part_size(part, self.file_size);
        if po >= logical {
            return;
        }
        let want = (SECTOR.min(logical - po)) as usize;
        let mut copied = 0usize;
        while copied < want {
            let target = po + copied as u64;
            let Some((&ppos, pbuf)) = self.queues[part].range(..=target).next_back() else {
                break;
            };
            let off = (target - ppos) as usize;
            if off >= pbuf.len() {
                break;
            }
            let n = (pbuf.len() - off).min(want - copied);
            buf[copied..copied + n].copy_from_slice(&pbuf[off..off + n]);
            copied += n;
        }
        debug_assert_eq!(copied, want, "sector read past contiguous frontier");
    }

    /// Assemble as many complete lines as the part frontiers allow and queue
    /// them as one output piece.
    fn assemble(&mut self) {
        let limit = self.to;
        let mut pending: Vec<u8> = Vec::new();
        let mut pending_pos = 0u64;

        while self.assemble_pos < limit {
            let line = self.assemble_pos / LINE;
            let po = line * SECTOR;

            // data parts other than the unused one are always needed; parity
            // is needed only to reconstruct an unused data part
            let need_parity = self.unused >= 1 && self.unused < RAIDPARTS;
            let mut ready = true;
            for part in 0..RAIDPARTS {
                let needed = if part == 0 {
                    need_parity
                } else {
                    part != self.unused
                };
                if needed && !self.sector_available(part, po) {
                    ready = false;
                    break;
                }
            }
            if !ready {
                break;
            }

            let mut sectors = [[0u8; RAIDSECTOR]; RAIDPARTS];
            for part in 0..RAIDPARTS {
                if part == 0 && !need_parity {
                    continue;
                }
                if part == self.unused {
                    continue;
                }
                let mut s = [0u8; RAIDSECTOR];
                self.read_sector(part, po, &mut s);
                sectors[part] = s;
            }
            if need_parity {
                // unused data part = parity XOR the four present data parts
                let mut s = sectors[0];
                for part in 1..RAIDPARTS {
                    if part == self.unused {
                        continue;
                    }
                    for (a, b) in s.iter_mut().zip(sectors[part].iter()) {
                        *a ^= *b;
                    }
                }
                sectors[self.unused] = s;
            }

            let line_start = line * LINE;
            let mut linebuf = [0u8; RAIDLINE];
            for part in 1..RAIDPARTS {
                linebuf[(part - 1) * RAIDSECTOR..part * RAIDSECTOR]
                    .copy_from_slice(&sectors[part]);
            }

            // trim the line to the still-undelivered requested window
            let out_start = line_start.max(self.from.max(self.assemble_pos));
            let out_end = (line_start + LINE).min(limit);
            if out_start < out_end {
                let a = (out_start - line_start) as usize;
                let b = (out_end - line_start) as usize;
                if pending.is_empty() {
                    pending_pos = out_start;
                }
                pending.extend_from_slice(&linebuf[a..b]);
            }

            self.assemble_pos = line_start + LINE;
            self.gc_consumed();
        }

        if !pending.is_empty() {
            self.out.push_back(FilePiece {
                pos: pending_pos,
                buf: pending,
            });
        }
    }

    /// Drop fully consumed pieces from every part queue.
    fn gc_consumed(&mut self) {
        let front = self.consumed_sector();
        for q in &mut self.queues {
            while let Some((&pos, buf)) = q.first_key_value() {
                if pos + buf.len() as u64 <= front {
                    q.pop_first();
                } else {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Split `data` into six raid parts (part 0 = XOR parity).
    pub fn build_parts(data: &[u8]) -> [Vec<u8>; RAIDPARTS] {
        let size = data.len() as u64;
        let mut parts: [Vec<u8>; RAIDPARTS] =
            std::array::from_fn(|i| Vec::with_capacity(raid_part_size(i, size) as usize));
        let lines = (data.len() + RAIDLINE - 1) / RAIDLINE;
        for line in 0..lines {
            let mut parity = [0u8; RAIDSECTOR];
            for part in 1..RAIDPARTS {
                let start = line * RAIDLINE + (part - 1) * RAIDSECTOR;
                let mut sector = [0u8; RAIDSECTOR];
                for (k, b) in sector.iter_mut().enumerate() {
                    *b = data.get(start + k).copied().unwrap_or(0);
                }
                for (p, s) in parity.iter_mut().zip(sector.iter()) {
                    *p ^= *s;
                }
                parts[part].extend_from_slice(&sector);
            }
            parts[0].extend_from_slice(&parity);
        }
        for (i, part) in parts.iter_mut().enumerate() {
            part.truncate(raid_part_size(i, size) as usize);
        }
        parts
    }

    fn collect_output(buf: &mut DirectReadBuffer) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(p) = buf.pop_output() {
            buf.output_write_completed(true);
            out.push((p.pos, p.buf));
        }
        out
    }

    #[test]
    fn part_sizes_cover_the_file() {
        for size in [0u64, 1, 79, 80, 81, 160, 400, 1000, 81920] {
            let data_sum: u64 = (1..RAIDPARTS).map(|p| raid_part_size(p, size)).sum();
            assert_eq!(data_sum, size, "data parts must cover exactly the file bytes");
        }
    }

    #[test]
    fn parity_part_matches_widest_data_part() {
        for size in [0u64, 1, 15, 16, 17, 80, 95, 1000] {
            let p0 = raid_part_size(0, size);
            let p1 = raid_part_size(1, size);
            assert_eq!(p0, p1, "parity spans the same sectors as part 1 (size {})", size);
        }
    }

    #[test]
    fn non_raid_passthrough_trims_to_range() {
        let mut b = DirectReadBuffer::new();
        b.set_is_raid(&["http://one".to_string()], 10, 30, 100, 1 << 20, false);
        assert!(!b.is_raid());
        assert_eq!(b.transfer_size(0), 30);

        let mut nbs = false;
        let mut pfr = false;
        let (from, to) = b.next_pos_for_connection(0, &mut nbs, &mut pfr);
        assert_eq!((from, to), (10, 30));

        b.submit_buffer(
            0,
            FilePiece {
                pos: 10,
                buf: vec![7u8; 25], // 5 bytes past the requested end
            },
        );
        let out = collect_output(&mut b);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 10);
        assert_eq!(out[0].1.len(), 20, "output clamped at the range end");
    }

    #[test]
    fn raid_reassembles_full_file_without_parity_part() {
        let data: Vec<u8> = (0..400u32).map(|i| (i % 251) as u8).collect();
        let parts = build_parts(&data);

        let urls: Vec<String> = (0..RAIDPARTS).map(|i| format!("http://p{}", i)).collect();
        let mut b = DirectReadBuffer::new();
        b.set_is_raid(&urls, 0, data.len() as u64, data.len() as u64, 1 << 20, false);
        b.set_unused_raid_connection(0); // parity idle: plain stripe read

        for part in 1..RAIDPARTS {
            b.submit_buffer(
                part,
                FilePiece {
                    pos: 0,
                    buf: parts[part].clone(),
                },
            );
        }
        let out = collect_output(&mut b);
        let mut assembled = Vec::new();
        let mut next = 0u64;
        for (pos, bytes) in out {
            assert_eq!(pos, next, "output must be contiguous");
            next = pos + bytes.len() as u64;
            assembled.extend(bytes);
        }
        assert_eq!(assembled, data);
    }

    #[test]
    fn raid_reconstructs_unused_data_part_from_parity() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();
        let parts = build_parts(&data);
        let urls: Vec<String> = (0..RAIDPARTS).map(|i| format!("http://p{}", i)).collect();

        let mut b = DirectReadBuffer::new();
        b.set_is_raid(&urls, 0, data.len() as u64, data.len() as u64, 1 << 20, false);
        b.set_unused_raid_connection(3);

        for part in 0..RAIDPARTS {
            if part == 3 {
                continue;
            }
            b.submit_buffer(
                part,
                FilePiece {
                    pos: 0,
                    buf: parts[part].clone(),
                },
            );
        }
        let out = collect_output(&mut b);
        let assembled: Vec<u8> = out.into_iter().flat_map(|(_, b)| b).collect();
        assert_eq!(assembled, data, "part 3 must be rebuilt from parity");
    }

    #[test]
    fn raid_mid_range_delivery_is_trimmed() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        let parts = build_parts(&data);
        let urls: Vec<String> = (0..RAIDPARTS).map(|i| format!("http://p{}", i)).collect();

        let (from, to) = (100u64, 900u64);
        let mut b = DirectReadBuffer::new();
        b.set_is_raid(&urls, from, to, data.len() as u64, 1 << 20, false);
        b.set_unused_raid_connection(0);

        for part in 1..RAIDPARTS {
            let mut nbs = false;
            let mut pfr = false;
            let (pfrom, pto) = b.next_pos_for_connection(part, &mut nbs, &mut pfr);
            assert!(pto > pfrom, "data parts must have work");
            let bytes = parts[part][pfrom as usize..pto as usize].to_vec();
            b.set_transfer_pos(part, pto);
            b.submit_buffer(part, FilePiece { pos: pfrom, buf: bytes });
        }
        let out = collect_output(&mut b);
        let mut next = from;
        let mut assembled = Vec::new();
        for (pos, bytes) in out {
            assert_eq!(pos, next);
            next = pos + bytes.len() as u64;
            assembled.extend(bytes);
        }
        assert_eq!(next, to);
        assert_eq!(assembled, &data[from as usize..to as usize]);
    }

    #[test]
    fn unused_connection_reports_restored_progress() {
        let data: Vec<u8> = vec![5u8; 800];
        let parts = build_parts(&data);
        let urls: Vec<String> = (0..RAIDPARTS).map(|i| format!("http://p{}", i)).collect();

        let mut b = DirectReadBuffer::new();
        b.set_is_raid(&urls, 0, 800, 800, 1 << 20, false);
        b.set_unused_raid_connection(2);

        let mut nbs = false;
        let mut pfr = false;
        let (f, t) = b.next_pos_for_connection(2, &mut nbs, &mut pfr);
        assert_eq!(f, t);
        assert!(pfr, "nothing restored yet: unused must pause");
        assert!(!nbs);

        for part in 0..RAIDPARTS {
            if part == 2 {
                continue;
            }
            b.submit_buffer(part, FilePiece { pos: 0, buf: parts[part].clone() });
        }
        let (f, t) = b.next_pos_for_connection(2, &mut nbs, &mut pfr);
        assert_eq!(f, t);
        assert!(nbs, "parity restored the unused part's range");

        // once everything is restored the unused connection reports done
        let (f, t) = b.next_pos_for_connection(2, &mut nbs, &mut pfr);
        assert_eq!(f, t);
        assert!(!nbs && !pfr, "unused connection has no further range");
    }

    #[test]
    fn reset_part_refetches_from_assembly_front() {
        let urls: Vec<String> = (0..RAIDPARTS).map(|i| format!("http://p{}", i)).collect();
        let mut b = DirectReadBuffer::new();
        b.set_is_raid(&urls, 0, 8000, 8000, 1 << 20, false);
        b.set_unused_raid_connection(0);

        b.submit_buffer(4, FilePiece { pos: 0, buf: vec![1u8; 160] });
        assert_eq!(b.transfer_pos(4), 0);
        b.set_transfer_pos(4, 160);
        b.reset_part(4);
        assert_eq!(b.transfer_pos(4), 0, "nothing assembled: restart at window start");
        assert!(b.queues[4].is_empty());
    }

    #[test]
    fn url_count_change_rebuilds_from_delivery_front() {
        let mut b = DirectReadBuffer::new();
        b.set_is_raid(&["http://one".to_string()], 0, 200, 200, 1 << 20, false);
        b.submit_buffer(0, FilePiece { pos: 0, buf: vec![9u8; 100] });
        assert!(b.pop_output().is_some());
        assert_eq!(b.delivered, 100);

        let urls: Vec<String> = (0..RAIDPARTS).map(|i| format!("http://p{}", i)).collect();
        b.update_urls_and_reset_pos(&urls);
        assert!(b.is_raid());
        assert_eq!(b.from, 100, "rebuild starts at the delivery front");
    }
}
