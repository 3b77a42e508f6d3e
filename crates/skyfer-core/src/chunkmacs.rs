//! Per-transfer map of chunk offsets to MAC fragments.
//!
//! Chunks ramp from 128 KiB up to 1 MiB (eight steps) and stay at 1 MiB
//! after that. Progress is never stored separately: the contiguous finished
//! prefix and the completed byte count are both derived from this map, so a
//! resumed transfer picks up exactly where its MACs prove it left off.

use std::collections::BTreeMap;

use crate::raid::RAIDLINE;
use crate::record::{RecordError, RecordReader, RecordWriter};

/// MAC fragment length per chunk.
pub const MAC_LEN: usize = 16;

const KIB: u64 = 1024;
const RAMP_STEP: u64 = 128 * KIB;
const MAX_CHUNK: u64 = 1024 * KIB;
/// Boundary after the last ramp chunk: 128K * (1+2+...+8).
const RAMP_END: u64 = 4608 * KIB;

/// Smallest chunk boundary strictly greater than `p`, capped at `size`.
pub fn chunk_ceil(p: u64, size: u64) -> u64 {
    let bound = if p >= RAMP_END {
        RAMP_END + ((p - RAMP_END) / MAX_CHUNK + 1) * MAX_CHUNK
    } else {
        let mut b = 0u64;
        let mut delta = RAMP_STEP;
        while b <= p {
            b += delta;
            delta = (delta + RAMP_STEP).min(MAX_CHUNK);
        }
        b
    };
    bound.min(size)
}

/// Largest chunk boundary less than or equal to `p`.
pub fn chunk_floor(p: u64) -> u64 {
    if p >= RAMP_END {
        return RAMP_END + ((p - RAMP_END) / MAX_CHUNK) * MAX_CHUNK;
    }
    let mut b = 0u64;
    let mut delta = RAMP_STEP;
    while b + delta <= p {
        b += delta;
        delta = (delta + RAMP_STEP).min(MAX_CHUNK);
    }
    b
}

/// One chunk's MAC fragment and completion flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMac {
    pub mac: [u8; MAC_LEN],
    pub finished: bool,
}

/// Ordered map from chunk start offset to MAC fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkMacMap {
    macs: BTreeMap<u64, ChunkMac>,
}

impl ChunkMacMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.macs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.macs.len()
    }

    pub fn clear(&mut self) {
        self.macs.clear();
    }

    pub fn insert(&mut self, chunk_start: u64, mac: ChunkMac) {
        self.macs.insert(chunk_start, mac);
    }

    pub fn get(&self, chunk_start: u64) -> Option<&ChunkMac> {
        self.macs.get(&chunk_start)
    }

    /// Derive `(pos, progresscompleted)` for a transfer of `size` bytes.
    ///
    /// `pos` is the end of the contiguous finished prefix; the completed
    /// count sums every finished chunk regardless of position.
    pub fn calc_progress(&self, size: u64) -> (u64, u64) {
        let mut pos = 0u64;
        let mut completed = 0u64;
        for (&start, cm) in &self.macs {
            if !cm.finished {
                continue;
            }
            let end = chunk_ceil(start, size);
            completed += end.saturating_sub(start);
            if start == pos {
                pos = end;
            }
        }
        (pos, completed)
    }

    /// Keep only finished chunks entirely below the largest RAID-line
    /// boundary at or under `pos`; everything else is dropped. Returns the
    /// boundary used. Needed when a transfer that started against a single
    /// URL resumes against a six-part set: part fetches are line-aligned, so
    /// a non-aligned tail cannot be credited.
    pub fn truncate_to_raidline(&mut self, pos: u64) -> u64 {
        let boundary = pos - pos % RAIDLINE as u64;
        self.macs.retain(|&start, cm| {
            cm.finished && start < boundary && chunk_ceil(start, u64::MAX) <= boundary
        });
        boundary
    }

    pub fn serialize(&self, w: &mut RecordWriter) {
        w.put_u32(self.macs.len() as u32);
        for (&start, cm) in &self.macs {
            w.put_u64(start);
            w.put_bytes(&cm.mac);
            w.put_u8(cm.finished as u8);
        }
    }

    pub fn unserialize(r: &mut RecordReader) -> Result<ChunkMacMap, RecordError> {
        let count = r.get_u32()?;
        let mut macs = BTreeMap::new();
        for _ in 0..count {
            let start = r.get_u64()?;
            let mut mac = [0u8; MAC_LEN];
            mac.copy_from_slice(r.get_bytes(MAC_LEN)?);
            let finished = r.get_u8()? != 0;
            macs.insert(start, ChunkMac { mac, finished });
        }
        Ok(ChunkMacMap { macs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const K: u64 = 1024;

    fn finished(mac_byte: u8) -> ChunkMac {
        ChunkMac {
            mac: [mac_byte; MAC_LEN],
            finished: true,
        }
    }

    #[test]
    fn chunk_boundaries_ramp_then_flatten() {
        assert_eq!(chunk_ceil(0, u64::MAX), 128 * K);
        assert_eq!(chunk_ceil(128 * K, u64::MAX), 384 * K);
        assert_eq!(chunk_ceil(384 * K, u64::MAX), 768 * K);
        assert_eq!(chunk_ceil(4608 * K - 1, u64::MAX), 4608 * K);
        assert_eq!(chunk_ceil(4608 * K, u64::MAX), 5632 * K);
        assert_eq!(chunk_ceil(5632 * K, u64::MAX), 6656 * K);
    }

    #[test]
    fn chunk_floor_inverts_ceil() {
        for p in [0, 1, 128 * K, 400 * K, 4608 * K, 5000 * K, 10_000 * K] {
            let f = chunk_floor(p);
            assert!(f <= p);
            assert!(chunk_ceil(f, u64::MAX) > p || f == p);
        }
    }

    #[test]
    fn ceil_caps_at_size() {
        assert_eq!(chunk_ceil(0, 1000), 1000);
        assert_eq!(chunk_ceil(128 * K, 200 * K), 200 * K);
    }

    #[test]
    fn progress_from_contiguous_prefix() {
        let mut m = ChunkMacMap::new();
        let size = 10_000 * K;
        m.insert(0, finished(1));
        m.insert(128 * K, finished(2));
        // gap at 384K..768K
        m.insert(768 * K, finished(3));
        let (pos, completed) = m.calc_progress(size);
        assert_eq!(pos, 384 * K, "pos stops at the first gap");
        assert_eq!(completed, 128 * K + 256 * K + 512 * K);
    }

    #[test]
    fn unfinished_chunks_do_not_count() {
        let mut m = ChunkMacMap::new();
        m.insert(
            0,
            ChunkMac {
                mac: [9; MAC_LEN],
                finished: false,
            },
        );
        let (pos, completed) = m.calc_progress(1024 * K);
        assert_eq!(pos, 0);
        assert_eq!(completed, 0);
    }

    #[test]
    fn truncate_to_raidline_drops_tail() {
        let mut m = ChunkMacMap::new();
        m.insert(0, finished(1));
        m.insert(128 * K, finished(2));
        let pos = 384 * K + 50; // not line-aligned
        let boundary = m.truncate_to_raidline(pos);
        assert_eq!(boundary % RAIDLINE as u64, 0);
        assert!(boundary <= pos);
        // both chunks end at 384K <= boundary, so they survive
        assert_eq!(m.len(), 2);
        let (p, _) = m.calc_progress(10_000 * K);
        assert!(p <= boundary);
    }

    #[test]
    fn serialize_roundtrip() {
        let mut m = ChunkMacMap::new();
        m.insert(0, finished(0xAA));
        m.insert(
            128 * K,
            ChunkMac {
                mac: [0xBB; MAC_LEN],
                finished: false,
            },
        );
        let mut w = RecordWriter::new();
        m.serialize(&mut w);
        let data = w.into_bytes();
        let mut r = RecordReader::new(&data);
        let back = ChunkMacMap::unserialize(&mut r).unwrap();
        assert_eq!(m, back);
        assert!(!r.has_data_left());
    }
}
