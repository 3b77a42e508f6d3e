//! File content identity: size, modification time and a sparse CRC.
//!
//! The fingerprint doubles as the queue key for transfers and as the
//! integrity check after a download lands on disk. The CRC is sparse so that
//! fingerprinting a multi-gigabyte file costs a handful of reads.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::record::{RecordError, RecordReader, RecordWriter};

/// Number of CRC words in a fingerprint.
pub const CRC_WORDS: usize = 4;
/// Probe length for the sparse scheme on large files.
const PROBE_LEN: u64 = 256;
/// Probes per CRC word on large files.
const PROBES_PER_WORD: u64 = 8;
/// Files up to this size are CRC'd in four contiguous bands.
const MAX_FULL: u64 = CRC_WORDS as u64 * PROBES_PER_WORD * PROBE_LEN;

/// {size, mtime, sparse CRC} identifying file contents.
///
/// `isvalid` distinguishes a computed fingerprint from a default/unknown one;
/// two fingerprints compare equal only when all fields including the flag
/// match, while [`FileFingerprint::eq_except_valid`] ignores the flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFingerprint {
    pub size: u64,
    pub mtime: i64,
    pub crc: [u32; CRC_WORDS],
    pub isvalid: bool,
}

impl Default for FileFingerprint {
    fn default() -> Self {
        FileFingerprint {
            size: 0,
            mtime: 0,
            crc: [0; CRC_WORDS],
            isvalid: false,
        }
    }
}

impl FileFingerprint {
    /// Compare content identity, ignoring the validity flag.
    pub fn eq_except_valid(&self, other: &FileFingerprint) -> bool {
        self.size == other.size && self.mtime == other.mtime && self.crc == other.crc
    }

    /// Lenient equality: when either side is not valid, the CRC cannot be
    /// compared and size plus mtime decide.
    pub fn matches(&self, other: &FileFingerprint) -> bool {
        if self.size != other.size || self.mtime != other.mtime {
            return false;
        }
        if !self.isvalid || !other.isvalid {
            return true;
        }
        self.crc == other.crc
    }

    /// Key usable in per-direction multimaps; excludes the validity flag.
    pub fn key(&self) -> FingerprintKey {
        FingerprintKey {
            size: self.size,
            mtime: self.mtime,
            crc: self.crc,
        }
    }

    /// Fingerprint an on-disk file (size and mtime from metadata, CRC from
    /// its contents).
    pub fn from_file(path: &Path) -> Result<FileFingerprint> {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let mut f = File::open(path)
            .with_context(|| format!("open {}", path.display()))?;
        let crc = sparse_crc(&mut f, meta.len())?;
        Ok(FileFingerprint {
            size: meta.len(),
            mtime,
            crc,
            isvalid: true,
        })
    }

    pub fn serialize(&self, w: &mut RecordWriter) {
        w.put_u64(self.size);
        w.put_i64(self.mtime);
        for c in self.crc {
            w.put_u32(c);
        }
        w.put_u8(self.isvalid as u8);
    }

    pub fn unserialize(r: &mut RecordReader) -> Result<FileFingerprint, RecordError> {
        let size = r.get_u64()?;
        let mtime = r.get_i64()?;
        let mut crc = [0u32; CRC_WORDS];
        for c in crc.iter_mut() {
            *c = r.get_u32()?;
        }
        let isvalid = r.get_u8()? != 0;
        Ok(FileFingerprint {
            size,
            mtime,
            crc,
            isvalid,
        })
    }
}

/// Hashable content key (size, mtime, CRC) for fingerprint-indexed maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FingerprintKey {
    pub size: u64,
    pub mtime: i64,
    pub crc: [u32; CRC_WORDS],
}

/// Compute the sparse CRC words over `size` bytes of `data`.
///
/// Three regimes:
/// - up to 16 bytes: the raw bytes themselves, little-endian, zero padded;
/// - up to 8 KiB: four contiguous bands, one CRC32 each;
/// - larger: per CRC word, eight 256-byte probes spaced evenly over the file.
pub fn sparse_crc<R: Read + Seek>(data: &mut R, size: u64) -> Result<[u32; CRC_WORDS]> {
    let mut crc = [0u32; CRC_WORDS];

    if size <= 16 {
        let mut raw = [0u8; 16];
        data.seek(SeekFrom::Start(0))?;
        data.read_exact(&mut raw[..size as usize])?;
        for (i, word) in crc.iter_mut().enumerate() {
            *word = u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
        }
        return Ok(crc);
    }

    if size <= MAX_FULL {
        let band = size / CRC_WORDS as u64;
        for (i, word) in crc.iter_mut().enumerate() {
            let start = i as u64 * band;
            let end = if i == CRC_WORDS - 1 { size } else { start + band };
            let mut buf = vec![0u8; (end - start) as usize];
            data.seek(SeekFrom::Start(start))?;
            data.read_exact(&mut buf)?;
            *word = crc32fast::hash(&buf);
        }
        return Ok(crc);
    }

    let probes = CRC_WORDS as u64 * PROBES_PER_WORD;
    let mut buf = [0u8; PROBE_LEN as usize];
    for (i, word) in crc.iter_mut().enumerate() {
        let mut hasher = crc32fast::Hasher::new();
        for p in 0..PROBES_PER_WORD {
            let k = i as u64 * PROBES_PER_WORD + p;
            let offset = (size - PROBE_LEN) * k / (probes - 1);
            data.seek(SeekFrom::Start(offset))?;
            data.read_exact(&mut buf)?;
            hasher.update(&buf);
        }
        *word = hasher.finalize();
    }
    Ok(crc)
}
