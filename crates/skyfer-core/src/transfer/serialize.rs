//! Byte-exact persisted record for a transfer.
//!
//! Stable little-endian sequential fields; version 1 appends eight expansion
//! flag bytes. Round-trip compatibility with existing caches is required, so
//! field order and widths here must never change; new data goes behind a
//! fresh expansion flag.

use crate::chunkmacs::ChunkMacMap;
use crate::config::EngineConfig;
use crate::fingerprint::FileFingerprint;
use crate::localpath::LocalPath;
use crate::raid::RAIDPARTS;
use crate::record::{RecordError, RecordReader, RecordWriter};
use crate::transfer::{
    Direction, Transfer, TransferId, TransferState, FILEKEY_LEN, TRANSFERKEY_LEN,
    UPLOAD_TOKEN_LEN,
};

const RECORD_VERSION: u8 = 1;

impl Transfer {
    /// Serialize to the persisted record layout.
    pub fn serialize(&self) -> Vec<u8> {
        debug_assert!(self.localfilename.is_empty() || self.localfilename.is_absolute());

        let mut w = RecordWriter::new();
        w.put_u8(self.direction.tag());
        w.put_blob16(&self.localfilename.serialize());
        w.put_bytes(&self.filekey);
        w.put_i64(self.ctriv);
        w.put_i64(self.metamac);
        w.put_bytes(&self.transferkey);
        self.chunkmacs.serialize(&mut w);
        self.fingerprint.serialize(&mut w);
        self.badfp.serialize(&mut w);
        w.put_i64(self.lastaccesstime);

        match &self.ultoken {
            Some(token) => {
                w.put_u8(2);
                w.put_bytes(token);
            }
            None => w.put_u8(0),
        }

        // raid URL strings share the record slot with the single-URL form,
        // NUL-delimited when there are six
        let mut combined = Vec::new();
        for (i, url) in self.tempurls.iter().enumerate() {
            if i > 0 {
                combined.push(0u8);
            }
            combined.extend_from_slice(url.as_bytes());
        }
        w.put_blob16(&combined);

        w.put_u8(self.state.tag());
        w.put_u64(self.priority);
        w.put_u8(RECORD_VERSION);
        w.put_expansion_flags(&[self.download_file_handle.is_some(), true, true]);
        if let Some(h) = self.download_file_handle {
            w.put_node_handle(h);
        }
        w.put_u8(self.discarded_temp_urls);

        w.into_bytes()
    }

    /// Restore a transfer from its persisted record.
    ///
    /// Fails cleanly on an unknown direction, truncated fields, a legacy
    /// upload-token form, or a URL count that is neither 0, 1 nor 6. Only
    /// the PAUSED state survives a restart; everything else restores as NONE.
    pub fn unserialize(
        id: TransferId,
        data: &[u8],
        cfg: &EngineConfig,
    ) -> Result<Transfer, RecordError> {
        let mut r = RecordReader::new(data);

        let direction = Direction::from_tag(r.get_u8()?).ok_or(RecordError { field: 0 })?;
        let path_blob = r.get_blob16()?.to_vec();

        let mut t = Transfer::new(id, direction, cfg);

        t.filekey.copy_from_slice(r.get_bytes(FILEKEY_LEN)?);
        t.ctriv = r.get_i64()?;
        t.metamac = r.get_i64()?;
        t.transferkey.copy_from_slice(r.get_bytes(TRANSFERKEY_LEN)?);
        t.chunkmacs = ChunkMacMap::unserialize(&mut r)?;
        t.fingerprint = FileFingerprint::unserialize(&mut r)?;
        t.badfp = FileFingerprint::unserialize(&mut r)?;
        t.lastaccesstime = r.get_i64()?;

        let has_ultoken = r.get_u8()?;
        match has_ultoken {
            0 => {}
            2 => {
                let mut token = [0u8; UPLOAD_TOKEN_LEN];
                token.copy_from_slice(r.get_bytes(UPLOAD_TOKEN_LEN)?);
                t.ultoken = Some(token);
            }
            // value 1 was the pre-2016 short token; those records are dead
            _ => return Err(RecordError { field: r.field() }),
        }

        let combined = r.get_blob16()?.to_vec();
        let state_tag = r.get_u8()?;
        t.priority = r.get_u64()?;
        let version = r.get_u8()?;

        let mut flags = [0u8; 8];
        if version > 0 {
            flags = r.get_expansion_flags()?;
        }
        if flags[0] != 0 {
            t.download_file_handle = Some(r.get_node_handle()?);
        }
        if flags[1] != 0 {
            t.discarded_temp_urls = r.get_u8()?;
        }
        r.expect_end()?;

        if !path_blob.is_empty() {
            if flags[2] != 0 {
                if let Some(p) = LocalPath::unserialize(&path_blob) {
                    t.localfilename = p;
                }
            } else {
                t.localfilename = LocalPath::from_platform_encoded(&path_blob);
            }
        }

        if !combined.is_empty() {
            t.tempurls = combined
                .split(|&b| b == 0)
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect();
        }
        if !t.tempurls.is_empty() && t.tempurls.len() != 1 && t.tempurls.len() != RAIDPARTS {
            tracing::error!("transfer record has {} temp URLs", t.tempurls.len());
            return Err(RecordError { field: r.field() });
        }

        if TransferState::from_tag(state_tag) == Some(TransferState::Paused) {
            tracing::debug!("restoring paused transfer");
            t.state = TransferState::Paused;
        }

        t.recalc_progress();
        Ok(t)
    }
}
