//! Transfer completion: fingerprint verification and target placement.
//!
//! Downloads re-fingerprint the landed file, repair server-side fingerprints
//! where the mtime drift proves a silent set-mtime failure, then place the
//! file at every target through the distributor. Uploads verify the source
//! was not modified underneath the transfer before handing completion to the
//! metadata channel.

use std::collections::HashSet;

use crate::cache::CacheBatch;
use crate::distributor::FileDistributor;
use crate::ds::Ds;
use crate::engine::Engine;
use crate::error::ErrorCode;
use crate::fingerprint::FileFingerprint;
use crate::transfer::{Direction, TransferId, TransferState};

/// Completion retry delay while targets are pending, in deciseconds.
const COMPLETION_RETRY_DS: Ds = 11;

/// Mtime drift at most this large is attributed to filesystem resolution
/// (FAT stores 2-second mtimes) or a silent set-mtime failure, and the
/// server-side fingerprint gets corrected instead of the file failing.
const MTIME_DRIFT_TOLERANCE_SECS: i64 = 2;

impl Engine {
    /// Last byte written (download) or last chunk acknowledged (upload).
    pub fn transfer_complete(&mut self, id: TransferId, now: Ds, batch: &mut CacheBatch) {
        let Some(mut t) = self.pool.take(id) else { return };
        t.state = TransferState::Completing;
        self.app.transfer_update(&t);

        if t.direction == Direction::Get {
            tracing::debug!(
                transfer = id,
                files = t.files.len(),
                "download complete: {}",
                t.files.first().map(|f| f.name.as_str()).unwrap_or("NO_FILES")
            );

            let mut transient_error = false;

            // disconnect the temp file from the slot
            if let Some(slot) = t.slot.as_mut() {
                slot.fa = None;
            }

            // set timestamp (subsequent moves & copies must not alter mtime)
            let success = self.fs.set_mtime(&t.localfilename, t.fingerprint.mtime);
            if !success {
                transient_error = self.fs.transient_error();
                tracing::debug!(transient_error, "set_mtime failed");
            }

            // verify integrity of the file
            let mut fingerprint = FileFingerprint::default();
            let mut fixfingerprint = false;
            let mut fixedfingerprint = false;
            let syncxfer = t.files.iter().any(|f| f.is_sync());
            for f in &t.files {
                if !fixedfingerprint {
                    if let Some(nfp) = self.node_store.node_fingerprint(f.handle) {
                        if !t.fingerprint.eq_except_valid(&nfp) {
                            tracing::debug!("wrong fingerprint already fixed on the node");
                            fixedfingerprint = true;
                        }
                    }
                }
                if syncxfer && fixedfingerprint {
                    break;
                }
            }

            if !fixedfingerprint && success {
                match self.fs.fingerprint(&t.localfilename) {
                    Some(fp) => {
                        fingerprint = fp;
                        let same = fingerprint.matches(&t.fingerprint);
                        if t.fingerprint.isvalid && !same {
                            tracing::error!(
                                transfer = id,
                                "fingerprint mismatch on completed download"
                            );
                            // enforce verification for sync transfers only
                            if syncxfer
                                && (!t.badfp.isvalid || !t.badfp.matches(&fingerprint))
                            {
                                t.badfp = fingerprint;
                                t.chunkmacs.clear();
                                self.fs.unlink(&t.localfilename);
                                self.pool.insert(t);
                                self.transfer_failed(
                                    id,
                                    ErrorCode::Write.into(),
                                    0,
                                    now,
                                    batch,
                                );
                                return;
                            }
                            if (t.fingerprint.mtime - fingerprint.mtime).abs()
                                <= MTIME_DRIFT_TOLERANCE_SECS
                            {
                                tracing::debug!("marking fingerprint for server-side fix");
                                fixfingerprint = true;
                            } else {
                                tracing::warn!("silent failure in set_mtime");
                            }
                        }
                    }
                    None => {
                        if syncxfer {
                            transient_error = self.fs.transient_error();
                            tracing::debug!(
                                transient_error,
                                "unable to validate fingerprint"
                            );
                        }
                    }
                }
            }

            if !transient_error {
                if fingerprint.isvalid {
                    // set the fingerprint on source nodes where it is
                    // missing or marked for fixing
                    let mut updated: HashSet<u64> = HashSet::new();
                    for f in &t.files {
                        if f.hprivate && !f.hforeign && updated.insert(f.handle.0) {
                            let needs_fix = self
                                .node_store
                                .node_fingerprint(f.handle)
                                .map_or(false, |nfp| {
                                    (!nfp.isvalid || fixfingerprint)
                                        && !fingerprint.matches(&nfp)
                                });
                            if needs_fix && fingerprint.size == t.size {
                                tracing::debug!(handle = %f.handle, "fixing node fingerprint");
                                self.node_store.update_node_fingerprint(f.handle, fingerprint);
                            }
                        }
                    }
                }

                // place the file in all target locations: up to one rename,
                // copies for the rest
                let mut distributor = t.download_distributor.take().unwrap_or_else(|| {
                    FileDistributor::new(
                        t.localfilename.clone(),
                        t.files.len(),
                        t.fingerprint.mtime,
                    )
                });

                let mut i = 0;
                while i < t.files.len() {
                    if t.files[i].is_sync() {
                        // sync items are passed to the sync thread below
                        i += 1;
                        continue;
                    }

                    let mut finalpath = t.files[i].localname.clone();
                    let mut file_transient = false;
                    let mut name_too_long = false;
                    let resolution = t.files[i].collision.to_target_resolution();
                    let placed = distributor.distribute_to(
                        &mut finalpath,
                        resolution,
                        &mut file_transient,
                        &mut name_too_long,
                    );

                    if placed {
                        // so the app may report an accurate final name
                        t.files[i].localname = finalpath;
                        let f = t.files.remove(i);
                        self.app.file_complete(&f);
                        continue;
                    }
                    if file_transient {
                        tracing::debug!("transient error completing file");
                        i += 1;
                        continue;
                    }
                    if !t.files[i].wants_retry(ErrorCode::Again, t.failcount) {
                        tracing::warn!("unable to complete transfer due to a persistent error");
                        let mut f = t.files.remove(i);
                        distributor.remove_target();
                        self.app.file_removed(&f, ErrorCode::Write.into());
                        f.terminated(ErrorCode::Write);
                        continue;
                    }
                    t.failcount += 1;
                    tracing::debug!(failcount = t.failcount, "persistent error completing file");
                    if name_too_long {
                        tracing::warn!("error is: name too long");
                    }
                    i += 1;
                }

                // the file itself is placed; sync targets copy (or move)
                // from the distributor on the sync thread
                let mut i = 0;
                while i < t.files.len() {
                    if t.files[i].is_sync() {
                        let f = t.files.remove(i);
                        self.app.file_complete(&f);
                        self.sync.handoff_download(&f);
                    } else {
                        i += 1;
                    }
                }

                if !t.files.is_empty() {
                    t.download_distributor = Some(distributor);
                }
            }

            if t.files.is_empty() {
                t.state = TransferState::Completed;
                t.finished = true;
                self.app.transfer_complete(&t);
                // the payload has been distributed; nothing to clean up
                t.localfilename.clear();
                self.destroy_transfer(t, batch);
            } else {
                // some files still pending; close the handle and retry soon
                tracing::debug!(pending = t.files.len(), "files pending completion");
                if let Some(slot) = t.slot.as_mut() {
                    slot.fa = None;
                    slot.retrying = true;
                    slot.retrybt.backoff_for(now, COMPLETION_RETRY_DS);
                }
                self.pool.insert(t);
            }
        } else {
            tracing::debug!(
                transfer = id,
                files = t.files.len(),
                "upload complete: {}",
                t.files.first().map(|f| f.name.as_str()).unwrap_or("NO_FILES")
            );

            if let Some(slot) = t.slot.as_mut() {
                slot.fa = None;
            }

            // files must not change during a PUT transfer
            let mut i = 0;
            while i < t.files.len() {
                let localpath = t.files[i].localname.clone();
                tracing::debug!("verifying upload: {}", localpath);

                let info = self.fs.open_info(&localpath);
                if !info.fopen_succeeded && self.fs.transient_error() {
                    tracing::warn!("retrying upload completion due to a transient error");
                    if let Some(slot) = t.slot.as_mut() {
                        slot.retrying = true;
                        slot.retrybt.backoff_for(now, COMPLETION_RETRY_DS);
                    }
                    self.pool.insert(t);
                    return;
                }

                let fingerprint_changed = info.fopen_succeeded
                    && self
                        .fs
                        .fingerprint(&localpath)
                        .map_or(false, |fp| !fp.matches(&t.fingerprint));
                let gone_and_not_sync = !t.files[i].is_sync() && !info.fopen_succeeded;

                if gone_and_not_sync || fingerprint_changed {
                    if gone_and_not_sync {
                        tracing::warn!("deletion detected after upload");
                    } else {
                        tracing::warn!("modification detected after upload: {}", localpath);
                    }
                    let mut f = t.files.remove(i);
                    self.app.file_removed(&f, ErrorCode::Read.into());
                    f.terminated(ErrorCode::Read);
                } else {
                    i += 1;
                }
            }

            if t.files.is_empty() {
                self.pool.insert(t);
                self.transfer_failed(id, ErrorCode::Read.into(), 0, now, batch);
                return;
            }

            // completion continues on the metadata channel (file attributes
            // and putnodes); the app calls complete_files when it finishes
            self.app.upload_completing(&t);
            self.pool.insert(t);
        }
    }

    /// The metadata channel finished: notify every file and let the
    /// transfer wind down.
    pub fn complete_files(&mut self, id: TransferId, batch: &mut CacheBatch) {
        let files = match self.pool.get_mut(id) {
            Some(t) => std::mem::take(&mut t.files),
            None => return,
        };
        for f in &files {
            self.app.file_complete(f);
        }
        self.remove_and_destroy(id, TransferState::Completed, batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::NodeStore;
    use crate::fsaccess::FsAccess;
    use crate::localpath::LocalPath;
    use crate::transfer::{CollisionResolution, File, TargetKind};
    use std::path::Path;

    fn write(path: &Path, contents: &[u8]) {
        std::fs::write(path, contents).unwrap();
    }

    fn download_engine(
        source: &Path,
        targets: &[(&Path, TargetKind)],
    ) -> (Engine, TransferId) {
        let mut eng = Engine::new(EngineConfig::default());
        let id = eng.create_transfer(Direction::Get);
        let mut batch = CacheBatch::new();
        {
            let t = eng.pool.get_mut(id).unwrap();
            t.localfilename = LocalPath::new(source.to_path_buf());
            for (p, kind) in targets {
                let mut f = File::new(*kind, "f", LocalPath::new(p.to_path_buf()));
                f.collision = CollisionResolution::Overwrite;
                t.files.push(f);
            }
        }
        eng.addtransfer(id, false, &mut batch);
        (eng, id)
    }

    #[test]
    fn download_distributes_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("dl.part");
        write(&src, b"content!");
        let t1 = dir.path().join("out1.bin");
        let t2 = dir.path().join("out2.bin");

        let (mut eng, id) = download_engine(
            &src,
            &[(&t1, TargetKind::Download), (&t2, TargetKind::Download)],
        );
        {
            // the transfer believes exactly what is on disk
            let fp = FileFingerprint::from_file(&src).unwrap();
            let t = eng.pool.get_mut(id).unwrap();
            t.fingerprint = fp;
            t.size = fp.size;
        }
        let mut batch = CacheBatch::new();
        eng.transfer_complete(id, 0, &mut batch);

        assert!(eng.pool.get(id).is_none(), "transfer completed and destroyed");
        assert_eq!(std::fs::read(&t1).unwrap(), b"content!");
        assert_eq!(std::fs::read(&t2).unwrap(), b"content!");
        assert!(!src.exists(), "source renamed into the last target");
    }

    #[test]
    fn sync_fingerprint_mismatch_fails_with_ewrite() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("dl.part");
        write(&src, b"actual bytes");
        let target = dir.path().join("synced.bin");

        let (mut eng, id) = download_engine(&src, &[(&target, TargetKind::SyncDownload)]);
        {
            let t = eng.pool.get_mut(id).unwrap();
            // expected fingerprint deliberately wrong, mtime far off
            t.fingerprint = FileFingerprint {
                size: 999,
                mtime: 1,
                crc: [9, 9, 9, 9],
                isvalid: true,
            };
            t.size = 999;
        }
        let mut batch = CacheBatch::new();
        eng.transfer_complete(id, 0, &mut batch);

        assert!(eng.pool.get(id).is_none(), "transfer failed and destroyed");
        assert!(!src.exists(), "mismatched sync download is deleted");
        assert!(!target.exists());
    }

    struct FixRecorder {
        node_fp: FileFingerprint,
        fixed: std::rc::Rc<std::cell::RefCell<Vec<u64>>>,
    }
    impl NodeStore for FixRecorder {
        fn node_fingerprint(&self, _h: crate::record::NodeHandle) -> Option<FileFingerprint> {
            Some(self.node_fp)
        }
        fn update_node_fingerprint(
            &mut self,
            h: crate::record::NodeHandle,
            _fp: FileFingerprint,
        ) {
            self.fixed.borrow_mut().push(h.0);
        }
    }

    /// Pretends set_mtime worked without touching the file, the failure mode
    /// the mtime-drift tolerance exists for.
    struct LyingFs(crate::fsaccess::StdFs);
    impl crate::fsaccess::FsAccess for LyingFs {
        fn set_mtime(&mut self, _path: &LocalPath, _mtime: i64) -> bool {
            true
        }
        fn unlink(&mut self, path: &LocalPath) -> bool {
            self.0.unlink(path)
        }
        fn fingerprint(&mut self, path: &LocalPath) -> Option<FileFingerprint> {
            self.0.fingerprint(path)
        }
        fn open_info(&mut self, path: &LocalPath) -> crate::fsaccess::OpenInfo {
            self.0.open_info(path)
        }
        fn transient_error(&self) -> bool {
            self.0.transient_error()
        }
    }

    #[test]
    fn silent_mtime_failure_fixes_node_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("dl.part");
        write(&src, b"some data here");
        filetime::set_file_mtime(&src, filetime::FileTime::from_unix_time(1_600_000_000, 0))
            .unwrap();
        let target = dir.path().join("out.bin");

        let (mut eng, id) = download_engine(&src, &[(&target, TargetKind::Download)]);
        let on_disk = FileFingerprint::from_file(&src).unwrap();
        // recorded fingerprint is 2s off: within the drift tolerance
        let recorded = FileFingerprint {
            mtime: on_disk.mtime + 2,
            ..on_disk
        };
        let fixed = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        eng.node_store = Box::new(FixRecorder {
            node_fp: recorded,
            fixed: fixed.clone(),
        });
        eng.fs = Box::new(LyingFs(crate::fsaccess::StdFs::new()));
        {
            let t = eng.pool.get_mut(id).unwrap();
            t.fingerprint = recorded;
            t.size = recorded.size;
            t.files[0].handle = crate::record::NodeHandle::new(42);
        }
        let mut batch = CacheBatch::new();
        eng.transfer_complete(id, 0, &mut batch);
        assert_eq!(
            &*fixed.borrow(),
            &[42],
            "drifted fingerprint must be corrected server-side"
        );
        assert!(eng.pool.get(id).is_none(), "transfer still completes");
    }

    #[test]
    fn upload_source_drift_removes_file_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("up.bin");
        write(&src, b"uploaded content");

        let mut eng = Engine::new(EngineConfig::default());
        let id = eng.create_transfer(Direction::Put);
        let mut batch = CacheBatch::new();
        {
            let t = eng.pool.get_mut(id).unwrap();
            let f = File::new(TargetKind::Upload, "u", LocalPath::new(src.clone()));
            t.files.push(f);
            // fingerprint recorded before the file changed
            t.fingerprint = FileFingerprint {
                size: 3,
                mtime: 1,
                crc: [1, 2, 3, 4],
                isvalid: true,
            };
        }
        eng.addtransfer(id, false, &mut batch);
        eng.transfer_complete(id, 0, &mut batch);
        assert!(
            eng.pool.get(id).is_none(),
            "all files dropped => transfer fails with EREAD"
        );
    }

    #[test]
    fn upload_unchanged_source_reaches_metadata_channel() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("up.bin");
        write(&src, b"stable");

        let mut eng = Engine::new(EngineConfig::default());
        let id = eng.create_transfer(Direction::Put);
        let mut batch = CacheBatch::new();
        {
            let fp = FileFingerprint::from_file(&src).unwrap();
            let t = eng.pool.get_mut(id).unwrap();
            t.files
                .push(File::new(TargetKind::Upload, "u", LocalPath::new(src.clone())));
            t.fingerprint = fp;
            t.size = fp.size;
        }
        eng.addtransfer(id, false, &mut batch);
        eng.transfer_complete(id, 0, &mut batch);

        let t = eng.pool.get(id).expect("waiting on the metadata channel");
        assert_eq!(t.state, TransferState::Completing);
        assert_eq!(t.files.len(), 1);

        eng.complete_files(id, &mut batch);
        assert!(eng.pool.get(id).is_none());
    }
}
