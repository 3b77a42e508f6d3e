//! Transfer failure classification: backoff, defer or destroy.
//!
//! A failed attempt notifies every file and collects whether any of them
//! wants the transfer kept alive; the transfer dies only when the verdict is
//! unanimous. Quota and paywall states flip the engine into overquota mode
//! instead of burning retries.

use crate::cache::CacheBatch;
use crate::ds::{Ds, NEVER};
use crate::engine::Engine;
use crate::error::{ApiError, ErrorCode};
use crate::transfer::{Direction, TransferId, TransferState};

impl Engine {
    /// Transfer attempt failed. `timeleft` (deciseconds, 0 = none) carries a
    /// server-supplied wait, e.g. the end of a bandwidth quota window.
    pub fn transfer_failed(
        &mut self,
        id: TransferId,
        e: ApiError,
        timeleft: Ds,
        now: Ds,
        batch: &mut CacheBatch,
    ) {
        let Some(mut t) = self.pool.take(id) else { return };
        let code = e.code;
        let mut defer = false;

        tracing::debug!(transfer = id, %e, "transfer failed");

        let eargs_class = code == ErrorCode::Args
            || (code == ErrorCode::Blocked && t.direction == Direction::Get)
            || (code == ErrorCode::TooMany && t.direction == Direction::Get && e.extra_info)
            || code == ErrorCode::SubUserKeyMissing;

        if code == ErrorCode::OverQuota || code == ErrorCode::Paywall {
            if t.slot.is_none() {
                t.bt.backoff_for(now, if timeleft != 0 { timeleft } else { NEVER });
                self.activate_overquota(now, timeleft, code == ErrorCode::Paywall);
                self.app.transfer_failed(&t, e, timeleft);
            } else {
                let all_foreign_targets = t.files.iter().all(|f| f.hforeign);
                // if all targets are foreign and this isn't a bandwidth
                // overquota, the transfer must fail; otherwise enter
                // overquota mode
                if timeleft == 0 && all_foreign_targets {
                    self.app.transfer_failed(&t, e, 0);
                } else {
                    t.bt.backoff_for(now, if timeleft != 0 { timeleft } else { NEVER });
                    self.activate_overquota(now, timeleft, code == ErrorCode::Paywall);
                }
            }
        } else if eargs_class {
            self.app.transfer_failed(&t, e, 0);
        } else if code != ErrorCode::BusinessPastDue {
            t.bt.backoff(now);
            t.state = TransferState::Retrying;
            self.app.transfer_failed(&t, e, timeleft);
        }

        let mut i = 0;
        while i < t.files.len() {
            // storage overquota: targets in someone else's storage cannot
            // recover by waiting, drop them
            if code == ErrorCode::OverQuota && timeleft == 0 && t.files[i].hforeign {
                let mut f = t.files.remove(i);
                self.app.file_removed(&f, e);
                f.terminated(code);
                continue;
            }

            // invalid target handle: sync targets defer (the sync engine
            // will drop the folder itself), app targets are removed now
            if eargs_class {
                if t.files[i].is_sync() && code == ErrorCode::Args {
                    defer = true;
                    i += 1;
                } else {
                    let mut f = t.files.remove(i);
                    self.app.file_removed(&f, e);
                    f.terminated(code);
                }
                continue;
            }

            if (t.files[i].wants_retry(code, t.failcount) && code != ErrorCode::BusinessPastDue)
                || (code == ErrorCode::NotFound // file-storage server unavailable
                    && t.direction == Direction::Put
                    && t.tempurls.is_empty()
                    && t.failcount < 16)
            {
                defer = true;
            }
            i += 1;
        }

        t.tempurls.clear();
        if t.direction == Direction::Put {
            t.chunkmacs.clear();
            t.progresscompleted = 0;
            t.ultoken = None;
            t.pos = 0;

            if let Some(fa) = t.slot.as_ref().and_then(|s| s.fa.as_ref()) {
                if !fa.fopen_succeeded {
                    tracing::warn!("fopen failed for upload");
                    defer = false;
                } else if fa.mtime != t.fingerprint.mtime || fa.size != t.size {
                    tracing::warn!(
                        size = t.size,
                        mtime = t.fingerprint.mtime,
                        fa_size = fa.size,
                        fa_mtime = fa.mtime,
                        "modification detected during active upload"
                    );
                    defer = false;
                }
            }
        }

        if defer {
            t.failcount += 1;
            t.slot = None;
            batch.put(t.id, t.direction.tag(), t.serialize());
            tracing::debug!(
                transfer = id,
                failcount = t.failcount,
                retry_in_ds = t.bt.retry_in(now),
                "deferring transfer"
            );
            self.pool.insert(t);
        } else {
            tracing::debug!(transfer = id, "removing transfer");
            t.state = TransferState::Failed;
            t.finished = true;

            if code == ErrorCode::BusinessPastDue {
                tracing::debug!("disabling syncs: business account past due");
                self.sync.disable_syncs(code);
            }

            let is_put = t.direction == Direction::Put;
            for f in &mut t.files {
                if f.is_sync()
                    && code != ErrorCode::BusinessPastDue
                    && code != ErrorCode::OverQuota
                    && code != ErrorCode::Paywall
                {
                    // have the sync look at that folder again so it doesn't
                    // just recreate the same transfer
                    if let Some(parent) = f.localname.parent() {
                        self.sync.trigger_scan(&parent, is_put);
                    }
                }
                self.app.file_removed(f, e);
                f.terminated(code);
            }
            self.app.transfer_removed(&t);
            self.destroy_transfer(t, batch);
        }
    }
}
