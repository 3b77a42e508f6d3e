//! Target placement for completed downloads: at most one rename, copies for
//! the rest, with name-collision resolution per target.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::localpath::LocalPath;

/// What to do when the target name already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetNameExistsResolution {
    /// Replace the existing file.
    OverwriteTarget,
    /// Move the existing file aside to `name (old n).ext`, then place.
    RenameExistingToOldN,
    /// Keep the existing file and place at the first free `name (n).ext`.
    RenameWithBracketedNumber,
}

/// Distributes one downloaded file to its target locations.
///
/// Copies are used while more than one target remains so the source survives
/// for the next delivery; the final delivery renames. `remove_target` lets a
/// caller abandon a delivery without stranding the rename for the rest.
#[derive(Debug)]
pub struct FileDistributor {
    source: LocalPath,
    targets_remaining: usize,
    mtime: i64,
}

impl FileDistributor {
    pub fn new(source: LocalPath, num_targets: usize, mtime: i64) -> Self {
        FileDistributor {
            source,
            targets_remaining: num_targets,
            mtime,
        }
    }

    pub fn targets_remaining(&self) -> usize {
        self.targets_remaining
    }

    /// A delivery was abandoned; stop reserving the source for it.
    pub fn remove_target(&mut self) {
        self.targets_remaining = self.targets_remaining.saturating_sub(1);
    }

    /// Place the source at `target`, resolving a name collision per
    /// `resolution`. On success `target` holds the final path (it may have
    /// gained a bracketed number). Transient filesystem failures set
    /// `transient_error` so the caller can retry later; over-long names set
    /// `name_too_long`.
    pub fn distribute_to(
        &mut self,
        target: &mut LocalPath,
        resolution: TargetNameExistsResolution,
        transient_error: &mut bool,
        name_too_long: &mut bool,
    ) -> bool {
        *transient_error = false;
        *name_too_long = false;

        let mut final_path = target.as_path().to_path_buf();
        if final_path.exists() {
            match resolution {
                TargetNameExistsResolution::OverwriteTarget => {}
                TargetNameExistsResolution::RenameExistingToOldN => {
                    let aside = first_free_variant(&final_path, "old ");
                    if let Err(e) = fs::rename(&final_path, &aside) {
                        classify(&e, transient_error, name_too_long);
                        tracing::warn!(
                            "failed to move existing target aside: {} -> {}: {}",
                            final_path.display(),
                            aside.display(),
                            e
                        );
                        return false;
                    }
                }
                TargetNameExistsResolution::RenameWithBracketedNumber => {
                    final_path = first_free_variant(&final_path, "");
                }
            }
        }

        let use_rename = self.targets_remaining <= 1;
        let result = if use_rename {
            fs::rename(self.source.as_path(), &final_path)
        } else {
            fs::copy(self.source.as_path(), &final_path).map(|_| ())
        };

        match result {
            Ok(()) => {
                // moves and copies are assumed not to alter mtime; enforce it
                let _ = filetime::set_file_mtime(
                    &final_path,
                    FileTime::from_unix_time(self.mtime, 0),
                );
                self.targets_remaining = self.targets_remaining.saturating_sub(1);
                *target = LocalPath::new(final_path);
                true
            }
            Err(e) => {
                classify(&e, transient_error, name_too_long);
                tracing::warn!(
                    "failed to distribute {} to {}: {}",
                    self.source,
                    final_path.display(),
                    e
                );
                false
            }
        }
    }
}

fn classify(e: &io::Error, transient_error: &mut bool, name_too_long: &mut bool) {
    match e.raw_os_error() {
        Some(36) | Some(63) => *name_too_long = true, // ENAMETOOLONG (linux, bsd)
        _ => {}
    }
    *transient_error = matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    );
}

/// First free `stem (marker n).ext` for n = 1, 2, ...
fn first_free_variant(path: &Path, marker: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|s| s.to_string_lossy().into_owned());
    let dir = path.parent().unwrap_or(Path::new(""));
    for n in 1u32.. {
        let name = match &ext {
            Some(ext) => format!("{} ({}{}).{}", stem, marker, n, ext),
            None => format!("{} ({}{})", stem, marker, n),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}
