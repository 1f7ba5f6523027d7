//! Track-vs-disk verification shared by the player and the streaming engine.
//!
//! The tape stores the exact size, mtime and permission bits every member had
//! at record time; offsets were computed from those values.  Any drift means
//! the precomputed layout no longer describes the bytes that would be
//! streamed, so verification fails hard instead of producing a corrupt
//! archive.

use std::path::Path;

use crate::error::TapeError;
use crate::probe;
use crate::track::Track;

/// How strictly tracks are compared against the live filesystem.
///
/// The default checks everything the recorder captured.  `permissive_mode`
/// is the explicit opt-out for callers that tolerate chmod drift on regular
/// files; size and mtime stay mandatory because the layout depends on them.
#[derive(Debug, Clone, Copy)]
pub struct IntegrityPolicy {
    check_mode: bool,
}

impl IntegrityPolicy {
    pub fn strict() -> Self {
        Self { check_mode: true }
    }

    pub fn permissive_mode() -> Self {
        Self { check_mode: false }
    }
}

impl Default for IntegrityPolicy {
    fn default() -> Self {
        Self::strict()
    }
}

/// Verify that `track` still matches the filesystem under `root`.
///
/// Directory rules: mtime must match, except for the root directory itself
/// (the tape metadata lives inside it, so recording inevitably touches it).
/// A changed directory mtime means entries were added, removed or renamed,
/// which would invalidate every following offset.
pub fn assert_track_integrity(
    root: &Path,
    track: &Track,
    policy: IntegrityPolicy,
) -> Result<(), TapeError> {
    let path = if track.rel_path.is_empty() {
        root.to_path_buf()
    } else {
        root.join(&track.rel_path)
    };

    let stats = probe::inspect(&path)
        .map_err(|e| TapeError::io(format!("probing {}", path.display()), e))?;
    let Some(st) = stats else {
        return Err(TapeError::integrity(&track.arc_path, "file missing from disk"));
    };

    if track.is_dir {
        if !st.is_dir {
            return Err(TapeError::integrity(
                &track.arc_path,
                "directory replaced by a non-directory",
            ));
        }
        if track.rel_path.is_empty() {
            // Root mtime exemption.
            return Ok(());
        }
        if st.mtime != track.mtime {
            return Err(TapeError::integrity(
                &track.arc_path,
                "directory structure changed (entries added, removed or renamed)",
            ));
        }
        return Ok(());
    }

    if track.is_symlink {
        if !st.is_symlink {
            return Err(TapeError::integrity(
                &track.arc_path,
                "symlink replaced by a non-symlink",
            ));
        }
        if st.linkname != track.linkname {
            return Err(TapeError::integrity(
                &track.arc_path,
                format!(
                    "symlink target changed: expected '{}', found '{}'",
                    track.linkname, st.linkname
                ),
            ));
        }
        return Ok(());
    }

    if !st.is_file {
        return Err(TapeError::integrity(
            &track.arc_path,
            "file replaced by a non-regular file",
        ));
    }
    if st.mtime != track.mtime {
        return Err(TapeError::integrity(
            &track.arc_path,
            "file modified (mtime changed since recording)",
        ));
    }
    if st.size != track.size {
        return Err(TapeError::integrity(
            &track.arc_path,
            format!(
                "file size changed: expected {}, found {}",
                track.size, st.size
            ),
        ));
    }
    if policy.check_mode && st.mode != track.mode {
        return Err(TapeError::integrity(
            &track.arc_path,
            format!(
                "permission bits changed: expected {:o}, found {:o}",
                track.mode, st.mode
            ),
        ));
    }

    Ok(())
}
