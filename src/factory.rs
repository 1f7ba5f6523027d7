//! Turns a probe result into an inventory [`Track`].
//!
//! The factory is the single place that decides what ends up in a record:
//! which entry types are supported, when the size is forced to zero, and
//! whether the owner identity is anonymized.

use std::io;
use std::path::Path;

use crate::probe;
use crate::track::Track;

/// Inspect `source_path` and build a [`Track`] for it.
///
/// Returns `Ok(None)` when the path vanished between listing and stat, or
/// when it is an unsupported type (socket, fifo, device).
///
/// With `anonymize` (the default policy), uid/gid are forced to 0 and both
/// owner names to `root`, so tapes recorded on different hosts with
/// different account databases stay byte-identical.
pub fn create_track(
    source_path: &Path,
    rel_path: &str,
    arc_path: &str,
    anonymize: bool,
) -> io::Result<Option<Track>> {
    let Some(stats) = probe::inspect(source_path)? else {
        return Ok(None);
    };
    if !(stats.is_dir || stats.is_file || stats.is_symlink) {
        return Ok(None);
    }

    // Directories and symlinks occupy a header block only.
    let size = if stats.is_dir || stats.is_symlink {
        0
    } else {
        stats.size
    };

    Ok(Some(Track {
        arc_path: arc_path.to_owned(),
        rel_path: rel_path.to_owned(),
        size,
        mtime: stats.mtime,
        mode: stats.mode,
        uid: if anonymize { 0 } else { stats.uid },
        gid: if anonymize { 0 } else { stats.gid },
        uname: if anonymize {
            "root".to_owned()
        } else {
            stats.uname
        },
        gname: if anonymize {
            "root".to_owned()
        } else {
            stats.gname
        },
        is_dir: stats.is_dir,
        is_symlink: stats.is_symlink,
        linkname: stats.linkname,
        start_offset: 0,
        end_offset: 0,
    }))
}
