//! Filesystem inspection for the recorder and the integrity layer.
//!
//! All stat calls in the crate go through [`inspect`] so every caller sees
//! the same view of a path: symlinks are never followed, mtimes are truncated
//! to integer seconds, and owner names fall back to the decimal id when the
//! host has no matching passwd/group entry.

use std::ffi::CStr;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Snapshot of one path as it exists on disk right now.
///
/// Exactly one of `is_dir` / `is_file` / `is_symlink` is true for supported
/// entries.  Sockets, fifos and devices report all three as false; callers
/// skip those silently.
#[derive(Debug, Clone)]
pub struct DiskEntryStats {
    pub is_dir: bool,
    pub is_file: bool,
    pub is_symlink: bool,
    /// Byte size; 0 for directories.
    pub size: u64,
    /// Modification time in whole seconds since the epoch.
    pub mtime: u64,
    /// Permission bits only (`st_mode & 0o7777`).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub uname: String,
    pub gname: String,
    /// Symlink target; empty for everything else.
    pub linkname: String,
}

/// Stat `path` without following symlinks.
///
/// Returns `Ok(None)` when the path does not exist.  Every other I/O failure
/// surfaces to the caller.
pub fn inspect(path: &Path) -> io::Result<Option<DiskEntryStats>> {
    let md = match fs::symlink_metadata(path) {
        Ok(md) => md,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let ft = md.file_type();
    let is_dir = ft.is_dir();
    let is_file = ft.is_file();
    let is_symlink = ft.is_symlink();

    let linkname = if is_symlink {
        fs::read_link(path)?.to_string_lossy().into_owned()
    } else {
        String::new()
    };

    Ok(Some(DiskEntryStats {
        is_dir,
        is_file,
        is_symlink,
        size: if is_dir { 0 } else { md.len() },
        mtime: md.mtime().max(0) as u64,
        mode: md.mode() & 0o7777,
        uid: md.uid(),
        gid: md.gid(),
        uname: user_name(md.uid()),
        gname: group_name(md.gid()),
        linkname,
    }))
}

/// Resolve a uid to its account name, falling back to the decimal id.
pub fn user_name(uid: u32) -> String {
    let mut buf = vec![0u8; 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe {
        libc::getpwuid_r(
            uid,
            &mut pwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };

    if rc == 0 && !result.is_null() {
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        if let Ok(s) = name.to_str() {
            return s.to_owned();
        }
    }
    uid.to_string()
}

/// Resolve a gid to its group name, falling back to the decimal id.
pub fn group_name(gid: u32) -> String {
    let mut buf = vec![0u8; 1024];
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();

    let rc = unsafe {
        libc::getgrgid_r(
            gid,
            &mut grp,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };

    if rc == 0 && !result.is_null() {
        let name = unsafe { CStr::from_ptr(grp.gr_name) };
        if let Ok(s) = name.to_str() {
            return s.to_owned();
        }
    }
    gid.to_string()
}
