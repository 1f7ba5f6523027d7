//! The inventory record for one archive member.
//!
//! A [`Track`] is created during recording, receives its stream offsets in
//! the layout pass, and is immutable afterwards.  All block arithmetic that
//! the layout pass and the streaming engine share lives here, so the two can
//! never disagree about where a member starts and ends.

/// TAR works in 512-byte blocks: one block of header per member, then the
/// content rounded up to the next block boundary.
pub const BLOCK_SIZE: u64 = 512;

/// Two zero blocks mark the end of every TAR stream.
pub const FOOTER_SIZE: u64 = 1024;

/// One archive member: a file, directory, or symlink inside the tape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    /// Path as seen inside the archive, `/`-separated, unique per tape.
    pub arc_path: String,
    /// Path relative to the recorded root directory on disk.  Empty for the
    /// root itself.
    pub rel_path: String,
    /// Content size in bytes; always 0 for directories and symlinks.
    pub size: u64,
    /// Modification time, truncated to integer seconds.
    pub mtime: u64,
    /// Permission bits only (type bits stripped).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub uname: String,
    pub gname: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    /// Symlink target; empty for everything else.
    pub linkname: String,
    /// Position of this member's header in the final stream.
    pub start_offset: u64,
    /// Position one past this member's padding in the final stream.
    pub end_offset: u64,
}

impl Track {
    /// Only regular files carry a body in a TAR stream.
    pub fn has_content(&self) -> bool {
        !self.is_dir && !self.is_symlink
    }

    /// Bytes of content that will appear in the stream (0 for dirs/symlinks).
    pub fn content_size(&self) -> u64 {
        if self.has_content() { self.size } else { 0 }
    }

    /// NUL bytes needed after the content to reach the next block boundary.
    pub fn padding_size(&self) -> u64 {
        (BLOCK_SIZE - self.content_size() % BLOCK_SIZE) % BLOCK_SIZE
    }

    /// Full footprint of this member in the stream: header + content + padding.
    pub fn total_block_size(&self) -> u64 {
        BLOCK_SIZE + self.content_size() + self.padding_size()
    }

    /// Stream offset where the content region begins.
    pub fn header_end_offset(&self) -> u64 {
        self.start_offset + BLOCK_SIZE
    }

    /// Stream offset where the padding region begins.
    pub fn content_end_offset(&self) -> u64 {
        self.header_end_offset() + self.content_size()
    }

    /// The path as it must be rendered into the header: directories carry a
    /// trailing `/`.
    pub fn header_arc_path(&self) -> String {
        if self.is_dir && !self.arc_path.ends_with('/') {
            format!("{}/", self.arc_path)
        } else {
            self.arc_path.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_track(size: u64) -> Track {
        Track {
            arc_path: "data/file.bin".into(),
            rel_path: "file.bin".into(),
            size,
            mtime: 1_700_000_000,
            mode: 0o644,
            uid: 0,
            gid: 0,
            uname: "root".into(),
            gname: "root".into(),
            is_dir: false,
            is_symlink: false,
            linkname: String::new(),
            start_offset: 0,
            end_offset: 0,
        }
    }

    #[test]
    fn one_byte_file_pads_to_full_block() {
        let t = file_track(1);
        assert_eq!(t.padding_size(), 511);
        assert_eq!(t.total_block_size(), 1024);
    }

    #[test]
    fn block_aligned_file_needs_no_padding() {
        let t = file_track(512);
        assert_eq!(t.padding_size(), 0);
        assert_eq!(t.total_block_size(), 1024);
    }

    #[test]
    fn empty_file_is_header_only() {
        let t = file_track(0);
        assert_eq!(t.padding_size(), 0);
        assert_eq!(t.total_block_size(), 512);
    }

    #[test]
    fn directory_has_no_content_region() {
        let mut t = file_track(4096);
        t.is_dir = true;
        assert_eq!(t.content_size(), 0);
        assert_eq!(t.total_block_size(), 512);
    }

    #[test]
    fn directory_header_path_gets_trailing_slash() {
        let mut t = file_track(0);
        t.is_dir = true;
        t.arc_path = "data/sub".into();
        assert_eq!(t.header_arc_path(), "data/sub/");

        t.arc_path = "data/sub/".into();
        assert_eq!(t.header_arc_path(), "data/sub/");
    }

    #[test]
    fn region_offsets_are_contiguous() {
        let mut t = file_track(700);
        t.start_offset = 2048;
        t.end_offset = 2048 + t.total_block_size();
        assert_eq!(t.header_end_offset(), 2560);
        assert_eq!(t.content_end_offset(), 3260);
        assert_eq!(t.end_offset, 3584);
    }
}
