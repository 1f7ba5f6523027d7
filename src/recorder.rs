//! Recording: deterministic discovery, offset layout, and atomic publish.
//!
//! # Determinism
//!
//! The whole point of a tape is that the stream is fully predictable before
//! a single byte is produced, so discovery must be reproducible: children of
//! every directory are visited in byte-wise sorted name order (never the raw
//! readdir order, which is filesystem-dependent), and the fingerprint is a
//! pure function of the ordered `(arc_path, size, mtime)` triples.  Two
//! commits over an unchanged tree yield the same fingerprint on any host.
//!
//! # Atomicity
//!
//! The store is built in a staging file next to its final location and
//! renamed into place only after a fully successful commit, so a crashed or
//! failed recording never leaves a half-written tape behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::TapeError;
use crate::factory;
use crate::header;
use crate::store::InventoryStore;
use crate::tape::{META_FINGERPRINT, META_TOTAL_SIZE, TAPE_DB_NAME, TAPE_METADATA_DIR};
use crate::track::{FOOTER_SIZE, Track};

/// Junk that most callers never want on a tape.  Not applied automatically;
/// pass it to [`TapeRecorder::with_exclude`] to opt in.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".DS_Store",
    "Thumbs.db",
    "__pycache__",
    "*.db-wal",
    "*.db-shm",
    "*.sock",
];

/// Tracks buffered between store flushes during discovery.
const BATCH_SIZE: usize = 300;

/// What to skip during discovery.  The engine's own metadata directory is
/// always skipped, independently of this policy.
pub enum ExcludePolicy {
    /// One glob pattern; matches the basename exactly or the path as a glob.
    Glob(String),
    /// Any matching pattern excludes the path.
    Globs(Vec<String>),
    /// Arbitrary predicate over the absolute path.
    Predicate(Box<dyn Fn(&Path) -> bool>),
}

enum ExcludeMatcher {
    None,
    Patterns { names: Vec<String>, set: GlobSet },
    Predicate(Box<dyn Fn(&Path) -> bool>),
}

impl ExcludeMatcher {
    fn compile(policy: ExcludePolicy) -> Result<Self, TapeError> {
        let patterns = match policy {
            ExcludePolicy::Predicate(f) => return Ok(Self::Predicate(f)),
            ExcludePolicy::Glob(p) => vec![p],
            ExcludePolicy::Globs(ps) => ps,
        };

        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            // Anchor each pattern at any depth as well, so "sub/*.txt"
            // excludes nested matches the way a right-anchored path match
            // would.
            for candidate in [pattern.clone(), format!("**/{pattern}")] {
                builder.add(Glob::new(&candidate).map_err(|e| TapeError::Validation {
                    message: format!("invalid exclude pattern '{pattern}': {e}"),
                })?);
            }
        }
        let set = builder.build().map_err(|e| TapeError::Validation {
            message: format!("invalid exclude patterns: {e}"),
        })?;
        Ok(Self::Patterns {
            names: patterns,
            set,
        })
    }

    fn matches(&self, path: &Path, rel: &Path) -> bool {
        match self {
            Self::None => false,
            Self::Predicate(f) => f(path),
            Self::Patterns { names, set } => {
                let basename_hit = path
                    .file_name()
                    .is_some_and(|n| names.iter().any(|p| n == p.as_str()));
                basename_hit || set.is_match(path) || set.is_match(rel)
            }
        }
    }
}

/// Records one directory into a fresh tape at `<root>/.tartape/index.db`.
pub struct TapeRecorder {
    root: PathBuf,
    tape_path: PathBuf,
    exclude: ExcludeMatcher,
    anonymize: bool,
}

impl std::fmt::Debug for TapeRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapeRecorder")
            .field("root", &self.root)
            .field("tape_path", &self.tape_path)
            .field("anonymize", &self.anonymize)
            .finish()
    }
}

impl TapeRecorder {
    /// Prepare a recording of `root`.
    ///
    /// Fails when `root` is not a directory or when a tape already exists
    /// there: a tape describes one frozen state of the tree, so overwriting
    /// it silently would defeat the integrity story.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, TapeError> {
        let root = std::path::absolute(root.as_ref())
            .map_err(|e| TapeError::io("resolving the root path", e))?;
        if !root.is_dir() {
            return Err(TapeError::NotADirectory {
                path: root.display().to_string(),
            });
        }
        let tape_path = root.join(TAPE_METADATA_DIR).join(TAPE_DB_NAME);
        if tape_path.exists() {
            return Err(TapeError::TapeExists {
                path: tape_path.display().to_string(),
            });
        }
        Ok(Self {
            root,
            tape_path,
            exclude: ExcludeMatcher::None,
            anonymize: true,
        })
    }

    /// Skip paths matching `policy` during discovery.
    pub fn with_exclude(mut self, policy: ExcludePolicy) -> Result<Self, TapeError> {
        self.exclude = ExcludeMatcher::compile(policy)?;
        Ok(self)
    }

    /// Keep the real uid/gid/uname/gname instead of forcing `0/0/root/root`.
    /// Anonymized tapes (the default) are reproducible across hosts with
    /// different account databases.
    pub fn with_anonymize(mut self, anonymize: bool) -> Self {
        self.anonymize = anonymize;
        self
    }

    /// Record the tape: discover, lay out offsets, fingerprint, publish.
    ///
    /// Returns the tape fingerprint.
    pub fn commit(self) -> Result<String, TapeError> {
        let meta_dir = self.root.join(TAPE_METADATA_DIR);
        fs::create_dir_all(&meta_dir)
            .map_err(|e| TapeError::io(format!("creating {}", meta_dir.display()), e))?;

        // Stage next to the final location so the publish rename stays on
        // one filesystem.
        let staging = meta_dir.join(format!("{TAPE_DB_NAME}.tmp"));
        if staging.exists() {
            fs::remove_file(&staging)
                .map_err(|e| TapeError::io("removing stale staging file", e))?;
        }

        let mut store = InventoryStore::create(&staging)?;
        self.scan(&mut store)?;
        let (fingerprint, total_size) = self.layout(&mut store)?;
        store.put_meta(META_FINGERPRINT, &fingerprint)?;
        store.put_meta(META_TOTAL_SIZE, &total_size.to_string())?;
        store.close()?;

        fs::rename(&staging, &self.tape_path)
            .map_err(|e| TapeError::io(format!("publishing {}", self.tape_path.display()), e))?;
        tracing::info!(
            path = %self.tape_path.display(),
            %fingerprint,
            total_size,
            "tape recorded"
        );
        Ok(fingerprint)
    }

    /// Walk the tree depth-first in byte-wise sorted order, buffering tracks
    /// and flushing them to the store in batches.
    fn scan(&self, store: &mut InventoryStore) -> Result<(), TapeError> {
        let prefix = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TapeError::Validation {
                message: format!("root path '{}' has no base name", self.root.display()),
            })?;
        let meta_dir = self.root.join(TAPE_METADATA_DIR);

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name();
        let entries = walker.into_iter().filter_entry(|e| {
            e.depth() == 0 || (e.path() != meta_dir && !self.should_exclude(e.path()))
        });

        let mut buffer: Vec<Track> = Vec::with_capacity(BATCH_SIZE);
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if err.io_error().map(|e| e.kind()) == Some(io::ErrorKind::PermissionDenied) {
                        tracing::warn!(path = ?err.path(), "permission denied, skipping");
                        continue;
                    }
                    let context = match err.path() {
                        Some(p) => format!("walking {}", p.display()),
                        None => "walking the directory tree".to_owned(),
                    };
                    let source = err
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::other("filesystem loop detected"));
                    return Err(TapeError::io(context, source));
                }
            };

            let (rel_path, arc_path) = if entry.depth() == 0 {
                (String::new(), prefix.clone())
            } else {
                let rel = entry
                    .path()
                    .strip_prefix(&self.root)
                    .map_err(|_| TapeError::Internal {
                        message: format!("walked outside the root: {}", entry.path().display()),
                    })?
                    .to_string_lossy()
                    .into_owned();
                let arc = format!("{prefix}/{rel}");
                (rel, arc)
            };

            match factory::create_track(entry.path(), &rel_path, &arc_path, self.anonymize) {
                Ok(Some(track)) => {
                    header::validate_compliance(&track)?;
                    buffer.push(track);
                    if buffer.len() >= BATCH_SIZE {
                        store.insert_tracks(&buffer)?;
                        buffer.clear();
                    }
                }
                Ok(None) => {} // vanished or unsupported type
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    tracing::warn!(path = %entry.path().display(), "permission denied, skipping");
                }
                Err(e) => {
                    return Err(TapeError::io(
                        format!("inspecting {}", entry.path().display()),
                        e,
                    ));
                }
            }
        }
        store.insert_tracks(&buffer)
    }

    /// Assign stream offsets in `arc_path` order and derive the fingerprint.
    ///
    /// Returns `(fingerprint, total_size)`.
    fn layout(&self, store: &mut InventoryStore) -> Result<(String, u64), TapeError> {
        let tracks = store.tracks_sorted()?;
        let mut updates = Vec::with_capacity(tracks.len());
        let mut sha = Sha256::new();
        let mut running: u64 = 0;

        for track in &tracks {
            let start = running;
            running += track.total_block_size();
            updates.push((track.arc_path.clone(), start, running));
            sha.update(format!("{}|{}|{}", track.arc_path, track.size, track.mtime).as_bytes());
        }

        store.update_offsets(&updates)?;
        Ok((hex::encode(sha.finalize()), running + FOOTER_SIZE))
    }

    fn should_exclude(&self, path: &Path) -> bool {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        self.exclude.matches(path, rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tape::Tape;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn commit_publishes_a_tape_and_returns_the_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "alpha");

        let fingerprint = TapeRecorder::new(dir.path()).unwrap().commit().unwrap();
        assert_eq!(fingerprint.len(), 64);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(dir.path().join(".tartape/index.db").is_file());
    }

    #[test]
    fn recording_twice_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "alpha");
        TapeRecorder::new(dir.path()).unwrap().commit().unwrap();

        let err = TapeRecorder::new(dir.path()).unwrap_err();
        assert!(matches!(err, TapeError::TapeExists { .. }));
    }

    #[test]
    fn root_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "file.txt", "not a dir");
        let err = TapeRecorder::new(dir.path().join("file.txt")).unwrap_err();
        assert!(matches!(err, TapeError::NotADirectory { .. }));
    }

    #[test]
    fn root_track_comes_first_with_the_directory_basename() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "alpha");
        TapeRecorder::new(dir.path()).unwrap().commit().unwrap();

        let tape = Tape::discover(dir.path()).unwrap();
        let tracks = tape.tracks().unwrap();
        let basename = dir.path().file_name().unwrap().to_string_lossy();
        assert_eq!(tracks[0].arc_path, basename);
        assert!(tracks[0].is_dir);
        assert_eq!(tracks[0].rel_path, "");
        assert_eq!(tracks[1].arc_path, format!("{basename}/a.txt"));
    }

    #[test]
    fn metadata_directory_is_never_recorded() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "alpha");
        TapeRecorder::new(dir.path()).unwrap().commit().unwrap();

        let tape = Tape::discover(dir.path()).unwrap();
        for track in tape.tracks().unwrap() {
            assert!(
                !track.arc_path.contains(TAPE_METADATA_DIR),
                "metadata dir leaked into the tape: {}",
                track.arc_path
            );
        }
    }

    #[test]
    fn layout_is_contiguous_and_accounts_for_the_footer() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "alpha");
        write(dir.path(), "sub/nested.txt", "nested content");
        write(dir.path(), "z.bin", &"x".repeat(1000));
        TapeRecorder::new(dir.path()).unwrap().commit().unwrap();

        let tape = Tape::discover(dir.path()).unwrap();
        let tracks = tape.tracks().unwrap();
        assert_eq!(tracks[0].start_offset, 0);
        for pair in tracks.windows(2) {
            assert_eq!(pair[0].end_offset, pair[1].start_offset);
        }
        for track in &tracks {
            assert_eq!(
                track.end_offset - track.start_offset,
                track.total_block_size()
            );
        }
        let last = tracks.last().unwrap();
        assert_eq!(last.end_offset + FOOTER_SIZE, tape.total_size().unwrap());
    }

    #[test]
    fn two_commits_over_an_unchanged_tree_agree() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.txt", "bravo");
        write(dir.path(), "a.txt", "alpha");
        write(dir.path(), "sub/c.txt", "charlie");

        let first = TapeRecorder::new(dir.path()).unwrap().commit().unwrap();
        fs::remove_file(dir.path().join(".tartape/index.db")).unwrap();
        let second = TapeRecorder::new(dir.path()).unwrap().commit().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn glob_exclusion_skips_matches_and_their_children() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "keep.txt", "kept");
        write(dir.path(), "drop.log", "dropped");
        write(dir.path(), "skipme/inner.txt", "dropped too");

        TapeRecorder::new(dir.path())
            .unwrap()
            .with_exclude(ExcludePolicy::Globs(vec![
                "*.log".to_owned(),
                "skipme".to_owned(),
            ]))
            .unwrap()
            .commit()
            .unwrap();

        let tape = Tape::discover(dir.path()).unwrap();
        let paths: Vec<String> = tape
            .tracks()
            .unwrap()
            .into_iter()
            .map(|t| t.arc_path)
            .collect();
        assert!(paths.iter().any(|p| p.ends_with("keep.txt")));
        assert!(!paths.iter().any(|p| p.ends_with("drop.log")));
        assert!(!paths.iter().any(|p| p.contains("skipme")));
    }

    #[test]
    fn predicate_exclusion_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "small.txt", "s");
        write(dir.path(), "secret.txt", "s");

        TapeRecorder::new(dir.path())
            .unwrap()
            .with_exclude(ExcludePolicy::Predicate(Box::new(|p: &Path| {
                p.file_name().is_some_and(|n| n == "secret.txt")
            })))
            .unwrap()
            .commit()
            .unwrap();

        let tape = Tape::discover(dir.path()).unwrap();
        let paths: Vec<String> = tape
            .tracks()
            .unwrap()
            .into_iter()
            .map(|t| t.arc_path)
            .collect();
        assert!(paths.iter().any(|p| p.ends_with("small.txt")));
        assert!(!paths.iter().any(|p| p.ends_with("secret.txt")));
    }

    #[test]
    fn invalid_glob_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let err = TapeRecorder::new(dir.path())
            .unwrap()
            .with_exclude(ExcludePolicy::Glob("[".to_owned()))
            .unwrap_err();
        assert!(matches!(err, TapeError::Validation { .. }));
    }

    #[test]
    fn anonymize_default_scrubs_identity() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "alpha");
        TapeRecorder::new(dir.path()).unwrap().commit().unwrap();

        let tape = Tape::discover(dir.path()).unwrap();
        for track in tape.tracks().unwrap() {
            assert_eq!((track.uid, track.gid), (0, 0));
            assert_eq!(track.uname, "root");
            assert_eq!(track.gname, "root");
        }
    }
}
