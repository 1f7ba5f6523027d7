//! Read-side handle for a recorded tape.
//!
//! A `Tape` wraps the inventory store read-only and exposes the recorded
//! metadata.  Several tapes (and several players over one tape) can be open
//! at the same time; only recording requires exclusivity.

use std::path::{Path, PathBuf};

use crate::error::TapeError;
use crate::store::InventoryStore;
use crate::track::Track;

/// Directory the engine keeps inside the recorded root.
pub const TAPE_METADATA_DIR: &str = ".tartape";
/// Inventory store file name inside [`TAPE_METADATA_DIR`].
pub const TAPE_DB_NAME: &str = "index.db";

/// Metadata keys written by the recorder.
pub(crate) const META_FINGERPRINT: &str = "fingerprint";
pub(crate) const META_TOTAL_SIZE: &str = "total_size";

pub struct Tape {
    store: InventoryStore,
    path: PathBuf,
}

impl Tape {
    /// Open an existing tape file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TapeError> {
        let path = path.into();
        if !path.is_file() {
            return Err(TapeError::TapeNotFound {
                path: path.display().to_string(),
            });
        }
        tracing::info!(path = %path.display(), "opening tape");
        let store = InventoryStore::open_read_only(&path)?;
        Ok(Self { store, path })
    }

    /// Find and open the tape recorded for `directory`
    /// (`<directory>/.tartape/index.db`).
    pub fn discover(directory: impl AsRef<Path>) -> Result<Self, TapeError> {
        let directory = directory.as_ref();
        if !directory.is_dir() {
            return Err(TapeError::NotADirectory {
                path: directory.display().to_string(),
            });
        }
        Self::open(directory.join(TAPE_METADATA_DIR).join(TAPE_DB_NAME))
    }

    /// The SHA-256 identity of the tape, as 64 lowercase hex characters.
    pub fn fingerprint(&self) -> Result<String, TapeError> {
        self.require_meta(META_FINGERPRINT)
    }

    /// Total byte length of the stream this tape describes, footer included.
    pub fn total_size(&self) -> Result<u64, TapeError> {
        let raw = self.require_meta(META_TOTAL_SIZE)?;
        raw.parse().map_err(|_| TapeError::Internal {
            message: format!("tape metadata '{META_TOTAL_SIZE}' is not a number: '{raw}'"),
        })
    }

    /// Every track in stream (ascending `arc_path`) order.
    pub fn tracks(&self) -> Result<Vec<Track>, TapeError> {
        self.store.tracks_sorted()
    }

    /// Look up one member by its archive path, e.g. to learn its byte
    /// window before choosing a resume offset.
    pub fn track(&self, arc_path: &str) -> Result<Option<Track>, TapeError> {
        self.store.get(arc_path)
    }

    pub fn count(&self) -> Result<u64, TapeError> {
        self.store.count_tracks()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn store(&self) -> &InventoryStore {
        &self.store
    }

    fn require_meta(&self, key: &str) -> Result<String, TapeError> {
        self.store.get_meta(key)?.ok_or_else(|| TapeError::Internal {
            message: format!("tape is missing the '{key}' metadata entry"),
        })
    }
}
