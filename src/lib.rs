//! Deterministic, resumable, integrity-checked TAR archiving.
//!
//! `tartape` records a directory tree into a compact inventory (the "tape")
//! in which every archive member's byte window in the future USTAR stream is
//! computed up front.  Playing the tape produces the archive lazily, from
//! byte 0 or from any resume offset, as a bit-exact suffix of the full
//! stream; any drift between the inventory and the live filesystem aborts
//! the playback instead of corrupting the output.
//!
//! Typical flow:
//!
//! ```no_run
//! use tartape::player::{PlayOptions, TapePlayer};
//! use tartape::recorder::TapeRecorder;
//! use tartape::stream::TarEvent;
//! use tartape::tape::Tape;
//!
//! # fn main() -> Result<(), tartape::error::TapeError> {
//! let _fingerprint = TapeRecorder::new("dataset")?.commit()?;
//!
//! let tape = Tape::discover("dataset")?;
//! let player = TapePlayer::new(&tape, "dataset");
//! let mut archive = Vec::new();
//! for event in player.play(PlayOptions::default())? {
//!     if let TarEvent::FileData { bytes } = event? {
//!         archive.extend_from_slice(&bytes);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod error;
pub mod factory;
pub mod header;
pub mod integrity;
pub mod player;
pub mod probe;
pub mod recorder;
pub mod store;
pub mod stream;
pub mod tape;
pub mod track;
