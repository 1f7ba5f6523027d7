//! Playback driver: verification pre-flight, resume-point validation, and
//! construction of the event stream.

use std::path::{Path, PathBuf};

use rand::seq::index::sample;

use crate::error::TapeError;
use crate::integrity::{IntegrityPolicy, assert_track_integrity};
use crate::stream::{CHUNK_SIZE_DEFAULT, StreamOptions, TarStream};
use crate::tape::Tape;
use crate::track::FOOTER_SIZE;

/// Playback configuration with the engine defaults: start at byte 0, 64 KiB
/// chunks, spot-check pre-flight, strict integrity.
#[derive(Debug, Clone, Copy)]
pub struct PlayOptions {
    /// Resume position in the stream; must lie inside `[0, total_size)`.
    pub start_offset: u64,
    /// Upper bound for one content `FileData` chunk.
    pub chunk_size: usize,
    /// `true` runs a random spot check before streaming, `false` verifies
    /// every track.
    pub fast_verify: bool,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            start_offset: 0,
            chunk_size: CHUNK_SIZE_DEFAULT,
            fast_verify: true,
        }
    }
}

/// Sample size used by the `fast_verify` pre-flight.
const SPOT_CHECK_SAMPLE: usize = 15;

/// Replays a tape against the directory it was recorded from.
pub struct TapePlayer<'a> {
    tape: &'a Tape,
    directory: PathBuf,
    integrity: IntegrityPolicy,
}

impl<'a> TapePlayer<'a> {
    pub fn new(tape: &'a Tape, directory: impl Into<PathBuf>) -> Self {
        Self {
            tape,
            directory: directory.into(),
            integrity: IntegrityPolicy::strict(),
        }
    }

    /// Use a non-default integrity policy for every check this player runs.
    pub fn with_integrity(mut self, policy: IntegrityPolicy) -> Self {
        self.integrity = policy;
        self
    }

    /// Check every track against the live filesystem; fails on the first
    /// drifted one.
    pub fn verify(&self) -> Result<(), TapeError> {
        tracing::info!("starting full integrity verification");
        for track in self.tape.tracks()? {
            assert_track_integrity(&self.directory, &track, self.integrity)?;
        }
        tracing::info!("full integrity verification passed");
        Ok(())
    }

    /// Check a uniform random sample of tracks, without replacement.
    ///
    /// A cheap pre-flight: it catches bulk drift (a re-synced or rebuilt
    /// directory) without stat-ing the whole inventory.
    pub fn spot_check(&self, sample_size: usize) -> Result<(), TapeError> {
        let tracks = self.tape.tracks()?;
        if tracks.is_empty() {
            return Ok(());
        }
        let n = sample_size.min(tracks.len());
        tracing::info!(sample = n, total = tracks.len(), "spot checking tracks");
        let mut rng = rand::thread_rng();
        for idx in sample(&mut rng, tracks.len(), n) {
            assert_track_integrity(&self.directory, &tracks[idx], self.integrity)?;
        }
        Ok(())
    }

    /// Start (or resume) playback and return the event stream.
    ///
    /// Runs the pre-flight chosen by `fast_verify`, validates the track
    /// covering a mid-stream resume point, then hands the remaining tracks
    /// to the engine.
    pub fn play(&self, opts: PlayOptions) -> Result<TarStream, TapeError> {
        if opts.chunk_size == 0 {
            return Err(TapeError::Validation {
                message: "chunk_size must be positive".into(),
            });
        }

        let total_size = self.tape.total_size()?;
        if opts.start_offset >= total_size {
            return Err(TapeError::OffsetOutOfRange {
                offset: opts.start_offset,
                total_size,
            });
        }

        if opts.fast_verify {
            self.spot_check(SPOT_CHECK_SAMPLE)?;
        } else {
            self.verify()?;
        }

        if opts.start_offset > 0 {
            tracing::info!(offset = opts.start_offset, "resuming stream");
            self.verify_resume_point(opts.start_offset, total_size)?;
        }

        let tracks = self.tape.store().tracks_from_offset(opts.start_offset)?;
        Ok(TarStream::new(
            self.directory.clone(),
            tracks,
            total_size - FOOTER_SIZE,
            StreamOptions {
                start_offset: opts.start_offset,
                chunk_size: opts.chunk_size,
                integrity: self.integrity,
            },
        ))
    }

    /// Validate the single track whose window contains the resume point.
    ///
    /// Offsets inside the footer need no validation: those bytes are NULs
    /// regardless of the filesystem.
    fn verify_resume_point(&self, offset: u64, total_size: u64) -> Result<(), TapeError> {
        if offset >= total_size - FOOTER_SIZE {
            tracing::debug!(offset, "resume point falls inside the footer");
            return Ok(());
        }

        let track = self
            .tape
            .store()
            .find_covering_offset(offset)?
            .ok_or_else(|| TapeError::Internal {
                message: format!("no track covers offset {offset} despite being within bounds"),
            })?;
        tracing::debug!(offset, track = %track.arc_path, "validating resume point");
        assert_track_integrity(&self.directory, &track, self.integrity)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}
