//! Error type shared by every component of the crate.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::index::PresetUid;

pub type Result<T, E = DatasetError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DatasetError {
    /// A variation index (or one of its two components) does not fit the configured counts.
    #[error("invalid variation {index} (should be < {count})")]
    VariationOutOfRange { index: usize, count: usize },
    #[error("dataset index {index} out of range (dataset length is {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("MIDI {what} {value} out of range (expected 0..=127)")]
    MidiOutOfRange { what: &'static str, value: u32 },
    #[error("preset UID {0} is not a valid preset UID (it might have been excluded from this dataset)")]
    UidNotFound(PresetUid),
    /// Read before generation. Expected only while a regeneration is running.
    #[error("cache entry {} does not exist, the cache must be (re)generated first", path.display())]
    CacheMiss { path: PathBuf },
    #[error("cannot perform spectrogram normalization '{0}'")]
    UnsupportedNormalization(String),
    #[error("missing '{key}' key in stats file {}", path.display())]
    MissingStatsKey { key: &'static str, path: PathBuf },
    #[error("stats file {} could not be found, stats must be computed first", path.display())]
    StatsNotComputed { path: PathBuf },
    #[error("wrong sampling frequency ({actual} Hz instead of {expected} Hz) for preset UID {uid}")]
    SampleRateMismatch {
        uid: PresetUid,
        expected: u32,
        actual: u32,
    },
    #[error("a 1-note dataset cannot use multi-note stacked spectrograms")]
    StackedSingleNote,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(
        "learnable tensor of preset UID {uid} (variation {preset_variation}) has {nonzero} nonzero classes for categorical parameter {param_index}, sum {sum}"
    )]
    OneHotViolation {
        uid: PresetUid,
        preset_variation: usize,
        param_index: usize,
        nonzero: usize,
        sum: f32,
    },
    #[error(
        "rendered audio does not correspond to this dataset's configuration: bad value for constraint '{key}' (expected {expected}, rendered audio files: {found})"
    )]
    RenderConstraintMismatch {
        key: String,
        expected: String,
        found: String,
    },
    #[error("shard directory {} is missing or incomplete, run every shard to completion before committing", path.display())]
    MissingShard { path: PathBuf },
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("tensor codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
    #[error("tensor shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("glob error: {0}")]
    Glob(#[from] glob::PatternError),
    #[error("fft error: {0}")]
    Fft(#[from] realfft::FftError),
    #[error("progress template error: {0}")]
    Progress(#[from] indicatif::style::TemplateError),
}

/// Builds a `map_err` adapter attaching `path` to an io error.
pub(crate) fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> DatasetError + use<> {
    let path = path.to_path_buf();
    move |source| DatasetError::Io { path, source }
}
