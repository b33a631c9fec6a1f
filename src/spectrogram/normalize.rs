//! Global normalization of spectrogram values.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array, ArrayBase, Data, DataMut, Dimension};
use phf::phf_map;
use serde::{Deserialize, Serialize};

use crate::error::{DatasetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum NormalizationMode {
    /// Values scaled into [-1, 1].
    MinMax,
    /// Zero mean, unit variance.
    MeanStd,
    None,
}

static NORMALIZATION_MODES: phf::Map<&'static str, NormalizationMode> = phf_map! {
    "min_max" => NormalizationMode::MinMax,
    "min-max" => NormalizationMode::MinMax,
    "mean_std" => NormalizationMode::MeanStd,
    "mean-std" => NormalizationMode::MeanStd,
    "none" => NormalizationMode::None,
    "None" => NormalizationMode::None,
};

impl NormalizationMode {
    pub fn from_name(name: &str) -> Result<Self> {
        NORMALIZATION_MODES
            .get(name)
            .copied()
            .ok_or_else(|| DatasetError::UnsupportedNormalization(name.to_string()))
    }

    /// Name used in cache folder and stats file names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MinMax => "min_max",
            Self::MeanStd => "mean_std",
            Self::None => "None",
        }
    }

    pub fn needs_stats(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl FromStr for NormalizationMode {
    type Err = DatasetError;

    fn from_str(name: &str) -> Result<Self> {
        Self::from_name(name)
    }
}

impl TryFrom<String> for NormalizationMode {
    type Error = DatasetError;

    fn try_from(name: String) -> Result<Self> {
        Self::from_name(&name)
    }
}

impl fmt::Display for NormalizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dataset-wide statistics of raw (un-normalized) spectrograms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

impl NormalizationStats {
    /// Placeholder for datasets that are not normalized.
    pub fn identity() -> Self {
        Self {
            min: -1.0,
            max: 1.0,
            mean: 0.0,
            std: 1.0,
        }
    }

    fn half_range(&self) -> f64 {
        (self.max - self.min) / 2.0
    }
}

fn normalize_value(x: f32, stats: &NormalizationStats, mode: NormalizationMode) -> f32 {
    let x = f64::from(x);
    let y = match mode {
        NormalizationMode::MinMax => -1.0 + (x - stats.min) / stats.half_range(),
        NormalizationMode::MeanStd => (x - stats.mean) / stats.std,
        NormalizationMode::None => x,
    };
    y as f32
}

fn denormalize_value(y: f32, stats: &NormalizationStats, mode: NormalizationMode) -> f32 {
    let y = f64::from(y);
    let x = match mode {
        NormalizationMode::MinMax => (y + 1.0) * stats.half_range() + stats.min,
        NormalizationMode::MeanStd => y * stats.std + stats.mean,
        NormalizationMode::None => y,
    };
    x as f32
}

pub fn normalize<S, D>(
    tensor: &ArrayBase<S, D>,
    stats: &NormalizationStats,
    mode: NormalizationMode,
) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    tensor.mapv(|x| normalize_value(x, stats, mode))
}

pub fn denormalize<S, D>(
    tensor: &ArrayBase<S, D>,
    stats: &NormalizationStats,
    mode: NormalizationMode,
) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    tensor.mapv(|y| denormalize_value(y, stats, mode))
}

pub fn normalize_in_place<S, D>(
    tensor: &mut ArrayBase<S, D>,
    stats: &NormalizationStats,
    mode: NormalizationMode,
) where
    S: DataMut<Elem = f32>,
    D: Dimension,
{
    if mode == NormalizationMode::None {
        return;
    }
    tensor.mapv_inplace(|x| normalize_value(x, stats, mode));
}
