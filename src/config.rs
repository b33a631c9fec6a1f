//! Configuration of a preset dataset and of its on-disk caches.
//!
//! A dataset is described by a TOML file deserialized into [`DatasetConfig`]. Everything
//! that ends up on disk is derived from it: the dataset root is `{storage_root}/{synth_name}`,
//! and the spectrogram cache folder and stats files are named after the spectrogram
//! description (FFT size, hop, mel bins and normalization mode). Changing any of those
//! parameters therefore points to a different, possibly not yet generated, cache.
//!
//! Example:
//!
//! ```toml
//! synth_name = "dexed"
//! storage_root = "/data/datasets"
//! sample_rate = 16000
//! n_fft = 512
//! fft_hop = 256
//! normalization = "min_max"
//! midi_notes = [[41, 75], [48, 75], [56, 75], [63, 75], [56, 25], [56, 127]]
//! stack_spectrograms = true
//! nb_preset_variations = 4
//! nb_audio_delay_variations = 2
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{io_at, DatasetError, Result};
use crate::index::MidiNote;
use crate::spectrogram::NormalizationMode;
use crate::variation::VariationCodec;

/// Noise-floor value of log-scaled spectrograms. Also the sentinel of silent renders.
pub const DEFAULT_SPECTROGRAM_MIN_DB: f32 = -120.0;
pub const DEFAULT_MEL_FMIN: f32 = 30.0;
pub const DEFAULT_MEL_FMAX: f32 = 11e3;
pub const DEFAULT_RANDOM_SEED: u64 = 0;

// Same tolerances as numpy.isclose, used to compare a spectrogram max to the silence floor.
pub const ZERO_VOLUME_RTOL: f64 = 1e-5;
pub const ZERO_VOLUME_ATOL: f64 = 1e-8;

// On-disk layout, relative to the dataset root.
pub const SPECTROGRAMS_FOLDER_PREFIX: &str = "Specs_";
pub const SPEC_STATS_FOLDER: &str = "SpecStats";
pub const LEARNABLE_PRESETS_FOLDER: &str = "LearnableTensorPresets";
pub const CAT_PARAMS_COUNTS_FILE: &str = "cat_params_class_counts.json";
pub const RENDER_CONSTRAINTS_FILE: &str = "audio_render_constraints_file.json";
pub const TENSOR_EXTENSION: &str = "tensor";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub synth_name: String,
    /// Each synth gets its own subfolder inside this folder.
    pub storage_root: PathBuf,
    pub sample_rate: u32,
    pub n_fft: usize,
    pub fft_hop: usize,
    /// Number of Mel bins. Absent for a linear-frequency STFT.
    #[serde(default)]
    pub n_mel_bins: Option<usize>,
    #[serde(default = "default_mel_fmin")]
    pub mel_fmin: f32,
    #[serde(default = "default_mel_fmax")]
    pub mel_fmax: f32,
    #[serde(default = "default_min_db")]
    pub spectrogram_min_db: f32,
    #[serde(default = "default_normalization")]
    pub normalization: NormalizationMode,
    /// (pitch, velocity) of every note rendered for each preset.
    pub midi_notes: Vec<MidiNote>,
    /// One multi-channel item per preset instead of one item per (preset, note).
    #[serde(default)]
    pub stack_spectrograms: bool,
    #[serde(default = "default_variations")]
    pub nb_preset_variations: usize,
    #[serde(default = "default_variations")]
    pub nb_audio_delay_variations: usize,
    #[serde(default = "default_true")]
    pub data_augmentation: bool,
    #[serde(default = "default_seed")]
    pub random_seed: u64,
    /// Text file of preset UIDs to leave out of the dataset.
    #[serde(default)]
    pub exclusion_list: Option<PathBuf>,
    #[serde(default)]
    pub learn_mod_wheel_params: bool,
}

fn default_mel_fmin() -> f32 {
    DEFAULT_MEL_FMIN
}

fn default_mel_fmax() -> f32 {
    DEFAULT_MEL_FMAX
}

fn default_min_db() -> f32 {
    DEFAULT_SPECTROGRAM_MIN_DB
}

fn default_normalization() -> NormalizationMode {
    NormalizationMode::MinMax
}

fn default_variations() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_seed() -> u64 {
    DEFAULT_RANDOM_SEED
}

impl DatasetConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(io_at(path))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.midi_notes.is_empty() {
            return Err(DatasetError::Config("at least one MIDI note is required".into()));
        }
        if self.midi_notes.len() == 1 && self.stack_spectrograms {
            return Err(DatasetError::StackedSingleNote);
        }
        if self.n_fft == 0 || self.fft_hop == 0 {
            return Err(DatasetError::Config("FFT size and hop must be nonzero".into()));
        }
        if self.fft_hop > self.n_fft {
            return Err(DatasetError::Config(format!(
                "FFT hop {} is larger than FFT size {}",
                self.fft_hop, self.n_fft
            )));
        }
        if self.n_mel_bins == Some(0) {
            return Err(DatasetError::Config("n_mel_bins must be positive when set".into()));
        }
        if self.mel_fmin < 0.0 || self.mel_fmax <= self.mel_fmin {
            return Err(DatasetError::Config(format!(
                "invalid mel frequency limits ({}, {})",
                self.mel_fmin, self.mel_fmax
            )));
        }
        if self.sample_rate == 0 {
            return Err(DatasetError::Config("sample rate must be nonzero".into()));
        }
        // Also rejects zero variation counts.
        self.variation_codec()?;
        Ok(())
    }

    /// Folder of every generated artifact of this synth.
    pub fn dataset_root(&self) -> PathBuf {
        self.storage_root.join(&self.synth_name)
    }

    /// Short description of the spectrograms' characteristics, usable as a file name.
    pub fn spectrogram_description(&self) -> String {
        let mels = match self.n_mel_bins {
            Some(bins) => bins.to_string(),
            None => "None".to_string(),
        };
        format!(
            "{}x{}_mel{}_norm_{}",
            self.n_fft,
            self.fft_hop,
            mels,
            self.normalization.name()
        )
    }

    pub fn variation_codec(&self) -> Result<VariationCodec> {
        VariationCodec::new(self.nb_preset_variations, self.nb_audio_delay_variations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        synth_name = "dexed"
        storage_root = "/tmp/datasets"
        sample_rate = 16000
        n_fft = 512
        fft_hop = 256
        midi_notes = [[56, 75], [60, 100]]
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = DatasetConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.normalization, NormalizationMode::MinMax);
        assert_eq!(config.spectrogram_min_db, DEFAULT_SPECTROGRAM_MIN_DB);
        assert_eq!(config.nb_preset_variations, 1);
        assert!(config.data_augmentation);
        assert!(!config.stack_spectrograms);
        assert_eq!(config.dataset_root(), PathBuf::from("/tmp/datasets/dexed"));
    }

    #[test]
    fn description_names_stft_mels_and_normalization() {
        let mut config = DatasetConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.spectrogram_description(), "512x256_melNone_norm_min_max");
        config.n_mel_bins = Some(257);
        config.normalization = NormalizationMode::MeanStd;
        assert_eq!(config.spectrogram_description(), "512x256_mel257_norm_mean_std");
        config.normalization = NormalizationMode::None;
        assert_eq!(config.spectrogram_description(), "512x256_mel257_norm_None");
    }

    #[test]
    fn stacking_a_single_note_is_rejected() {
        let text = MINIMAL.replace("[[56, 75], [60, 100]]", "[[56, 75]]") + "stack_spectrograms = true\n";
        let err = DatasetConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, DatasetError::StackedSingleNote));
    }

    #[test]
    fn unknown_normalization_name_is_rejected() {
        let text = format!("{MINIMAL}normalization = \"z_score\"\n");
        assert!(DatasetConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn out_of_range_note_is_rejected() {
        let text = MINIMAL.replace("[60, 100]", "[60, 128]");
        assert!(DatasetConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn zero_variations_are_rejected() {
        let text = format!("{MINIMAL}nb_audio_delay_variations = 0\n");
        assert!(DatasetConfig::from_toml_str(&text).is_err());
    }
}
