//! A dataset of synth presets, paired with the spectrograms of their rendered notes.
//!
//! [`PresetDataset`] ties the caches together. Offline, it (re)generates spectrograms, their
//! stats and the learnable presets. At training time, [`PresetDataset::get_item`] only reads
//! cached files.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::OnceLock;

use ndarray::{Array, Array2, Array3, ArrayBase, Data, Dimension};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::{DatasetConfig, RENDER_CONSTRAINTS_FILE};
use crate::error::{io_at, DatasetError, Result};
use crate::exclusion::ExclusionList;
use crate::index::{IndexMapper, MidiNote, PresetUid};
use crate::learnable::{CategoricalClassCounts, LearnablePresetCache};
use crate::shard::ShardSpec;
use crate::spectrogram::{
    denormalize, normalize, NormalizationStats, RegenerationReport, SpectrogramCache, SpectrogramTransform,
};
use crate::stats::{find_zero_volume_presets, StatsAggregator};
use crate::synth::SynthBackend;
use crate::tensor::write_atomically;
use crate::variation::{Variation, VariationCodec, VariationIndex};

/// One training item.
#[derive(Debug, Clone)]
pub struct DatasetItem {
    /// (notes, frequency, time). A single channel when spectrograms are not stacked.
    pub spectrograms: Array3<f32>,
    /// Learnable representation of the preset, shape (1, width).
    pub preset: Array2<f32>,
    pub uid: PresetUid,
    pub notes: Vec<MidiNote>,
    pub variation: Variation,
}

/// Rendering settings which must match between the audio files and the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderConstraints {
    pub learn_mod_wheel_params: bool,
    pub nb_variations_per_note: usize,
}

pub struct PresetDataset<B> {
    config: DatasetConfig,
    backend: B,
    mapper: IndexMapper,
    codec: VariationCodec,
    spectrograms: SpectrogramCache,
    stats: StatsAggregator,
    learnables: LearnablePresetCache,
    normalization_stats: OnceLock<NormalizationStats>,
}

impl<B: SynthBackend> PresetDataset<B> {
    pub fn new(config: DatasetConfig, backend: B) -> Result<Self> {
        config.validate()?;
        let excluded = match &config.exclusion_list {
            Some(path) => ExclusionList::load(path)?,
            None => ExclusionList::empty(),
        };
        let mapper = IndexMapper::from_registry(
            backend.preset_uids(),
            &excluded,
            config.midi_notes.clone(),
            config.stack_spectrograms,
        )?;
        if mapper.valid_uids().is_empty() {
            warn!("No valid preset left in dataset '{}'", backend.synth_name());
        }
        let codec = config.variation_codec()?;
        Ok(Self {
            spectrograms: SpectrogramCache::from_config(&config),
            stats: StatsAggregator::from_config(&config),
            learnables: LearnablePresetCache::new(config.dataset_root()),
            normalization_stats: OnceLock::new(),
            config,
            backend,
            mapper,
            codec,
        })
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn index_mapper(&self) -> &IndexMapper {
        &self.mapper
    }

    pub fn variation_codec(&self) -> &VariationCodec {
        &self.codec
    }

    pub fn spectrogram_cache(&self) -> &SpectrogramCache {
        &self.spectrograms
    }

    pub fn stats_aggregator(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn learnable_cache(&self) -> &LearnablePresetCache {
        &self.learnables
    }

    pub fn len(&self) -> usize {
        self.mapper.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapper.is_empty()
    }

    pub fn valid_preset_uids(&self) -> &[PresetUid] {
        self.mapper.valid_uids()
    }

    /// Number of presets of the registry, excluded ones included.
    pub fn total_nb_presets(&self) -> usize {
        self.backend.preset_uids().len()
    }

    /// Variations rendered for each note, whether or not items draw from them.
    pub fn nb_variations_per_note(&self) -> usize {
        self.codec.count()
    }

    /// Number of rendered audio files (or spectrograms) the dataset relies on.
    pub fn nb_valid_audio_files(&self) -> usize {
        self.mapper.valid_uids().len() * self.config.midi_notes.len() * self.codec.count()
    }

    fn draw_variation<R: Rng + ?Sized>(&self, rng: &mut R) -> VariationIndex {
        if self.config.data_augmentation {
            rng.random_range(0..self.codec.count())
        } else {
            0
        }
    }

    /// Reads item `index` from the caches, with a variation drawn from `rng`.
    pub fn get_item<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<DatasetItem> {
        let key = self.mapper.index_to_key(index)?;
        let variation_index = self.draw_variation(rng);
        let variation = self.codec.decode(variation_index)?;
        let notes = self.mapper.selected_notes(key.notes);
        let spectrograms = self
            .spectrograms
            .read_stacked(key.uid, &notes, variation_index)?;
        let preset = self.learnables.read(key.uid, variation.preset_variation)?;
        Ok(DatasetItem {
            spectrograms,
            preset,
            uid: key.uid,
            notes,
            variation,
        })
    }

    /// Stats used to normalize this dataset's spectrograms. Loaded once, then memoised.
    pub fn normalization_stats(&self) -> Result<NormalizationStats> {
        if !self.config.normalization.needs_stats() {
            return Ok(NormalizationStats::identity());
        }
        if let Some(stats) = self.normalization_stats.get() {
            return Ok(*stats);
        }
        let stats = self.stats.load()?;
        Ok(*self.normalization_stats.get_or_init(|| stats))
    }

    pub fn normalize_spectrogram<S, D>(&self, spectrogram: &ArrayBase<S, D>) -> Result<Array<f32, D>>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        Ok(normalize(spectrogram, &self.normalization_stats()?, self.config.normalization))
    }

    pub fn denormalize_spectrogram<S, D>(&self, spectrogram: &ArrayBase<S, D>) -> Result<Array<f32, D>>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        Ok(denormalize(spectrogram, &self.normalization_stats()?, self.config.normalization))
    }

    /// Renders every spectrogram, computes and stores their stats, then normalizes the cache.
    pub fn compute_and_store_spectrograms_and_stats<T>(&mut self, transform: &T) -> Result<NormalizationStats>
    where
        T: SpectrogramTransform + ?Sized,
    {
        self.stats.clear()?;
        self.spectrograms.regenerate_all(
            self.mapper.valid_uids(),
            self.mapper.notes(),
            &self.codec,
            &self.backend,
            transform,
            self.config.sample_rate,
        )?;
        self.finish_spectrograms()
    }

    /// Renders the spectrograms of one shard. Stats are computed by [`Self::commit_shards`]
    /// once every shard is done.
    pub fn render_shard<T>(&self, shard: ShardSpec, transform: &T) -> Result<RegenerationReport>
    where
        T: SpectrogramTransform + ?Sized,
    {
        self.stats.clear()?;
        self.spectrograms.regenerate_shard(
            shard,
            self.mapper.valid_uids(),
            self.mapper.notes(),
            &self.codec,
            &self.backend,
            transform,
            self.config.sample_rate,
        )
    }

    pub fn commit_shards(&mut self, shard_count: usize) -> Result<NormalizationStats> {
        self.spectrograms.commit_shards(shard_count)?;
        self.finish_spectrograms()
    }

    fn finish_spectrograms(&mut self) -> Result<NormalizationStats> {
        let (uids, notes) = (self.mapper.valid_uids(), self.mapper.notes());
        let rows = self
            .stats
            .compute_batch_stats(&self.spectrograms, uids, notes, &self.codec)?;
        let stats = self.stats.store(&rows)?;
        self.spectrograms.apply_normalization_in_place(
            uids,
            notes,
            &self.codec,
            &stats,
            self.config.normalization,
        )?;
        self.normalization_stats = OnceLock::new();
        Ok(stats)
    }

    pub fn compute_and_store_learnable_presets(&self) -> Result<CategoricalClassCounts> {
        self.learnables.regenerate_all(
            self.mapper.valid_uids(),
            self.codec.nb_preset_variations(),
            &self.backend,
            &self.backend,
        )
    }

    /// Samples count of each class of every categorical parameter.
    pub fn cat_params_class_samples_count(&self) -> Result<CategoricalClassCounts> {
        self.learnables.class_counts()
    }

    /// Positions in the valid-UID list of presets having at least one silent spectrogram.
    pub fn zero_volume_preset_indices(&self) -> Result<Vec<usize>> {
        let rows = self.stats.load_rows()?;
        let floor = f64::from(self.config.spectrogram_min_db);
        let mut indices = Vec::new();
        for uid in find_zero_volume_presets(&rows, floor) {
            match self.mapper.position_of(uid) {
                Some(position) => indices.push(position),
                None => warn!("Zero-volume preset UID {} is not part of this dataset", uid),
            }
        }
        Ok(indices)
    }

    pub fn zero_volume_preset_uids(&self) -> Result<Vec<PresetUid>> {
        let rows = self.stats.load_rows()?;
        Ok(find_zero_volume_presets(&rows, f64::from(self.config.spectrogram_min_db)))
    }

    pub fn render_constraints(&self) -> RenderConstraints {
        RenderConstraints {
            learn_mod_wheel_params: self.config.learn_mod_wheel_params,
            nb_variations_per_note: self.nb_variations_per_note(),
        }
    }

    pub fn render_constraints_path(&self) -> PathBuf {
        self.config.dataset_root().join(RENDER_CONSTRAINTS_FILE)
    }

    pub fn write_render_constraints(&self) -> Result<()> {
        let root = self.config.dataset_root();
        fs::create_dir_all(&root).map_err(io_at(&root))?;
        let constraints = self.render_constraints();
        write_atomically(&self.render_constraints_path(), |writer| {
            Ok(serde_json::to_writer_pretty(writer, &constraints)?)
        })
    }

    /// Fails if the stored render constraints differ from this dataset's.
    pub fn check_render_constraints(&self) -> Result<()> {
        let path = self.render_constraints_path();
        let text = fs::read_to_string(&path).map_err(io_at(&path))?;
        let found: Map<String, Value> = serde_json::from_str(&text)?;
        let Value::Object(expected) = serde_json::to_value(self.render_constraints())? else {
            return Ok(());
        };
        for (key, value) in expected {
            let found_value = found.get(&key).cloned().unwrap_or(Value::Null);
            if found_value != value {
                return Err(DatasetError::RenderConstraintMismatch {
                    key,
                    expected: value.to_string(),
                    found: found_value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Deletes every spectrogram and stats file of the synth, whatever their description.
    pub fn delete_all_spectrogram_data(&mut self) -> Result<()> {
        let root = self.config.dataset_root();
        match fs::metadata(&root) {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("Dataset folder '{}' does not exist", root.display());
                return Ok(());
            }
            Err(err) => return Err(io_at(&root)(err)),
            Ok(_) => {}
        }
        SpectrogramCache::delete_all(&root)?;
        self.normalization_stats = OnceLock::new();
        info!("Deleted all spectrogram data of '{}'", self.backend.synth_name());
        Ok(())
    }
}

impl<B: SynthBackend> fmt::Display for PresetDataset<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = &self.config;
        writeln!(
            f,
            "Dataset of {}/{} {} presets. Total items count {}: {} MIDI notes / preset, {} spectrograms.",
            self.mapper.valid_uids().len(),
            self.total_nb_presets(),
            self.backend.synth_name(),
            self.len(),
            config.midi_notes.len(),
            if config.stack_spectrograms { "stacked" } else { "independent" },
        )?;
        let kind = match config.n_mel_bins {
            Some(bins) => format!("Mel ({bins} bins)"),
            None => "Linear".to_string(),
        };
        writeln!(
            f,
            "{} spectrogram items, n_fft={}, hop={}, min={:.1}dB, normalization: {}.",
            kind, config.n_fft, config.fft_hop, config.spectrogram_min_db, config.normalization
        )?;
        write!(
            f,
            "{}x preset data augmentation, {}x audio delay data augmentation (enabled: {}).",
            self.codec.nb_preset_variations(),
            self.codec.nb_delay_variations(),
            config.data_augmentation
        )
    }
}
