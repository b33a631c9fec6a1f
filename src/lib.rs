//! Offline generation and cached access of synth preset datasets.
//!
//! Each dataset item pairs the spectrograms of a preset's rendered notes with the learnable
//! tensor representation of that preset. Spectrograms, their stats and the learnable presets
//! are computed once in batch, then read from disk by [`PresetDataset::get_item`].

pub mod backend;
pub mod config;
pub mod dataset;
pub mod error;
pub mod exclusion;
pub mod index;
pub mod learnable;
pub mod logging;
pub mod preset;
pub mod shard;
pub mod spectrogram;
pub mod stats;
pub mod synth;
pub mod tensor;
pub mod variation;

mod progress;

pub use backend::PrerenderedSynth;
pub use config::DatasetConfig;
pub use dataset::{DatasetItem, PresetDataset, RenderConstraints};
pub use error::{DatasetError, Result};
pub use exclusion::ExclusionList;
pub use index::{DatasetIndices, IndexMapper, ItemKey, MidiNote, NoteSelector, PresetUid};
pub use learnable::{CategoricalClassCounts, LearnablePresetCache};
pub use preset::{FullPreset, LearnableLayout, OneHotEncoder, ParamModel};
pub use shard::ShardSpec;
pub use spectrogram::{
    LogSpectrogram, NormalizationMode, NormalizationStats, SpectrogramCache, SpectrogramTransform,
};
pub use stats::{ItemStats, StatsAggregator};
pub use synth::{LearnableEncoder, PresetProvider, RenderedAudio, Renderer, SynthBackend};
pub use variation::{Variation, VariationCodec, VariationIndex};
