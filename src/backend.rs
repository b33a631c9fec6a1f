//! Backend serving a synth whose audio has already been rendered to WAV files.
//!
//! Layout of `{storage_root}/{synth_name}/`:
//! - `param_model.json`: the [`ParamModel`] of the synth.
//! - `presets.parquet`: a `uid` integer column, an optional `name` string column and one
//!   numeric column per parameter of the model, holding normalized values.
//! - `Audio/{UID}_{pitch}_{velocity}_pvar{preset_variation}.wav`: one rendering per preset
//!   variation. Multi-channel files are mixed down to mono. Audio-delay variations are
//!   applied when the file is read.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::array::{Array, Float32Array, Int64Array, RecordBatch, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use hound::{SampleFormat, WavReader};
use ndarray::Array2;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::{debug, info};

use crate::config::DatasetConfig;
use crate::error::{io_at, DatasetError, Result};
use crate::index::{MidiNote, PresetUid};
use crate::preset::{FullPreset, LearnableLayout, OneHotEncoder, ParamModel};
use crate::synth::{
    pseudo_random_audio_delay, LearnableEncoder, PresetProvider, RenderedAudio, Renderer, SynthBackend,
};
use crate::variation::{VariationCodec, VariationIndex};

pub const PARAM_MODEL_FILE: &str = "param_model.json";
pub const PRESETS_FILE: &str = "presets.parquet";
pub const AUDIO_FOLDER: &str = "Audio";

#[derive(Debug, Clone)]
struct PresetRecord {
    name: Option<String>,
    values: Vec<f32>,
}

#[derive(Debug)]
pub struct PrerenderedSynth {
    name: String,
    audio_folder: PathBuf,
    uids: Vec<PresetUid>,
    presets: HashMap<PresetUid, PresetRecord>,
    codec: VariationCodec,
    encoder: OneHotEncoder,
    random_seed: u64,
}

impl PrerenderedSynth {
    pub fn open(config: &DatasetConfig) -> Result<Self> {
        let root = config.dataset_root();
        let model = ParamModel::load(&root.join(PARAM_MODEL_FILE))?;
        let (uids, presets) = load_presets(&root.join(PRESETS_FILE), &model)?;
        info!(
            "Loaded {} presets of synth '{}' ({} parameters)",
            uids.len(),
            config.synth_name,
            model.len()
        );
        Ok(Self {
            name: config.synth_name.clone(),
            audio_folder: root.join(AUDIO_FOLDER),
            uids,
            presets,
            codec: config.variation_codec()?,
            encoder: OneHotEncoder::new(model),
            random_seed: config.random_seed,
        })
    }

    pub fn audio_path(&self, uid: PresetUid, note: MidiNote, preset_variation: usize) -> PathBuf {
        self.audio_folder.join(format!(
            "{}_{}_{}_pvar{}.wav",
            uid, note.pitch, note.velocity, preset_variation
        ))
    }

    pub fn param_model(&self) -> &ParamModel {
        self.encoder.model()
    }

    fn delay_seed(&self, uid: PresetUid, audio_delay: usize) -> u64 {
        self.random_seed ^ (u64::from(uid.0) << 20) ^ audio_delay as u64
    }
}

fn load_presets(
    path: &Path,
    model: &ParamModel,
) -> Result<(Vec<PresetUid>, HashMap<PresetUid, PresetRecord>)> {
    let file = File::open(path).map_err(io_at(path))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut uids = Vec::new();
    let mut presets = HashMap::new();
    for batch in reader {
        let batch = batch?;
        let uid_column = cast(required_column(&batch, "uid", path)?, &DataType::Int64)?;
        let uid_column = uid_column
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| bad_column("uid", path))?;
        let names = batch
            .column_by_name("name")
            .and_then(|column| column.as_any().downcast_ref::<StringArray>());
        let param_columns = model
            .params()
            .iter()
            .map(|spec| Ok(cast(required_column(&batch, &spec.name, path)?, &DataType::Float32)?))
            .collect::<Result<Vec<_>>>()?;
        let param_columns = param_columns
            .iter()
            .zip(model.params())
            .map(|(column, spec)| {
                column
                    .as_any()
                    .downcast_ref::<Float32Array>()
                    .ok_or_else(|| bad_column(&spec.name, path))
            })
            .collect::<Result<Vec<_>>>()?;

        for row in 0..batch.num_rows() {
            let uid = u32::try_from(uid_column.value(row))
                .map(PresetUid)
                .map_err(|_| bad_column("uid", path))?;
            let record = PresetRecord {
                name: names
                    .filter(|names| names.is_valid(row))
                    .map(|names| names.value(row).to_string()),
                values: param_columns.iter().map(|column| column.value(row)).collect(),
            };
            if presets.insert(uid, record).is_some() {
                return Err(DatasetError::Config(format!(
                    "duplicate preset UID {uid} in {}",
                    path.display()
                )));
            }
            uids.push(uid);
        }
    }
    Ok((uids, presets))
}

fn required_column<'a>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a dyn Array> {
    batch
        .column_by_name(name)
        .map(|column| column.as_ref())
        .ok_or_else(|| bad_column(name, path))
}

fn bad_column(name: &str, path: &Path) -> DatasetError {
    DatasetError::Config(format!("missing or invalid column '{name}' in {}", path.display()))
}

/// Reads a WAV file as mono f32 samples.
fn read_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let interleaved = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            let scale = 1.0 / (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|s| s as f32 * scale))
                .collect::<Result<Vec<_>, _>>()?
        }
    };
    let channels = usize::from(spec.channels.max(1));
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    Ok((mono, spec.sample_rate))
}

impl Renderer for PrerenderedSynth {
    fn render(&self, uid: PresetUid, note: MidiNote, variation: VariationIndex) -> Result<RenderedAudio> {
        let variation = self.codec.decode(variation)?;
        let path = self.audio_path(uid, note, variation.preset_variation);
        let (mut samples, sample_rate) = read_wav(&path)?;
        if variation.audio_delay > 0 {
            let delay = pseudo_random_audio_delay(
                &mut samples,
                sample_rate,
                self.delay_seed(uid, variation.audio_delay),
            );
            debug!("Delayed {} by {} samples", path.display(), delay);
        }
        Ok(RenderedAudio { samples, sample_rate })
    }
}

impl PresetProvider for PrerenderedSynth {
    fn full_preset(&self, uid: PresetUid, preset_variation: usize) -> Result<FullPreset> {
        if preset_variation >= self.codec.nb_preset_variations() {
            return Err(DatasetError::VariationOutOfRange {
                index: preset_variation,
                count: self.codec.nb_preset_variations(),
            });
        }
        let record = self.presets.get(&uid).ok_or(DatasetError::UidNotFound(uid))?;
        Ok(FullPreset {
            uid,
            values: record.values.clone(),
        })
    }
}

impl LearnableEncoder for PrerenderedSynth {
    fn layout(&self) -> &LearnableLayout {
        self.encoder.layout()
    }

    fn encode(&self, preset: &FullPreset) -> Result<Array2<f32>> {
        self.encoder.encode(preset)
    }
}

impl SynthBackend for PrerenderedSynth {
    fn synth_name(&self) -> &str {
        &self.name
    }

    fn preset_uids(&self) -> Vec<PresetUid> {
        self.uids.clone()
    }

    fn preset_name(&self, uid: PresetUid) -> Option<String> {
        self.presets.get(&uid).and_then(|record| record.name.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Float64Array, Int32Array};
    use arrow::datatypes::{Field, Schema};
    use hound::{WavSpec, WavWriter};
    use parquet::arrow::ArrowWriter;
    use tempfile::{tempdir, TempDir};

    use super::*;

    pub(crate) const PARAM_MODEL_JSON: &str = r#"[
        {"name": "algorithm", "kind": "categorical", "cardinality": 4},
        {"name": "cutoff", "kind": "numerical"}
    ]"#;

    /// Writes the files of a 3-preset synth under `{root}/{synth}`.
    pub(crate) fn write_synth(root: &Path, synth: &str, sample_rate: u32, notes: &[MidiNote], nb_pv: usize) {
        let dir = root.join(synth);
        std::fs::create_dir_all(dir.join(AUDIO_FOLDER)).unwrap();
        std::fs::write(dir.join(PARAM_MODEL_FILE), PARAM_MODEL_JSON).unwrap();

        let schema = Arc::new(Schema::new(vec![
            Field::new("uid", DataType::Int32, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("algorithm", DataType::Float64, false),
            Field::new("cutoff", DataType::Float32, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int32Array::from(vec![30, 10, 20])) as ArrayRef,
                Arc::new(StringArray::from(vec![Some("BRASS 1"), None, Some("E.PIANO")])),
                Arc::new(Float64Array::from(vec![0.0, 1.0 / 3.0, 1.0])),
                Arc::new(Float32Array::from(vec![0.5, 0.25, 0.75])),
            ],
        )
        .unwrap();
        let file = File::create(dir.join(PRESETS_FILE)).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let spec = WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        for uid in [10, 20, 30] {
            for note in notes {
                for pv in 0..nb_pv {
                    let path = dir.join(AUDIO_FOLDER).join(format!(
                        "{}_{}_{}_pvar{}.wav",
                        uid, note.pitch, note.velocity, pv
                    ));
                    let mut wav = WavWriter::create(path, spec).unwrap();
                    for i in 0..2048 {
                        let t = i as f32 / sample_rate as f32;
                        let s = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5 * (pv + 1) as f32 / nb_pv as f32;
                        let s = (s * i16::MAX as f32) as i16;
                        wav.write_sample(s).unwrap();
                        wav.write_sample(s).unwrap();
                    }
                    wav.finalize().unwrap();
                }
            }
        }
    }

    fn config(root: &TempDir) -> DatasetConfig {
        DatasetConfig::from_toml_str(&format!(
            r#"
            synth_name = "dexed"
            storage_root = "{}"
            sample_rate = 16000
            n_fft = 256
            fft_hop = 64
            midi_notes = [[60, 100]]
            stack_spectrograms = false
            nb_preset_variations = 2
            nb_audio_delay_variations = 2
            "#,
            root.path().display()
        ))
        .unwrap()
    }

    #[test]
    fn loads_presets_in_registry_order() {
        let root = tempdir().unwrap();
        let note = MidiNote::new(60, 100).unwrap();
        write_synth(root.path(), "dexed", 16000, &[note], 2);
        let synth = PrerenderedSynth::open(&config(&root)).unwrap();

        assert_eq!(synth.preset_uids(), vec![PresetUid(30), PresetUid(10), PresetUid(20)]);
        assert_eq!(synth.preset_name(PresetUid(30)).as_deref(), Some("BRASS 1"));
        assert_eq!(synth.preset_name(PresetUid(10)), None);
        let preset = synth.full_preset(PresetUid(20), 1).unwrap();
        assert_eq!(preset.values, vec![1.0, 0.75]);
        assert!(matches!(
            synth.full_preset(PresetUid(99), 0),
            Err(DatasetError::UidNotFound(PresetUid(99)))
        ));
        assert!(synth.full_preset(PresetUid(20), 2).is_err());

        let tensor = synth.encode(&synth.full_preset(PresetUid(10), 0).unwrap()).unwrap();
        assert_eq!(tensor.row(0).to_vec(), vec![0.0, 1.0, 0.0, 0.0, 0.25]);
    }

    #[test]
    fn renders_mono_audio_with_optional_delay() {
        let root = tempdir().unwrap();
        let note = MidiNote::new(60, 100).unwrap();
        write_synth(root.path(), "dexed", 16000, &[note], 2);
        let synth = PrerenderedSynth::open(&config(&root)).unwrap();

        let plain = synth.render(PresetUid(10), note, 2).unwrap();
        assert_eq!(plain.sample_rate, 16000);
        assert_eq!(plain.samples.len(), 2048);
        assert!(plain.samples[1] > 0.0);

        let delayed = synth.render(PresetUid(10), note, 3).unwrap();
        assert_eq!(delayed.samples.len(), 2048);
        let onset = delayed.samples.iter().position(|&s| s != 0.0).unwrap();
        assert!(onset > 1);
        assert_eq!(delayed.samples[onset], plain.samples[1]);
        assert_eq!(synth.render(PresetUid(10), note, 3).unwrap(), delayed);
    }

    #[test]
    fn missing_audio_is_an_error() {
        let root = tempdir().unwrap();
        let note = MidiNote::new(60, 100).unwrap();
        write_synth(root.path(), "dexed", 16000, &[note], 2);
        let synth = PrerenderedSynth::open(&config(&root)).unwrap();
        assert!(synth.render(PresetUid(10), MidiNote::new(61, 100).unwrap(), 0).is_err());
    }
}
