//! Statistics of raw spectrograms.
//!
//! One [`ItemStats`] row is computed per cached spectrogram. Rows reduce into the global
//! [`NormalizationStats`] stored in `SpecStats/{description}.json`, and are kept in full in
//! `SpecStats/{description}_full.csv` for auditing and for the zero-volume scan.

use std::fs::{self, File};
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, RecordBatch};
use arrow::csv::{ReaderBuilder, WriterBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use indicatif::ParallelProgressIterator;
use ndarray::Array2;
use rayon::prelude::*;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::{DatasetConfig, SPEC_STATS_FOLDER, ZERO_VOLUME_ATOL, ZERO_VOLUME_RTOL};
use crate::error::{io_at, DatasetError, Result};
use crate::index::{MidiNote, PresetUid};
use crate::progress;
use crate::spectrogram::{CacheKey, NormalizationStats, SpectrogramCache};
use crate::tensor::write_atomically;
use crate::variation::VariationCodec;

/// Statistics of a single spectrogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemStats {
    pub uid: PresetUid,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Unbiased (n - 1) standard deviation.
    pub std: f64,
}

impl ItemStats {
    pub fn of_tensor(uid: PresetUid, tensor: &Array2<f32>) -> Self {
        let n = tensor.len();
        let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
        for &x in tensor {
            let x = f64::from(x);
            min = min.min(x);
            max = max.max(x);
            sum += x;
        }
        let mean = if n == 0 { 0.0 } else { sum / n as f64 };
        let variance = if n < 2 {
            0.0
        } else {
            tensor.iter().map(|&x| (f64::from(x) - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        };
        Self {
            uid,
            min,
            max,
            mean,
            std: variance.sqrt(),
        }
    }

    pub fn variance(&self) -> f64 {
        self.std * self.std
    }
}

/// Running reduction of [`ItemStats`] rows. Merging is commutative and associative, so
/// partial accumulators of disjoint row sets can be combined in any order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsAccumulator {
    min: f64,
    max: f64,
    sum_means: f64,
    sum_variances: f64,
    count: usize,
}

impl Default for StatsAccumulator {
    fn default() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum_means: 0.0,
            sum_variances: 0.0,
            count: 0,
        }
    }
}

impl StatsAccumulator {
    pub fn push(mut self, row: &ItemStats) -> Self {
        self.min = self.min.min(row.min);
        self.max = self.max.max(row.max);
        self.sum_means += row.mean;
        self.sum_variances += row.variance();
        self.count += 1;
        self
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            sum_means: self.sum_means + other.sum_means,
            sum_variances: self.sum_variances + other.sum_variances,
            count: self.count + other.count,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `None` if no row was accumulated.
    pub fn finish(&self) -> Option<NormalizationStats> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        // std is the square root of the mean per-item variance, not a pooled variance.
        Some(NormalizationStats {
            min: self.min,
            max: self.max,
            mean: self.sum_means / n,
            std: (self.sum_variances / n).sqrt(),
        })
    }
}

pub fn aggregate(rows: &[ItemStats]) -> Result<NormalizationStats> {
    rows.par_iter()
        .fold(StatsAccumulator::default, |acc, row| acc.push(row))
        .reduce(StatsAccumulator::default, StatsAccumulator::merge)
        .finish()
        .ok_or_else(|| DatasetError::Config("cannot aggregate the stats of an empty dataset".into()))
}

/// Same semantics as numpy's `isclose(a, b)`.
pub fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= ZERO_VOLUME_ATOL + ZERO_VOLUME_RTOL * b.abs()
}

/// UIDs having at least one spectrogram whose max sits on the silence floor, in order of
/// first appearance.
pub fn find_zero_volume_presets(rows: &[ItemStats], silence_floor: f64) -> Vec<PresetUid> {
    let mut uids: Vec<PresetUid> = Vec::new();
    for row in rows.iter().filter(|row| is_close(row.max, silence_floor)) {
        if !uids.contains(&row.uid) {
            uids.push(row.uid);
        }
    }
    uids
}

fn full_stats_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("UID", DataType::Int64, false),
        Field::new("min", DataType::Float64, false),
        Field::new("max", DataType::Float64, false),
        Field::new("mean", DataType::Float64, false),
        Field::new("std", DataType::Float64, false),
    ]))
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|column| column.as_any().downcast_ref::<T>())
        .ok_or_else(|| {
            DatasetError::Config(format!("column '{name}' missing from {}", path.display()))
        })
}

#[derive(Debug, Clone)]
pub struct StatsAggregator {
    folder: PathBuf,
    description: String,
}

impl StatsAggregator {
    pub fn new(dataset_root: impl AsRef<Path>, description: impl Into<String>) -> Self {
        Self {
            folder: dataset_root.as_ref().join(SPEC_STATS_FOLDER),
            description: description.into(),
        }
    }

    pub fn from_config(config: &DatasetConfig) -> Self {
        Self::new(config.dataset_root(), config.spectrogram_description())
    }

    pub fn stats_file(&self) -> PathBuf {
        self.folder.join(format!("{}.json", self.description))
    }

    pub fn full_stats_file(&self) -> PathBuf {
        self.folder.join(format!("{}_full.csv", self.description))
    }

    /// Stats of every raw spectrogram of `uids`, in cache key order.
    pub fn compute_batch_stats(
        &self,
        cache: &SpectrogramCache,
        uids: &[PresetUid],
        notes: &[MidiNote],
        codec: &VariationCodec,
    ) -> Result<Vec<ItemStats>> {
        let start = Instant::now();
        let keys = CacheKey::all(uids, notes, codec);
        let pb = progress::bar(keys.len(), "Stats")?;
        let rows = keys
            .par_iter()
            .progress_with(pb)
            .map(|key| -> Result<ItemStats> {
                let spec = cache.read(key.uid, key.note, key.variation)?;
                Ok(ItemStats::of_tensor(key.uid, &spec))
            })
            .collect::<Result<Vec<_>>>()?;
        info!(
            "Computed stats of {} spectrograms in {:.1}s",
            rows.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(rows)
    }

    /// Removes stored stats, which no longer describe the cache once it gets regenerated.
    pub fn clear(&self) -> Result<()> {
        for path in [self.stats_file(), self.full_stats_file()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(io_at(&path)(err)),
            }
        }
        Ok(())
    }

    /// Aggregates `rows`, then stores both the global stats and the full rows.
    pub fn store(&self, rows: &[ItemStats]) -> Result<NormalizationStats> {
        let stats = aggregate(rows)?;
        fs::create_dir_all(&self.folder).map_err(io_at(&self.folder))?;
        write_atomically(&self.stats_file(), |writer| {
            Ok(serde_json::to_writer_pretty(writer, &stats)?)
        })?;

        let batch = RecordBatch::try_new(
            full_stats_schema(),
            vec![
                Arc::new(Int64Array::from_iter_values(rows.iter().map(|row| i64::from(row.uid.0)))) as ArrayRef,
                Arc::new(Float64Array::from_iter_values(rows.iter().map(|row| row.min))),
                Arc::new(Float64Array::from_iter_values(rows.iter().map(|row| row.max))),
                Arc::new(Float64Array::from_iter_values(rows.iter().map(|row| row.mean))),
                Arc::new(Float64Array::from_iter_values(rows.iter().map(|row| row.std))),
            ],
        )?;
        write_atomically(&self.full_stats_file(), |writer| {
            let mut csv = WriterBuilder::new().with_header(true).build(writer);
            csv.write(&batch)?;
            Ok(())
        })?;
        info!(
            "Stored stats of {} spectrograms into '{}': {:?}",
            rows.len(),
            self.stats_file().display(),
            stats
        );
        Ok(stats)
    }

    pub fn load(&self) -> Result<NormalizationStats> {
        let path = self.stats_file();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(DatasetError::StatsNotComputed { path });
            }
            Err(err) => return Err(io_at(&path)(err)),
        };
        let record: Map<String, Value> = serde_json::from_str(&text)?;
        let get = |key: &'static str| {
            record
                .get(key)
                .and_then(Value::as_f64)
                .ok_or_else(|| DatasetError::MissingStatsKey {
                    key,
                    path: path.clone(),
                })
        };
        Ok(NormalizationStats {
            min: get("min")?,
            max: get("max")?,
            mean: get("mean")?,
            std: get("std")?,
        })
    }

    /// Reads back the full per-spectrogram rows.
    pub fn load_rows(&self) -> Result<Vec<ItemStats>> {
        let path = self.full_stats_file();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(DatasetError::StatsNotComputed { path });
            }
            Err(err) => return Err(io_at(&path)(err)),
        };
        let reader = ReaderBuilder::new(full_stats_schema())
            .with_header(true)
            .build(BufReader::new(file))?;
        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch?;
            let uid = column::<Int64Array>(&batch, "UID", &path)?;
            let min = column::<Float64Array>(&batch, "min", &path)?;
            let max = column::<Float64Array>(&batch, "max", &path)?;
            let mean = column::<Float64Array>(&batch, "mean", &path)?;
            let std = column::<Float64Array>(&batch, "std", &path)?;
            for i in 0..batch.num_rows() {
                let raw_uid = uid.value(i);
                let Ok(raw_uid) = u32::try_from(raw_uid) else {
                    warn!("Skipping invalid UID {} in '{}'", raw_uid, path.display());
                    continue;
                };
                rows.push(ItemStats {
                    uid: PresetUid(raw_uid),
                    min: min.value(i),
                    max: max.value(i),
                    mean: mean.value(i),
                    std: std.value(i),
                });
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    fn row(uid: u32, max: f64, std: f64) -> ItemStats {
        ItemStats {
            uid: PresetUid(uid),
            min: -120.0,
            max,
            mean: -60.0,
            std,
        }
    }

    #[test]
    fn item_stats_use_unbiased_variance() {
        let stats = ItemStats::of_tensor(PresetUid(1), &array![[1.0_f32, 2.0], [3.0, 4.0]]);
        assert_eq!((stats.min, stats.max, stats.mean), (1.0, 4.0, 2.5));
        assert!((stats.variance() - 5.0 / 3.0).abs() < 1e-12);
        assert_eq!(ItemStats::of_tensor(PresetUid(1), &array![[7.0_f32]]).std, 0.0);
    }

    #[test]
    fn aggregate_std_is_root_of_mean_variance() {
        let rows = [row(1, 0.0, 1.0), row(2, 3.0, 2.0)];
        let stats = aggregate(&rows).unwrap();
        assert!((stats.std - 2.5_f64.sqrt()).abs() < 1e-12);
        assert_eq!(stats.max, 3.0);
        assert_eq!(stats.mean, -60.0);
        assert!(aggregate(&[]).is_err());
    }

    #[test]
    fn accumulators_merge_in_any_order() {
        let rows: Vec<_> = (0..6).map(|i| row(i, i as f64, 1.0 + i as f64)).collect();
        let whole = rows.iter().fold(StatsAccumulator::default(), |acc, row| acc.push(row));
        let left = rows[..2].iter().fold(StatsAccumulator::default(), |acc, row| acc.push(row));
        let right = rows[2..].iter().fold(StatsAccumulator::default(), |acc, row| acc.push(row));
        assert_eq!(right.merge(left).finish(), whole.finish());
        assert_eq!(whole.count(), 6);
        assert!(StatsAccumulator::default().finish().is_none());
    }

    #[test]
    fn zero_volume_rows_are_flagged_once() {
        let rows = [
            row(5, -120.0, 0.0),
            row(6, -119.9, 0.1),
            row(5, -120.0, 0.0),
            row(7, -120.0000001, 0.0),
        ];
        assert_eq!(
            find_zero_volume_presets(&rows, -120.0),
            vec![PresetUid(5), PresetUid(7)]
        );
    }

    #[test]
    fn stats_files_round_trip() {
        let dir = tempdir().unwrap();
        let aggregator = StatsAggregator::new(dir.path(), "257x64_melNone_norm_min_max");
        assert!(matches!(aggregator.load(), Err(DatasetError::StatsNotComputed { .. })));
        assert!(matches!(aggregator.load_rows(), Err(DatasetError::StatsNotComputed { .. })));

        let rows = vec![row(11, -20.5, 3.0), row(11, -120.0, 0.0), row(4, -10.0, 5.0)];
        let stats = aggregator.store(&rows).unwrap();
        assert_eq!(aggregator.load().unwrap(), stats);
        assert_eq!(aggregator.load_rows().unwrap(), rows);
        assert!(aggregator
            .full_stats_file()
            .ends_with("SpecStats/257x64_melNone_norm_min_max_full.csv"));

        aggregator.clear().unwrap();
        assert!(!aggregator.stats_file().exists());
    }

    #[test]
    fn missing_key_is_reported() {
        let dir = tempdir().unwrap();
        let aggregator = StatsAggregator::new(dir.path(), "desc");
        fs::create_dir_all(dir.path().join(SPEC_STATS_FOLDER)).unwrap();
        fs::write(aggregator.stats_file(), r#"{"min": -120.0, "max": 10.0, "mean": -50.0}"#).unwrap();
        assert!(matches!(
            aggregator.load(),
            Err(DatasetError::MissingStatsKey { key: "std", .. })
        ));
    }
}
