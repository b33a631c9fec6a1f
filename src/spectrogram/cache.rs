//! Cache of raw (then normalized) spectrograms, one `.tensor` file per
//! (preset, note, variation).
//!
//! Files live in `{dataset_root}/Specs_{description}/{UID}_{pitch}_{velocity}_{variation}.tensor`.
//! A full regeneration deletes the live folder, renders into a staging folder and renames it
//! into place once every item has been written. Sharded runs write one folder per shard,
//! [`SpectrogramCache::commit_shards`] merges them.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use indicatif::{ParallelProgressIterator, ProgressIterator};
use ndarray::{Array2, Array3, Axis};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::{DatasetConfig, SPECTROGRAMS_FOLDER_PREFIX, SPEC_STATS_FOLDER, TENSOR_EXTENSION};
use crate::error::{io_at, DatasetError, Result};
use crate::index::{MidiNote, PresetUid};
use crate::progress;
use crate::shard::ShardSpec;
use crate::synth::Renderer;
use crate::tensor::{read_tensor, remove_dir_if_exists, reset_dir, write_atomically, write_tensor};
use crate::variation::{VariationCodec, VariationIndex};

use super::normalize::{normalize_in_place, NormalizationMode, NormalizationStats};
use super::transform::SpectrogramTransform;

/// Written in a shard folder once every spectrogram of the shard has been rendered.
const SHARD_DONE_FILE: &str = ".done";

/// One cached spectrogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheKey {
    pub uid: PresetUid,
    pub note: MidiNote,
    pub variation: VariationIndex,
}

impl CacheKey {
    /// Every key of `uids`, in (uid, note, variation) order.
    pub fn all(uids: &[PresetUid], notes: &[MidiNote], codec: &VariationCodec) -> Vec<Self> {
        let mut keys = Vec::with_capacity(uids.len() * notes.len() * codec.count());
        for &uid in uids {
            for &note in notes {
                for variation in codec.indices() {
                    keys.push(Self { uid, note, variation });
                }
            }
        }
        keys
    }

    fn file_name(&self) -> String {
        format!(
            "{}_{}_{}_{}.{TENSOR_EXTENSION}",
            self.uid, self.note.pitch, self.note.velocity, self.variation
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegenerationReport {
    pub items: usize,
    pub elapsed: Duration,
}

impl RegenerationReport {
    pub fn ms_per_item(&self) -> f64 {
        if self.items == 0 {
            return 0.0;
        }
        self.elapsed.as_secs_f64() * 1000.0 / self.items as f64
    }
}

#[derive(Debug, Clone)]
pub struct SpectrogramCache {
    dataset_root: PathBuf,
    description: String,
}

impl SpectrogramCache {
    pub fn new(dataset_root: impl Into<PathBuf>, description: impl Into<String>) -> Self {
        Self {
            dataset_root: dataset_root.into(),
            description: description.into(),
        }
    }

    pub fn from_config(config: &DatasetConfig) -> Self {
        Self::new(config.dataset_root(), config.spectrogram_description())
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn folder(&self) -> PathBuf {
        self.folder_with_suffix("")
    }

    fn staging_folder(&self) -> PathBuf {
        self.folder_with_suffix(".staging")
    }

    pub fn shard_folder(&self, shard: ShardSpec) -> PathBuf {
        self.folder_with_suffix(&format!(".{}", shard.dir_suffix()))
    }

    fn folder_with_suffix(&self, suffix: &str) -> PathBuf {
        self.dataset_root
            .join(format!("{SPECTROGRAMS_FOLDER_PREFIX}{}{suffix}", self.description))
    }

    pub fn path_for(&self, uid: PresetUid, note: MidiNote, variation: VariationIndex) -> PathBuf {
        self.folder().join(CacheKey { uid, note, variation }.file_name())
    }

    pub fn read(&self, uid: PresetUid, note: MidiNote, variation: VariationIndex) -> Result<Array2<f32>> {
        read_tensor(&self.path_for(uid, note, variation))
    }

    /// Spectrograms of several notes stacked along a new leading (channel) axis.
    pub fn read_stacked(
        &self,
        uid: PresetUid,
        notes: &[MidiNote],
        variation: VariationIndex,
    ) -> Result<Array3<f32>> {
        let specs = notes
            .iter()
            .map(|note| self.read(uid, *note, variation))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = specs.iter().map(|spec| spec.view()).collect();
        Ok(ndarray::stack(Axis(0), &views)?)
    }

    /// Number of spectrogram files currently in the live folder.
    pub fn count_files(&self) -> Result<usize> {
        let folder = self.folder();
        if !folder.is_dir() {
            return Ok(0);
        }
        let mut count = 0;
        for entry in fs::read_dir(&folder).map_err(io_at(&folder))? {
            let entry = entry.map_err(io_at(&folder))?;
            if entry.path().extension().is_some_and(|ext| ext == TENSOR_EXTENSION) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Renders and stores the raw spectrogram of every (uid, note, variation).
    ///
    /// Previous spectrograms are deleted before anything is rendered.
    pub fn regenerate_all<R, T>(
        &self,
        uids: &[PresetUid],
        notes: &[MidiNote],
        codec: &VariationCodec,
        renderer: &R,
        transform: &T,
        sample_rate: u32,
    ) -> Result<RegenerationReport>
    where
        R: Renderer + ?Sized,
        T: SpectrogramTransform + ?Sized,
    {
        let folder = self.folder();
        let staging = self.staging_folder();
        info!("Deleting previous spectrograms in '{}'", folder.display());
        remove_dir_if_exists(&folder)?;
        reset_dir(&staging)?;
        let keys = CacheKey::all(uids, notes, codec);
        let report = render_into(&staging, &keys, renderer, transform, sample_rate, "Spectrograms")?;
        fs::rename(&staging, &folder).map_err(io_at(&folder))?;
        info!(
            "Finished writing {} spectrograms into '{}' ({:.1} min, {:.1} ms/spectrogram)",
            report.items,
            folder.display(),
            report.elapsed.as_secs_f64() / 60.0,
            report.ms_per_item()
        );
        Ok(report)
    }

    /// Renders the UIDs owned by `shard` into the shard's own folder.
    pub fn regenerate_shard<R, T>(
        &self,
        shard: ShardSpec,
        uids: &[PresetUid],
        notes: &[MidiNote],
        codec: &VariationCodec,
        renderer: &R,
        transform: &T,
        sample_rate: u32,
    ) -> Result<RegenerationReport>
    where
        R: Renderer + ?Sized,
        T: SpectrogramTransform + ?Sized,
    {
        let folder = self.shard_folder(shard);
        reset_dir(&folder)?;
        let keys = CacheKey::all(&shard.select(uids), notes, codec);
        let prefix = format!("Shard {shard}");
        let report = render_into(&folder, &keys, renderer, transform, sample_rate, &prefix)?;
        write_atomically(&folder.join(SHARD_DONE_FILE), |writer| {
            writeln!(writer, "{}", report.items).map_err(io_at(&folder))
        })?;
        info!(
            "Shard {} wrote {} spectrograms into '{}' ({:.1} ms/spectrogram)",
            shard,
            report.items,
            folder.display(),
            report.ms_per_item()
        );
        Ok(report)
    }

    /// Moves the output of every shard of a `shard_count`-way run into the live folder.
    /// Nothing is touched if a shard folder is missing or its render did not complete.
    pub fn commit_shards(&self, shard_count: usize) -> Result<usize> {
        let shard_folders = ShardSpec::all(shard_count)?
            .into_iter()
            .map(|shard| self.shard_folder(shard))
            .collect::<Vec<_>>();
        if let Some(missing) = shard_folders
            .iter()
            .find(|dir| !dir.join(SHARD_DONE_FILE).is_file())
        {
            return Err(DatasetError::MissingShard {
                path: missing.clone(),
            });
        }
        let folder = self.folder();
        let staging = self.staging_folder();
        remove_dir_if_exists(&folder)?;
        reset_dir(&staging)?;
        let mut moved = 0;
        for shard_folder in &shard_folders {
            for entry in fs::read_dir(shard_folder).map_err(io_at(shard_folder))? {
                let source = entry.map_err(io_at(shard_folder))?.path();
                // Skips the done marker and temporary files.
                if !source.extension().is_some_and(|ext| ext == TENSOR_EXTENSION) {
                    continue;
                }
                let Some(name) = source.file_name() else { continue };
                let target = staging.join(name);
                fs::rename(&source, &target).map_err(io_at(&target))?;
                moved += 1;
            }
            remove_dir_if_exists(shard_folder)?;
        }
        fs::rename(&staging, &folder).map_err(io_at(&folder))?;
        info!("Committed {} shards ({} spectrograms) into '{}'", shard_count, moved, folder.display());
        Ok(moved)
    }

    /// Rewrites every cached spectrogram in normalized form. Stats must have been computed
    /// from the raw spectrograms beforehand.
    pub fn apply_normalization_in_place(
        &self,
        uids: &[PresetUid],
        notes: &[MidiNote],
        codec: &VariationCodec,
        stats: &NormalizationStats,
        mode: NormalizationMode,
    ) -> Result<usize> {
        if !mode.needs_stats() {
            return Ok(0);
        }
        let start = Instant::now();
        let folder = self.folder();
        let keys = CacheKey::all(uids, notes, codec);
        let pb = progress::bar(keys.len(), "Normalizing")?;
        keys.par_iter().progress_with(pb).try_for_each(|key| -> Result<()> {
            let path = folder.join(key.file_name());
            let mut spec = read_tensor(&path)?;
            normalize_in_place(&mut spec, stats, mode);
            write_tensor(&path, &spec)
        })?;
        info!(
            "Normalized {} spectrograms ({}) in {:.1}s",
            keys.len(),
            mode,
            start.elapsed().as_secs_f64()
        );
        Ok(keys.len())
    }

    /// Deletes every spectrogram folder of the dataset, whatever its description, and the
    /// stats folder. Returns the number of folders removed.
    pub fn delete_all(dataset_root: &Path) -> Result<usize> {
        let pattern = dataset_root.join(format!("{SPECTROGRAMS_FOLDER_PREFIX}*"));
        let mut removed = 0;
        for entry in glob::glob(&pattern.to_string_lossy())? {
            let path = entry.map_err(|err| {
                let path = err.path().to_path_buf();
                io_at(&path)(err.into())
            })?;
            if path.is_dir() {
                remove_dir_if_exists(&path)?;
                removed += 1;
            }
        }
        let stats_folder = dataset_root.join(SPEC_STATS_FOLDER);
        if stats_folder.is_dir() {
            remove_dir_if_exists(&stats_folder)?;
            removed += 1;
        } else {
            warn!("Spectrogram stats folder '{}' does not exist", stats_folder.display());
        }
        info!("Deleted {} spectrogram folders from '{}'", removed, dataset_root.display());
        Ok(removed)
    }
}

fn render_into<R, T>(
    dir: &Path,
    keys: &[CacheKey],
    renderer: &R,
    transform: &T,
    sample_rate: u32,
    prefix: &str,
) -> Result<RegenerationReport>
where
    R: Renderer + ?Sized,
    T: SpectrogramTransform + ?Sized,
{
    let start = Instant::now();
    // Renderers and transforms are not thread-safe: one item at a time.
    for key in keys.iter().progress_with(progress::bar(keys.len(), prefix)?) {
        let audio = renderer.render(key.uid, key.note, key.variation)?;
        if audio.sample_rate != sample_rate {
            return Err(DatasetError::SampleRateMismatch {
                uid: key.uid,
                expected: sample_rate,
                actual: audio.sample_rate,
            });
        }
        let spec = transform.compute(&audio.samples)?;
        write_tensor(&dir.join(key.file_name()), &spec)?;
    }
    Ok(RegenerationReport {
        items: keys.len(),
        elapsed: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::synth::RenderedAudio;
    use ndarray::array;
    use tempfile::tempdir;

    /// Renders a constant signal whose value encodes the request.
    struct ConstRenderer {
        sample_rate: u32,
        calls: Cell<usize>,
    }

    impl Renderer for ConstRenderer {
        fn render(&self, uid: PresetUid, note: MidiNote, variation: VariationIndex) -> Result<RenderedAudio> {
            self.calls.set(self.calls.get() + 1);
            let value = uid.0 as f32 + note.pitch as f32 / 1000.0 + variation as f32 / 10.0;
            Ok(RenderedAudio {
                samples: vec![value; 4],
                sample_rate: self.sample_rate,
            })
        }
    }

    /// 1x2 "spectrogram" holding the first sample twice.
    struct Passthrough;

    impl SpectrogramTransform for Passthrough {
        fn compute(&self, waveform: &[f32]) -> Result<Array2<f32>> {
            Ok(array![[waveform[0], waveform[0]]])
        }
    }

    fn notes() -> Vec<MidiNote> {
        vec![MidiNote::new(40, 85).unwrap(), MidiNote::new(60, 85).unwrap()]
    }

    fn renderer(sample_rate: u32) -> ConstRenderer {
        ConstRenderer {
            sample_rate,
            calls: Cell::new(0),
        }
    }

    #[test]
    fn paths_follow_the_naming_scheme() {
        let cache = SpectrogramCache::new("/data/dexed", "257x64_melNone_norm_min_max");
        assert_eq!(
            cache.path_for(PresetUid(42), MidiNote::new(60, 100).unwrap(), 3),
            PathBuf::from("/data/dexed/Specs_257x64_melNone_norm_min_max/42_60_100_3.tensor")
        );
    }

    #[test]
    fn regeneration_writes_every_item_and_replaces_stale_files() {
        let dir = tempdir().unwrap();
        let cache = SpectrogramCache::new(dir.path(), "test");
        fs::create_dir_all(cache.folder()).unwrap();
        fs::write(cache.folder().join("999_1_1_0.tensor"), b"stale").unwrap();

        let codec = VariationCodec::new(2, 1).unwrap();
        let uids = [PresetUid(3), PresetUid(8)];
        let renderer = renderer(16000);
        let report = cache
            .regenerate_all(&uids, &notes(), &codec, &renderer, &Passthrough, 16000)
            .unwrap();
        assert_eq!(report.items, 8);
        assert_eq!(renderer.calls.get(), 8);
        assert_eq!(cache.count_files().unwrap(), 8);
        assert!(!cache.folder().join("999_1_1_0.tensor").exists());
        assert!(!cache.staging_folder().exists());

        let spec = cache.read(PresetUid(8), notes()[1], 1).unwrap();
        assert_eq!(spec.dim(), (1, 2));
        assert!((spec[[0, 1]] - 8.16).abs() < 1e-4);
        let stacked = cache.read_stacked(PresetUid(3), &notes(), 0).unwrap();
        assert_eq!(stacked.shape(), &[2, 1, 2]);
    }

    #[test]
    fn sample_rate_mismatch_aborts_regeneration() {
        let dir = tempdir().unwrap();
        let cache = SpectrogramCache::new(dir.path(), "test");
        let err = cache
            .regenerate_all(&[PresetUid(1)], &notes(), &VariationCodec::single(), &renderer(44100), &Passthrough, 16000)
            .unwrap_err();
        assert!(matches!(
            err,
            DatasetError::SampleRateMismatch {
                expected: 16000,
                actual: 44100,
                ..
            }
        ));
        assert!(!cache.folder().exists());
    }

    #[test]
    fn shards_are_committed_into_the_live_folder() {
        let dir = tempdir().unwrap();
        let cache = SpectrogramCache::new(dir.path(), "test");
        let uids: Vec<_> = (0..5).map(PresetUid).collect();
        let codec = VariationCodec::single();

        let first = ShardSpec::new(0, 2).unwrap();
        cache
            .regenerate_shard(first, &uids, &notes(), &codec, &renderer(16000), &Passthrough, 16000)
            .unwrap();
        assert!(matches!(
            cache.commit_shards(2),
            Err(DatasetError::MissingShard { .. })
        ));

        let second = ShardSpec::new(1, 2).unwrap();
        let report = cache
            .regenerate_shard(second, &uids, &notes(), &codec, &renderer(16000), &Passthrough, 16000)
            .unwrap();
        assert_eq!(report.items, 4);
        assert_eq!(cache.commit_shards(2).unwrap(), 10);
        assert_eq!(cache.count_files().unwrap(), 10);
        assert!(!cache.shard_folder(first).exists());
        assert!(cache.read(PresetUid(3), notes()[0], 0).is_ok());
    }

    /// Fails on every render of one preset.
    struct FailingRenderer {
        inner: ConstRenderer,
        failing_uid: PresetUid,
    }

    impl Renderer for FailingRenderer {
        fn render(&self, uid: PresetUid, note: MidiNote, variation: VariationIndex) -> Result<RenderedAudio> {
            if uid == self.failing_uid {
                return Err(DatasetError::UidNotFound(uid));
            }
            self.inner.render(uid, note, variation)
        }
    }

    #[test]
    fn incomplete_shard_is_not_committed() {
        let dir = tempdir().unwrap();
        let cache = SpectrogramCache::new(dir.path(), "test");
        let uids: Vec<_> = (0..5).map(PresetUid).collect();
        let codec = VariationCodec::single();
        cache
            .regenerate_all(&uids, &notes(), &codec, &renderer(16000), &Passthrough, 16000)
            .unwrap();

        let first = ShardSpec::new(0, 2).unwrap();
        cache
            .regenerate_shard(first, &uids, &notes(), &codec, &renderer(16000), &Passthrough, 16000)
            .unwrap();
        // Shard 1/2 owns UIDs 1 and 3, and UID 3 fails.
        let second = ShardSpec::new(1, 2).unwrap();
        let failing = FailingRenderer {
            inner: renderer(16000),
            failing_uid: PresetUid(3),
        };
        assert!(cache
            .regenerate_shard(second, &uids, &notes(), &codec, &failing, &Passthrough, 16000)
            .is_err());
        assert!(cache.shard_folder(second).is_dir());

        assert!(matches!(
            cache.commit_shards(2),
            Err(DatasetError::MissingShard { path }) if path == cache.shard_folder(second)
        ));
        // The previous live cache is left untouched.
        assert_eq!(cache.count_files().unwrap(), 10);

        fs::write(cache.shard_folder(first).join("0_40_85_0.tensor.tmp"), b"partial").unwrap();
        cache
            .regenerate_shard(second, &uids, &notes(), &codec, &renderer(16000), &Passthrough, 16000)
            .unwrap();
        assert_eq!(cache.commit_shards(2).unwrap(), 10);
        assert_eq!(fs::read_dir(cache.folder()).unwrap().count(), 10);
    }

    #[test]
    fn normalization_rewrites_files() {
        let dir = tempdir().unwrap();
        let cache = SpectrogramCache::new(dir.path(), "test");
        let uids = [PresetUid(1), PresetUid(2)];
        let codec = VariationCodec::single();
        cache
            .regenerate_all(&uids, &notes(), &codec, &renderer(16000), &Passthrough, 16000)
            .unwrap();
        let stats = NormalizationStats {
            min: 0.0,
            max: 4.0,
            mean: 2.0,
            std: 1.0,
        };
        let count = cache
            .apply_normalization_in_place(&uids, &notes(), &codec, &stats, NormalizationMode::MeanStd)
            .unwrap();
        assert_eq!(count, 4);
        let spec = cache.read(PresetUid(2), notes()[0], 0).unwrap();
        assert!((spec[[0, 0]] - 0.04).abs() < 1e-5);

        let untouched = cache
            .apply_normalization_in_place(&uids, &notes(), &codec, &stats, NormalizationMode::None)
            .unwrap();
        assert_eq!(untouched, 0);
    }

    #[test]
    fn delete_all_removes_every_description() {
        let dir = tempdir().unwrap();
        for name in ["Specs_a", "Specs_b.shard-0-of-2", SPEC_STATS_FOLDER, "Audio"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        assert_eq!(SpectrogramCache::delete_all(dir.path()).unwrap(), 3);
        assert!(dir.path().join("Audio").is_dir());
        assert!(!dir.path().join("Specs_a").exists());
    }
}
