//! Cache of learnable preset tensors, one file per (UID, preset variation), plus the
//! per-class sample counts of categorical parameters.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;

use indicatif::ProgressIterator;
use ndarray::{s, Array2};
use tracing::info;

use crate::config::{CAT_PARAMS_COUNTS_FILE, LEARNABLE_PRESETS_FOLDER, TENSOR_EXTENSION};
use crate::error::{io_at, DatasetError, Result};
use crate::index::PresetUid;
use crate::progress;
use crate::synth::{LearnableEncoder, PresetProvider};
use crate::tensor::{read_tensor, remove_dir_if_exists, reset_dir, write_atomically, write_tensor};

/// Samples count of each class, by categorical parameter index.
pub type CategoricalClassCounts = BTreeMap<usize, Vec<u64>>;

#[derive(Debug, Clone)]
pub struct LearnablePresetCache {
    dataset_root: PathBuf,
}

impl LearnablePresetCache {
    pub fn new(dataset_root: impl Into<PathBuf>) -> Self {
        Self {
            dataset_root: dataset_root.into(),
        }
    }

    pub fn folder(&self) -> PathBuf {
        self.dataset_root.join(LEARNABLE_PRESETS_FOLDER)
    }

    fn staging_folder(&self) -> PathBuf {
        self.dataset_root.join(format!("{LEARNABLE_PRESETS_FOLDER}.staging"))
    }

    pub fn path_for(&self, uid: PresetUid, preset_variation: usize) -> PathBuf {
        self.folder().join(file_name(uid, preset_variation))
    }

    pub fn class_counts_path(&self) -> PathBuf {
        self.folder().join(CAT_PARAMS_COUNTS_FILE)
    }

    pub fn read(&self, uid: PresetUid, preset_variation: usize) -> Result<Array2<f32>> {
        read_tensor(&self.path_for(uid, preset_variation))
    }

    /// Encodes and stores every (uid, preset variation), counting the classes of categorical
    /// parameters on the way. Fails on the first tensor that breaks one-hot encoding.
    pub fn regenerate_all<P, E>(
        &self,
        uids: &[PresetUid],
        nb_preset_variations: usize,
        provider: &P,
        encoder: &E,
    ) -> Result<CategoricalClassCounts>
    where
        P: PresetProvider + ?Sized,
        E: LearnableEncoder + ?Sized,
    {
        let start = Instant::now();
        let folder = self.folder();
        let staging = self.staging_folder();
        remove_dir_if_exists(&folder)?;
        reset_dir(&staging)?;

        let layout = encoder.layout();
        let mut counts: CategoricalClassCounts = layout
            .categorical()
            .map(|(param_index, columns)| (param_index, vec![0; columns.len()]))
            .collect();
        let total = uids.len() * nb_preset_variations;
        let pb = progress::bar(total, "Learnable presets")?;
        for (uid, preset_variation) in uids
            .iter()
            .flat_map(|&uid| (0..nb_preset_variations).map(move |pv| (uid, pv)))
            .progress_with(pb)
        {
            let preset = provider.full_preset(uid, preset_variation)?;
            let tensor = encoder.encode(&preset)?;
            layout.check_one_hot(&tensor, uid, preset_variation)?;
            for (param_index, columns) in layout.categorical() {
                let group = tensor.slice(s![0, columns]);
                if let Some(class) = group.iter().position(|&v| v != 0.0) {
                    if let Some(count) = counts.get_mut(&param_index).and_then(|c| c.get_mut(class)) {
                        *count += 1;
                    }
                }
            }
            write_tensor(&staging.join(file_name(uid, preset_variation)), &tensor)?;
        }
        write_atomically(&staging.join(CAT_PARAMS_COUNTS_FILE), |writer| {
            Ok(serde_json::to_writer(writer, &counts)?)
        })?;
        fs::rename(&staging, &folder).map_err(io_at(&folder))?;
        info!(
            "Finished writing {} learnable presets into '{}' ({:.1}s)",
            total,
            folder.display(),
            start.elapsed().as_secs_f64()
        );
        Ok(counts)
    }

    pub fn class_counts(&self) -> Result<CategoricalClassCounts> {
        let path = self.class_counts_path();
        read_class_counts(&path)
    }
}

fn file_name(uid: PresetUid, preset_variation: usize) -> String {
    format!("{uid}_{preset_variation}.{TENSOR_EXTENSION}")
}

fn read_class_counts(path: &Path) -> Result<CategoricalClassCounts> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(DatasetError::StatsNotComputed {
            path: path.to_path_buf(),
        }),
        Err(err) => Err(io_at(path)(err)),
    }
}
