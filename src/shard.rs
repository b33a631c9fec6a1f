//! Process-level sharding of cache generation.
//!
//! Rendering and spectrogram kernels are not safe to run on several threads, so parallel
//! generation happens in separate processes. Each process owns a disjoint subset of the
//! valid UIDs (by position in the valid list) and writes to its own directory.

use std::fmt;
use std::str::FromStr;

use crate::error::{DatasetError, Result};
use crate::index::PresetUid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    index: usize,
    count: usize,
}

impl ShardSpec {
    pub fn new(index: usize, count: usize) -> Result<Self> {
        if count == 0 || index >= count {
            return Err(DatasetError::Config(format!(
                "invalid shard {index}/{count} (expected index < count)"
            )));
        }
        Ok(Self { index, count })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn owns_position(&self, position: usize) -> bool {
        position % self.count == self.index
    }

    /// UIDs owned by this shard, in valid-list order.
    pub fn select(&self, valid_uids: &[PresetUid]) -> Vec<PresetUid> {
        valid_uids
            .iter()
            .enumerate()
            .filter(|(position, _)| self.owns_position(*position))
            .map(|(_, uid)| *uid)
            .collect()
    }

    /// Every shard of a run split into `count` processes.
    pub fn all(count: usize) -> Result<Vec<Self>> {
        (0..count.max(1)).map(|index| Self::new(index, count)).collect()
    }

    pub(crate) fn dir_suffix(&self) -> String {
        format!("shard-{}-of-{}", self.index, self.count)
    }
}

impl FromStr for ShardSpec {
    type Err = DatasetError;

    /// Parses `"index/count"`, e.g. `"2/8"`.
    fn from_str(text: &str) -> Result<Self> {
        let invalid = || DatasetError::Config(format!("cannot parse shard '{text}' (expected 'index/count')"));
        let (index, count) = text.split_once('/').ok_or_else(invalid)?;
        let index = index.trim().parse().map_err(|_| invalid())?;
        let count = count.trim().parse().map_err(|_| invalid())?;
        Self::new(index, count)
    }
}

impl fmt::Display for ShardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}
