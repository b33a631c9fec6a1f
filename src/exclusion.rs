//! Lists of preset UIDs left out of a dataset.
//!
//! Plain text, one or more comma-separated UIDs per line. Blank lines and lines starting
//! with `#` are ignored. A token that is not an integer UID is reported and skipped, the
//! rest of the file still loads.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::warn;

use crate::error::{io_at, Result};
use crate::index::PresetUid;

/// A token of an exclusion list that could not be parsed into a UID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedToken {
    /// 1-based line number.
    pub line: usize,
    pub token: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    uids: BTreeSet<PresetUid>,
    warnings: Vec<MalformedToken>,
}

impl ExclusionList {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads an exclusion file. A missing file is not an error: nothing gets excluded.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text, &path.display().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Cannot find preset UIDs to be excluded (missing file: '{}')",
                    path.display()
                );
                Ok(Self::empty())
            }
            Err(err) => Err(io_at(path)(err)),
        }
    }

    /// `source` only names the input in warnings.
    pub fn parse(text: &str, source: &str) -> Self {
        let mut list = Self::empty();
        for (line_index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            for token in line.split(',').map(str::trim) {
                // Trailing commas leave empty tokens behind.
                if token.is_empty() {
                    continue;
                }
                match token.parse::<u32>() {
                    Ok(uid) => {
                        list.uids.insert(PresetUid(uid));
                    }
                    Err(_) => {
                        warn!(
                            "File {}, line {}: cannot parse '{}' into an integer preset UID",
                            source,
                            line_index + 1,
                            token
                        );
                        list.warnings.push(MalformedToken {
                            line: line_index + 1,
                            token: token.to_string(),
                        });
                    }
                }
            }
        }
        list
    }

    pub fn contains(&self, uid: PresetUid) -> bool {
        self.uids.contains(&uid)
    }

    pub fn uids(&self) -> &BTreeSet<PresetUid> {
        &self.uids
    }

    pub fn warnings(&self) -> &[MalformedToken] {
        &self.warnings
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }
}
