//! Mapping between flat dataset indices and (preset UID, MIDI notes).
//!
//! With stacked spectrograms, one dataset item holds every note of a preset, so the dataset
//! has one item per valid preset. Otherwise each (preset, note) pair is its own item and the
//! dataset length is multiplied by the number of notes: item `i` is note `i % n_notes` of
//! preset `valid_uids[i / n_notes]`.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DatasetError, Result};
use crate::exclusion::ExclusionList;

/// Stable identity of one preset (or instrument recording) in the source registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresetUid(pub u32);

impl fmt::Display for PresetUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for PresetUid {
    fn from(uid: u32) -> Self {
        Self(uid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "(u32, u32)")]
pub struct MidiNote {
    pub pitch: u8,
    pub velocity: u8,
}

impl MidiNote {
    pub fn new(pitch: u32, velocity: u32) -> Result<Self> {
        let pitch = midi_value("pitch", pitch)?;
        let velocity = midi_value("velocity", velocity)?;
        Ok(Self { pitch, velocity })
    }
}

fn midi_value(what: &'static str, value: u32) -> Result<u8> {
    match u8::try_from(value) {
        Ok(v) if v <= 127 => Ok(v),
        _ => Err(DatasetError::MidiOutOfRange { what, value }),
    }
}

impl TryFrom<(u32, u32)> for MidiNote {
    type Error = DatasetError;

    fn try_from((pitch, velocity): (u32, u32)) -> Result<Self> {
        Self::new(pitch, velocity)
    }
}

impl fmt::Display for MidiNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.pitch, self.velocity)
    }
}

/// Which notes of a preset a dataset item holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteSelector {
    /// Every configured note, stacked as channels.
    All,
    Single { index: usize, note: MidiNote },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemKey {
    pub uid: PresetUid,
    pub notes: NoteSelector,
}

/// Dataset indices of one preset: a single item when stacked, one item per note otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetIndices {
    Single(usize),
    PerNote(Vec<usize>),
}

impl DatasetIndices {
    pub fn contains(&self, index: usize) -> bool {
        match self {
            Self::Single(i) => *i == index,
            Self::PerNote(indices) => indices.contains(&index),
        }
    }

    pub fn to_vec(&self) -> Vec<usize> {
        match self {
            Self::Single(i) => vec![*i],
            Self::PerNote(indices) => indices.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexMapper {
    valid_uids: Vec<PresetUid>,
    positions: HashMap<PresetUid, usize>,
    notes: Vec<MidiNote>,
    stacked: bool,
}

impl IndexMapper {
    pub fn new(valid_uids: Vec<PresetUid>, notes: Vec<MidiNote>, stacked: bool) -> Result<Self> {
        if notes.is_empty() {
            return Err(DatasetError::Config("at least one MIDI note is required".into()));
        }
        // A 1-note dataset cannot handle multi-note stacked spectrograms.
        if notes.len() == 1 && stacked {
            return Err(DatasetError::StackedSingleNote);
        }
        let mut positions = HashMap::with_capacity(valid_uids.len());
        for (position, uid) in valid_uids.iter().enumerate() {
            if positions.insert(*uid, position).is_some() {
                return Err(DatasetError::Config(format!("duplicate preset UID {uid}")));
            }
        }
        Ok(Self {
            valid_uids,
            positions,
            notes,
            stacked,
        })
    }

    /// Keeps the registry's order, minus the excluded UIDs.
    pub fn from_registry(
        all_uids: impl IntoIterator<Item = PresetUid>,
        excluded: &ExclusionList,
        notes: Vec<MidiNote>,
        stacked: bool,
    ) -> Result<Self> {
        let valid_uids = all_uids
            .into_iter()
            .filter(|uid| !excluded.contains(*uid))
            .collect();
        Self::new(valid_uids, notes, stacked)
    }

    pub fn len(&self) -> usize {
        if self.stacked {
            self.valid_uids.len()
        } else {
            self.valid_uids.len() * self.notes.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stacked(&self) -> bool {
        self.stacked
    }

    pub fn valid_uids(&self) -> &[PresetUid] {
        &self.valid_uids
    }

    pub fn notes(&self) -> &[MidiNote] {
        &self.notes
    }

    /// Position of `uid` in the valid list.
    pub fn position_of(&self, uid: PresetUid) -> Option<usize> {
        self.positions.get(&uid).copied()
    }

    pub fn index_to_key(&self, index: usize) -> Result<ItemKey> {
        if index >= self.len() {
            return Err(DatasetError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        if self.stacked {
            return Ok(ItemKey {
                uid: self.valid_uids[index],
                notes: NoteSelector::All,
            });
        }
        let n_notes = self.notes.len();
        let note_index = index % n_notes;
        Ok(ItemKey {
            uid: self.valid_uids[index / n_notes],
            notes: NoteSelector::Single {
                index: note_index,
                note: self.notes[note_index],
            },
        })
    }

    pub fn uid_to_indices(&self, uid: PresetUid) -> Result<DatasetIndices> {
        let position = self
            .position_of(uid)
            .ok_or(DatasetError::UidNotFound(uid))?;
        if self.stacked {
            return Ok(DatasetIndices::Single(position));
        }
        let n_notes = self.notes.len();
        let base = position * n_notes;
        Ok(DatasetIndices::PerNote((base..base + n_notes).collect()))
    }

    /// Notes selected by `selector`, in configuration order.
    pub fn selected_notes(&self, selector: NoteSelector) -> Vec<MidiNote> {
        match selector {
            NoteSelector::All => self.notes.clone(),
            NoteSelector::Single { note, .. } => vec![note],
        }
    }
}
