//! Synth presets and their learnable (tensor) representation.
//!
//! A full preset holds one normalized value in [0, 1] per synth parameter. Its learnable
//! representation is a `(1, width)` tensor: numerical parameters take one column each,
//! categorical parameters take one column per class (one-hot), fixed parameters are not
//! learned and take no column.

use std::ops::Range;
use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{io_at, DatasetError, Result};
use crate::index::PresetUid;
use crate::synth::LearnableEncoder;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamKind {
    Numerical,
    Categorical { cardinality: usize },
    /// Constant or unused parameter.
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParamKind,
}

/// Ordered description of every parameter of the synth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ParamSpec>", into = "Vec<ParamSpec>")]
pub struct ParamModel {
    params: Vec<ParamSpec>,
}

impl ParamModel {
    pub fn new(params: Vec<ParamSpec>) -> Result<Self> {
        for spec in &params {
            if let ParamKind::Categorical { cardinality: 0 } = spec.kind {
                return Err(DatasetError::Config(format!(
                    "categorical parameter '{}' has a zero cardinality",
                    spec.name
                )));
            }
        }
        Ok(Self { params })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(io_at(path))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl TryFrom<Vec<ParamSpec>> for ParamModel {
    type Error = DatasetError;

    fn try_from(params: Vec<ParamSpec>) -> Result<Self> {
        Self::new(params)
    }
}

impl From<ParamModel> for Vec<ParamSpec> {
    fn from(model: ParamModel) -> Self {
        model.params
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FullPreset {
    pub uid: PresetUid,
    /// One normalized value per parameter of the [`ParamModel`].
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearnableColumns {
    Numerical { column: usize },
    Categorical { columns: Range<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnableParam {
    /// Index of the parameter in the full preset.
    pub param_index: usize,
    pub columns: LearnableColumns,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnableLayout {
    params: Vec<LearnableParam>,
    width: usize,
}

impl LearnableLayout {
    pub fn from_model(model: &ParamModel) -> Self {
        let mut params = Vec::new();
        let mut width = 0;
        for (param_index, spec) in model.params().iter().enumerate() {
            let columns = match spec.kind {
                ParamKind::Numerical => {
                    width += 1;
                    LearnableColumns::Numerical { column: width - 1 }
                }
                ParamKind::Categorical { cardinality } => {
                    width += cardinality;
                    LearnableColumns::Categorical {
                        columns: width - cardinality..width,
                    }
                }
                ParamKind::Fixed => continue,
            };
            params.push(LearnableParam {
                param_index,
                columns,
            });
        }
        Self { params, width }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn params(&self) -> &[LearnableParam] {
        &self.params
    }

    /// (parameter index, one-hot columns) of every categorical parameter.
    pub fn categorical(&self) -> impl Iterator<Item = (usize, Range<usize>)> + '_ {
        self.params.iter().filter_map(|p| match &p.columns {
            LearnableColumns::Categorical { columns } => Some((p.param_index, columns.clone())),
            LearnableColumns::Numerical { .. } => None,
        })
    }

    fn check_shape(&self, tensor: &Array2<f32>) -> Result<()> {
        if tensor.dim() != (1, self.width) {
            return Err(DatasetError::Config(format!(
                "learnable tensor has shape {:?}, expected (1, {})",
                tensor.dim(),
                self.width
            )));
        }
        Ok(())
    }

    /// Every categorical group must hold exactly one nonzero element, summing to 1.
    pub fn check_one_hot(
        &self,
        tensor: &Array2<f32>,
        uid: PresetUid,
        preset_variation: usize,
    ) -> Result<()> {
        self.check_shape(tensor)?;
        let row = tensor.row(0);
        for (param_index, columns) in self.categorical() {
            let group = row.slice(ndarray::s![columns]);
            let nonzero = group.iter().filter(|&&v| v != 0.0).count();
            let sum = group.sum();
            if nonzero != 1 || sum != 1.0 {
                return Err(DatasetError::OneHotViolation {
                    uid,
                    preset_variation,
                    param_index,
                    nonzero,
                    sum,
                });
            }
        }
        Ok(())
    }

    /// Class (argmax of the one-hot group) of a categorical parameter.
    pub fn class_of(&self, tensor: &Array2<f32>, param_index: usize) -> Option<usize> {
        let (_, columns) = self.categorical().find(|(idx, _)| *idx == param_index)?;
        let row = tensor.row(0);
        row.slice(ndarray::s![columns])
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (class, &v)| match best {
                Some((_, best_v)) if best_v >= v => best,
                _ => Some((class, v)),
            })
            .map(|(class, _)| class)
    }
}

/// Default learnable encoding: numerical values copied, categorical values one-hot encoded.
#[derive(Debug, Clone)]
pub struct OneHotEncoder {
    model: ParamModel,
    layout: LearnableLayout,
}

impl OneHotEncoder {
    pub fn new(model: ParamModel) -> Self {
        let layout = LearnableLayout::from_model(&model);
        Self { model, layout }
    }

    pub fn model(&self) -> &ParamModel {
        &self.model
    }
}

/// Class of a normalized value quantized on `cardinality` evenly spaced steps.
pub fn quantized_class(value: f32, cardinality: usize) -> usize {
    let steps = cardinality.saturating_sub(1) as f32;
    (value.clamp(0.0, 1.0) * steps).round() as usize
}

impl LearnableEncoder for OneHotEncoder {
    fn layout(&self) -> &LearnableLayout {
        &self.layout
    }

    fn encode(&self, preset: &FullPreset) -> Result<Array2<f32>> {
        if preset.values.len() != self.model.len() {
            return Err(DatasetError::Config(format!(
                "preset UID {} has {} parameter values, the synth has {} parameters",
                preset.uid,
                preset.values.len(),
                self.model.len()
            )));
        }
        let mut tensor = Array2::<f32>::zeros((1, self.layout.width()));
        for param in self.layout.params() {
            let value = preset.values[param.param_index];
            match &param.columns {
                LearnableColumns::Numerical { column } => tensor[[0, *column]] = value,
                LearnableColumns::Categorical { columns } => {
                    let class = quantized_class(value, columns.len());
                    tensor[[0, columns.start + class]] = 1.0;
                }
            }
        }
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ParamModel {
        serde_json::from_str(
            r#"[
                {"name": "algorithm", "kind": "categorical", "cardinality": 4},
                {"name": "cutoff", "kind": "numerical"},
                {"name": "master_tune", "kind": "fixed"},
                {"name": "lfo_wave", "kind": "categorical", "cardinality": 3}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn layout_skips_fixed_params() {
        let layout = LearnableLayout::from_model(&model());
        assert_eq!(layout.width(), 4 + 1 + 3);
        let categorical: Vec<_> = layout.categorical().collect();
        assert_eq!(categorical, vec![(0, 0..4), (3, 5..8)]);
    }

    #[test]
    fn encoder_one_hot_encodes_categorical_values() {
        let encoder = OneHotEncoder::new(model());
        let preset = FullPreset {
            uid: PresetUid(3),
            values: vec![2.0 / 3.0, 0.25, 0.5, 1.0],
        };
        let tensor = encoder.encode(&preset).unwrap();
        assert_eq!(tensor.row(0).to_vec(), vec![0.0, 0.0, 1.0, 0.0, 0.25, 0.0, 0.0, 1.0]);
        encoder.layout().check_one_hot(&tensor, preset.uid, 0).unwrap();
        assert_eq!(encoder.layout().class_of(&tensor, 0), Some(2));
        assert_eq!(encoder.layout().class_of(&tensor, 3), Some(2));
        assert_eq!(encoder.layout().class_of(&tensor, 1), None);
    }

    #[test]
    fn broken_one_hot_group_is_detected() {
        let layout = LearnableLayout::from_model(&model());
        let mut tensor = Array2::<f32>::zeros((1, layout.width()));
        tensor[[0, 1]] = 1.0;
        tensor[[0, 5]] = 1.0;
        tensor[[0, 6]] = 1.0;
        let err = layout.check_one_hot(&tensor, PresetUid(9), 1).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::OneHotViolation {
                param_index: 3,
                nonzero: 2,
                ..
            }
        ));
    }

    #[test]
    fn wrong_value_count_is_rejected() {
        let encoder = OneHotEncoder::new(model());
        let preset = FullPreset {
            uid: PresetUid(1),
            values: vec![0.0; 2],
        };
        assert!(encoder.encode(&preset).is_err());
    }

    #[test]
    fn zero_cardinality_is_rejected() {
        let parsed: std::result::Result<ParamModel, _> =
            serde_json::from_str(r#"[{"name": "x", "kind": "categorical", "cardinality": 0}]"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn quantization_rounds_to_nearest_step() {
        assert_eq!(quantized_class(0.0, 8), 0);
        assert_eq!(quantized_class(1.0, 8), 7);
        assert_eq!(quantized_class(0.49, 3), 1);
        assert_eq!(quantized_class(0.7, 1), 0);
    }
}
