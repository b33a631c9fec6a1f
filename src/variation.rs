//! Data-augmentation variations.
//!
//! Each (preset, note) pair is rendered several times: once per preset-level variant and,
//! for each of those, once per audio-delay variant. A single flat [`VariationIndex`] names
//! one of those renderings; [`VariationCodec`] is the only place where it gets split into
//! its two components or rebuilt from them.

use crate::error::{DatasetError, Result};

/// Flat index of one augmented rendering of a (preset, note) pair.
pub type VariationIndex = usize;

/// The two components of a [`VariationIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Variation {
    pub preset_variation: usize,
    pub audio_delay: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariationCodec {
    nb_preset_variations: usize,
    nb_delay_variations: usize,
}

impl VariationCodec {
    pub fn new(nb_preset_variations: usize, nb_delay_variations: usize) -> Result<Self> {
        if nb_preset_variations == 0 || nb_delay_variations == 0 {
            return Err(DatasetError::Config(format!(
                "variation counts must be positive (got {nb_preset_variations} preset variations, {nb_delay_variations} audio delays)"
            )));
        }
        Ok(Self {
            nb_preset_variations,
            nb_delay_variations,
        })
    }

    /// Codec of a dataset without data augmentation.
    pub fn single() -> Self {
        Self {
            nb_preset_variations: 1,
            nb_delay_variations: 1,
        }
    }

    pub fn nb_preset_variations(&self) -> usize {
        self.nb_preset_variations
    }

    pub fn nb_delay_variations(&self) -> usize {
        self.nb_delay_variations
    }

    /// Number of variations per note.
    pub fn count(&self) -> usize {
        self.nb_preset_variations * self.nb_delay_variations
    }

    pub fn encode(&self, preset_variation: usize, audio_delay: usize) -> Result<VariationIndex> {
        if preset_variation >= self.nb_preset_variations {
            return Err(DatasetError::VariationOutOfRange {
                index: preset_variation,
                count: self.nb_preset_variations,
            });
        }
        if audio_delay >= self.nb_delay_variations {
            return Err(DatasetError::VariationOutOfRange {
                index: audio_delay,
                count: self.nb_delay_variations,
            });
        }
        Ok(audio_delay + preset_variation * self.nb_delay_variations)
    }

    pub fn decode(&self, variation: VariationIndex) -> Result<Variation> {
        if variation >= self.count() {
            return Err(DatasetError::VariationOutOfRange {
                index: variation,
                count: self.count(),
            });
        }
        Ok(Variation {
            preset_variation: variation / self.nb_delay_variations,
            audio_delay: variation % self.nb_delay_variations,
        })
    }

    pub fn indices(&self) -> std::ops::Range<VariationIndex> {
        0..self.count()
    }
}

impl Default for VariationCodec {
    fn default() -> Self {
        Self::single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_then_encode_is_identity() {
        let codec = VariationCodec::new(4, 3).unwrap();
        for v in codec.indices() {
            let Variation {
                preset_variation,
                audio_delay,
            } = codec.decode(v).unwrap();
            assert_eq!(codec.encode(preset_variation, audio_delay).unwrap(), v);
        }
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let codec = VariationCodec::new(2, 5).unwrap();
        for pv in 0..2 {
            for ad in 0..5 {
                let v = codec.encode(pv, ad).unwrap();
                assert_eq!(
                    codec.decode(v).unwrap(),
                    Variation {
                        preset_variation: pv,
                        audio_delay: ad
                    }
                );
            }
        }
    }

    #[test]
    fn audio_delay_is_the_fast_axis() {
        let codec = VariationCodec::new(3, 2).unwrap();
        assert_eq!(codec.encode(0, 1).unwrap(), 1);
        assert_eq!(codec.encode(1, 0).unwrap(), 2);
        assert_eq!(codec.encode(2, 1).unwrap(), 5);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let codec = VariationCodec::new(3, 2).unwrap();
        assert!(matches!(
            codec.decode(6),
            Err(DatasetError::VariationOutOfRange { index: 6, count: 6 })
        ));
        assert!(codec.encode(3, 0).is_err());
        assert!(codec.encode(0, 2).is_err());
    }

    #[test]
    fn zero_counts_are_a_configuration_error() {
        assert!(matches!(VariationCodec::new(0, 2), Err(DatasetError::Config(_))));
        assert!(matches!(VariationCodec::new(2, 0), Err(DatasetError::Config(_))));
    }

    #[test]
    fn single_codec_has_one_variation() {
        let codec = VariationCodec::single();
        assert_eq!(codec.count(), 1);
        assert_eq!(codec.decode(0).unwrap().preset_variation, 0);
    }
}
