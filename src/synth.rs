//! Capabilities a synthesizer backend provides to the dataset.
//!
//! A backend renders audio for a (preset, note, variation), hands out full presets, and
//! encodes them into their learnable representation. Concrete synths implement these traits
//! instead of sharing state with the dataset.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::Result;
use crate::index::{MidiNote, PresetUid};
use crate::preset::{FullPreset, LearnableLayout};
use crate::variation::VariationIndex;

/// Longest onset delay of the audio-delay augmentation, in seconds.
pub const MAX_AUDIO_DELAY_SECONDS: f32 = 0.002;

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedAudio {
    /// Mono samples.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

pub trait Renderer {
    fn render(&self, uid: PresetUid, note: MidiNote, variation: VariationIndex) -> Result<RenderedAudio>;
}

pub trait PresetProvider {
    fn full_preset(&self, uid: PresetUid, preset_variation: usize) -> Result<FullPreset>;
}

pub trait LearnableEncoder {
    /// Column layout of the tensors produced by [`LearnableEncoder::encode`].
    fn layout(&self) -> &LearnableLayout;

    fn encode(&self, preset: &FullPreset) -> Result<Array2<f32>>;
}

pub trait SynthBackend: Renderer + PresetProvider + LearnableEncoder {
    fn synth_name(&self) -> &str;

    /// Every preset UID of the registry, in registry order (exclusions not applied).
    fn preset_uids(&self) -> Vec<PresetUid>;

    fn preset_name(&self, _uid: PresetUid) -> Option<String> {
        None
    }
}

/// Delays the note onset by a few samples (at most 2 ms), filling the start with zeros.
/// The length of `audio` is preserved and the delay only depends on `seed`.
pub fn pseudo_random_audio_delay(audio: &mut [f32], sample_rate: u32, seed: u64) -> usize {
    let mut rng = StdRng::seed_from_u64(seed);
    let max_delay = ((sample_rate as f32 * MAX_AUDIO_DELAY_SECONDS) as usize).max(1);
    let delay = rng.random_range(1..=max_delay);
    if delay >= audio.len() {
        audio.fill(0.0);
        return audio.len();
    }
    audio.rotate_right(delay);
    audio[..delay].fill(0.0);
    delay
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_shifts_audio_and_keeps_length() {
        let mut audio: Vec<f32> = (1..=200).map(|i| i as f32).collect();
        let delay = pseudo_random_audio_delay(&mut audio, 16000, 7);
        assert!((1..=32).contains(&delay));
        assert_eq!(audio.len(), 200);
        assert!(audio[..delay].iter().all(|&s| s == 0.0));
        assert_eq!(audio[delay], 1.0);
    }

    #[test]
    fn delay_is_reproducible() {
        let mut a = vec![1.0_f32; 500];
        let mut b = vec![1.0_f32; 500];
        assert_eq!(
            pseudo_random_audio_delay(&mut a, 44100, 99),
            pseudo_random_audio_delay(&mut b, 44100, 99)
        );
        assert_eq!(a, b);
    }

    #[test]
    fn short_audio_is_silenced() {
        let mut audio = vec![1.0_f32; 2];
        let delay = pseudo_random_audio_delay(&mut audio, 48000, 3);
        assert!(delay >= 1);
        assert!(audio.iter().all(|&s| s == 0.0) || audio[0] == 0.0);
    }
}
