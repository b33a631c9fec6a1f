//! Log-scaled STFT and Mel spectrograms.

use std::f32::consts::PI;
use std::sync::Arc;

use ndarray::{Array1, Array2};
use realfft::{RealFftPlanner, RealToComplex};

use crate::config::DatasetConfig;
use crate::error::{DatasetError, Result};

/// Turns a waveform into a 2D (frequency x time) tensor.
pub trait SpectrogramTransform {
    fn compute(&self, waveform: &[f32]) -> Result<Array2<f32>>;
}

pub struct LogSpectrogram {
    n_fft: usize,
    hop: usize,
    min_db: f32,
    window: Vec<f32>,
    mel_filters: Option<Array2<f32>>,
    fft: Arc<dyn RealToComplex<f32>>,
}

impl LogSpectrogram {
    /// Linear-frequency spectrogram, `n_fft / 2 + 1` rows.
    pub fn linear(n_fft: usize, hop: usize, min_db: f32) -> Self {
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(n_fft);
        Self {
            n_fft,
            hop,
            min_db,
            window: hann_window(n_fft),
            mel_filters: None,
            fft,
        }
    }

    /// Mel spectrogram, `n_mels` rows.
    pub fn mel(
        n_fft: usize,
        hop: usize,
        min_db: f32,
        n_mels: usize,
        sample_rate: u32,
        f_min: f32,
        f_max: f32,
    ) -> Self {
        let mut spectrogram = Self::linear(n_fft, hop, min_db);
        spectrogram.mel_filters = Some(mel_filterbank(n_mels, n_fft, sample_rate, f_min, f_max));
        spectrogram
    }

    pub fn from_config(config: &DatasetConfig) -> Self {
        match config.n_mel_bins {
            Some(n_mels) => Self::mel(
                config.n_fft,
                config.fft_hop,
                config.spectrogram_min_db,
                n_mels,
                config.sample_rate,
                config.mel_fmin,
                config.mel_fmax,
            ),
            None => Self::linear(config.n_fft, config.fft_hop, config.spectrogram_min_db),
        }
    }

    pub fn n_rows(&self) -> usize {
        match &self.mel_filters {
            Some(filters) => filters.nrows(),
            None => self.n_fft / 2 + 1,
        }
    }

    /// Number of frames produced for a waveform of `n_samples` samples.
    pub fn n_frames(&self, n_samples: usize) -> usize {
        1 + n_samples / self.hop
    }

    /// Power spectrum, one column per frame. Frames are centered (zero padding of `n_fft / 2`).
    fn power_frames(&self, waveform: &[f32]) -> Result<Array2<f32>> {
        let bins = self.n_fft / 2 + 1;
        let n_frames = self.n_frames(waveform.len());
        let pad = self.n_fft / 2;
        let mut power = Array2::<f32>::zeros((bins, n_frames));
        let mut input = self.fft.make_input_vec();
        let mut output = self.fft.make_output_vec();
        for frame in 0..n_frames {
            let start = frame * self.hop;
            for (i, cell) in input.iter_mut().enumerate() {
                let sample = (start + i)
                    .checked_sub(pad)
                    .and_then(|pos| waveform.get(pos))
                    .copied()
                    .unwrap_or(0.0);
                *cell = sample * self.window[i];
            }
            self.fft.process(&mut input, &mut output)?;
            for (bin, c) in output.iter().enumerate() {
                power[[bin, frame]] = c.norm_sqr();
            }
        }
        Ok(power)
    }
}

impl SpectrogramTransform for LogSpectrogram {
    fn compute(&self, waveform: &[f32]) -> Result<Array2<f32>> {
        if waveform.is_empty() {
            return Err(DatasetError::Config("cannot compute the spectrogram of an empty waveform".into()));
        }
        let power = self.power_frames(waveform)?;
        let min_db = self.min_db;
        let spectrogram = match &self.mel_filters {
            Some(filters) => filters.dot(&power).mapv(|p| power_to_db(p, min_db)),
            // 20 log10(|X|) == 10 log10(|X|^2)
            None => power.mapv(|p| power_to_db(p, min_db)),
        };
        Ok(spectrogram)
    }
}

fn power_to_db(power: f32, min_db: f32) -> f32 {
    if power <= 0.0 {
        return min_db;
    }
    (10.0 * power.log10()).max(min_db)
}

/// Periodic Hann window.
fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f32 / size as f32).cos())
        .collect()
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular filters, one row per Mel band, one column per FFT bin.
fn mel_filterbank(n_mels: usize, n_fft: usize, sample_rate: u32, f_min: f32, f_max: f32) -> Array2<f32> {
    let bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f32 / 2.0;
    let f_max = f_max.min(nyquist).max(f_min);
    let (mel_min, mel_max) = (hz_to_mel(f_min), hz_to_mel(f_max));
    let edges: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();
    let bin_freqs = Array1::from_iter((0..bins).map(|k| k as f32 * sample_rate as f32 / n_fft as f32));

    let mut filters = Array2::<f32>::zeros((n_mels, bins));
    for m in 0..n_mels {
        let (left, center, right) = (edges[m], edges[m + 1], edges[m + 2]);
        for (k, &f) in bin_freqs.iter().enumerate() {
            let rising = (f - left) / (center - left).max(f32::EPSILON);
            let falling = (right - f) / (right - center).max(f32::EPSILON);
            filters[[m, k]] = rising.min(falling).max(0.0);
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: u32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn linear_shape_follows_fft_and_hop() {
        let spec = LogSpectrogram::linear(512, 256, -120.0);
        let out = spec.compute(&sine(440.0, 16000, 16000)).unwrap();
        assert_eq!(out.dim(), (257, 1 + 16000 / 256));
    }

    #[test]
    fn silence_sits_on_the_floor() {
        let spec = LogSpectrogram::linear(256, 128, -120.0);
        let out = spec.compute(&vec![0.0; 4000]).unwrap();
        assert!(out.iter().all(|&v| v == -120.0));
    }

    #[test]
    fn sine_peaks_at_its_frequency_bin() {
        let sample_rate = 16000;
        let spec = LogSpectrogram::linear(512, 256, -120.0);
        let out = spec.compute(&sine(1000.0, sample_rate, 8000)).unwrap();
        let column = out.column(10);
        let (peak_bin, _) = column
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        // 1000 Hz * 512 / 16000 = bin 32
        assert!((31..=33).contains(&peak_bin), "peak at bin {peak_bin}");
    }

    #[test]
    fn mel_shape_has_one_row_per_band() {
        let spec = LogSpectrogram::mel(1024, 256, -120.0, 64, 16000, 30.0, 8000.0);
        let out = spec.compute(&sine(440.0, 16000, 4096)).unwrap();
        assert_eq!(out.dim(), (64, 1 + 4096 / 256));
        assert!(out.iter().all(|&v| v >= -120.0));
    }

    #[test]
    fn empty_waveform_is_rejected() {
        let spec = LogSpectrogram::linear(256, 128, -120.0);
        assert!(spec.compute(&[]).is_err());
    }
}
