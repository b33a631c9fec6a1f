//! Spectrograms: computation, normalization and the on-disk cache.

mod cache;
mod normalize;
mod transform;

pub use cache::{CacheKey, RegenerationReport, SpectrogramCache};
pub use normalize::{
    denormalize, normalize, normalize_in_place, NormalizationMode, NormalizationStats,
};
pub use transform::{LogSpectrogram, SpectrogramTransform};
