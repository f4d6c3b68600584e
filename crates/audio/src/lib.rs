//! # audio
//!
//! Акустический фронтенд seq2seq-распознавания.
//!
//! - чтение WAV и сведение к моно
//! - ресэмплинг к частоте модели
//! - log-mel признаки для энкодера

pub mod loader;
pub mod mel;
pub mod resample;

pub use loader::{load_wav, to_mono};
pub use mel::{FeatureExtractor, Features};
pub use resample::Resampler;
