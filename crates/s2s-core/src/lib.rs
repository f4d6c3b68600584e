//! # s2s-core
//!
//! Базовые типы, трейты и определения ошибок для seq2seq-фреймворка.
//!
//! Этот крейт предоставляет фундаментальные абстракции для всех остальных
//! крейтов в workspace:
//!
//! - Конфигурация энкодера, внимания, декодера, поиска и обучения
//! - Словарь токенов [`Vocabulary`] со служебными токенами
//! - Унифицированная обработка ошибок через [`S2sError`]
//! - Trait [`StepDecoder`]: шов между моделью и алгоритмами поиска
//! - Раскладка файлов чекпоинта [`CheckpointFiles`]

pub mod config;
pub mod debug;
pub mod error;
pub mod model_files;
pub mod traits;
pub mod types;
pub mod vocab;

pub use config::{
    AttentionConfig, AttentionKind, DecoderConfig, EncoderConfig, EncoderInput, FeatureConfig,
    MelNormalization, MelScale, ModelConfig, RnnType, SearchConfig, SearchStrategy, TrainConfig,
};
pub use error::{S2sError, S2sResult};
pub use model_files::CheckpointFiles;
pub use traits::StepDecoder;
pub use types::{AudioBuffer, DecodeOutput, Hypothesis};
pub use vocab::{Granularity, Vocabulary};
