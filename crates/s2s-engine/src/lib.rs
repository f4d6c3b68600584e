//! # s2s-engine
//!
//! Единый фасад для обученных seq2seq-моделей.
//!
//! `Seq2SeqEngine` загружает директорию чекпоинта и выполняет перевод текста
//! (NMT) или распознавание речи (ASR), не привязываясь к устройству модели.
//!
//! # Пример
//!
//! ```ignore
//! use s2s_core::SearchConfig;
//! use s2s_engine::Seq2SeqEngine;
//!
//! let engine = Seq2SeqEngine::load("checkpoints/en-fr", &candle_core::Device::Cpu)?;
//! let result = engine.translate("hello world", &SearchConfig::beam(5, 64))?;
//! println!("{}", result.text);
//! ```

mod engine;

pub use engine::{Input, Seq2SeqEngine, Task};
