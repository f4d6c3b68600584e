//! # s2s-train
//!
//! Обучение моделей из `s2s-model`:
//!
//! - [`data`]: TSV-корпуса (параллельные тексты и манифесты аудио)
//! - [`batch`]: батчинг с группировкой по длине и паддингом
//! - [`loss`]: маскированная NLL со сглаживанием меток
//! - [`metrics`]: расстояние Левенштейна, CER, WER, перплексия
//! - [`checkpoint`]: запись чекпоинта и состояния обучения
//! - [`trainer`]: цикл обучения с AdamW, клиппингом и снижением learning rate

pub mod batch;
pub mod checkpoint;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod trainer;

pub use batch::{collate, Batch, Batcher};
pub use checkpoint::{Checkpointer, EpochMetrics, TrainerState};
pub use data::{
    encode_manifest, encode_parallel, load_manifest_tsv, load_parallel_tsv, Example,
    ManifestEntry, Source,
};
pub use loss::{masked_nll, LossOutput};
pub use metrics::{cer, edit_distance, perplexity, wer, ErrorCounter};
pub use trainer::{clip_grad_norm, EvalMetrics, TrainReport, Trainer};
