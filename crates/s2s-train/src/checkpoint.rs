//! Запись чекпоинтов и состояния обучения.

use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use s2s_core::{CheckpointFiles, FeatureConfig, ModelConfig, S2sError, S2sResult, Vocabulary};

/// Метрики одной эпохи.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub valid_loss: Option<f64>,
    pub valid_perplexity: Option<f64>,
    pub valid_cer: Option<f64>,
    pub valid_wer: Option<f64>,
    pub learning_rate: f64,
}

/// Состояние обучения для продолжения (`trainer_state.json`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrainerState {
    /// Количество завершённых эпох.
    pub epoch: usize,
    pub global_step: usize,
    pub learning_rate: f64,
    pub best_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub epochs_without_improvement: usize,
    pub history: Vec<EpochMetrics>,
}

impl TrainerState {
    pub fn load(path: impl AsRef<Path>) -> S2sResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            S2sError::Data(format!("Не удалось прочитать {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> S2sResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Пишет чекпоинт в директорию: статические файлы (конфиг, словари,
/// параметры признаков) один раз при создании, веса и состояние: по вызову.
pub struct Checkpointer {
    files: CheckpointFiles,
}

impl Checkpointer {
    pub fn create(
        dir: impl AsRef<Path>,
        config: &ModelConfig,
        tgt_vocab: &Vocabulary,
        src_vocab: Option<&Vocabulary>,
        features: Option<&FeatureConfig>,
    ) -> S2sResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let files = CheckpointFiles::layout(dir);

        config.save(&files.config)?;
        tgt_vocab.save(&files.tgt_vocab)?;
        if let (Some(vocab), Some(path)) = (src_vocab, files.src_vocab.as_ref()) {
            vocab.save(path)?;
        }
        if let (Some(features), Some(path)) = (features, files.features.as_ref()) {
            features.save(path)?;
        }
        info!("Чекпоинт: {}", dir.display());
        Ok(Self { files })
    }

    pub fn dir(&self) -> &Path {
        &self.files.dir
    }

    pub fn weights_path(&self) -> &Path {
        &self.files.weights
    }

    pub fn state_path(&self) -> PathBuf {
        self.files
            .trainer_state
            .clone()
            .unwrap_or_else(|| self.files.dir.join(s2s_core::model_files::TRAINER_STATE_FILE))
    }

    pub fn save_weights(&self, varmap: &VarMap) -> S2sResult<()> {
        varmap.save(&self.files.weights)?;
        Ok(())
    }

    pub fn save_state(&self, state: &TrainerState) -> S2sResult<()> {
        state.save(self.state_path())
    }
}
