//! Раскладка файлов чекпоинта на диске.
//!
//! ```text
//! checkpoint/
//! ├── config.json          ModelConfig (обязательно)
//! ├── model.safetensors    веса VarMap (обязательно)
//! ├── tgt_vocab.json       целевой словарь (обязательно)
//! ├── src_vocab.json       исходный словарь (NMT)
//! ├── features.json        FeatureConfig (ASR)
//! └── trainer_state.json   состояние обучения (опционально)
//! ```

use std::path::{Path, PathBuf};

use crate::config::EncoderInput;
use crate::{ModelConfig, S2sError, S2sResult};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const TGT_VOCAB_FILE: &str = "tgt_vocab.json";
pub const SRC_VOCAB_FILE: &str = "src_vocab.json";
pub const FEATURES_FILE: &str = "features.json";
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

/// Разрешённые пути файлов чекпоинта.
#[derive(Debug, Clone)]
pub struct CheckpointFiles {
    pub dir: PathBuf,
    pub config: PathBuf,
    pub weights: PathBuf,
    pub tgt_vocab: PathBuf,
    pub src_vocab: Option<PathBuf>,
    pub features: Option<PathBuf>,
    pub trainer_state: Option<PathBuf>,
}

impl CheckpointFiles {
    /// Пути внутри директории без проверки существования (для записи).
    pub fn layout(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            config: dir.join(CONFIG_FILE),
            weights: dir.join(WEIGHTS_FILE),
            tgt_vocab: dir.join(TGT_VOCAB_FILE),
            src_vocab: Some(dir.join(SRC_VOCAB_FILE)),
            features: Some(dir.join(FEATURES_FILE)),
            trainer_state: Some(dir.join(TRAINER_STATE_FILE)),
            dir,
        }
    }

    /// Найти файлы чекпоинта и проверить, что есть всё необходимое.
    ///
    /// Какие из опциональных файлов обязательны, зависит от вида входа
    /// энкодера: для токенов нужен `src_vocab.json`, для признаков `features.json`.
    pub fn resolve(dir: impl AsRef<Path>) -> S2sResult<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(S2sError::Model(format!(
                "Директория чекпоинта не найдена: {}",
                dir.display()
            )));
        }

        let required = [CONFIG_FILE, WEIGHTS_FILE, TGT_VOCAB_FILE];
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|name| !dir.join(name).is_file())
            .collect();
        if !missing.is_empty() {
            return Err(S2sError::Model(format!(
                "В чекпоинте {} не найдены файлы: {}",
                dir.display(),
                missing.join(", ")
            )));
        }

        let existing = |name: &str| Some(dir.join(name)).filter(|p| p.is_file());
        let files = Self {
            dir: dir.to_path_buf(),
            config: dir.join(CONFIG_FILE),
            weights: dir.join(WEIGHTS_FILE),
            tgt_vocab: dir.join(TGT_VOCAB_FILE),
            src_vocab: existing(SRC_VOCAB_FILE),
            features: existing(FEATURES_FILE),
            trainer_state: existing(TRAINER_STATE_FILE),
        };

        let config = ModelConfig::from_file(&files.config)?;
        match config.encoder.input {
            EncoderInput::Tokens { .. } if files.src_vocab.is_none() => {
                return Err(S2sError::Model(format!(
                    "Модель с токенным входом требует {SRC_VOCAB_FILE} в {}",
                    dir.display()
                )));
            }
            EncoderInput::Features { .. } if files.features.is_none() => {
                return Err(S2sError::Model(format!(
                    "Модель с акустическим входом требует {FEATURES_FILE} в {}",
                    dir.display()
                )));
            }
            _ => {}
        }

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(WEIGHTS_FILE), b"").unwrap();
        let err = CheckpointFiles::resolve(dir.path()).unwrap_err().to_string();
        assert!(err.contains(CONFIG_FILE));
        assert!(err.contains(TGT_VOCAB_FILE));
        assert!(!err.contains(WEIGHTS_FILE));
    }

    #[test]
    fn test_token_model_needs_src_vocab() {
        let dir = tempfile::tempdir().unwrap();
        ModelConfig::nmt_small(10, 10)
            .save(dir.path().join(CONFIG_FILE))
            .unwrap();
        std::fs::write(dir.path().join(WEIGHTS_FILE), b"").unwrap();
        std::fs::write(dir.path().join(TGT_VOCAB_FILE), b"{}").unwrap();
        assert!(CheckpointFiles::resolve(dir.path()).is_err());

        std::fs::write(dir.path().join(SRC_VOCAB_FILE), b"{}").unwrap();
        let files = CheckpointFiles::resolve(dir.path()).unwrap();
        assert!(files.src_vocab.is_some());
        assert!(files.features.is_none());
    }
}
