//! Конфигурационные структуры для seq2seq-моделей.
//!
//! Все конфиги сериализуются в JSON и хранятся рядом с весами в чекпоинте
//! (см. [`crate::model_files::CheckpointFiles`]).

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{S2sError, S2sResult};

// ---------------------------------------------------------------------------
// RNN
// ---------------------------------------------------------------------------

/// Тип рекуррентной ячейки.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RnnType {
    /// Long short-term memory (4 гейта, состояние ячейки `c`).
    Lstm,
    /// Gated recurrent unit (3 гейта).
    Gru,
    /// Классическая RNN с tanh.
    Rnn,
}

impl RnnType {
    /// Количество гейтов, упакованных в матрицы `weight_ih` / `weight_hh`.
    pub fn gate_count(&self) -> usize {
        match self {
            RnnType::Lstm => 4,
            RnnType::Gru => 3,
            RnnType::Rnn => 1,
        }
    }

    /// Строковый идентификатор.
    pub fn as_str(&self) -> &'static str {
        match self {
            RnnType::Lstm => "lstm",
            RnnType::Gru => "gru",
            RnnType::Rnn => "rnn",
        }
    }
}

impl FromStr for RnnType {
    type Err = S2sError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lstm" => Ok(RnnType::Lstm),
            "gru" => Ok(RnnType::Gru),
            "rnn" => Ok(RnnType::Rnn),
            other => Err(S2sError::Config(format!("RNN type not supported: {other}"))),
        }
    }
}

impl fmt::Display for RnnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Энкодер
// ---------------------------------------------------------------------------

/// Вид входа энкодера.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EncoderInput {
    /// Последовательность токенов (NMT): embedding-lookup.
    Tokens {
        /// Размер исходного словаря.
        vocab_size: usize,
    },
    /// Последовательность акустических фреймов (ASR): линейная проекция.
    Features {
        /// Размерность одного фрейма (например, число mel-бинов).
        feature_dim: usize,
        /// Сколько соседних фреймов склеивать в один (делит ось времени).
        frame_stack: usize,
    },
}

impl EncoderInput {
    /// Размерность входа RNN до проекции.
    pub fn input_dim(&self) -> usize {
        match self {
            EncoderInput::Tokens { vocab_size } => *vocab_size,
            EncoderInput::Features {
                feature_dim,
                frame_stack,
            } => feature_dim * (*frame_stack).max(1),
        }
    }

    /// `true` для акустического входа.
    pub fn is_features(&self) -> bool {
        matches!(self, EncoderInput::Features { .. })
    }
}

/// Конфигурация рекуррентного энкодера (listener).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Вид входа.
    pub input: EncoderInput,

    /// Размерность скрытого состояния одного направления.
    pub hidden_size: usize,

    /// Количество рекуррентных слоёв.
    pub n_layers: usize,

    /// Двунаправленный энкодер.
    pub bidirectional: bool,

    /// Тип ячейки.
    pub rnn_type: RnnType,

    /// Вероятность dropout на входе и между слоями.
    pub dropout_p: f32,
}

impl EncoderConfig {
    /// Значения по умолчанию listener'а: 5 слоёв, bi-GRU, dropout 0.5.
    pub fn listener(input: EncoderInput, hidden_size: usize) -> Self {
        Self {
            input,
            hidden_size,
            n_layers: 5,
            bidirectional: true,
            rnn_type: RnnType::Gru,
            dropout_p: 0.5,
        }
    }

    /// Количество направлений (1 или 2).
    pub fn num_directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    /// Размерность выхода энкодера (`hidden_size * directions`).
    pub fn output_size(&self) -> usize {
        self.hidden_size * self.num_directions()
    }
}

// ---------------------------------------------------------------------------
// Внимание
// ---------------------------------------------------------------------------

/// Вид функции выравнивания.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionKind {
    /// Скалярное произведение (Luong dot).
    Dot,
    /// Скалярное произведение, делённое на `sqrt(H)`.
    Scaled,
    /// Билинейная форма `qᵀ W k` (Luong general).
    General,
    /// Аддитивное внимание (Bahdanau).
    Additive,
    /// Аддитивное внимание + свёртка по предыдущему выравниванию.
    Location,
}

impl FromStr for AttentionKind {
    type Err = S2sError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dot" => Ok(AttentionKind::Dot),
            "scaled" | "scaled-dot" => Ok(AttentionKind::Scaled),
            "general" => Ok(AttentionKind::General),
            "additive" | "bahdanau" => Ok(AttentionKind::Additive),
            "location" | "location-aware" => Ok(AttentionKind::Location),
            other => Err(S2sError::Config(format!(
                "Attention type not supported: {other}"
            ))),
        }
    }
}

/// Конфигурация механизма внимания.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Вид выравнивания.
    pub kind: AttentionKind,

    /// Размерность скрытого пространства для additive/location.
    pub attn_dim: usize,

    /// Количество каналов свёртки location-aware внимания.
    pub location_channels: usize,

    /// Размер ядра свёртки (нечётный).
    pub location_kernel: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            kind: AttentionKind::Dot,
            attn_dim: 128,
            location_channels: 10,
            location_kernel: 31,
        }
    }
}

// ---------------------------------------------------------------------------
// Декодер
// ---------------------------------------------------------------------------

/// Конфигурация авторегрессионного декодера (speller).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Размер целевого словаря (включая служебные токены).
    pub vocab_size: usize,

    /// Размерность эмбеддинга токенов.
    pub embed_dim: usize,

    /// Размерность скрытого состояния (должна совпадать с выходом энкодера).
    pub hidden_size: usize,

    /// Количество рекуррентных слоёв.
    pub n_layers: usize,

    /// Тип ячейки.
    pub rnn_type: RnnType,

    /// Вероятность dropout.
    pub dropout_p: f32,

    /// Максимальная длина генерации по умолчанию.
    pub max_length: usize,
}

// ---------------------------------------------------------------------------
// Модель целиком
// ---------------------------------------------------------------------------

/// Конфигурация seq2seq-модели.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Имя модели (для логов и `DecodeOutput`).
    pub name: String,

    /// Энкодер.
    pub encoder: EncoderConfig,

    /// Механизм внимания.
    #[serde(default)]
    pub attention: AttentionConfig,

    /// Декодер.
    pub decoder: DecoderConfig,
}

impl ModelConfig {
    /// Небольшая NMT-модель: bi-LSTM энкодер, general-внимание.
    pub fn nmt_small(src_vocab: usize, tgt_vocab: usize) -> Self {
        Self {
            name: "nmt-small".to_string(),
            encoder: EncoderConfig {
                input: EncoderInput::Tokens {
                    vocab_size: src_vocab,
                },
                hidden_size: 256,
                n_layers: 2,
                bidirectional: true,
                rnn_type: RnnType::Lstm,
                dropout_p: 0.3,
            },
            attention: AttentionConfig {
                kind: AttentionKind::General,
                ..AttentionConfig::default()
            },
            decoder: DecoderConfig {
                vocab_size: tgt_vocab,
                embed_dim: 256,
                hidden_size: 512,
                n_layers: 2,
                rnn_type: RnnType::Lstm,
                dropout_p: 0.3,
                max_length: 128,
            },
        }
    }

    /// Небольшая ASR-модель: 80 mel-бинов, склейка 3 фреймов, bi-GRU listener,
    /// location-aware внимание.
    pub fn asr_small(tgt_vocab: usize) -> Self {
        let encoder = EncoderConfig::listener(
            EncoderInput::Features {
                feature_dim: 80,
                frame_stack: 3,
            },
            256,
        );
        Self {
            name: "asr-small".to_string(),
            decoder: DecoderConfig {
                vocab_size: tgt_vocab,
                embed_dim: 256,
                hidden_size: encoder.output_size(),
                n_layers: 2,
                rnn_type: RnnType::Gru,
                dropout_p: 0.3,
                max_length: 256,
            },
            encoder,
            attention: AttentionConfig {
                kind: AttentionKind::Location,
                ..AttentionConfig::default()
            },
        }
    }

    /// Проверить согласованность размерностей.
    pub fn validate(&self) -> S2sResult<()> {
        let enc = &self.encoder;
        let dec = &self.decoder;

        if enc.hidden_size == 0 || enc.n_layers == 0 {
            return Err(S2sError::Config(
                "encoder.hidden_size и encoder.n_layers должны быть > 0".into(),
            ));
        }
        if dec.hidden_size == 0 || dec.n_layers == 0 || dec.embed_dim == 0 {
            return Err(S2sError::Config(
                "decoder.hidden_size, decoder.n_layers и decoder.embed_dim должны быть > 0".into(),
            ));
        }
        match &enc.input {
            EncoderInput::Tokens { vocab_size } if *vocab_size == 0 => {
                return Err(S2sError::Config("encoder.input.vocab_size = 0".into()));
            }
            EncoderInput::Features {
                feature_dim,
                frame_stack,
            } if *feature_dim == 0 || *frame_stack == 0 => {
                return Err(S2sError::Config(
                    "encoder.input.feature_dim и frame_stack должны быть > 0".into(),
                ));
            }
            _ => {}
        }
        // 4 служебных токена + хотя бы один обычный
        if dec.vocab_size <= 4 {
            return Err(S2sError::Config(format!(
                "decoder.vocab_size слишком мал: {}",
                dec.vocab_size
            )));
        }
        if dec.hidden_size != enc.output_size() {
            return Err(S2sError::Config(format!(
                "decoder.hidden_size ({}) должен совпадать с выходом энкодера ({} × {} = {})",
                dec.hidden_size,
                enc.hidden_size,
                enc.num_directions(),
                enc.output_size()
            )));
        }
        for (name, p) in [("encoder", enc.dropout_p), ("decoder", dec.dropout_p)] {
            if !(0.0..1.0).contains(&p) {
                return Err(S2sError::Config(format!(
                    "{name}.dropout_p вне диапазона [0, 1): {p}"
                )));
            }
        }
        if self.attention.kind == AttentionKind::Location && self.attention.location_kernel % 2 == 0
        {
            return Err(S2sError::Config(format!(
                "attention.location_kernel должен быть нечётным: {}",
                self.attention.location_kernel
            )));
        }
        Ok(())
    }

    /// Загрузить конфиг из JSON-файла и проверить его.
    pub fn from_file(path: impl AsRef<Path>) -> S2sResult<Self> {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Сохранить конфиг в JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> S2sResult<()> {
        write_json(path, self)
    }
}

// ---------------------------------------------------------------------------
// Акустические признаки
// ---------------------------------------------------------------------------

/// Шкала mel-фильтров.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MelScale {
    /// Slaney: линейная ниже 1000 Гц, логарифмическая выше.
    Slaney,
    /// HTK: полностью логарифмическая шкала.
    Htk,
}

/// Тип нормализации log-mel признаков.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MelNormalization {
    /// Вычитание среднего и деление на стандартное отклонение по всей записи.
    PerUtterance,
    /// Без нормализации.
    None,
}

/// Конфигурация mel-спектрограммы.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Целевая частота дискретизации в Гц.
    pub sample_rate: usize,

    /// Размер окна FFT.
    pub n_fft: usize,

    /// Шаг между фреймами.
    pub hop_length: usize,

    /// Длина окна Ханна (≤ n_fft).
    pub win_length: usize,

    /// Количество mel-бинов.
    pub n_mels: usize,

    /// Минимальная частота для mel-фильтра.
    pub f_min: f32,

    /// Максимальная частота для mel-фильтра.
    pub f_max: f32,

    /// Шкала mel-фильтров.
    pub mel_scale: MelScale,

    /// Тип нормализации.
    pub normalization: MelNormalization,
}

impl Default for FeatureConfig {
    /// 80 log-mel, окно 25 мс, шаг 10 мс при 16 кГц.
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            n_fft: 512,
            hop_length: 160,
            win_length: 400,
            n_mels: 80,
            f_min: 0.0,
            f_max: 8000.0,
            mel_scale: MelScale::Slaney,
            normalization: MelNormalization::PerUtterance,
        }
    }
}

impl FeatureConfig {
    /// Проверить параметры STFT.
    pub fn validate(&self) -> S2sResult<()> {
        if self.n_fft == 0 || self.hop_length == 0 || self.n_mels == 0 {
            return Err(S2sError::Config(
                "n_fft, hop_length и n_mels должны быть > 0".into(),
            ));
        }
        if self.win_length == 0 || self.win_length > self.n_fft {
            return Err(S2sError::Config(format!(
                "win_length ({}) должен быть в (0, n_fft = {}]",
                self.win_length, self.n_fft
            )));
        }
        if self.f_max <= self.f_min || self.f_max > self.sample_rate as f32 / 2.0 {
            return Err(S2sError::Config(format!(
                "некорректный диапазон частот: [{}, {}] при sample_rate={}",
                self.f_min, self.f_max, self.sample_rate
            )));
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> S2sResult<Self> {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> S2sResult<()> {
        write_json(path, self)
    }
}

// ---------------------------------------------------------------------------
// Поиск
// ---------------------------------------------------------------------------

/// Стратегия генерации.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Argmax на каждом шаге.
    Greedy,
    /// Сэмплирование с температурой.
    Sample {
        temperature: f32,
        seed: u64,
    },
    /// Beam search.
    Beam {
        beam_size: usize,
        /// Показатель степени в нормализации `score / len^α`.
        length_penalty: f32,
        /// Остановиться, как только набрано `beam_size` завершённых гипотез.
        early_stopping: bool,
    },
}

/// Параметры поиска.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    pub strategy: SearchStrategy,
    /// Максимум генерируемых токенов (без `<eos>`).
    pub max_length: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self::greedy(128)
    }
}

impl SearchConfig {
    pub fn greedy(max_length: usize) -> Self {
        Self {
            strategy: SearchStrategy::Greedy,
            max_length,
        }
    }

    pub fn beam(beam_size: usize, max_length: usize) -> Self {
        Self {
            strategy: SearchStrategy::Beam {
                beam_size,
                length_penalty: 1.0,
                early_stopping: false,
            },
            max_length,
        }
    }

    pub fn validate(&self) -> S2sResult<()> {
        if self.max_length == 0 {
            return Err(S2sError::Config("max_length должен быть > 0".into()));
        }
        match &self.strategy {
            SearchStrategy::Sample { temperature, .. }
                if *temperature < 0.0 || !temperature.is_finite() =>
            {
                Err(S2sError::Config(format!(
                    "температура должна быть конечной и ≥ 0: {temperature}"
                )))
            }
            SearchStrategy::Beam { beam_size: 0, .. } => {
                Err(S2sError::Config("beam_size должен быть > 0".into()))
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Обучение
// ---------------------------------------------------------------------------

/// Гиперпараметры обучения.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Порог глобальной нормы градиента (`None`: без клиппинга).
    pub grad_clip: Option<f64>,
    /// Вероятность подать на вход декодера эталонный токен.
    pub teacher_forcing_ratio: f64,
    pub label_smoothing: f64,
    /// Множитель learning rate при отсутствии улучшения.
    pub lr_decay: f64,
    /// Сколько эпох без улучшения терпеть до снижения learning rate.
    pub lr_patience: usize,
    pub seed: u64,
    /// Группировать примеры близкой длины в один батч.
    pub sort_by_length: bool,
    /// Логировать каждые N шагов.
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 32,
            learning_rate: 1e-3,
            weight_decay: 1e-5,
            grad_clip: Some(5.0),
            teacher_forcing_ratio: 0.9,
            label_smoothing: 0.1,
            lr_decay: 0.5,
            lr_patience: 1,
            seed: 42,
            sort_by_length: true,
            log_every: 50,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> S2sResult<()> {
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(S2sError::Config("epochs и batch_size должны быть > 0".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(S2sError::Config(format!(
                "learning_rate должен быть > 0: {}",
                self.learning_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.teacher_forcing_ratio) {
            return Err(S2sError::Config(format!(
                "teacher_forcing_ratio вне [0, 1]: {}",
                self.teacher_forcing_ratio
            )));
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(S2sError::Config(format!(
                "label_smoothing вне [0, 1): {}",
                self.label_smoothing
            )));
        }
        if !(self.lr_decay > 0.0 && self.lr_decay <= 1.0) {
            return Err(S2sError::Config(format!(
                "lr_decay вне (0, 1]: {}",
                self.lr_decay
            )));
        }
        if let Some(clip) = self.grad_clip {
            if !(clip > 0.0) {
                return Err(S2sError::Config(format!("grad_clip должен быть > 0: {clip}")));
            }
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> S2sResult<Self> {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> S2sResult<T> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .map_err(|e| S2sError::Config(format!("Не удалось прочитать {}: {e}", path.display())))?;
    Ok(serde_json::from_str(&data)?)
}

fn write_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> S2sResult<()> {
    let data = serde_json::to_string_pretty(value)?;
    std::fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rnn_type_parsing() {
        assert_eq!("LSTM".parse::<RnnType>().unwrap(), RnnType::Lstm);
        assert_eq!(" gru ".parse::<RnnType>().unwrap(), RnnType::Gru);
        let err = "transformer".parse::<RnnType>().unwrap_err();
        assert!(err.to_string().contains("RNN type not supported"));
    }

    #[test]
    fn test_listener_defaults() {
        let cfg = EncoderConfig::listener(EncoderInput::Tokens { vocab_size: 10 }, 64);
        assert_eq!(cfg.n_layers, 5);
        assert!(cfg.bidirectional);
        assert_eq!(cfg.rnn_type, RnnType::Gru);
        assert!((cfg.dropout_p - 0.5).abs() < f32::EPSILON);
        assert_eq!(cfg.output_size(), 128);
    }

    #[test]
    fn test_presets_are_valid() {
        ModelConfig::nmt_small(1000, 1200).validate().unwrap();
        ModelConfig::asr_small(60).validate().unwrap();
    }

    #[test]
    fn test_hidden_mismatch_rejected() {
        let mut cfg = ModelConfig::nmt_small(100, 100);
        cfg.decoder.hidden_size = 256;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, S2sError::Config(_)));
    }

    #[test]
    fn test_even_location_kernel_rejected() {
        let mut cfg = ModelConfig::asr_small(60);
        cfg.attention.location_kernel = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_json_shape() {
        let cfg = ModelConfig::asr_small(60);
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["encoder"]["input"]["type"], "features");
        assert_eq!(json["encoder"]["rnn_type"], "gru");
        assert_eq!(json["attention"]["kind"], "location");

        let back: ModelConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = ModelConfig::nmt_small(50, 60);
        cfg.save(&path).unwrap();
        assert_eq!(ModelConfig::from_file(&path).unwrap(), cfg);
    }

    #[test]
    fn test_search_config_validation() {
        assert!(SearchConfig::beam(0, 10).validate().is_err());
        assert!(SearchConfig::greedy(0).validate().is_err());
        let sample = SearchConfig {
            strategy: SearchStrategy::Sample {
                temperature: -1.0,
                seed: 0,
            },
            max_length: 5,
        };
        assert!(sample.validate().is_err());
        SearchConfig::beam(4, 10).validate().unwrap();
    }

    #[test]
    fn test_train_config_partial_json() {
        let cfg: TrainConfig = serde_json::from_str(r#"{"epochs": 3, "grad_clip": null}"#).unwrap();
        assert_eq!(cfg.epochs, 3);
        assert_eq!(cfg.grad_clip, None);
        assert_eq!(cfg.batch_size, TrainConfig::default().batch_size);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_feature_config_validation() {
        FeatureConfig::default().validate().unwrap();
        let bad = FeatureConfig {
            win_length: 1024,
            ..FeatureConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
