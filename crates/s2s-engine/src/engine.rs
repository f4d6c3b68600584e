//! Загрузка чекпоинта и декодирование.

use std::path::Path;
use std::time::Instant;

use candle_core::{Device, Tensor};
use tracing::{debug, info};

use audio::FeatureExtractor;
use s2s_core::vocab::PAD_ID;
use s2s_core::{
    AudioBuffer, CheckpointFiles, DecodeOutput, EncoderInput, FeatureConfig, Hypothesis,
    ModelConfig, S2sError, S2sResult, SearchConfig, Vocabulary,
};
use s2s_model::Seq2Seq;

/// Вид задачи, определяемый входом энкодера.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Текст → текст.
    Translation,
    /// Аудио → текст.
    Recognition,
}

/// Вход для декодирования.
#[derive(Debug, Clone, Copy)]
pub enum Input<'a> {
    Text(&'a str),
    /// Моно-сэмплы в [-1.0, 1.0] с произвольной частотой.
    Audio { samples: &'a [f32], sample_rate: usize },
}

/// Загруженная модель вместе со словарями и экстрактором признаков.
pub struct Seq2SeqEngine {
    model: Seq2Seq,
    src_vocab: Option<Vocabulary>,
    tgt_vocab: Vocabulary,
    extractor: Option<FeatureExtractor>,
}

impl std::fmt::Debug for Seq2SeqEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seq2SeqEngine")
            .field("src_vocab", &self.src_vocab)
            .field("tgt_vocab", &self.tgt_vocab)
            .field("extractor", &self.extractor)
            .finish_non_exhaustive()
    }
}

impl Seq2SeqEngine {
    /// Загрузить чекпоинт из директории.
    ///
    /// # Ошибки
    /// Возвращает ошибку, если:
    /// - нет обязательных файлов (`config.json`, `model.safetensors`, `tgt_vocab.json`)
    /// - размеры словарей или признаков не совпадают с конфигом модели
    /// - веса не соответствуют архитектуре
    pub fn load(dir: impl AsRef<Path>, device: &Device) -> S2sResult<Self> {
        let dir = dir.as_ref();
        info!("Seq2SeqEngine: загрузка чекпоинта {:?}", dir);

        let files = CheckpointFiles::resolve(dir)?;
        let config = ModelConfig::from_file(&files.config)?;
        let tgt_vocab = Vocabulary::load(&files.tgt_vocab)?;
        let src_vocab = files
            .src_vocab
            .as_ref()
            .map(Vocabulary::load)
            .transpose()?;
        let features = files
            .features
            .as_ref()
            .map(FeatureConfig::from_file)
            .transpose()?;

        let model = Seq2Seq::from_safetensors(&config, &files.weights, device)?;
        let engine = Self::from_parts(model, src_vocab, tgt_vocab, features)?;

        info!(
            "Seq2SeqEngine: модель '{}' загружена ({:?})",
            engine.name(),
            engine.task()
        );
        Ok(engine)
    }

    /// Собрать движок из уже построенной модели.
    pub fn from_parts(
        model: Seq2Seq,
        src_vocab: Option<Vocabulary>,
        tgt_vocab: Vocabulary,
        features: Option<FeatureConfig>,
    ) -> S2sResult<Self> {
        let config = model.config();
        if tgt_vocab.len() != config.decoder.vocab_size {
            return Err(S2sError::Config(format!(
                "целевой словарь ({}) не совпадает с decoder.vocab_size ({})",
                tgt_vocab.len(),
                config.decoder.vocab_size
            )));
        }

        let extractor = match &config.encoder.input {
            EncoderInput::Tokens { vocab_size } => {
                let vocab = src_vocab.as_ref().ok_or_else(|| {
                    S2sError::Config("для текстовой модели нужен исходный словарь".into())
                })?;
                if vocab.len() != *vocab_size {
                    return Err(S2sError::Config(format!(
                        "исходный словарь ({}) не совпадает с encoder.input.vocab_size ({vocab_size})",
                        vocab.len()
                    )));
                }
                None
            }
            EncoderInput::Features { feature_dim, .. } => {
                let features = features.ok_or_else(|| {
                    S2sError::Config("для акустической модели нужен features.json".into())
                })?;
                if features.n_mels != *feature_dim {
                    return Err(S2sError::Config(format!(
                        "n_mels ({}) не совпадает с encoder.input.feature_dim ({feature_dim})",
                        features.n_mels
                    )));
                }
                Some(FeatureExtractor::new(features)?)
            }
        };

        Ok(Self {
            model,
            src_vocab,
            tgt_vocab,
            extractor,
        })
    }

    /// Имя модели из конфига.
    pub fn name(&self) -> &str {
        &self.model.config().name
    }

    pub fn task(&self) -> Task {
        if self.extractor.is_some() {
            Task::Recognition
        } else {
            Task::Translation
        }
    }

    pub fn model(&self) -> &Seq2Seq {
        &self.model
    }

    pub fn tgt_vocab(&self) -> &Vocabulary {
        &self.tgt_vocab
    }

    pub fn src_vocab(&self) -> Option<&Vocabulary> {
        self.src_vocab.as_ref()
    }

    /// Частота, к которой приводится аудио (только для ASR).
    pub fn sample_rate(&self) -> Option<usize> {
        self.extractor.as_ref().map(|e| e.config().sample_rate)
    }

    /// Перевести текст; возвращает лучшую гипотезу.
    pub fn translate(&self, text: &str, search: &SearchConfig) -> S2sResult<DecodeOutput> {
        self.best(Input::Text(text), search)
    }

    /// Распознать аудио; возвращает лучшую гипотезу.
    pub fn transcribe(
        &self,
        samples: &[f32],
        sample_rate: usize,
        search: &SearchConfig,
    ) -> S2sResult<DecodeOutput> {
        self.best(
            Input::Audio {
                samples,
                sample_rate,
            },
            search,
        )
    }

    /// Все гипотезы поиска, лучшая первой.
    ///
    /// Для greedy и сэмплирования список состоит из одного элемента.
    pub fn n_best(&self, input: Input<'_>, search: &SearchConfig) -> S2sResult<Vec<DecodeOutput>> {
        let start = Instant::now();
        let (source, lengths, duration) = self.prepare(input)?;

        let (stepper, state) = self.model.stepper(&source, &lengths)?;
        let hyps = s2s_search::decode(&stepper, state, search)?
            .into_iter()
            .next()
            .unwrap_or_default();
        let elapsed = start.elapsed().as_secs_f64();

        debug!(
            hypotheses = hyps.len(),
            elapsed, "Seq2SeqEngine: декодирование завершено"
        );
        Ok(hyps.iter().map(|h| self.output(h, elapsed, duration)).collect())
    }

    /// Перевести несколько строк одним батчем (по лучшей гипотезе на строку).
    pub fn translate_batch(
        &self,
        texts: &[&str],
        search: &SearchConfig,
    ) -> S2sResult<Vec<DecodeOutput>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let encoded = texts
            .iter()
            .map(|t| self.encode_text(t))
            .collect::<S2sResult<Vec<_>>>()?;
        let lengths: Vec<usize> = encoded.iter().map(Vec::len).collect();
        let max_len = lengths.iter().copied().max().unwrap_or(0);
        let mut data = vec![PAD_ID; texts.len() * max_len];
        for (row, ids) in encoded.iter().enumerate() {
            data[row * max_len..row * max_len + ids.len()].copy_from_slice(ids);
        }
        let source = Tensor::from_vec(data, (texts.len(), max_len), self.model.device())?;

        let (stepper, state) = self.model.stepper(&source, &lengths)?;
        let results = s2s_search::decode(&stepper, state, search)?;
        let elapsed = start.elapsed().as_secs_f64() / texts.len() as f64;

        results
            .iter()
            .map(|hyps| {
                hyps.first()
                    .map(|h| self.output(h, elapsed, 0.0))
                    .ok_or_else(|| S2sError::Inference("поиск не вернул гипотез".into()))
            })
            .collect()
    }

    fn best(&self, input: Input<'_>, search: &SearchConfig) -> S2sResult<DecodeOutput> {
        self.n_best(input, search)?
            .into_iter()
            .next()
            .ok_or_else(|| S2sError::Inference("поиск не вернул гипотез".into()))
    }

    fn output(&self, hyp: &Hypothesis, elapsed: f64, duration: f64) -> DecodeOutput {
        DecodeOutput::new(
            self.tgt_vocab.decode(&hyp.tokens),
            hyp,
            self.name(),
            elapsed,
            duration,
        )
    }

    fn encode_text(&self, text: &str) -> S2sResult<Vec<u32>> {
        let vocab = self.src_vocab.as_ref().ok_or_else(|| {
            S2sError::Config(format!(
                "модель '{}' распознаёт аудио, текстовый вход не поддерживается",
                self.name()
            ))
        })?;
        let ids = vocab.encode(text);
        if ids.is_empty() {
            return Err(S2sError::Data("пустой текст".into()));
        }
        Ok(ids)
    }

    /// Вход энкодера `[1, t(, f)]`, длины и длительность аудио в секундах.
    fn prepare(&self, input: Input<'_>) -> S2sResult<(Tensor, Vec<usize>, f64)> {
        let device = self.model.device();
        match input {
            Input::Text(text) => {
                let ids = self.encode_text(text)?;
                let len = ids.len();
                Ok((Tensor::from_vec(ids, (1, len), device)?, vec![len], 0.0))
            }
            Input::Audio {
                samples,
                sample_rate,
            } => {
                let extractor = self.extractor.as_ref().ok_or_else(|| {
                    S2sError::Config(format!(
                        "модель '{}' переводит текст, аудиовход не поддерживается",
                        self.name()
                    ))
                })?;
                if sample_rate == 0 {
                    return Err(S2sError::Audio("частота дискретизации = 0".into()));
                }
                let buffer = AudioBuffer::new(samples.to_vec(), sample_rate, 1);
                let duration = f64::from(buffer.duration());
                let features = extractor.extract_buffer(&buffer)?;
                if features.num_frames == 0 {
                    return Err(S2sError::Data("пустое аудио".into()));
                }
                let frames = features.num_frames;
                Ok((features.to_tensor(device)?, vec![frames], duration))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{VarBuilder, VarMap};
    use s2s_core::Granularity;

    fn nmt_engine() -> Seq2SeqEngine {
        let src = Vocabulary::build(["a b c"], Granularity::Word, 1, None);
        let tgt = Vocabulary::build(["x y z"], Granularity::Word, 1, None);
        let mut config = ModelConfig::nmt_small(src.len(), tgt.len());
        config.encoder.hidden_size = 4;
        config.decoder.hidden_size = 8;
        config.decoder.embed_dim = 4;
        config.decoder.max_length = 5;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Seq2Seq::new(&config, vb).unwrap();
        Seq2SeqEngine::from_parts(model, Some(src), tgt, None).unwrap()
    }

    #[test]
    fn test_translate_respects_max_length() {
        let engine = nmt_engine();
        assert_eq!(engine.task(), Task::Translation);
        let out = engine.translate("a b c", &SearchConfig::greedy(5)).unwrap();
        assert!(out.tokens.len() <= 5);
        assert!(out.tokens.iter().all(|&t| (t as usize) < engine.tgt_vocab().len()));
        assert_eq!(out.rtf, 0.0);
    }

    #[test]
    fn test_audio_on_text_model_is_config_error() {
        let engine = nmt_engine();
        let err = engine
            .transcribe(&[0.0; 1600], 16000, &SearchConfig::greedy(5))
            .unwrap_err();
        assert!(matches!(err, S2sError::Config(_)));
    }

    #[test]
    fn test_n_best_bounded_by_beam() {
        let engine = nmt_engine();
        let outs = engine
            .n_best(Input::Text("a c"), &SearchConfig::beam(3, 4))
            .unwrap();
        assert!(!outs.is_empty() && outs.len() <= 3);
        assert!(outs.iter().all(|o| o.score.is_finite() && o.tokens.len() <= 4));
    }

    #[test]
    fn test_batch_matches_single_greedy() {
        let engine = nmt_engine();
        let search = SearchConfig::greedy(5);
        let batch = engine.translate_batch(&["a b c", "b"], &search).unwrap();
        let single = engine.translate("b", &search).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].tokens, single.tokens);
    }

    #[test]
    fn test_vocab_size_mismatch_rejected() {
        let src = Vocabulary::build(["a b c"], Granularity::Word, 1, None);
        let tgt = Vocabulary::build(["x y z"], Granularity::Word, 1, None);
        let config = ModelConfig::nmt_small(src.len(), tgt.len() + 1);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Seq2Seq::new(&config, vb).unwrap();
        assert!(matches!(
            Seq2SeqEngine::from_parts(model, Some(src), tgt, None),
            Err(S2sError::Config(_))
        ));
    }
}
