//! Seq2Seq: энкодер, внимание и декодер в одной модели.

use std::path::Path;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::Rng;
use tracing::{debug, info};

use s2s_core::{ModelConfig, S2sError, S2sResult, StepDecoder};
use s2s_core::vocab::{EOS_ID, SOS_ID};

use crate::attention::AttentionMemory;
use crate::decoder::{Decoder, DecoderState};
use crate::encoder::{Encoder, EncoderOutput};

pub struct Seq2Seq {
    encoder: Encoder,
    decoder: Decoder,
    config: ModelConfig,
    device: Device,
}

impl Seq2Seq {
    /// Построить модель поверх `VarBuilder`.
    ///
    /// С `VarBuilder::from_varmap` веса создаются и регистрируются как
    /// обучаемые; с safetensors читаются из файла.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> S2sResult<Self> {
        config.validate()?;
        let device = vb.device().clone();
        let encoder = Encoder::new(&config.encoder, vb.pp("encoder"))?;
        let decoder = Decoder::new(&config.decoder, &config.attention, vb.pp("decoder"))?;
        Ok(Self {
            encoder,
            decoder,
            config: config.clone(),
            device,
        })
    }

    /// Загрузить веса для инференса (mmap safetensors).
    pub fn from_safetensors(
        config: &ModelConfig,
        weights: impl AsRef<Path>,
        device: &Device,
    ) -> S2sResult<Self> {
        let weights = weights.as_ref();
        if !weights.is_file() {
            return Err(S2sError::Model(format!(
                "Файл весов не найден: {}",
                weights.display()
            )));
        }
        let start = Instant::now();
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        let model = Self::new(config, vb)
            .map_err(|e| S2sError::Model(format!("{}: {e}", weights.display())))?;
        info!(
            "{}: веса загружены за {:.2}с",
            config.name,
            start.elapsed().as_secs_f64()
        );
        Ok(model)
    }

    /// Создать обучаемую модель; если `weights` задан, загрузить его в `VarMap`.
    pub fn trainable(
        config: &ModelConfig,
        weights: Option<&Path>,
        device: &Device,
    ) -> S2sResult<(VarMap, Self)> {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(config, vb)?;
        if let Some(path) = weights {
            varmap.load(path)?;
            debug!("{}: веса продолжения загружены из {}", config.name, path.display());
        }
        Ok((varmap, model))
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn encode(
        &self,
        source: &Tensor,
        lengths: &[usize],
        train: bool,
    ) -> S2sResult<EncoderOutput> {
        self.encoder.forward(source, lengths, train)
    }

    /// Состояние декодера и память внимания для выхода энкодера.
    pub fn prepare_decoding(
        &self,
        encoded: &EncoderOutput,
    ) -> S2sResult<(DecoderState, AttentionMemory)> {
        let state = self.decoder.init_state(&encoded.state)?;
        let memory = self
            .decoder
            .attention()
            .prepare(&encoded.outputs, &encoded.lengths)?;
        Ok((state, memory))
    }

    /// Полный проход для обучения: log-вероятности [b, T, V].
    pub fn forward<R: Rng>(
        &self,
        source: &Tensor,
        source_lengths: &[usize],
        targets_in: &Tensor,
        teacher_forcing_ratio: f64,
        rng: &mut R,
        train: bool,
    ) -> S2sResult<Tensor> {
        let encoded = self.encode(source, source_lengths, train)?;
        let (state, memory) = self.prepare_decoding(&encoded)?;
        let targets_in = targets_in.to_dtype(DType::U32)?;
        Ok(self.decoder.forward_teacher(
            &targets_in,
            state,
            &memory,
            teacher_forcing_ratio,
            rng,
            train,
        )?)
    }

    /// Адаптер пошагового декодирования для поиска.
    ///
    /// Возвращает адаптер и начальное состояние (по строке на пример батча).
    pub fn stepper(
        &self,
        source: &Tensor,
        lengths: &[usize],
    ) -> S2sResult<(Seq2SeqStepper<'_>, StepState)> {
        let encoded = self.encode(source, lengths, false)?;
        let (decoder, memory) = self.prepare_decoding(&encoded)?;
        Ok((Seq2SeqStepper { model: self }, StepState { decoder, memory }))
    }
}

/// Суммарное число скалярных параметров в `VarMap`.
pub fn parameter_count(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

/// Состояние пошагового декодирования.
#[derive(Debug, Clone)]
pub struct StepState {
    pub decoder: DecoderState,
    pub memory: AttentionMemory,
}

pub struct Seq2SeqStepper<'a> {
    model: &'a Seq2Seq,
}

impl StepDecoder for Seq2SeqStepper<'_> {
    type State = StepState;

    fn sos_id(&self) -> u32 {
        SOS_ID
    }

    fn eos_id(&self) -> u32 {
        EOS_ID
    }

    fn vocab_size(&self) -> usize {
        self.model.config.decoder.vocab_size
    }

    fn batch_size(&self, state: &StepState) -> usize {
        state.memory.values.dim(0).unwrap_or(0)
    }

    fn step(&self, tokens: &[u32], state: &StepState) -> S2sResult<(Tensor, StepState)> {
        let tokens = Tensor::new(tokens, &self.model.device)?;
        let (log_probs, decoder) = self
            .model
            .decoder
            .step(&tokens, &state.decoder, &state.memory, false)?;
        Ok((
            log_probs,
            StepState {
                decoder,
                memory: state.memory.clone(),
            },
        ))
    }

    fn reorder(&self, state: &StepState, indices: &[usize]) -> S2sResult<StepState> {
        let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let idx = Tensor::new(idx.as_slice(), &self.model.device)?;
        Ok(StepState {
            decoder: state.decoder.index_select(&idx)?,
            memory: state.memory.index_select(&idx)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use s2s_core::{
        AttentionConfig, AttentionKind, DecoderConfig, EncoderConfig, EncoderInput, RnnType,
    };

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            name: "tiny".into(),
            encoder: EncoderConfig {
                input: EncoderInput::Tokens { vocab_size: 10 },
                hidden_size: 4,
                n_layers: 1,
                bidirectional: true,
                rnn_type: RnnType::Gru,
                dropout_p: 0.0,
            },
            attention: AttentionConfig {
                kind: AttentionKind::Additive,
                attn_dim: 4,
                ..AttentionConfig::default()
            },
            decoder: DecoderConfig {
                vocab_size: 9,
                embed_dim: 4,
                hidden_size: 8,
                n_layers: 1,
                rnn_type: RnnType::Gru,
                dropout_p: 0.0,
                max_length: 6,
            },
        }
    }

    #[test]
    fn test_forward_shape_and_params() {
        let (varmap, model) = Seq2Seq::trainable(&tiny_config(), None, &Device::Cpu).unwrap();
        assert!(parameter_count(&varmap) > 0);

        let src = Tensor::new(&[[4u32, 5, 6], [7, 8, 0]], &Device::Cpu).unwrap();
        let tgt = Tensor::new(&[[1u32, 4, 5], [1, 6, 0]], &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let out = model.forward(&src, &[3, 2], &tgt, 1.0, &mut rng, true).unwrap();
        assert_eq!(out.dims(), &[2, 3, 9]);
    }

    #[test]
    fn test_stepper_reorder() {
        let (_vm, model) = Seq2Seq::trainable(&tiny_config(), None, &Device::Cpu).unwrap();
        let src = Tensor::new(&[[4u32, 5, 6]], &Device::Cpu).unwrap();
        let (stepper, state) = model.stepper(&src, &[3]).unwrap();
        assert_eq!(stepper.batch_size(&state), 1);

        let beams = stepper.reorder(&state, &[0, 0, 0]).unwrap();
        assert_eq!(stepper.batch_size(&beams), 3);
        let (log_probs, next) = stepper.step(&[1, 1, 1], &beams).unwrap();
        assert_eq!(log_probs.dims(), &[3, 9]);

        // одинаковые строки дают одинаковые распределения
        let rows: Vec<Vec<f32>> = log_probs.to_vec2().unwrap();
        for (x, y) in rows[0].iter().zip(&rows[2]) {
            assert!((x - y).abs() < 1e-6);
        }
        assert_eq!(stepper.batch_size(&next), 3);
    }

    #[test]
    fn test_save_and_reload_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let cfg = tiny_config();
        let (varmap, model) = Seq2Seq::trainable(&cfg, None, &Device::Cpu).unwrap();
        varmap.save(&path).unwrap();

        let loaded = Seq2Seq::from_safetensors(&cfg, &path, &Device::Cpu).unwrap();
        let src = Tensor::new(&[[4u32, 5]], &Device::Cpu).unwrap();
        let (s1, st1) = model.stepper(&src, &[2]).unwrap();
        let (s2, st2) = loaded.stepper(&src, &[2]).unwrap();
        let a: Vec<Vec<f32>> = s1.step(&[1], &st1).unwrap().0.to_vec2().unwrap();
        let b: Vec<Vec<f32>> = s2.step(&[1], &st2).unwrap().0.to_vec2().unwrap();
        for (x, y) in a[0].iter().zip(&b[0]) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_missing_weights_file() {
        let err =
            Seq2Seq::from_safetensors(&tiny_config(), "/nonexistent/model.safetensors", &Device::Cpu);
        assert!(matches!(err, Err(S2sError::Model(_))));
    }
}
