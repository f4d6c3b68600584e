//! Авторегрессионный декодер с вниманием (speller).
//!
//! Шаг декодера:
//! 1. embedding предыдущего токена + dropout
//! 2. шаг RNN
//! 3. внимание по памяти энкодера
//! 4. `tanh(W_c [out; ctx])`
//! 5. проекция на словарь + log-softmax

use candle_core::{DType, ModuleT, Result, Tensor, D};
use candle_nn::{Dropout, Embedding, Linear, Module, VarBuilder};
use rand::Rng;
use s2s_core::{AttentionConfig, DecoderConfig, RnnType};

use crate::attention::{Attention, AttentionMemory};
use crate::rnn::{RnnState, StackedRnn};

/// Состояние декодера между шагами.
#[derive(Debug, Clone)]
pub struct DecoderState {
    pub rnn: RnnState,
    /// Выравнивание предыдущего шага [b, t] (для location-aware внимания).
    pub align: Option<Tensor>,
}

impl DecoderState {
    pub fn index_select(&self, indices: &Tensor) -> Result<Self> {
        Ok(Self {
            rnn: self.rnn.index_select(indices)?,
            align: self
                .align
                .as_ref()
                .map(|a| a.index_select(indices, 0))
                .transpose()?,
        })
    }
}

pub struct Decoder {
    embedding: Embedding,
    dropout: Dropout,
    rnn: StackedRnn,
    attention: Attention,
    combine: Linear,
    out: Linear,
    config: DecoderConfig,
}

impl Decoder {
    pub fn new(
        config: &DecoderConfig,
        attention: &AttentionConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let embedding =
            candle_nn::embedding(config.vocab_size, config.embed_dim, vb.pp("embedding"))?;
        let rnn = StackedRnn::new(
            config.rnn_type,
            config.embed_dim,
            config.hidden_size,
            config.n_layers,
            false,
            config.dropout_p,
            vb.pp("rnn"),
        )?;
        let attention = Attention::new(attention, config.hidden_size, vb.pp("attention"))?;
        let combine = candle_nn::linear(
            2 * config.hidden_size,
            config.hidden_size,
            vb.pp("linear_out"),
        )?;
        let out = candle_nn::linear(config.hidden_size, config.vocab_size, vb.pp("out"))?;

        Ok(Self {
            embedding,
            dropout: Dropout::new(config.dropout_p),
            rnn,
            attention,
            combine,
            out,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn attention(&self) -> &Attention {
        &self.attention
    }

    /// Начальное состояние из финального состояния энкодера.
    ///
    /// Берутся верхние слои энкодера; если у декодера слоёв больше,
    /// недостающие нижние слои начинаются с нуля. Состояние ячейки LSTM
    /// переносится только между LSTM; иначе оно нулевое.
    pub fn init_state(&self, encoder_state: &RnnState) -> Result<DecoderState> {
        let batch = encoder_state.batch_size()?;
        let n = self.config.n_layers;
        let hidden = self.config.hidden_size;
        let device = match encoder_state.h.first() {
            Some(h) => h.device().clone(),
            None => candle_core::bail!("пустое состояние энкодера"),
        };
        let zero = Tensor::zeros((batch, hidden), DType::F32, &device)?;

        let take_top = |src: &[Tensor]| -> Vec<Tensor> {
            let skip = src.len().saturating_sub(n);
            let top = &src[skip..];
            let missing = n - top.len();
            std::iter::repeat(zero.clone())
                .take(missing)
                .chain(top.iter().cloned())
                .collect()
        };

        let h = take_top(&encoder_state.h);
        let c = match (self.config.rnn_type, encoder_state.c.as_ref()) {
            (RnnType::Lstm, Some(c)) => Some(take_top(c)),
            (RnnType::Lstm, None) => Some(vec![zero.clone(); n]),
            _ => None,
        };

        Ok(DecoderState {
            rnn: RnnState { h, c },
            align: None,
        })
    }

    /// Один шаг: `tokens` [b] (u32) → log-вероятности [b, V].
    pub fn step(
        &self,
        tokens: &Tensor,
        state: &DecoderState,
        memory: &AttentionMemory,
        train: bool,
    ) -> Result<(Tensor, DecoderState)> {
        let embedded = self.embedding.forward(tokens)?;
        let embedded = self.dropout.forward_t(&embedded, train)?;
        let (output, rnn) = self.rnn.step(&embedded, &state.rnn, train)?;
        let (context, align) = self.attention.forward(&output, memory, state.align.as_ref())?;

        let combined = self
            .combine
            .forward(&Tensor::cat(&[&output, &context], D::Minus1)?)?
            .tanh()?;
        let combined = self.dropout.forward_t(&combined, train)?;
        let logits = self.out.forward(&combined)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;

        Ok((
            log_probs,
            DecoderState {
                rnn,
                align: Some(align),
            },
        ))
    }

    /// Прогнать всю целевую последовательность.
    ///
    /// `targets_in` [b, T]: `<sos>` + эталон без последнего токена.
    /// На каждом шаге с вероятностью `teacher_forcing_ratio` на вход идёт
    /// эталонный токен, иначе argmax предыдущего шага (решение общее на батч).
    /// Возвращает log-вероятности [b, T, V].
    pub fn forward_teacher<R: Rng>(
        &self,
        targets_in: &Tensor,
        init: DecoderState,
        memory: &AttentionMemory,
        teacher_forcing_ratio: f64,
        rng: &mut R,
        train: bool,
    ) -> Result<Tensor> {
        let steps = targets_in.dim(1)?;
        let mut state = init;
        let mut outputs = Vec::with_capacity(steps);
        let mut input = targets_in.narrow(1, 0, 1)?.squeeze(1)?;

        for t in 0..steps {
            let (log_probs, next) = self.step(&input, &state, memory, train)?;
            state = next;

            if t + 1 < steps {
                let use_gold = teacher_forcing_ratio >= 1.0
                    || (teacher_forcing_ratio > 0.0 && rng.gen_bool(teacher_forcing_ratio));
                input = if use_gold {
                    targets_in.narrow(1, t + 1, 1)?.squeeze(1)?
                } else {
                    log_probs.detach().argmax(D::Minus1)?
                };
            }
            outputs.push(log_probs);
        }

        Tensor::stack(&outputs, 1)
    }
}
