//! Рекуррентный энкодер (listener).
//!
//! Токенный вход проходит через embedding, акустический через склейку
//! `frame_stack` соседних фреймов и линейную проекцию. Дальше dropout и
//! стек RNN с маскированием паддинга.

use candle_core::{DType, ModuleT, Result, Tensor};
use candle_nn::{Dropout, Embedding, Linear, Module, VarBuilder};
use s2s_core::{EncoderConfig, EncoderInput, S2sError, S2sResult};

use crate::rnn::{RnnState, StackedRnn};

enum InputLayer {
    Embedding(Embedding),
    Projection { linear: Linear, frame_stack: usize },
}

/// Результат энкодера.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Выходы последнего слоя [b, t', hidden * dirs].
    pub outputs: Tensor,
    /// Длины после склейки фреймов.
    pub lengths: Vec<usize>,
    /// Финальное состояние с объединёнными направлениями:
    /// по одному [b, hidden * dirs] на слой.
    pub state: RnnState,
}

pub struct Encoder {
    input: InputLayer,
    dropout: Dropout,
    rnn: StackedRnn,
    config: EncoderConfig,
}

impl Encoder {
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let input = match &config.input {
            EncoderInput::Tokens { vocab_size } => InputLayer::Embedding(candle_nn::embedding(
                *vocab_size,
                config.hidden_size,
                vb.pp("embedding"),
            )?),
            EncoderInput::Features { frame_stack, .. } => InputLayer::Projection {
                linear: candle_nn::linear(
                    config.input.input_dim(),
                    config.hidden_size,
                    vb.pp("input_proj"),
                )?,
                frame_stack: (*frame_stack).max(1),
            },
        };
        let rnn = StackedRnn::new(
            config.rnn_type,
            config.hidden_size,
            config.hidden_size,
            config.n_layers,
            config.bidirectional,
            config.dropout_p,
            vb.pp("rnn"),
        )?;

        Ok(Self {
            input,
            dropout: Dropout::new(config.dropout_p),
            rnn,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Прогнать батч через энкодер.
    ///
    /// `input`: токены [b, t] (u32) или признаки [b, t, feature_dim] (f32).
    pub fn forward(
        &self,
        input: &Tensor,
        lengths: &[usize],
        train: bool,
    ) -> S2sResult<EncoderOutput> {
        let batch = input.dim(0)?;
        let time = input.dim(1)?;
        check_lengths(lengths, batch, time)?;

        let (embedded, lengths) = match &self.input {
            InputLayer::Embedding(embedding) => {
                if input.rank() != 2 {
                    return Err(S2sError::Data(format!(
                        "Энкодер ожидает токены [batch, time], получено {:?}",
                        input.dims()
                    )));
                }
                (embedding.forward(&input.to_dtype(DType::U32)?)?, lengths.to_vec())
            }
            InputLayer::Projection {
                linear,
                frame_stack,
            } => {
                let (stacked, lengths) = stack_frames(input, lengths, *frame_stack)?;
                (linear.forward(&stacked)?, lengths)
            }
        };

        let embedded = self.dropout.forward_t(&embedded, train)?;
        let (outputs, state) = self.rnn.forward(&embedded, &lengths, train)?;
        let state = state.merge_directions(self.rnn.num_directions())?;

        Ok(EncoderOutput {
            outputs,
            lengths,
            state,
        })
    }
}

fn check_lengths(lengths: &[usize], batch: usize, time: usize) -> S2sResult<()> {
    if lengths.len() != batch {
        return Err(S2sError::Data(format!(
            "Количество длин ({}) не совпадает с размером батча ({batch})",
            lengths.len()
        )));
    }
    if let Some(bad) = lengths.iter().find(|&&l| l == 0 || l > time) {
        return Err(S2sError::Data(format!(
            "Некорректная длина последовательности {bad} (ось времени {time})"
        )));
    }
    Ok(())
}

/// Склеить `k` соседних фреймов: [b, t, f] → [b, ceil(t/k), f*k].
///
/// Хвост дополняется нулями до кратной длины.
fn stack_frames(features: &Tensor, lengths: &[usize], k: usize) -> S2sResult<(Tensor, Vec<usize>)> {
    let (batch, time, dim) = features.dims3().map_err(|_| {
        S2sError::Data(format!(
            "Энкодер ожидает признаки [batch, time, dim], получено {:?}",
            features.dims()
        ))
    })?;
    let features = features.to_dtype(DType::F32)?;
    if k == 1 {
        return Ok((features, lengths.to_vec()));
    }

    let stacked_time = time.div_ceil(k);
    let pad = stacked_time * k - time;
    let padded = if pad > 0 {
        let zeros = Tensor::zeros((batch, pad, dim), DType::F32, features.device())?;
        Tensor::cat(&[&features, &zeros], 1)?
    } else {
        features
    };
    let stacked = padded.reshape((batch, stacked_time, dim * k))?;
    let lengths = lengths.iter().map(|l| l.div_ceil(k)).collect();
    Ok((stacked, lengths))
}
