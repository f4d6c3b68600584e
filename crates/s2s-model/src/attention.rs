//! Механизмы внимания декодера.
//!
//! Все варианты считают энергию `e[b, t]` для запроса декодера и каждой
//! позиции памяти энкодера, маскируют паддинг и нормализуют softmax'ом.

use candle_core::{Result, Tensor, D};
use candle_nn::{Conv1d, Conv1dConfig, Linear, Module, VarBuilder};
use s2s_core::{AttentionConfig, AttentionKind};

use crate::rnn::length_mask;

/// Штраф для замаскированных позиций: после softmax даёт ровно 0 в f32.
const MASK_PENALTY: f64 = -1e9;

enum Scorer {
    Dot,
    Scaled {
        scale: f64,
    },
    General {
        w: Linear,
    },
    Additive {
        query: Linear,
        key: Linear,
        v: Linear,
    },
    Location {
        query: Linear,
        key: Linear,
        v: Linear,
        conv: Conv1d,
        location: Linear,
    },
}

/// Память энкодера, подготовленная для многократных шагов внимания.
///
/// Проекция ключей не зависит от запроса, поэтому считается один раз
/// на высказывание.
#[derive(Debug, Clone)]
pub struct AttentionMemory {
    /// Выходы энкодера [b, t, H].
    pub values: Tensor,
    /// Ключи: `values` для dot/scaled, проекция для остальных.
    pub keys: Tensor,
    /// 1.0: реальная позиция, 0.0: паддинг [b, t].
    pub mask: Tensor,
}

impl AttentionMemory {
    /// Выбрать строки батча (для beam search).
    pub fn index_select(&self, indices: &Tensor) -> Result<Self> {
        Ok(Self {
            values: self.values.index_select(indices, 0)?,
            keys: self.keys.index_select(indices, 0)?,
            mask: self.mask.index_select(indices, 0)?,
        })
    }

    pub fn time_steps(&self) -> Result<usize> {
        self.values.dim(1)
    }
}

pub struct Attention {
    kind: AttentionKind,
    scorer: Scorer,
}

impl Attention {
    /// `hidden`: размерность и запроса, и памяти.
    pub fn new(config: &AttentionConfig, hidden: usize, vb: VarBuilder) -> Result<Self> {
        let scorer = match config.kind {
            AttentionKind::Dot => Scorer::Dot,
            AttentionKind::Scaled => Scorer::Scaled {
                scale: 1.0 / (hidden as f64).sqrt(),
            },
            AttentionKind::General => Scorer::General {
                w: candle_nn::linear_no_bias(hidden, hidden, vb.pp("linear_in"))?,
            },
            AttentionKind::Additive => Scorer::Additive {
                query: candle_nn::linear_no_bias(hidden, config.attn_dim, vb.pp("query"))?,
                key: candle_nn::linear(hidden, config.attn_dim, vb.pp("key"))?,
                v: candle_nn::linear_no_bias(config.attn_dim, 1, vb.pp("v"))?,
            },
            AttentionKind::Location => {
                let conv_cfg = Conv1dConfig {
                    padding: config.location_kernel / 2,
                    ..Default::default()
                };
                Scorer::Location {
                    query: candle_nn::linear_no_bias(hidden, config.attn_dim, vb.pp("query"))?,
                    key: candle_nn::linear(hidden, config.attn_dim, vb.pp("key"))?,
                    v: candle_nn::linear_no_bias(config.attn_dim, 1, vb.pp("v"))?,
                    conv: candle_nn::conv1d(
                        1,
                        config.location_channels,
                        config.location_kernel,
                        conv_cfg,
                        vb.pp("location_conv"),
                    )?,
                    location: candle_nn::linear_no_bias(
                        config.location_channels,
                        config.attn_dim,
                        vb.pp("location_proj"),
                    )?,
                }
            }
        };
        Ok(Self {
            kind: config.kind,
            scorer,
        })
    }

    pub fn kind(&self) -> AttentionKind {
        self.kind
    }

    /// Подготовить память: выходы энкодера [b, t, H] и их реальные длины.
    pub fn prepare(&self, values: &Tensor, lengths: &[usize]) -> Result<AttentionMemory> {
        let (_, time, _) = values.dims3()?;
        let mask = length_mask(lengths, time, values.device())?;
        let keys = match &self.scorer {
            Scorer::Dot | Scorer::Scaled { .. } => values.clone(),
            Scorer::General { w } => w.forward(values)?,
            Scorer::Additive { key, .. } | Scorer::Location { key, .. } => key.forward(values)?,
        };
        Ok(AttentionMemory {
            values: values.clone(),
            keys,
            mask,
        })
    }

    /// Один шаг внимания.
    ///
    /// `query`: [b, H], `prev_align`: выравнивание предыдущего шага [b, t]
    /// (используется только location-aware вариантом; `None`: нули).
    /// Возвращает контекст [b, H] и выравнивание [b, t].
    pub fn forward(
        &self,
        query: &Tensor,
        memory: &AttentionMemory,
        prev_align: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let energy = match &self.scorer {
            Scorer::Dot | Scorer::General { .. } => bilinear(&memory.keys, query)?,
            Scorer::Scaled { scale } => bilinear(&memory.keys, query)?.affine(*scale, 0.0)?,
            Scorer::Additive { query: wq, v, .. } => {
                let q = wq.forward(query)?.unsqueeze(1)?;
                v.forward(&memory.keys.broadcast_add(&q)?.tanh()?)?
                    .squeeze(D::Minus1)?
            }
            Scorer::Location {
                query: wq,
                v,
                conv,
                location,
                ..
            } => {
                let prev = match prev_align {
                    Some(a) => a.clone(),
                    None => memory.mask.zeros_like()?,
                };
                // [b, t] → [b, 1, t] → conv → [b, C, t] → [b, t, C] → [b, t, A]
                let loc = conv.forward(&prev.unsqueeze(1)?)?.transpose(1, 2)?;
                let loc = location.forward(&loc.contiguous()?)?;
                let q = wq.forward(query)?.unsqueeze(1)?;
                v.forward(&(memory.keys.broadcast_add(&q)? + loc)?.tanh()?)?
                    .squeeze(D::Minus1)?
            }
        };

        let penalty = memory.mask.affine(-MASK_PENALTY, MASK_PENALTY)?;
        let align = candle_nn::ops::softmax(&(energy + penalty)?, D::Minus1)?;
        // [b, 1, t] × [b, t, H] → [b, H]
        let context = align
            .unsqueeze(1)?
            .matmul(&memory.values)?
            .squeeze(1)?;
        Ok((context, align))
    }
}

/// `keys [b, t, H] · query [b, H]` → [b, t].
fn bilinear(keys: &Tensor, query: &Tensor) -> Result<Tensor> {
    keys.matmul(&query.unsqueeze(D::Minus1)?)?.squeeze(D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn check_kind(kind: AttentionKind) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = AttentionConfig {
            kind,
            attn_dim: 6,
            location_channels: 3,
            location_kernel: 5,
        };
        let attn = Attention::new(&cfg, 4, vb).unwrap();

        let values = Tensor::randn(0f32, 1f32, (2, 7, 4), &Device::Cpu).unwrap();
        let memory = attn.prepare(&values, &[7, 4]).unwrap();
        let query = Tensor::randn(0f32, 1f32, (2, 4), &Device::Cpu).unwrap();

        let (context, align) = attn.forward(&query, &memory, None).unwrap();
        assert_eq!(context.dims(), &[2, 4]);
        assert_eq!(align.dims(), &[2, 7]);

        let rows: Vec<Vec<f32>> = align.to_vec2().unwrap();
        for row in &rows {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "{kind:?}: сумма весов {sum}");
        }
        assert!(rows[1][4..].iter().all(|&w| w == 0.0), "{kind:?}: вес на паддинге");

        // Второй шаг с предыдущим выравниванием
        let (_, align2) = attn.forward(&query, &memory, Some(&align)).unwrap();
        assert_eq!(align2.dims(), &[2, 7]);
    }

    #[test]
    fn test_all_kinds_normalized_and_masked() {
        for kind in [
            AttentionKind::Dot,
            AttentionKind::Scaled,
            AttentionKind::General,
            AttentionKind::Additive,
            AttentionKind::Location,
        ] {
            check_kind(kind);
        }
    }

    #[test]
    fn test_dot_prefers_matching_key() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = Attention::new(&AttentionConfig::default(), 2, vb).unwrap();

        let values = Tensor::new(&[[[10f32, 0.], [0., 10.], [-10., 0.]]], &Device::Cpu).unwrap();
        let memory = attn.prepare(&values, &[3]).unwrap();
        let query = Tensor::new(&[[0f32, 1.]], &Device::Cpu).unwrap();
        let (context, align) = attn.forward(&query, &memory, None).unwrap();

        let align: Vec<f32> = align.squeeze(0).unwrap().to_vec1().unwrap();
        assert!(align[1] > 0.99);
        let context: Vec<f32> = context.squeeze(0).unwrap().to_vec1().unwrap();
        assert!((context[1] - 10.0).abs() < 0.1);
    }

    #[test]
    fn test_memory_reorder() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = Attention::new(&AttentionConfig::default(), 3, vb).unwrap();
        let values = Tensor::randn(0f32, 1f32, (2, 4, 3), &Device::Cpu).unwrap();
        let memory = attn.prepare(&values, &[4, 2]).unwrap();

        let idx = Tensor::new(&[1u32, 1, 0], &Device::Cpu).unwrap();
        let picked = memory.index_select(&idx).unwrap();
        assert_eq!(picked.values.dims(), &[3, 4, 3]);
        let mask: Vec<Vec<f32>> = picked.mask.to_vec2().unwrap();
        assert_eq!(mask[0], vec![1.0, 1.0, 0.0, 0.0]);
        assert_eq!(mask[2], vec![1.0, 1.0, 1.0, 1.0]);
    }
}
