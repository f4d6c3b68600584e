//! Рекуррентные слои: LSTM, GRU и tanh-RNN.
//!
//! Весовые ключи совпадают с PyTorch `nn.LSTM` / `nn.GRU` / `nn.RNN`:
//! - `weight_ih_l{k}`: [G*hidden, input]
//! - `weight_hh_l{k}`: [G*hidden, hidden]
//! - `bias_ih_l{k}`, `bias_hh_l{k}`: [G*hidden]
//! - суффикс `_reverse` для обратного направления
//!
//! где G: число гейтов (4 для LSTM, 3 для GRU, 1 для RNN).
//!
//! Последовательности переменной длины обрабатываются как packed sequence:
//! на паддинге состояние не меняется, а выход равен нулю.

use candle_core::{DType, Device, ModuleT, Result, Tensor, D};
use candle_nn::{Dropout, Init, VarBuilder};
use s2s_core::RnnType;

/// Один слой одного направления.
struct RnnLayer {
    rnn_type: RnnType,
    weight_ih: Tensor,
    weight_hh: Tensor,
    bias_ih: Tensor,
    bias_hh: Tensor,
    hidden_size: usize,
}

impl RnnLayer {
    fn new(
        rnn_type: RnnType,
        input_size: usize,
        hidden_size: usize,
        suffix: &str,
        vb: &VarBuilder,
    ) -> Result<Self> {
        let gate_size = rnn_type.gate_count() * hidden_size;
        // Инициализация как в PyTorch: U(-1/sqrt(h), 1/sqrt(h)).
        let k = 1.0 / (hidden_size as f64).sqrt();
        let init = Init::Uniform { lo: -k, up: k };

        let weight_ih =
            vb.get_with_hints((gate_size, input_size), &format!("weight_ih_{suffix}"), init)?;
        let weight_hh =
            vb.get_with_hints((gate_size, hidden_size), &format!("weight_hh_{suffix}"), init)?;
        let bias_ih = vb.get_with_hints(gate_size, &format!("bias_ih_{suffix}"), init)?;
        let bias_hh = vb.get_with_hints(gate_size, &format!("bias_hh_{suffix}"), init)?;

        Ok(Self {
            rnn_type,
            weight_ih,
            weight_hh,
            bias_ih,
            bias_hh,
            hidden_size,
        })
    }

    /// Один шаг: x [b, input], h [b, hidden], c [b, hidden] (только LSTM).
    fn cell(&self, x: &Tensor, h: &Tensor, c: Option<&Tensor>) -> Result<(Tensor, Option<Tensor>)> {
        let gi = x
            .matmul(&self.weight_ih.t()?)?
            .broadcast_add(&self.bias_ih)?;
        let gh = h
            .matmul(&self.weight_hh.t()?)?
            .broadcast_add(&self.bias_hh)?;
        let hs = self.hidden_size;

        match self.rnn_type {
            RnnType::Lstm => {
                // c = σ(f) * c_prev + σ(i) * tanh(g); h = σ(o) * tanh(c)
                let gates = (gi + gh)?;
                let i_gate = candle_nn::ops::sigmoid(&gates.narrow(D::Minus1, 0, hs)?)?;
                let f_gate = candle_nn::ops::sigmoid(&gates.narrow(D::Minus1, hs, hs)?)?;
                let g_gate = gates.narrow(D::Minus1, 2 * hs, hs)?.tanh()?;
                let o_gate = candle_nn::ops::sigmoid(&gates.narrow(D::Minus1, 3 * hs, hs)?)?;

                let c_prev = match c {
                    Some(c) => c.clone(),
                    None => h.zeros_like()?,
                };
                let c_new = ((f_gate * c_prev)? + (i_gate * g_gate)?)?;
                let h_new = (o_gate * c_new.tanh()?)?;
                Ok((h_new, Some(c_new)))
            }
            RnnType::Gru => {
                // r, z: из суммы; n = tanh(gi_n + r * gh_n); h = (1 - z) * n + z * h_prev
                let r = candle_nn::ops::sigmoid(
                    &(gi.narrow(D::Minus1, 0, hs)? + gh.narrow(D::Minus1, 0, hs)?)?,
                )?;
                let z = candle_nn::ops::sigmoid(
                    &(gi.narrow(D::Minus1, hs, hs)? + gh.narrow(D::Minus1, hs, hs)?)?,
                )?;
                let n = (gi.narrow(D::Minus1, 2 * hs, hs)?
                    + (r * gh.narrow(D::Minus1, 2 * hs, hs)?)?)?
                .tanh()?;
                let h_new = ((z.affine(-1.0, 1.0)? * n)? + (z * h)?)?;
                Ok((h_new, None))
            }
            RnnType::Rnn => Ok(((gi + gh)?.tanh()?, None)),
        }
    }
}

/// Состояние стека: по одному тензору `[batch, hidden]` на (слой, направление).
///
/// Индекс `layer * num_directions + direction`, как у PyTorch `h_n`.
#[derive(Debug, Clone)]
pub struct RnnState {
    pub h: Vec<Tensor>,
    /// Состояние ячейки, только для LSTM.
    pub c: Option<Vec<Tensor>>,
}

impl RnnState {
    /// Нулевое начальное состояние.
    pub fn zeros(
        rnn_type: RnnType,
        slots: usize,
        batch: usize,
        hidden_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let zero = Tensor::zeros((batch, hidden_size), DType::F32, device)?;
        let h = vec![zero.clone(); slots];
        let c = (rnn_type == RnnType::Lstm).then(|| vec![zero; slots]);
        Ok(Self { h, c })
    }

    /// Выбрать строки батча по индексам (для beam search).
    pub fn index_select(&self, indices: &Tensor) -> Result<Self> {
        let select = |ts: &Vec<Tensor>| -> Result<Vec<Tensor>> {
            ts.iter().map(|t| t.index_select(indices, 0)).collect()
        };
        Ok(Self {
            h: select(&self.h)?,
            c: self.c.as_ref().map(select).transpose()?,
        })
    }

    /// Склеить направления каждого слоя: `[b, h]` × dirs → `[b, h * dirs]`.
    pub fn merge_directions(&self, num_directions: usize) -> Result<Self> {
        if num_directions == 1 {
            return Ok(self.clone());
        }
        let merge = |ts: &Vec<Tensor>| -> Result<Vec<Tensor>> {
            ts.chunks(num_directions)
                .map(|dirs| Tensor::cat(dirs, D::Minus1))
                .collect()
        };
        Ok(Self {
            h: merge(&self.h)?,
            c: self.c.as_ref().map(merge).transpose()?,
        })
    }

    pub fn num_slots(&self) -> usize {
        self.h.len()
    }

    pub fn batch_size(&self) -> Result<usize> {
        match self.h.first() {
            Some(h) => h.dim(0),
            None => Ok(0),
        }
    }
}

/// Маска `[batch, time]` (1.0: реальный шаг, 0.0: паддинг).
pub fn length_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| if t < len { 1.0 } else { 0.0 }))
        .collect();
    Tensor::from_vec(data, (lengths.len(), max_len), device)
}

/// Многослойная (опционально двунаправленная) рекуррентная сеть.
pub struct StackedRnn {
    /// layers[l][d]: слой l, направление d.
    layers: Vec<Vec<RnnLayer>>,
    rnn_type: RnnType,
    hidden_size: usize,
    num_directions: usize,
    dropout: Dropout,
}

impl StackedRnn {
    pub fn new(
        rnn_type: RnnType,
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        bidirectional: bool,
        dropout_p: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_directions = if bidirectional { 2 } else { 1 };
        let mut layers = Vec::with_capacity(num_layers);
        for l in 0..num_layers {
            let layer_input = if l == 0 {
                input_size
            } else {
                hidden_size * num_directions
            };
            let mut dirs = Vec::with_capacity(num_directions);
            for d in 0..num_directions {
                let suffix = if d == 0 {
                    format!("l{l}")
                } else {
                    format!("l{l}_reverse")
                };
                dirs.push(RnnLayer::new(
                    rnn_type,
                    layer_input,
                    hidden_size,
                    &suffix,
                    &vb,
                )?);
            }
            layers.push(dirs);
        }

        Ok(Self {
            layers,
            rnn_type,
            hidden_size,
            num_directions,
            dropout: Dropout::new(dropout_p),
        })
    }

    pub fn rnn_type(&self) -> RnnType {
        self.rnn_type
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn num_directions(&self) -> usize {
        self.num_directions
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Нулевое состояние для батча.
    pub fn zero_state(&self, batch: usize, device: &Device) -> Result<RnnState> {
        RnnState::zeros(
            self.rnn_type,
            self.num_layers() * self.num_directions,
            batch,
            self.hidden_size,
            device,
        )
    }

    /// Прогнать всю последовательность.
    ///
    /// `x`: [b, t, input], `lengths`: реальные длины строк.
    /// Возвращает выходы последнего слоя [b, t, hidden * dirs] и финальное
    /// состояние (на последнем реальном шаге каждой строки).
    pub fn forward(
        &self,
        x: &Tensor,
        lengths: &[usize],
        train: bool,
    ) -> Result<(Tensor, RnnState)> {
        let (batch, time, _) = x.dims3()?;
        let device = x.device();
        let mask = length_mask(lengths, time, device)?;
        let steps: Vec<Tensor> = (0..time)
            .map(|t| mask.narrow(1, t, 1))
            .collect::<Result<_>>()?;

        let mut input = x.clone();
        let mut final_h = Vec::with_capacity(self.num_layers() * self.num_directions);
        let mut final_c = Vec::with_capacity(self.num_layers() * self.num_directions);

        for (l, dirs) in self.layers.iter().enumerate() {
            let mut dir_outputs = Vec::with_capacity(self.num_directions);
            for (d, layer) in dirs.iter().enumerate() {
                let mut h = Tensor::zeros((batch, self.hidden_size), DType::F32, device)?;
                let mut c = (self.rnn_type == RnnType::Lstm).then(|| h.clone());
                let mut outputs: Vec<Tensor> = Vec::with_capacity(time);

                let order: Box<dyn Iterator<Item = usize>> = if d == 0 {
                    Box::new(0..time)
                } else {
                    Box::new((0..time).rev())
                };
                for t in order {
                    let x_t = input.narrow(1, t, 1)?.squeeze(1)?;
                    let (h_new, c_new) = layer.cell(&x_t, &h, c.as_ref())?;
                    let m = &steps[t];
                    let keep = m.affine(-1.0, 1.0)?;
                    h = (h_new.broadcast_mul(m)? + h.broadcast_mul(&keep)?)?;
                    if let (Some(c_prev), Some(c_new)) = (c.as_ref(), c_new) {
                        c = Some((c_new.broadcast_mul(m)? + c_prev.broadcast_mul(&keep)?)?);
                    }
                    outputs.push(h.broadcast_mul(m)?);
                }
                if d == 1 {
                    outputs.reverse();
                }
                dir_outputs.push(Tensor::stack(&outputs, 1)?);
                final_h.push(h);
                if let Some(c) = c {
                    final_c.push(c);
                }
            }

            let out = if dir_outputs.len() == 1 {
                dir_outputs.remove(0)
            } else {
                Tensor::cat(&dir_outputs, D::Minus1)?
            };
            // Dropout между слоями, но не после последнего.
            input = if l + 1 < self.num_layers() {
                self.dropout.forward_t(&out, train)?
            } else {
                out
            };
        }

        let state = RnnState {
            h: final_h,
            c: (self.rnn_type == RnnType::Lstm).then_some(final_c),
        };
        Ok((input, state))
    }

    /// Один шаг однонаправленного стека: x [b, input] → (выход [b, hidden], состояние).
    pub fn step(&self, x: &Tensor, state: &RnnState, train: bool) -> Result<(Tensor, RnnState)> {
        if self.num_directions != 1 {
            candle_core::bail!("step() поддерживается только для однонаправленной RNN");
        }
        let mut input = x.clone();
        let mut new_h = Vec::with_capacity(self.num_layers());
        let mut new_c = Vec::with_capacity(self.num_layers());

        for (l, dirs) in self.layers.iter().enumerate() {
            let c_prev = state.c.as_ref().map(|c| &c[l]);
            let (h, c) = dirs[0].cell(&input, &state.h[l], c_prev)?;
            input = if l + 1 < self.num_layers() {
                self.dropout.forward_t(&h, train)?
            } else {
                h.clone()
            };
            new_h.push(h);
            if let Some(c) = c {
                new_c.push(c);
            }
        }

        let state = RnnState {
            h: new_h,
            c: (self.rnn_type == RnnType::Lstm).then_some(new_c),
        };
        Ok((input, state))
    }
}
