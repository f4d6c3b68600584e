//! Сэмплирование с температурой.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use s2s_core::{Hypothesis, S2sError, S2sResult, StepDecoder};

use crate::{greedy_decode, rows};

/// Сэмплировать следующий токен из `softmax(log_probs / temperature)`.
///
/// `temperature = 0` сводится к жадному поиску. Оценка гипотезы: сумма
/// исходных (не масштабированных) log-вероятностей выбранных токенов.
pub fn sample_decode<D: StepDecoder>(
    decoder: &D,
    mut state: D::State,
    temperature: f32,
    seed: u64,
    max_length: usize,
) -> S2sResult<Vec<Hypothesis>> {
    if !temperature.is_finite() || temperature < 0.0 {
        return Err(S2sError::Config(format!(
            "температура должна быть конечной и ≥ 0: {temperature}"
        )));
    }
    if temperature == 0.0 {
        return greedy_decode(decoder, state, max_length);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let batch = decoder.batch_size(&state);
    let eos = decoder.eos_id();
    let mut hyps: Vec<Hypothesis> = (0..batch)
        .map(|_| Hypothesis::new(Vec::new(), 0.0, false))
        .collect();
    let mut inputs = vec![decoder.sos_id(); batch];

    for _ in 0..max_length {
        if hyps.iter().all(|h| h.finished) {
            break;
        }
        let (log_probs, next) = decoder.step(&inputs, &state)?;
        state = next;

        for (i, row) in rows(&log_probs)?.iter().enumerate() {
            let hyp = &mut hyps[i];
            if hyp.finished {
                continue;
            }
            let dist = WeightedIndex::new(tempered(row, temperature)).map_err(|e| {
                S2sError::Inference(format!("некорректное распределение на шаге: {e}"))
            })?;
            let token = dist.sample(&mut rng) as u32;
            hyp.score += row[token as usize];
            if token == eos {
                hyp.finished = true;
            } else {
                hyp.tokens.push(token);
            }
            inputs[i] = token;
        }
    }

    Ok(hyps)
}

/// Ненормированные веса `exp((lp - max) / T)`.
fn tempered(row: &[f32], temperature: f32) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    row.iter()
        .map(|&lp| ((lp - max) / temperature).exp())
        .collect()
}
