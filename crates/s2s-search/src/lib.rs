//! # s2s-search
//!
//! Алгоритмы генерации поверх [`s2s_core::StepDecoder`]:
//!
//! - [`greedy_decode`]: argmax на каждом шаге, строки батча независимы
//! - [`sample_decode`]: сэмплирование с температурой и фиксированным seed
//! - [`beam_search`]: n-best для одного входа
//! - [`decode`]: выбор алгоритма по [`s2s_core::SearchConfig`]

mod beam;
mod greedy;
mod sample;

pub use beam::beam_search;
pub use greedy::greedy_decode;
pub use sample::sample_decode;

use candle_core::{DType, Tensor};
use s2s_core::{Hypothesis, S2sResult, SearchConfig, SearchStrategy, StepDecoder};

/// Декодировать каждую строку состояния согласно конфигу.
///
/// Для greedy/sample на строку возвращается одна гипотеза, для beam search:
/// до `beam_size` лучших, отсортированных по убыванию нормированной оценки.
pub fn decode<D: StepDecoder>(
    decoder: &D,
    state: D::State,
    config: &SearchConfig,
) -> S2sResult<Vec<Vec<Hypothesis>>> {
    config.validate()?;
    let single = |hyps: Vec<Hypothesis>| hyps.into_iter().map(|h| vec![h]).collect();

    match &config.strategy {
        SearchStrategy::Greedy => Ok(single(greedy_decode(decoder, state, config.max_length)?)),
        SearchStrategy::Sample { temperature, seed } => Ok(single(sample_decode(
            decoder,
            state,
            *temperature,
            *seed,
            config.max_length,
        )?)),
        SearchStrategy::Beam {
            beam_size,
            length_penalty,
            early_stopping,
        } => {
            let batch = decoder.batch_size(&state);
            let mut results = Vec::with_capacity(batch);
            for row in 0..batch {
                let row_state = decoder.reorder(&state, &[row])?;
                results.push(beam_search(
                    decoder,
                    row_state,
                    *beam_size,
                    *length_penalty,
                    *early_stopping,
                    config.max_length,
                )?);
            }
            Ok(results)
        }
    }
}

/// Log-вероятности шага в виде строк `Vec<f32>`.
fn rows(log_probs: &Tensor) -> S2sResult<Vec<Vec<f32>>> {
    Ok(log_probs.to_dtype(DType::F32)?.to_vec2::<f32>()?)
}

/// Индекс первого максимума.
fn argmax(row: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_decode_dispatch() {
        let dec = TableDecoder::new()
            .with(SOS, &[(3, 0.9), (4, 0.1)])
            .with(3, &[(EOS, 1.0)]);

        let greedy = decode(&dec, 2, &SearchConfig::greedy(5)).unwrap();
        assert_eq!(greedy.len(), 2);
        assert_eq!(greedy[0][0].tokens, vec![3]);

        let beam = decode(&dec, 2, &SearchConfig::beam(2, 5)).unwrap();
        assert_eq!(beam.len(), 2);
        assert_eq!(beam[1][0].tokens, vec![3]);
        assert!(beam[1].len() <= 2);
    }

    #[test]
    fn test_decode_rejects_invalid_config() {
        let dec = TableDecoder::new();
        let bad = SearchConfig {
            strategy: SearchStrategy::Sample {
                temperature: -0.5,
                seed: 1,
            },
            max_length: 5,
        };
        assert!(matches!(
            decode(&dec, 1, &bad),
            Err(s2s_core::S2sError::Config(_))
        ));
    }

    #[test]
    fn test_argmax_first_of_ties() {
        assert_eq!(argmax(&[0.1, 0.5, 0.5, 0.2]), 1);
        assert_eq!(argmax(&[-1.0]), 0);
    }
}
