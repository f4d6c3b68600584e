//! Батчинг: группировка по длине, перемешивание и паддинг.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use s2s_core::vocab::{EOS_ID, PAD_ID, SOS_ID};
use s2s_core::{S2sError, S2sResult};

use crate::data::{Example, Source};

/// Батч, готовый для модели.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Токены [b, t] (u32) или признаки [b, t, f] (f32), паддинг нулями.
    pub source: Tensor,
    pub source_lengths: Vec<usize>,
    /// `<sos>` + y, [b, T].
    pub target_in: Tensor,
    /// y + `<eos>`, [b, T].
    pub target_out: Tensor,
    /// 1.0 на реальных позициях `target_out`, [b, T].
    pub target_mask: Tensor,
    /// Исходные целевые id (для метрик).
    pub targets: Vec<Vec<u32>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.source_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source_lengths.is_empty()
    }

    /// Количество целевых токенов, включая `<eos>`.
    pub fn num_target_tokens(&self) -> usize {
        self.targets.iter().map(|t| t.len() + 1).sum()
    }
}

pub struct Batcher {
    batch_size: usize,
    sort_by_length: bool,
    rng: StdRng,
}

impl Batcher {
    pub fn new(batch_size: usize, sort_by_length: bool, seed: u64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            sort_by_length,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// План эпохи: индексы примеров по батчам.
    ///
    /// При `sort_by_length` в батч попадают примеры близкой длины, иначе
    /// примеры перемешиваются. Порядок батчей перемешивается всегда.
    pub fn plan(&mut self, examples: &[Example]) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..examples.len()).collect();
        if self.sort_by_length {
            order.sort_by_key(|&i| examples[i].source.len());
        } else {
            order.shuffle(&mut self.rng);
        }
        let mut batches: Vec<Vec<usize>> = order
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect();
        batches.shuffle(&mut self.rng);
        batches
    }

    /// Батчи без перемешивания (для валидации).
    pub fn sequential(&self, examples: &[Example]) -> Vec<Vec<usize>> {
        (0..examples.len())
            .collect::<Vec<_>>()
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect()
    }
}

/// Собрать батч из примеров.
pub fn collate(examples: &[&Example], device: &Device) -> S2sResult<Batch> {
    if examples.is_empty() {
        return Err(S2sError::Data("пустой батч".into()));
    }
    let batch = examples.len();
    let source_lengths: Vec<usize> = examples.iter().map(|e| e.source.len()).collect();
    let max_src = source_lengths.iter().copied().max().unwrap_or(0);

    let source = match &examples[0].source {
        Source::Tokens(_) => {
            let mut data = vec![PAD_ID; batch * max_src];
            for (row, ex) in examples.iter().enumerate() {
                let Source::Tokens(ids) = &ex.source else {
                    return Err(mixed_sources());
                };
                data[row * max_src..row * max_src + ids.len()].copy_from_slice(ids);
            }
            Tensor::from_vec(data, (batch, max_src), device)?
        }
        Source::Features { feature_dim, .. } => {
            let dim = *feature_dim;
            let mut data = vec![0f32; batch * max_src * dim];
            for (row, ex) in examples.iter().enumerate() {
                let Source::Features {
                    frames,
                    feature_dim,
                    ..
                } = &ex.source
                else {
                    return Err(mixed_sources());
                };
                if *feature_dim != dim {
                    return Err(S2sError::Data(format!(
                        "разная размерность признаков в батче: {dim} и {feature_dim}"
                    )));
                }
                let start = row * max_src * dim;
                data[start..start + frames.len()].copy_from_slice(frames);
            }
            Tensor::from_vec(data, (batch, max_src, dim), device)?
        }
    };

    let max_tgt = examples.iter().map(|e| e.target.len()).max().unwrap_or(0) + 1;
    let mut target_in = vec![PAD_ID; batch * max_tgt];
    let mut target_out = vec![PAD_ID; batch * max_tgt];
    let mut target_mask = vec![0f32; batch * max_tgt];
    for (row, ex) in examples.iter().enumerate() {
        let base = row * max_tgt;
        let n = ex.target.len();
        target_in[base] = SOS_ID;
        target_in[base + 1..base + 1 + n].copy_from_slice(&ex.target);
        target_out[base..base + n].copy_from_slice(&ex.target);
        target_out[base + n] = EOS_ID;
        target_mask[base..base + n + 1].fill(1.0);
    }

    Ok(Batch {
        source,
        source_lengths,
        target_in: Tensor::from_vec(target_in, (batch, max_tgt), device)?,
        target_out: Tensor::from_vec(target_out, (batch, max_tgt), device)?,
        target_mask: Tensor::from_vec(target_mask, (batch, max_tgt), device)?,
        targets: examples.iter().map(|e| e.target.clone()).collect(),
    })
}

fn mixed_sources() -> S2sError {
    S2sError::Data("в батче смешаны токенный и акустический входы".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(src: &[u32], tgt: &[u32]) -> Example {
        Example::new(Source::Tokens(src.to_vec()), tgt.to_vec()).unwrap()
    }

    #[test]
    fn test_collate_tokens() {
        let a = tok(&[4, 5, 6], &[7, 8]);
        let b = tok(&[9], &[10]);
        let batch = collate(&[&a, &b], &Device::Cpu).unwrap();

        assert_eq!(batch.source_lengths, vec![3, 1]);
        let src: Vec<Vec<u32>> = batch.source.to_vec2().unwrap();
        assert_eq!(src, vec![vec![4, 5, 6], vec![9, 0, 0]]);

        let tin: Vec<Vec<u32>> = batch.target_in.to_vec2().unwrap();
        let tout: Vec<Vec<u32>> = batch.target_out.to_vec2().unwrap();
        let mask: Vec<Vec<f32>> = batch.target_mask.to_vec2().unwrap();
        assert_eq!(tin, vec![vec![SOS_ID, 7, 8], vec![SOS_ID, 10, PAD_ID]]);
        assert_eq!(tout, vec![vec![7, 8, EOS_ID], vec![10, EOS_ID, PAD_ID]]);
        assert_eq!(mask, vec![vec![1., 1., 1.], vec![1., 1., 0.]]);
        assert_eq!(batch.num_target_tokens(), 5);
    }

    #[test]
    fn test_collate_features() {
        let a = Example::new(
            Source::Features {
                frames: vec![1., 2., 3., 4.],
                num_frames: 2,
                feature_dim: 2,
            },
            vec![5],
        )
        .unwrap();
        let b = Example::new(
            Source::Features {
                frames: vec![9., 9.],
                num_frames: 1,
                feature_dim: 2,
            },
            vec![6],
        )
        .unwrap();
        let batch = collate(&[&a, &b], &Device::Cpu).unwrap();
        assert_eq!(batch.source.dims(), &[2, 2, 2]);
        let rows: Vec<Vec<Vec<f32>>> = batch.source.to_vec3().unwrap();
        assert_eq!(rows[1], vec![vec![9., 9.], vec![0., 0.]]);
    }

    #[test]
    fn test_mixed_sources_rejected() {
        let a = tok(&[4], &[5]);
        let b = Example::new(
            Source::Features {
                frames: vec![1.],
                num_frames: 1,
                feature_dim: 1,
            },
            vec![5],
        )
        .unwrap();
        assert!(matches!(
            collate(&[&a, &b], &Device::Cpu),
            Err(S2sError::Data(_))
        ));
    }

    #[test]
    fn test_plan_groups_by_length_and_covers_all() {
        let examples: Vec<Example> = [5usize, 1, 4, 2, 3, 6]
            .iter()
            .map(|&n| tok(&vec![4; n], &[5]))
            .collect();
        let mut batcher = Batcher::new(2, true, 0);
        let plan = batcher.plan(&examples);
        assert_eq!(plan.len(), 3);

        let mut seen: Vec<usize> = plan.iter().flatten().copied().collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);

        for batch in &plan {
            let lens: Vec<usize> = batch.iter().map(|&i| examples[i].source.len()).collect();
            assert_eq!(lens[1] - lens[0], 1);
        }
    }

    #[test]
    fn test_plan_is_seeded() {
        let examples: Vec<Example> = (1..=10).map(|n| tok(&vec![4; n], &[5])).collect();
        let a = Batcher::new(3, false, 9).plan(&examples);
        let b = Batcher::new(3, false, 9).plan(&examples);
        assert_eq!(a, b);
    }
}
