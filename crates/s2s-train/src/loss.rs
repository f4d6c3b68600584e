//! Маскированная NLL со сглаживанием меток.

use candle_core::{DType, Result, Tensor, D};

/// Значение функции потерь на батче.
pub struct LossOutput {
    /// Скалярная функция потерь для `backward()`.
    pub loss: Tensor,
    /// Средняя NLL без сглаживания (для перплексии).
    pub nll: f64,
    /// Количество реальных (не паддинг) позиций.
    pub tokens: usize,
}

/// NLL, усреднённая по реальным позициям.
///
/// `log_probs`: [b, T, V], `targets`: [b, T] (u32), `mask`: [b, T] (f32).
/// Со сглаживанием `ε` потеря на позиции равна
/// `(1 - ε) · nll + ε · mean_v(-log p_v)`.
pub fn masked_nll(
    log_probs: &Tensor,
    targets: &Tensor,
    mask: &Tensor,
    label_smoothing: f64,
) -> Result<LossOutput> {
    let targets = targets.to_dtype(DType::U32)?.unsqueeze(D::Minus1)?;
    let nll = log_probs.gather(&targets, D::Minus1)?.squeeze(D::Minus1)?.neg()?;

    let tokens = mask.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    let denom = f64::from(tokens).max(1.0);

    let nll_sum = (&nll * mask)?.sum_all()?;
    let nll_mean = (nll_sum / denom)?;

    let loss = if label_smoothing > 0.0 {
        let smooth = log_probs.mean(D::Minus1)?.neg()?;
        let smooth_mean = ((smooth * mask)?.sum_all()? / denom)?;
        ((&nll_mean * (1.0 - label_smoothing))? + (smooth_mean * label_smoothing)?)?
    } else {
        nll_mean.clone()
    };

    Ok(LossOutput {
        loss,
        nll: f64::from(nll_mean.to_scalar::<f32>()?),
        tokens: tokens.round() as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn uniform_log_probs(b: usize, t: usize, v: usize) -> Tensor {
        Tensor::full(-(v as f32).ln(), (b, t, v), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_uniform_distribution_loss() {
        let lp = uniform_log_probs(2, 3, 8);
        let targets = Tensor::new(&[[1u32, 2, 0], [3, 0, 0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1f32, 1., 0.], [1., 0., 0.]], &Device::Cpu).unwrap();

        let out = masked_nll(&lp, &targets, &mask, 0.0).unwrap();
        assert_eq!(out.tokens, 3);
        assert!((out.nll - (8f64).ln()).abs() < 1e-5);
        // для равномерного распределения сглаживание не меняет потерю
        let smoothed = masked_nll(&lp, &targets, &mask, 0.1).unwrap();
        let v: f32 = smoothed.loss.to_scalar().unwrap();
        assert!((f64::from(v) - (8f64).ln()).abs() < 1e-5);
    }

    #[test]
    fn test_padding_is_ignored() {
        // первая позиция уверенно верная, вторая: паддинг с «плохим» распределением
        let lp = Tensor::new(
            &[[[0f32, -20., -20.], [-20., -20., 0.]]],
            &Device::Cpu,
        )
        .unwrap();
        let targets = Tensor::new(&[[0u32, 0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1f32, 0.]], &Device::Cpu).unwrap();
        let out = masked_nll(&lp, &targets, &mask, 0.0).unwrap();
        assert!(out.nll.abs() < 1e-6);
    }

    #[test]
    fn test_smoothing_penalizes_confidence() {
        let lp = Tensor::new(&[[[0f32, -30., -30.]]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1f32]], &Device::Cpu).unwrap();
        let plain: f32 = masked_nll(&lp, &targets, &mask, 0.0).unwrap().loss.to_scalar().unwrap();
        let smooth: f32 = masked_nll(&lp, &targets, &mask, 0.1).unwrap().loss.to_scalar().unwrap();
        assert!(plain.abs() < 1e-6);
        assert!((smooth - 2.0).abs() < 1e-4); // 0.1 * (0 + 30 + 30) / 3
    }
}
