//! Ресэмплинг к частоте модели.

use rubato::{FftFixedInOut, Resampler as RubatoResampler};
use s2s_core::{AudioBuffer, S2sError, S2sResult};

/// FFT-ресэмплер (rubato) к фиксированной целевой частоте.
pub struct Resampler {
    target_sample_rate: usize,
}

impl Resampler {
    pub fn new(target_sample_rate: usize) -> Self {
        Self { target_sample_rate }
    }

    /// Пересэмплировать моно-буфер; длина результата `round(n · ratio)`.
    pub fn resample(&self, buffer: &AudioBuffer) -> S2sResult<AudioBuffer> {
        if buffer.sample_rate == self.target_sample_rate {
            return Ok(buffer.clone());
        }
        if buffer.channels != 1 {
            return Err(S2sError::Audio(
                "ресэмплинг требует моно, сначала вызовите to_mono()".to_string(),
            ));
        }
        if buffer.samples.is_empty() {
            return Ok(AudioBuffer::new(Vec::new(), self.target_sample_rate, 1));
        }

        let ratio = self.target_sample_rate as f64 / buffer.sample_rate as f64;
        let chunk_size = 1024;

        let mut resampler = FftFixedInOut::<f32>::new(
            buffer.sample_rate,
            self.target_sample_rate,
            chunk_size,
            1,
        )
        .map_err(|e| S2sError::Audio(format!("не удалось создать ресэмплер: {e}")))?;

        // FftFixedInOut может округлить размер блока
        let in_chunk = resampler.input_frames_next();
        let delay = resampler.output_delay();
        let expected_len = (buffer.samples.len() as f64 * ratio).round() as usize;
        let needed = delay + expected_len;
        let mut output = Vec::with_capacity(needed + in_chunk);

        // после конца сигнала подаются нулевые блоки, пока задержка фильтра
        // не вытолкнет весь хвост
        let mut pos = 0;
        while output.len() < needed {
            let end = (pos + in_chunk).min(buffer.samples.len());
            let mut chunk = buffer.samples[pos..end].to_vec();
            chunk.resize(in_chunk, 0.0);
            let out = resampler
                .process(&[chunk], None)
                .map_err(|e| S2sError::Audio(format!("ошибка ресэмплинга: {e}")))?;
            output.extend_from_slice(&out[0]);
            pos = end;
        }

        output.drain(..delay);
        output.truncate(expected_len);
        Ok(AudioBuffer::new(output, self.target_sample_rate, 1))
    }
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new(16000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resampler_no_change() {
        let buffer = AudioBuffer::new(vec![0.0; 1024], 16000, 1);
        let result = Resampler::new(16000).resample(&buffer).unwrap();

        assert_eq!(result.sample_rate, 16000);
        assert_eq!(result.samples.len(), buffer.samples.len());
    }

    #[test]
    fn test_downsample_length() {
        let buffer = AudioBuffer::new(vec![0.1; 48000], 48000, 1);
        let result = Resampler::new(16000).resample(&buffer).unwrap();
        assert_eq!(result.sample_rate, 16000);
        assert_eq!(result.samples.len(), 16000);
    }

    fn peak_after_downsample(impulse_at: usize) -> (usize, usize) {
        let mut samples = vec![0.0f32; 48000];
        samples[impulse_at] = 1.0;
        let buffer = AudioBuffer::new(samples, 48000, 1);
        let result = Resampler::new(16000).resample(&buffer).unwrap();
        let peak = result
            .samples
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        (peak, result.samples.len())
    }

    #[test]
    fn test_impulse_keeps_position() {
        let (peak, len) = peak_after_downsample(24000);
        assert_eq!(len, 16000);
        assert!(peak.abs_diff(8000) <= 1, "пик на {peak}");
    }

    #[test]
    fn test_impulse_near_end_is_kept() {
        let (peak, len) = peak_after_downsample(47700);
        assert_eq!(len, 16000);
        assert!(peak.abs_diff(15900) <= 1, "пик на {peak}");
    }

    #[test]
    fn test_stereo_rejected() {
        let buffer = AudioBuffer::new(vec![0.0; 200], 8000, 2);
        assert!(Resampler::new(16000).resample(&buffer).is_err());
    }
}
