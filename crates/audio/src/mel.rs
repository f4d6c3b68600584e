//! Log-mel признаки для акустического энкодера.
//!
//! Конвейер: центрированное STFT (окно Ханна, reflect-паддинг) →
//! спектр мощности → mel-фильтры (Slaney или HTK) → ln → опциональная
//! per-utterance нормализация.

use candle_core::{Device, Tensor};
use rustfft::{num_complex::Complex, FftPlanner};
use s2s_core::{AudioBuffer, FeatureConfig, MelNormalization, MelScale, S2sResult};
use std::f32::consts::PI;
use tracing::debug;

use crate::loader::to_mono;
use crate::resample::Resampler;

const LOG_FLOOR: f32 = 1e-10;

/// Матрица признаков `[num_frames, feature_dim]` в row-major порядке.
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub frames: Vec<f32>,
    pub num_frames: usize,
    pub feature_dim: usize,
}

impl Features {
    /// Признаки одного фрейма.
    pub fn frame(&self, idx: usize) -> &[f32] {
        &self.frames[idx * self.feature_dim..(idx + 1) * self.feature_dim]
    }

    /// Тензор `[1, num_frames, feature_dim]`.
    pub fn to_tensor(&self, device: &Device) -> S2sResult<Tensor> {
        Ok(Tensor::from_vec(
            self.frames.clone(),
            (1, self.num_frames, self.feature_dim),
            device,
        )?)
    }
}

/// Параметризованный log-mel экстрактор.
#[derive(Debug)]
pub struct FeatureExtractor {
    config: FeatureConfig,
    window: Vec<f32>,
    mel_filters: Vec<Vec<f32>>,
}

impl FeatureExtractor {
    /// Создать экстрактор с фильтрами, сгенерированными по конфигурации.
    pub fn new(config: FeatureConfig) -> S2sResult<Self> {
        config.validate()?;
        let window = padded_hann_window(config.win_length, config.n_fft);
        let (hz_to_mel, mel_to_hz): (fn(f32) -> f32, fn(f32) -> f32) = match config.mel_scale {
            MelScale::Slaney => (hz_to_mel_slaney, mel_to_hz_slaney),
            MelScale::Htk => (hz_to_mel_htk, mel_to_hz_htk),
        };
        let mel_filters = create_mel_filterbank(
            config.n_mels,
            config.n_fft,
            config.sample_rate as f32,
            config.f_min,
            config.f_max,
            hz_to_mel,
            mel_to_hz,
        );

        Ok(Self {
            config,
            window,
            mel_filters,
        })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Привести буфер к моно и `config.sample_rate`, затем извлечь признаки.
    pub fn extract_buffer(&self, buffer: &AudioBuffer) -> S2sResult<Features> {
        let mono = to_mono(buffer);
        let resampled = Resampler::new(self.config.sample_rate).resample(&mono)?;
        Ok(self.extract(&resampled.samples))
    }

    /// Извлечь признаки из моно-сэмплов с частотой `config.sample_rate`.
    ///
    /// Пустой вход даёт ноль фреймов.
    pub fn extract(&self, samples: &[f32]) -> Features {
        let n_mels = self.config.n_mels;
        if samples.is_empty() {
            return Features {
                frames: Vec::new(),
                num_frames: 0,
                feature_dim: n_mels,
            };
        }

        let power = self.stft(samples);
        let mut log_mel: Vec<f32> = Vec::with_capacity(power.len() * n_mels);
        for frame in &power {
            for filter in &self.mel_filters {
                let energy: f32 = frame.iter().zip(filter).map(|(s, f)| s * f).sum();
                log_mel.push(energy.max(LOG_FLOOR).ln());
            }
        }

        if self.config.normalization == MelNormalization::PerUtterance {
            normalize_per_utterance(&mut log_mel);
        }

        debug!(
            frames = power.len(),
            n_mels, "log-mel признаки извлечены"
        );

        Features {
            num_frames: power.len(),
            frames: log_mel,
            feature_dim: n_mels,
        }
    }

    /// Центрированное STFT, спектр мощности (|X|²) положительных частот.
    fn stft(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let num_frames = samples.len() / hop + 1;
        let pad = (n_fft / 2) as isize;
        let n = samples.len() as isize;

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n_fft);

        let mut spectrogram = Vec::with_capacity(num_frames);
        for frame_idx in 0..num_frames {
            let start = frame_idx as isize * hop as isize - pad;
            let mut buffer: Vec<Complex<f32>> = (0..n_fft)
                .map(|i| {
                    let idx = reflect(start + i as isize, n);
                    let sample = idx.map_or(0.0, |j| samples[j] * self.window[i]);
                    Complex::new(sample, 0.0)
                })
                .collect();

            fft.process(&mut buffer);

            spectrogram.push(
                buffer
                    .iter()
                    .take(n_fft / 2 + 1)
                    .map(|c| c.re * c.re + c.im * c.im)
                    .collect(),
            );
        }
        spectrogram
    }
}

/// Reflect-паддинг как в `torch.stft(center=True)`; `None` за пределами
/// двойного отражения (очень короткие сигналы).
fn reflect(idx: isize, n: isize) -> Option<usize> {
    let mut i = idx;
    if i < 0 {
        i = -i;
    }
    if i >= n {
        i = 2 * n - i - 2;
    }
    (0..n).contains(&i).then_some(i as usize)
}

fn normalize_per_utterance(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let std = var.sqrt().max(1e-10);
    for v in values.iter_mut() {
        *v = ((*v as f64 - mean) / std) as f32;
    }
}

/// Периодическое окно Ханна длины `win_length`, центрированное в `n_fft`.
fn padded_hann_window(win_length: usize, n_fft: usize) -> Vec<f32> {
    let mut window = vec![0.0; n_fft];
    let offset = (n_fft - win_length) / 2;
    for n in 0..win_length {
        window[offset + n] = 0.5 * (1.0 - (2.0 * PI * n as f32 / win_length as f32).cos());
    }
    window
}

/// Convert frequency to Slaney Mel scale (linear below 1 kHz, log above).
fn hz_to_mel_slaney(hz: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4f32).ln() / 27.0;

    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz_slaney(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4f32).ln() / 27.0;

    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        f_sp * mel
    }
}

fn hz_to_mel_htk(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz_htk(mel: f32) -> f32 {
    700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}

/// Треугольные фильтры с Slaney-нормировкой площади `2 / (f_right - f_left)`.
fn create_mel_filterbank(
    n_mels: usize,
    n_fft: usize,
    sample_rate: f32,
    f_min: f32,
    f_max: f32,
    hz_to_mel: fn(f32) -> f32,
    mel_to_hz: fn(f32) -> f32,
) -> Vec<Vec<f32>> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|i| i as f32 * sample_rate / n_fft as f32)
        .collect();

    let mel_min = hz_to_mel(f_min);
    let mel_max = hz_to_mel(f_max);
    let hz_points: Vec<f32> = (0..=n_mels + 1)
        .map(|i| mel_to_hz(mel_min + i as f32 * (mel_max - mel_min) / (n_mels + 1) as f32))
        .collect();

    let mut filterbank = vec![vec![0.0_f32; n_freqs]; n_mels];
    for (m, filter) in filterbank.iter_mut().enumerate() {
        let (f_left, f_center, f_right) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
        let enorm = 2.0 / (f_right - f_left);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            if freq >= f_left && freq < f_center {
                filter[k] = enorm * (freq - f_left) / (f_center - f_left);
            } else if freq >= f_center && freq <= f_right {
                filter[k] = enorm * (f_right - freq) / (f_right - f_center);
            }
        }
    }
    filterbank
}
