//! Общие типы для seq2seq-операций.
//!
//! Содержит базовые структуры данных, используемые всеми крейтами workspace:
//! буфер аудио, гипотезы поиска и результат декодирования.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Аудио-буфер
// ---------------------------------------------------------------------------

/// Буфер необработанного аудио.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Аудио-сэмплы (нормализованы к [-1.0, 1.0]), каналы чередуются.
    pub samples: Vec<f32>,

    /// Частота дискретизации в Гц.
    pub sample_rate: usize,

    /// Количество каналов.
    pub channels: usize,
}

impl AudioBuffer {
    /// Создать новый буфер аудио.
    pub fn new(samples: Vec<f32>, sample_rate: usize, channels: usize) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Длительность в секундах.
    pub fn duration(&self) -> f32 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / (self.sample_rate * self.channels) as f32
    }

    /// Количество сэмплов на канал.
    pub fn num_samples(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }
}

// ---------------------------------------------------------------------------
// Гипотезы
// ---------------------------------------------------------------------------

/// Гипотеза декодера: токены без `<sos>`/`<eos>` и суммарный log-prob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub tokens: Vec<u32>,
    pub score: f32,
    /// Гипотеза завершилась `<eos>` (а не упёрлась в лимит длины).
    pub finished: bool,
}

impl Hypothesis {
    pub fn new(tokens: Vec<u32>, score: f32, finished: bool) -> Self {
        Self {
            tokens,
            score,
            finished,
        }
    }

    /// Нормированная оценка `score / len^length_penalty`.
    ///
    /// Длина учитывает `<eos>` у завершённых гипотез; пустая незавершённая
    /// гипотеза не нормируется.
    pub fn normalized_score(&self, length_penalty: f32) -> f32 {
        let len = self.tokens.len() + usize::from(self.finished);
        if len == 0 {
            return self.score;
        }
        self.score / (len as f32).powf(length_penalty)
    }
}

// ---------------------------------------------------------------------------
// Результат декодирования
// ---------------------------------------------------------------------------

/// Результат распознавания / перевода: унифицирован для ASR и NMT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeOutput {
    /// Итоговый текст.
    pub text: String,

    /// Id токенов лучшей гипотезы.
    pub tokens: Vec<u32>,

    /// Суммарный log-prob лучшей гипотезы.
    pub score: f32,

    /// Название модели.
    pub model_name: String,

    /// Время инференса в секундах.
    pub inference_time_secs: f64,

    /// Длительность входа в секундах (0 для текста).
    pub input_duration_secs: f64,

    /// Real-Time Factor (inference_time / input_duration), 0 для текста.
    pub rtf: f64,
}

impl DecodeOutput {
    pub fn new(
        text: String,
        hypothesis: &Hypothesis,
        model_name: impl Into<String>,
        inference_time_secs: f64,
        input_duration_secs: f64,
    ) -> Self {
        let rtf = if input_duration_secs > 0.0 {
            inference_time_secs / input_duration_secs
        } else {
            0.0
        };
        Self {
            text,
            tokens: hypothesis.tokens.clone(),
            score: hypothesis.score,
            model_name: model_name.into(),
            inference_time_secs,
            input_duration_secs,
            rtf,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_duration() {
        let buf = AudioBuffer::new(vec![0.0; 32000], 16000, 2);
        assert!((buf.duration() - 1.0).abs() < 1e-6);
        assert_eq!(buf.num_samples(), 16000);
    }

    #[test]
    fn test_normalized_score() {
        let h = Hypothesis::new(vec![5, 6, 7], -4.0, true);
        assert!((h.normalized_score(1.0) + 1.0).abs() < 1e-6);
        assert!((h.normalized_score(0.0) + 4.0).abs() < 1e-6);

        let empty = Hypothesis::new(vec![], -2.0, false);
        assert_eq!(empty.normalized_score(1.0), -2.0);
    }

    #[test]
    fn test_rtf() {
        let h = Hypothesis::new(vec![1], -0.5, true);
        let out = DecodeOutput::new("a".into(), &h, "m", 0.5, 2.0);
        assert!((out.rtf - 0.25).abs() < 1e-9);
        let text = DecodeOutput::new("a".into(), &h, "m", 0.5, 0.0);
        assert_eq!(text.rtf, 0.0);
    }
}
