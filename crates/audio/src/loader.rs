//! Чтение WAV.

use std::io::Read;
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec};
use s2s_core::{AudioBuffer, S2sError, S2sResult};

/// Прочитать WAV-файл в [`AudioBuffer`] (сэмплы в [-1, 1], каналы
/// чередуются как в файле).
pub fn load_wav(path: impl AsRef<Path>) -> S2sResult<AudioBuffer> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .map_err(|e| S2sError::Audio(format!("Не удалось открыть {}: {e}", path.display())))?;
    read_samples(reader).map_err(|e| match e {
        S2sError::Audio(msg) => S2sError::Audio(format!("{}: {msg}", path.display())),
        other => other,
    })
}

fn read_samples<R: Read>(reader: WavReader<R>) -> S2sResult<AudioBuffer> {
    let spec = reader.spec();
    check_spec(&spec)?;

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<f32>, _>>()
            .map_err(|e| S2sError::Audio(format!("ошибка чтения сэмплов: {e}")))?,
        SampleFormat::Int => {
            let scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<f32>, _>>()
                .map_err(|e| S2sError::Audio(format!("ошибка чтения сэмплов: {e}")))?
        }
    };

    Ok(AudioBuffer::new(
        samples,
        spec.sample_rate as usize,
        spec.channels as usize,
    ))
}

fn check_spec(spec: &WavSpec) -> S2sResult<()> {
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(S2sError::Audio(format!(
            "некорректный заголовок: {} каналов, {} Гц",
            spec.channels, spec.sample_rate
        )));
    }
    if spec.sample_format == SampleFormat::Int && !(1..=32).contains(&spec.bits_per_sample) {
        return Err(S2sError::Audio(format!(
            "неподдерживаемая разрядность: {} бит",
            spec.bits_per_sample
        )));
    }
    Ok(())
}

/// Свести многоканальный буфер к моно усреднением каналов.
pub fn to_mono(buffer: &AudioBuffer) -> AudioBuffer {
    let channels = buffer.channels;
    if channels <= 1 {
        return buffer.clone();
    }
    let scale = 1.0 / channels as f32;
    let samples = buffer
        .samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect();
    AudioBuffer::new(samples, buffer.sample_rate, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, channels: u16, samples: &[i16]) {
        let spec = WavSpec {
            channels,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_to_mono_averages_frames() {
        let stereo = AudioBuffer::new(vec![1.0, 0.0, 0.5, 0.5, -1.0, 1.0], 16000, 2);
        let mono = to_mono(&stereo);
        assert_eq!(mono.channels, 1);
        assert_eq!(mono.samples, vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_load_int16_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 1, &[0, 16384, -16384, i16::MAX]);

        let buf = load_wav(&path).unwrap();
        assert_eq!(buf.sample_rate, 8000);
        assert_eq!(buf.channels, 1);
        assert_eq!(buf.samples.len(), 4);
        assert!((buf.samples[1] - 0.5).abs() < 1e-4);
        assert!((buf.samples[2] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_load_stereo_then_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 2, &[16384, 0, 0, -16384]);

        let buf = load_wav(&path).unwrap();
        assert_eq!(buf.channels, 2);
        let mono = to_mono(&buf);
        assert_eq!(mono.samples.len(), 2);
        assert!((mono.samples[0] - 0.25).abs() < 1e-4);
        assert!((mono.samples[1] + 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_missing_file_is_audio_error() {
        let err = load_wav("/nonexistent/clip.wav").unwrap_err();
        assert!(matches!(err, S2sError::Audio(_)));
    }
}
