//! Корпуса для обучения.
//!
//! - NMT: TSV `source<TAB>target`, по паре на строку
//! - ASR: манифест `wav_path<TAB>transcript`; относительные пути
//!   разрешаются от директории манифеста
//!
//! Пустые строки и строки, начинающиеся с `#`, пропускаются.

use std::path::{Path, PathBuf};

use audio::{load_wav, FeatureExtractor};
use s2s_core::{S2sError, S2sResult, Vocabulary};
use tracing::{debug, info};

/// Вход энкодера одного примера.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Id исходных токенов.
    Tokens(Vec<u32>),
    /// Признаки `[num_frames, feature_dim]` в row-major порядке.
    Features {
        frames: Vec<f32>,
        num_frames: usize,
        feature_dim: usize,
    },
}

impl Source {
    /// Длина по оси времени.
    pub fn len(&self) -> usize {
        match self {
            Source::Tokens(ids) => ids.len(),
            Source::Features { num_frames, .. } => *num_frames,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Обучающий пример: вход и целевые id (без `<sos>`/`<eos>`).
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub source: Source,
    pub target: Vec<u32>,
}

impl Example {
    pub fn new(source: Source, target: Vec<u32>) -> S2sResult<Self> {
        if target.is_empty() {
            return Err(S2sError::Data("пустая целевая последовательность".into()));
        }
        if source.is_empty() {
            return Err(S2sError::Data("пустая входная последовательность".into()));
        }
        Ok(Self { source, target })
    }
}

/// Строка манифеста ASR.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub audio: PathBuf,
    pub transcript: String,
}

fn read_tsv(path: &Path) -> S2sResult<Vec<(usize, String, String)>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| S2sError::Data(format!("Не удалось прочитать {}: {e}", path.display())))?;

    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim_end_matches('\r');
        if trimmed.trim().is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (left, right) = trimmed.split_once('\t').ok_or_else(|| {
            S2sError::Data(format!(
                "{}:{line_no}: ожидалось два поля, разделённых табуляцией",
                path.display()
            ))
        })?;
        if left.trim().is_empty() || right.trim().is_empty() {
            return Err(S2sError::Data(format!(
                "{}:{line_no}: пустое поле",
                path.display()
            )));
        }
        rows.push((line_no, left.trim().to_string(), right.trim().to_string()));
    }
    Ok(rows)
}

/// Прочитать параллельный корпус `source<TAB>target`.
pub fn load_parallel_tsv(path: impl AsRef<Path>) -> S2sResult<Vec<(String, String)>> {
    let path = path.as_ref();
    let pairs: Vec<(String, String)> = read_tsv(path)?
        .into_iter()
        .map(|(_, src, tgt)| (src, tgt))
        .collect();
    info!("{}: {} пар", path.display(), pairs.len());
    Ok(pairs)
}

/// Прочитать манифест ASR `wav_path<TAB>transcript`.
pub fn load_manifest_tsv(path: impl AsRef<Path>) -> S2sResult<Vec<ManifestEntry>> {
    let path = path.as_ref();
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let entries: Vec<ManifestEntry> = read_tsv(path)?
        .into_iter()
        .map(|(_, audio, transcript)| {
            let audio = PathBuf::from(audio);
            let audio = if audio.is_relative() {
                base.join(audio)
            } else {
                audio
            };
            ManifestEntry { audio, transcript }
        })
        .collect();
    info!("{}: {} записей", path.display(), entries.len());
    Ok(entries)
}

/// Закодировать параллельный корпус словарями.
pub fn encode_parallel(
    pairs: &[(String, String)],
    src_vocab: &Vocabulary,
    tgt_vocab: &Vocabulary,
) -> S2sResult<Vec<Example>> {
    pairs
        .iter()
        .enumerate()
        .map(|(i, (src, tgt))| {
            Example::new(
                Source::Tokens(src_vocab.encode(src)),
                tgt_vocab.encode(tgt),
            )
            .map_err(|e| S2sError::Data(format!("пара #{}: {e}", i + 1)))
        })
        .collect()
}

/// Загрузить аудио манифеста и извлечь признаки.
pub fn encode_manifest(
    entries: &[ManifestEntry],
    extractor: &FeatureExtractor,
    tgt_vocab: &Vocabulary,
) -> S2sResult<Vec<Example>> {
    let mut examples = Vec::with_capacity(entries.len());
    for entry in entries {
        let buffer = load_wav(&entry.audio)?;
        let features = extractor.extract_buffer(&buffer)?;
        debug!(
            "{}: {} фреймов",
            entry.audio.display(),
            features.num_frames
        );
        let example = Example::new(
            Source::Features {
                frames: features.frames,
                num_frames: features.num_frames,
                feature_dim: features.feature_dim,
            },
            tgt_vocab.encode(&entry.transcript),
        )
        .map_err(|e| S2sError::Data(format!("{}: {e}", entry.audio.display())))?;
        examples.push(example);
    }
    Ok(examples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use s2s_core::Granularity;

    #[test]
    fn test_parallel_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.tsv");
        std::fs::write(&path, "# comment\nhello world\tbonjour monde\n\nbye\tsalut\r\n").unwrap();

        let pairs = load_parallel_tsv(&path).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("hello world".to_string(), "bonjour monde".to_string()),
                ("bye".to_string(), "salut".to_string()),
            ]
        );
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tsv");
        std::fs::write(&path, "a\tb\nno tab here\n").unwrap();
        let err = load_parallel_tsv(&path).unwrap_err();
        assert!(matches!(err, S2sError::Data(_)));
        assert!(err.to_string().contains(":2:"));
    }

    #[test]
    fn test_manifest_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.tsv");
        std::fs::write(&path, "clips/a.wav\tпривет\n/abs/b.wav\tмир\n").unwrap();
        let entries = load_manifest_tsv(&path).unwrap();
        assert_eq!(entries[0].audio, dir.path().join("clips/a.wav"));
        assert_eq!(entries[1].audio, PathBuf::from("/abs/b.wav"));
        assert_eq!(entries[1].transcript, "мир");
    }

    #[test]
    fn test_encode_parallel_rejects_empty_target() {
        let src = Vocabulary::build(["a b"], Granularity::Word, 1, None);
        let tgt = Vocabulary::build(["x y"], Granularity::Word, 1, None);
        let ok = encode_parallel(&[("a b".into(), "x".into())], &src, &tgt).unwrap();
        assert_eq!(ok[0].target, vec![tgt.token_id("x").unwrap()]);

        let err = Example::new(Source::Tokens(vec![4]), vec![]).unwrap_err();
        assert!(matches!(err, S2sError::Data(_)));
    }
}
