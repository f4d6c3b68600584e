//! Словарь токенов.
//!
//! Id служебных токенов фиксированы: `<pad>`=0, `<sos>`=1, `<eos>`=2, `<unk>`=3.
//! На диске словарь хранится как JSON со списком токенов, где id = позиция.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{S2sError, S2sResult};

pub const PAD_TOKEN: &str = "<pad>";
pub const SOS_TOKEN: &str = "<sos>";
pub const EOS_TOKEN: &str = "<eos>";
pub const UNK_TOKEN: &str = "<unk>";

pub const PAD_ID: u32 = 0;
pub const SOS_ID: u32 = 1;
pub const EOS_ID: u32 = 2;
pub const UNK_ID: u32 = 3;

const RESERVED: [&str; 4] = [PAD_TOKEN, SOS_TOKEN, EOS_TOKEN, UNK_TOKEN];

/// Единица токенизации.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Символы (включая пробел): для ASR и языков без сегментации.
    Char,
    /// Слова, разделённые пробельными символами: для NMT.
    Word,
}

impl std::str::FromStr for Granularity {
    type Err = S2sError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "char" | "character" => Ok(Granularity::Char),
            "word" => Ok(Granularity::Word),
            other => Err(S2sError::Config(format!("Unknown granularity: {other}"))),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct VocabFile {
    granularity: Granularity,
    tokens: Vec<String>,
}

/// Двунаправленное отображение токен ↔ id.
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    granularity: Granularity,
    id_to_token: Vec<String>,
    token_to_id: HashMap<String, u32>,
}

impl Vocabulary {
    /// Построить словарь по корпусу.
    ///
    /// Токены сортируются по убыванию частоты, при равной частоте:
    /// лексикографически. `max_size` ограничивает число обычных токенов
    /// (служебные не учитываются).
    pub fn build<I, S>(
        lines: I,
        granularity: Granularity,
        min_freq: usize,
        max_size: Option<usize>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for line in lines {
            for tok in tokenize(line.as_ref(), granularity) {
                *counts.entry(tok.to_string()).or_insert(0) += 1;
            }
        }

        let mut entries: Vec<(String, usize)> = counts
            .into_iter()
            .filter(|(tok, n)| *n >= min_freq.max(1) && !RESERVED.contains(&tok.as_str()))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        if let Some(limit) = max_size {
            entries.truncate(limit);
        }

        let tokens = RESERVED
            .iter()
            .map(|s| s.to_string())
            .chain(entries.into_iter().map(|(tok, _)| tok))
            .collect();

        Self::from_tokens(granularity, tokens)
    }

    fn from_tokens(granularity: Granularity, id_to_token: Vec<String>) -> Self {
        let mut token_to_id = HashMap::with_capacity(id_to_token.len());
        for (id, tok) in id_to_token.iter().enumerate() {
            token_to_id.entry(tok.clone()).or_insert(id as u32);
        }
        Self {
            granularity,
            id_to_token,
            token_to_id,
        }
    }

    /// Загрузить словарь из JSON.
    pub fn load(path: impl AsRef<Path>) -> S2sResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            S2sError::Vocab(format!("Не удалось прочитать словарь {}: {e}", path.display()))
        })?;
        let file: VocabFile = serde_json::from_str(&data)?;

        for (id, expected) in RESERVED.iter().enumerate() {
            match file.tokens.get(id) {
                Some(tok) if tok == expected => {}
                other => {
                    return Err(S2sError::Vocab(format!(
                        "{}: ожидался служебный токен {expected} с id={id}, найден {:?}",
                        path.display(),
                        other
                    )));
                }
            }
        }

        Ok(Self::from_tokens(file.granularity, file.tokens))
    }

    /// Сохранить словарь в JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> S2sResult<()> {
        let file = VocabFile {
            granularity: self.granularity,
            tokens: self.id_to_token.clone(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Преобразовать текст в id (без `<sos>`/`<eos>`).
    pub fn encode(&self, text: &str) -> Vec<u32> {
        tokenize(text, self.granularity)
            .map(|tok| self.token_id(tok).unwrap_or(UNK_ID))
            .collect()
    }

    /// Преобразовать id в текст.
    ///
    /// Останавливается на первом `<eos>`, пропускает `<pad>` и `<sos>`.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut pieces: Vec<&str> = Vec::with_capacity(ids.len());
        for &id in ids {
            match id {
                EOS_ID => break,
                PAD_ID | SOS_ID => continue,
                _ => {
                    if let Some(tok) = self.id_to_token.get(id as usize) {
                        pieces.push(tok);
                    } else {
                        pieces.push(UNK_TOKEN);
                    }
                }
            }
        }
        match self.granularity {
            Granularity::Char => pieces.concat(),
            Granularity::Word => pieces.join(" "),
        }
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(id as usize).map(String::as_str)
    }

    /// Размер словаря, включая служебные токены.
    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    /// Словарь всегда содержит служебные токены.
    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }
}

fn tokenize(text: &str, granularity: Granularity) -> Box<dyn Iterator<Item = &str> + '_> {
    match granularity {
        Granularity::Word => Box::new(text.split_whitespace()),
        Granularity::Char => {
            let trimmed = text.trim();
            Box::new(
                trimmed
                    .char_indices()
                    .map(move |(i, c)| &trimmed[i..i + c.len_utf8()]),
            )
        }
    }
}
