//! Метрики качества: расстояние Левенштейна, CER, WER, перплексия.

/// Минимальное число вставок, удалений и замен, переводящее `a` в `b`.
pub fn edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn error_rate(errors: usize, reference_len: usize) -> f64 {
    match (errors, reference_len) {
        (0, _) => 0.0,
        (e, 0) => e as f64,
        (e, n) => e as f64 / n as f64,
    }
}

/// Character error rate одной пары.
///
/// Для пустого эталона возвращается число лишних символов гипотезы.
pub fn cer(reference: &str, hypothesis: &str) -> f64 {
    let r: Vec<char> = reference.chars().collect();
    let h: Vec<char> = hypothesis.chars().collect();
    error_rate(edit_distance(&r, &h), r.len())
}

/// Word error rate одной пары (слова разделены пробельными символами).
pub fn wer(reference: &str, hypothesis: &str) -> f64 {
    let r: Vec<&str> = reference.split_whitespace().collect();
    let h: Vec<&str> = hypothesis.split_whitespace().collect();
    error_rate(edit_distance(&r, &h), r.len())
}

/// `exp(mean NLL)`.
pub fn perplexity(mean_nll: f64) -> f64 {
    mean_nll.exp()
}

/// Накопитель корпусных CER/WER: ошибки и длины эталонов суммируются
/// по всем парам.
#[derive(Debug, Clone, Default)]
pub struct ErrorCounter {
    char_errors: usize,
    chars: usize,
    word_errors: usize,
    words: usize,
}

impl ErrorCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, reference: &str, hypothesis: &str) {
        let rc: Vec<char> = reference.chars().collect();
        let hc: Vec<char> = hypothesis.chars().collect();
        self.char_errors += edit_distance(&rc, &hc);
        self.chars += rc.len();

        let rw: Vec<&str> = reference.split_whitespace().collect();
        let hw: Vec<&str> = hypothesis.split_whitespace().collect();
        self.word_errors += edit_distance(&rw, &hw);
        self.words += rw.len();
    }

    pub fn cer(&self) -> f64 {
        error_rate(self.char_errors, self.chars)
    }

    pub fn wer(&self) -> f64 {
        error_rate(self.word_errors, self.words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance(b"kitten", b"sitting"), 3);
        assert_eq!(edit_distance::<u8>(b"", b"abc"), 3);
        assert_eq!(edit_distance(&[1, 2, 3], &[1, 2, 3]), 0);
    }

    #[test]
    fn test_cer_wer() {
        assert_eq!(cer("привет", "привет"), 0.0);
        assert!((cer("abcd", "abed") - 0.25).abs() < 1e-9);
        assert!((wer("the cat sat", "the bat sat") - 1.0 / 3.0).abs() < 1e-9);
        assert!((wer("a b", "a b c d") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_reference() {
        assert_eq!(cer("", ""), 0.0);
        assert_eq!(wer("", ""), 0.0);
        assert_eq!(wer("", "extra words"), 2.0);
    }

    #[test]
    fn test_corpus_counter() {
        let mut counter = ErrorCounter::new();
        counter.add("ab", "ab");
        counter.add("cd", "ce");
        assert!((counter.cer() - 0.25).abs() < 1e-9);
        assert!((counter.wer() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_perplexity() {
        assert!((perplexity((10f64).ln()) - 10.0).abs() < 1e-9);
    }
}
