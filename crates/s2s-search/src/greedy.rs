//! Жадное декодирование.

use s2s_core::{Hypothesis, S2sResult, StepDecoder};

use crate::{argmax, rows};

/// Argmax на каждом шаге для всех строк состояния.
///
/// Строки останавливаются независимо на `<eos>`; сам `<eos>` в токены не
/// попадает, но его log-prob входит в оценку. Строка, упёршаяся в
/// `max_length`, возвращается с `finished = false`.
pub fn greedy_decode<D: StepDecoder>(
    decoder: &D,
    mut state: D::State,
    max_length: usize,
) -> S2sResult<Vec<Hypothesis>> {
    let batch = decoder.batch_size(&state);
    let eos = decoder.eos_id();
    let mut hyps: Vec<Hypothesis> = (0..batch)
        .map(|_| Hypothesis::new(Vec::new(), 0.0, false))
        .collect();
    let mut inputs = vec![decoder.sos_id(); batch];

    for _ in 0..max_length {
        if hyps.iter().all(|h| h.finished) {
            break;
        }
        let (log_probs, next) = decoder.step(&inputs, &state)?;
        state = next;

        for (i, row) in rows(&log_probs)?.iter().enumerate() {
            let hyp = &mut hyps[i];
            if hyp.finished {
                continue;
            }
            let token = argmax(row) as u32;
            hyp.score += row[token as usize];
            if token == eos {
                hyp.finished = true;
            } else {
                hyp.tokens.push(token);
            }
            inputs[i] = token;
        }
    }

    Ok(hyps)
}
