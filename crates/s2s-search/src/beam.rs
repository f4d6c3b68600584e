//! Beam search для одного входа.
//!
//! Живые лучи идут пачкой через [`StepDecoder`]; после каждого шага состояние
//! переупорядочивается по индексам родительских лучей. Завершённые гипотезы
//! копятся в ограниченном наборе, ранжированном по `score / len^α`.

use s2s_core::{Hypothesis, S2sError, S2sResult, StepDecoder};
use tracing::debug;

use crate::rows;

/// Ограниченный набор завершённых гипотез, лучшая первой.
struct FinishedHypotheses {
    hypotheses: Vec<Hypothesis>,
    capacity: usize,
    length_penalty: f32,
    worst_score: f32,
}

impl FinishedHypotheses {
    fn new(capacity: usize, length_penalty: f32) -> Self {
        Self {
            hypotheses: Vec::with_capacity(capacity),
            capacity,
            length_penalty,
            worst_score: f32::NEG_INFINITY,
        }
    }

    fn add(&mut self, hypothesis: Hypothesis) {
        if hypothesis.score == f32::NEG_INFINITY {
            return;
        }
        let score = hypothesis.normalized_score(self.length_penalty);
        if self.hypotheses.len() < self.capacity || score > self.worst_score {
            self.hypotheses.push(hypothesis);
            let lp = self.length_penalty;
            self.hypotheses.sort_by(|a, b| {
                b.normalized_score(lp)
                    .total_cmp(&a.normalized_score(lp))
            });
            self.hypotheses.truncate(self.capacity);
            self.worst_score = self
                .hypotheses
                .last()
                .map(|h| h.normalized_score(lp))
                .unwrap_or(f32::NEG_INFINITY);
        }
    }

    fn len(&self) -> usize {
        self.hypotheses.len()
    }

    fn is_empty(&self) -> bool {
        self.hypotheses.is_empty()
    }

    /// Поиск можно остановить: набор полон и ни один живой луч из `cur_len`
    /// токенов уже не обгонит худшую завершённую гипотезу. Завершённый луч
    /// будет длиннее хотя бы на `<eos>`, поэтому граница считается для
    /// длины `cur_len + 1`.
    fn is_done(&self, early_stopping: bool, best_live_score: f32, cur_len: usize) -> bool {
        if self.len() < self.capacity {
            return false;
        }
        if early_stopping {
            return true;
        }
        let finished_len = (cur_len + 1) as f32;
        let best_attainable = best_live_score / finished_len.powf(self.length_penalty);
        self.worst_score >= best_attainable
    }

    fn into_sorted(self) -> Vec<Hypothesis> {
        self.hypotheses
    }
}

/// Кандидат продолжения: (оценка, родительский луч, токен).
type Candidate = (f32, usize, u32);

/// Лучшие `2k` продолжений по всем живым лучам.
///
/// С каждого луча берётся не больше `2k` токенов, чтобы после отсева `<eos>`
/// гарантированно осталось `k` живых кандидатов.
fn top_candidates(log_probs: &[Vec<f32>], beams: &[Hypothesis], k: usize) -> Vec<Candidate> {
    let per_beam = 2 * k;
    let mut candidates: Vec<Candidate> = Vec::with_capacity(beams.len() * per_beam);

    for (beam_idx, (beam, row)) in beams.iter().zip(log_probs).enumerate() {
        if beam.score == f32::NEG_INFINITY {
            continue;
        }
        let mut order: Vec<usize> = (0..row.len()).collect();
        // стабильная сортировка: при равенстве выигрывает меньший id
        order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
        for &tok in order.iter().take(per_beam) {
            candidates.push((beam.score + row[tok], beam_idx, tok as u32));
        }
    }

    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
    candidates.truncate(per_beam);
    candidates
}

/// Beam search для состояния из одной строки.
///
/// Возвращает до `beam_size` гипотез, лучшая первой. Если ни одна гипотеза
/// не завершилась до `max_length`, возвращаются живые лучи
/// (`finished = false`). При `beam_size = 1` результат совпадает с жадным
/// поиском.
pub fn beam_search<D: StepDecoder>(
    decoder: &D,
    state: D::State,
    beam_size: usize,
    length_penalty: f32,
    early_stopping: bool,
    max_length: usize,
) -> S2sResult<Vec<Hypothesis>> {
    if beam_size == 0 {
        return Err(S2sError::Config("beam_size должен быть > 0".into()));
    }
    let rows_in = decoder.batch_size(&state);
    if rows_in != 1 {
        return Err(S2sError::Inference(format!(
            "beam search ожидает одну строку состояния, получено {rows_in}"
        )));
    }

    let eos = decoder.eos_id();
    let verbose = s2s_core::debug::enabled();
    let mut finished = FinishedHypotheses::new(beam_size, length_penalty);
    let mut beams = vec![Hypothesis::new(Vec::new(), 0.0, false)];
    let mut inputs = vec![decoder.sos_id()];
    let mut state = state;

    for step in 0..max_length {
        let (log_probs, next_state) = decoder.step(&inputs, &state)?;
        let log_probs = rows(&log_probs)?;
        let candidates = top_candidates(&log_probs, &beams, beam_size);

        let mut live = Vec::with_capacity(beam_size);
        let mut parents = Vec::with_capacity(beam_size);
        let mut tokens = Vec::with_capacity(beam_size);

        for (rank, (score, parent, token)) in candidates.into_iter().enumerate() {
            let mut hyp_tokens = beams[parent].tokens.clone();
            if token == eos {
                // <eos> ниже первых k мест не даёт завершённой гипотезы
                if rank < beam_size {
                    finished.add(Hypothesis::new(hyp_tokens, score, true));
                }
                continue;
            }
            hyp_tokens.push(token);
            live.push(Hypothesis::new(hyp_tokens, score, false));
            parents.push(parent);
            tokens.push(token);
            if live.len() == beam_size {
                break;
            }
        }

        if verbose {
            eprintln!(
                "DEBUG beam step {step}: live={}, finished={}, best_live={:?}",
                live.len(),
                finished.len(),
                live.first().map(|h| h.score)
            );
        }

        let best_live = live.first().map(|h| h.score).unwrap_or(f32::NEG_INFINITY);
        if live.is_empty() || finished.is_done(early_stopping, best_live, step + 1) {
            debug!(step, finished = finished.len(), "beam search остановлен");
            beams = live;
            break;
        }

        state = decoder.reorder(&next_state, &parents)?;
        inputs = tokens;
        beams = live;
    }

    if finished.is_empty() {
        beams.sort_by(|a, b| {
            b.normalized_score(length_penalty)
                .total_cmp(&a.normalized_score(length_penalty))
        });
        return Ok(beams);
    }
    Ok(finished.into_sorted())
}
