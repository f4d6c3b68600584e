//! Шов между моделью и алгоритмами поиска.
//!
//! Алгоритмы из `s2s-search` ничего не знают о внутреннем устройстве модели:
//! им нужен только пошаговый декодер с переупорядочиваемым состоянием.

use candle_core::Tensor;

use crate::error::S2sResult;

/// Пошаговый (инкрементальный) декодер.
///
/// Состояние описывает `n` независимых строк (гипотез); строка `i` тензора
/// log-вероятностей соответствует строке `i` состояния и `tokens[i]`.
///
/// # Пример
/// ```ignore
/// let (log_probs, state) = decoder.step(&[decoder.sos_id(); n], &state)?;
/// let state = decoder.reorder(&state, &[0, 0, 1])?;
/// ```
pub trait StepDecoder {
    /// Состояние декодера для пачки строк.
    type State: Clone;

    /// Id токена начала последовательности.
    fn sos_id(&self) -> u32;

    /// Id токена конца последовательности.
    fn eos_id(&self) -> u32;

    /// Размер выходного словаря.
    fn vocab_size(&self) -> usize;

    /// Количество строк в состоянии.
    fn batch_size(&self, state: &Self::State) -> usize;

    /// Один шаг: предыдущие токены → log-вероятности `[n, vocab]` и новое состояние.
    fn step(&self, tokens: &[u32], state: &Self::State) -> S2sResult<(Tensor, Self::State)>;

    /// Выбрать (с повторами) строки состояния по индексам.
    fn reorder(&self, state: &Self::State, indices: &[usize]) -> S2sResult<Self::State>;
}
