//! Рекуррентная seq2seq-модель с вниманием на candle.
//!
//! - [`rnn`]: ячейки LSTM/GRU/RNN и многослойный стек с маскированием
//! - [`encoder`]: listener для токенов или акустических признаков
//! - [`attention`]: dot, scaled, general, additive, location-aware
//! - [`decoder`]: speller с вниманием и teacher forcing
//! - [`seq2seq`]: модель целиком и адаптер [`s2s_core::StepDecoder`]

pub mod attention;
pub mod decoder;
pub mod encoder;
pub mod rnn;
pub mod seq2seq;

pub use attention::{Attention, AttentionMemory};
pub use decoder::{Decoder, DecoderState};
pub use encoder::{Encoder, EncoderOutput};
pub use rnn::{RnnState, StackedRnn};
pub use seq2seq::{parameter_count, Seq2Seq, Seq2SeqStepper, StepState};
