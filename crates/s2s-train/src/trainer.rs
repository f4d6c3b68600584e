//! Цикл обучения.
//!
//! Одна эпоха:
//! 1. план батчей от [`Batcher`]
//! 2. для каждого батча: прямой проход с teacher forcing → маскированная NLL →
//!    `backward()` → клиппинг глобальной нормы → шаг AdamW
//! 3. валидация: NLL при полном teacher forcing + жадное декодирование для CER/WER
//! 4. снижение learning rate, если валидационная потеря не улучшилась
//!    `lr_patience` эпох подряд; сохранение лучшего чекпоинта

use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use s2s_core::{S2sError, S2sResult, TrainConfig, Vocabulary};
use s2s_model::Seq2Seq;
use s2s_search::greedy_decode;

use crate::batch::{collate, Batch, Batcher};
use crate::checkpoint::{Checkpointer, EpochMetrics, TrainerState};
use crate::data::Example;
use crate::loss::masked_nll;
use crate::metrics::{perplexity, ErrorCounter};

/// Итоги валидации.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalMetrics {
    pub loss: f64,
    pub perplexity: f64,
    pub cer: f64,
    pub wer: f64,
}

/// История обучения.
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub history: Vec<EpochMetrics>,
    pub best_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub global_step: usize,
}

pub struct Trainer<'a> {
    model: &'a Seq2Seq,
    varmap: &'a VarMap,
    optimizer: AdamW,
    config: TrainConfig,
    batcher: Batcher,
    rng: StdRng,
    state: TrainerState,
    device: Device,
}

impl<'a> Trainer<'a> {
    pub fn new(model: &'a Seq2Seq, varmap: &'a VarMap, config: TrainConfig) -> S2sResult<Self> {
        config.validate()?;
        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        let state = TrainerState {
            learning_rate: config.learning_rate,
            ..TrainerState::default()
        };

        Ok(Self {
            model,
            varmap,
            optimizer,
            batcher: Batcher::new(config.batch_size, config.sort_by_length, config.seed),
            rng: StdRng::seed_from_u64(config.seed),
            device: model.device().clone(),
            config,
            state,
        })
    }

    /// Продолжить с сохранённого состояния (learning rate, счётчики, история).
    pub fn resume(mut self, state: TrainerState) -> Self {
        self.optimizer.set_learning_rate(state.learning_rate);
        // разные эпохи продолжения получают разный порядок батчей
        let seed = self.config.seed.wrapping_add(state.epoch as u64);
        self.batcher = Batcher::new(self.config.batch_size, self.config.sort_by_length, seed);
        self.rng = StdRng::seed_from_u64(seed);
        self.state = state;
        self
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Один шаг оптимизации; возвращает потерю батча.
    pub fn train_step(&mut self, batch: &Batch) -> S2sResult<f64> {
        let log_probs = self.model.forward(
            &batch.source,
            &batch.source_lengths,
            &batch.target_in,
            self.config.teacher_forcing_ratio,
            &mut self.rng,
            true,
        )?;
        let out = masked_nll(
            &log_probs,
            &batch.target_out,
            &batch.target_mask,
            self.config.label_smoothing,
        )?;
        let loss = f64::from(out.loss.to_scalar::<f32>()?);
        if !loss.is_finite() {
            return Err(S2sError::Inference(format!(
                "нечисловая потеря на шаге {}: {loss}",
                self.state.global_step
            )));
        }

        let mut grads = out.loss.backward()?;
        if let Some(max_norm) = self.config.grad_clip {
            let norm = clip_grad_norm(self.varmap, &mut grads, max_norm)?;
            if s2s_core::debug::enabled() {
                eprintln!("DEBUG step {}: grad norm = {norm:.4}", self.state.global_step);
            }
        }
        self.optimizer.step(&grads)?;
        self.state.global_step += 1;
        Ok(loss)
    }

    /// Одна эпоха; возвращает среднюю потерю на батч.
    pub fn train_epoch(&mut self, examples: &[Example]) -> S2sResult<f64> {
        let plan = self.batcher.plan(examples);
        let mut total = 0.0;
        for (i, indices) in plan.iter().enumerate() {
            let refs: Vec<&Example> = indices.iter().map(|&i| &examples[i]).collect();
            let batch = collate(&refs, &self.device)?;
            let loss = self.train_step(&batch)?;
            total += loss;

            if self.config.log_every > 0 && (i + 1) % self.config.log_every == 0 {
                info!(
                    epoch = self.state.epoch + 1,
                    step = self.state.global_step,
                    loss,
                    "batch {}/{}",
                    i + 1,
                    plan.len()
                );
            }
        }
        Ok(total / plan.len().max(1) as f64)
    }

    /// Валидационная NLL и жадные CER/WER.
    pub fn evaluate(&self, examples: &[Example], tgt_vocab: &Vocabulary) -> S2sResult<EvalMetrics> {
        let max_length = self.model.config().decoder.max_length;
        let mut nll_sum = 0.0;
        let mut tokens = 0usize;
        let mut errors = ErrorCounter::new();
        let mut no_tf = StdRng::seed_from_u64(0);

        for indices in self.batcher.sequential(examples) {
            let refs: Vec<&Example> = indices.iter().map(|&i| &examples[i]).collect();
            let batch = collate(&refs, &self.device)?;

            let log_probs = self.model.forward(
                &batch.source,
                &batch.source_lengths,
                &batch.target_in,
                1.0,
                &mut no_tf,
                false,
            )?;
            let out = masked_nll(&log_probs, &batch.target_out, &batch.target_mask, 0.0)?;
            nll_sum += out.nll * out.tokens as f64;
            tokens += out.tokens;

            let (stepper, state) = self.model.stepper(&batch.source, &batch.source_lengths)?;
            let hyps = greedy_decode(&stepper, state, max_length)?;
            for (hyp, target) in hyps.iter().zip(&batch.targets) {
                errors.add(&tgt_vocab.decode(target), &tgt_vocab.decode(&hyp.tokens));
            }
        }

        let loss = nll_sum / tokens.max(1) as f64;
        Ok(EvalMetrics {
            loss,
            perplexity: perplexity(loss),
            cer: errors.cer(),
            wer: errors.wer(),
        })
    }

    /// Полный цикл обучения.
    ///
    /// Если `valid` пуст, критерием улучшения служит потеря на обучении, а
    /// CER/WER не считаются.
    pub fn fit(
        &mut self,
        train: &[Example],
        valid: &[Example],
        tgt_vocab: &Vocabulary,
        checkpoint: Option<&Checkpointer>,
    ) -> S2sResult<TrainReport> {
        if train.is_empty() {
            return Err(S2sError::Data("пустой обучающий корпус".into()));
        }
        info!(
            train = train.len(),
            valid = valid.len(),
            epochs = self.config.epochs,
            "Начало обучения"
        );

        for epoch in self.state.epoch..self.config.epochs {
            let start = Instant::now();
            let train_loss = self.train_epoch(train)?;

            let eval = if valid.is_empty() {
                None
            } else {
                Some(self.evaluate(valid, tgt_vocab)?)
            };
            let criterion = eval.as_ref().map_or(train_loss, |m| m.loss);

            let metrics = EpochMetrics {
                epoch: epoch + 1,
                train_loss,
                valid_loss: eval.as_ref().map(|m| m.loss),
                valid_perplexity: eval.as_ref().map(|m| m.perplexity),
                valid_cer: eval.as_ref().map(|m| m.cer),
                valid_wer: eval.as_ref().map(|m| m.wer),
                learning_rate: self.learning_rate(),
            };
            info!(
                epoch = epoch + 1,
                train_loss,
                valid_loss = ?metrics.valid_loss,
                cer = ?metrics.valid_cer,
                wer = ?metrics.valid_wer,
                lr = metrics.learning_rate,
                "Эпоха за {:.1}с",
                start.elapsed().as_secs_f64()
            );

            self.state.epoch = epoch + 1;
            self.state.history.push(metrics);

            let improved = self.state.best_loss.map_or(true, |best| criterion < best);
            if improved {
                self.state.best_loss = Some(criterion);
                self.state.best_epoch = Some(epoch + 1);
                self.state.epochs_without_improvement = 0;
                if let Some(ckpt) = checkpoint {
                    ckpt.save_weights(self.varmap)?;
                    debug!("Лучшая модель сохранена: {}", ckpt.weights_path().display());
                }
            } else {
                self.state.epochs_without_improvement += 1;
                if self.state.epochs_without_improvement >= self.config.lr_patience.max(1) {
                    let lr = self.learning_rate() * self.config.lr_decay;
                    self.optimizer.set_learning_rate(lr);
                    self.state.epochs_without_improvement = 0;
                    warn!(lr, "Нет улучшения, learning rate снижен");
                }
            }
            self.state.learning_rate = self.learning_rate();

            if let Some(ckpt) = checkpoint {
                ckpt.save_state(&self.state)?;
            }
        }

        Ok(TrainReport {
            history: self.state.history.clone(),
            best_loss: self.state.best_loss,
            best_epoch: self.state.best_epoch,
            global_step: self.state.global_step,
        })
    }
}

/// Масштабировать градиенты так, чтобы их глобальная L2-норма не
/// превышала `max_norm`. Возвращает норму до клиппинга; нечисловая норма
/// (NaN, inf) даёт ошибку `Inference`.
pub fn clip_grad_norm(varmap: &VarMap, grads: &mut GradStore, max_norm: f64) -> S2sResult<f64> {
    let vars = varmap.all_vars();
    let mut sq_sum = 0f64;
    for var in &vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sq_sum += f64::from(g.sqr()?.sum_all()?.to_scalar::<f32>()?);
        }
    }
    let norm = sq_sum.sqrt();
    if !norm.is_finite() {
        return Err(S2sError::Inference(format!(
            "нечисловая норма градиента: {norm}"
        )));
    }
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in &vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let scaled: Tensor = (g * scale)?;
                grads.insert(var.as_tensor(), scaled);
            }
        }
    }
    Ok(norm)
}
