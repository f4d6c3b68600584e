//! Обучение крошечной модели на игрушечном корпусе.

use candle_core::Device;

use s2s_core::{
    AttentionConfig, AttentionKind, CheckpointFiles, DecoderConfig, EncoderConfig, EncoderInput,
    Granularity, ModelConfig, RnnType, TrainConfig, Vocabulary,
};
use s2s_model::Seq2Seq;
use s2s_train::{encode_parallel, Checkpointer, Example, Trainer, TrainerState};

const CORPUS: &[(&str, &str)] = &[
    ("a b", "x y"),
    ("b a", "y x"),
    ("a a b", "x x y"),
    ("b b", "y y"),
];

fn corpus() -> (Vocabulary, Vocabulary, Vec<Example>) {
    let pairs: Vec<(String, String)> = CORPUS
        .iter()
        .map(|(s, t)| (s.to_string(), t.to_string()))
        .collect();
    let src = Vocabulary::build(pairs.iter().map(|p| &p.0), Granularity::Word, 1, None);
    let tgt = Vocabulary::build(pairs.iter().map(|p| &p.1), Granularity::Word, 1, None);
    let examples = encode_parallel(&pairs, &src, &tgt).unwrap();
    (src, tgt, examples)
}

fn tiny_config(src: &Vocabulary, tgt: &Vocabulary) -> ModelConfig {
    ModelConfig {
        name: "copy-tiny".into(),
        encoder: EncoderConfig {
            input: EncoderInput::Tokens {
                vocab_size: src.len(),
            },
            hidden_size: 8,
            n_layers: 1,
            bidirectional: true,
            rnn_type: RnnType::Gru,
            dropout_p: 0.0,
        },
        attention: AttentionConfig {
            kind: AttentionKind::General,
            ..AttentionConfig::default()
        },
        decoder: DecoderConfig {
            vocab_size: tgt.len(),
            embed_dim: 8,
            hidden_size: 16,
            n_layers: 1,
            rnn_type: RnnType::Gru,
            dropout_p: 0.0,
            max_length: 6,
        },
    }
}

fn train_config(epochs: usize) -> TrainConfig {
    TrainConfig {
        epochs,
        batch_size: 2,
        learning_rate: 1e-2,
        weight_decay: 0.0,
        grad_clip: Some(1.0),
        teacher_forcing_ratio: 1.0,
        label_smoothing: 0.0,
        lr_decay: 0.5,
        lr_patience: 3,
        seed: 7,
        sort_by_length: false,
        log_every: 0,
    }
}

#[test]
fn test_training_reduces_loss() {
    let (src, tgt, examples) = corpus();
    let config = tiny_config(&src, &tgt);
    let (varmap, model) = Seq2Seq::trainable(&config, None, &Device::Cpu).unwrap();

    let mut trainer = Trainer::new(&model, &varmap, train_config(40)).unwrap();
    let report = trainer.fit(&examples, &examples, &tgt, None).unwrap();

    assert_eq!(report.history.len(), 40);
    assert_eq!(report.global_step, 80);
    let first = report.history[0].train_loss;
    let last = report.history[39].train_loss;
    assert!(last < first * 0.5, "потеря не снизилась: {first} → {last}");

    let best = report.best_loss.unwrap();
    let valid = report.history[0].valid_loss.unwrap();
    assert!(best <= valid);
    assert!(report.history.iter().all(|m| m.valid_cer.is_some()));
}

#[test]
fn test_checkpoint_reloads_for_inference() {
    let (src, tgt, examples) = corpus();
    let config = tiny_config(&src, &tgt);
    let dir = tempfile::tempdir().unwrap();
    let ckpt = Checkpointer::create(dir.path(), &config, &tgt, Some(&src), None).unwrap();

    let (varmap, model) = Seq2Seq::trainable(&config, None, &Device::Cpu).unwrap();
    let mut trainer = Trainer::new(&model, &varmap, train_config(3)).unwrap();
    let report = trainer.fit(&examples, &[], &tgt, Some(&ckpt)).unwrap();
    assert!(report.history.iter().all(|m| m.valid_loss.is_none()));

    let files = CheckpointFiles::resolve(dir.path()).unwrap();
    let loaded_config = ModelConfig::from_file(&files.config).unwrap();
    assert_eq!(loaded_config, config);
    Seq2Seq::from_safetensors(&loaded_config, &files.weights, &Device::Cpu).unwrap();

    let state = TrainerState::load(ckpt.state_path()).unwrap();
    assert_eq!(state.epoch, 3);
    assert_eq!(state.history.len(), 3);
    assert_eq!(state.best_epoch, report.best_epoch);
}

#[test]
fn test_resume_continues_from_saved_epoch() {
    let (src, tgt, examples) = corpus();
    let config = tiny_config(&src, &tgt);
    let dir = tempfile::tempdir().unwrap();
    let ckpt = Checkpointer::create(dir.path(), &config, &tgt, Some(&src), None).unwrap();

    {
        let (varmap, model) = Seq2Seq::trainable(&config, None, &Device::Cpu).unwrap();
        let mut trainer = Trainer::new(&model, &varmap, train_config(2)).unwrap();
        trainer.fit(&examples, &[], &tgt, Some(&ckpt)).unwrap();
    }

    let state = TrainerState::load(ckpt.state_path()).unwrap();
    let (varmap, model) =
        Seq2Seq::trainable(&config, Some(ckpt.weights_path()), &Device::Cpu).unwrap();
    let mut trainer = Trainer::new(&model, &varmap, train_config(4))
        .unwrap()
        .resume(state);
    let report = trainer.fit(&examples, &[], &tgt, Some(&ckpt)).unwrap();

    assert_eq!(report.history.len(), 4);
    assert_eq!(report.history[2].epoch, 3);
    assert_eq!(report.global_step, 8);
}

#[test]
fn test_empty_corpus_rejected() {
    let (src, tgt, _) = corpus();
    let config = tiny_config(&src, &tgt);
    let (varmap, model) = Seq2Seq::trainable(&config, None, &Device::Cpu).unwrap();
    let mut trainer = Trainer::new(&model, &varmap, train_config(1)).unwrap();
    assert!(trainer.fit(&[], &[], &tgt, None).is_err());
}
