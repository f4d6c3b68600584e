//! Загрузка чекпоинтов с диска.

use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use s2s_core::model_files::{
    CONFIG_FILE, FEATURES_FILE, SRC_VOCAB_FILE, TGT_VOCAB_FILE, WEIGHTS_FILE,
};
use s2s_core::{
    AttentionConfig, AttentionKind, DecoderConfig, EncoderConfig, EncoderInput, FeatureConfig,
    Granularity, ModelConfig, RnnType, S2sError, SearchConfig, Vocabulary,
};
use s2s_engine::{Seq2SeqEngine, Task};
use s2s_model::Seq2Seq;

fn write_weights(config: &ModelConfig, dir: &Path) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    Seq2Seq::new(config, vb).unwrap();
    varmap.save(dir.join(WEIGHTS_FILE)).unwrap();
    config.save(dir.join(CONFIG_FILE)).unwrap();
}

fn tiny_decoder(vocab_size: usize, hidden_size: usize) -> DecoderConfig {
    DecoderConfig {
        vocab_size,
        embed_dim: 4,
        hidden_size,
        n_layers: 1,
        rnn_type: RnnType::Lstm,
        dropout_p: 0.0,
        max_length: 6,
    }
}

fn asr_features() -> FeatureConfig {
    FeatureConfig {
        sample_rate: 8000,
        n_fft: 256,
        hop_length: 80,
        win_length: 200,
        n_mels: 10,
        f_max: 4000.0,
        ..FeatureConfig::default()
    }
}

fn write_asr_checkpoint(dir: &Path) -> Vocabulary {
    let tgt = Vocabulary::build(["да нет"], Granularity::Char, 1, None);
    let config = ModelConfig {
        name: "asr-tiny".into(),
        encoder: EncoderConfig {
            input: EncoderInput::Features {
                feature_dim: 10,
                frame_stack: 2,
            },
            hidden_size: 4,
            n_layers: 2,
            bidirectional: true,
            rnn_type: RnnType::Gru,
            dropout_p: 0.0,
        },
        attention: AttentionConfig {
            kind: AttentionKind::Location,
            ..AttentionConfig::default()
        },
        decoder: tiny_decoder(tgt.len(), 8),
    };
    write_weights(&config, dir);
    tgt.save(dir.join(TGT_VOCAB_FILE)).unwrap();
    asr_features().save(dir.join(FEATURES_FILE)).unwrap();
    tgt
}

fn write_nmt_checkpoint(dir: &Path) {
    let src = Vocabulary::build(["the cat sat"], Granularity::Word, 1, None);
    let tgt = Vocabulary::build(["le chat assis"], Granularity::Word, 1, None);
    let config = ModelConfig {
        name: "nmt-tiny".into(),
        encoder: EncoderConfig {
            input: EncoderInput::Tokens {
                vocab_size: src.len(),
            },
            hidden_size: 8,
            n_layers: 1,
            bidirectional: false,
            rnn_type: RnnType::Lstm,
            dropout_p: 0.0,
        },
        attention: AttentionConfig {
            kind: AttentionKind::Additive,
            ..AttentionConfig::default()
        },
        decoder: tiny_decoder(tgt.len(), 8),
    };
    write_weights(&config, dir);
    src.save(dir.join(SRC_VOCAB_FILE)).unwrap();
    tgt.save(dir.join(TGT_VOCAB_FILE)).unwrap();
}

fn sine(seconds: f32, rate: usize) -> Vec<f32> {
    let n = (seconds * rate as f32) as usize;
    (0..n)
        .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin() * 0.5)
        .collect()
}

#[test]
fn test_load_nmt_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    write_nmt_checkpoint(dir.path());

    let engine = Seq2SeqEngine::load(dir.path(), &Device::Cpu).unwrap();
    assert_eq!(engine.name(), "nmt-tiny");
    assert_eq!(engine.task(), Task::Translation);
    assert_eq!(engine.sample_rate(), None);

    let out = engine
        .translate("the cat sat on a mat", &SearchConfig::beam(2, 6))
        .unwrap();
    assert!(out.tokens.len() <= 6);
    assert_eq!(out.model_name, "nmt-tiny");
}

#[test]
fn test_load_asr_checkpoint_resamples() {
    let dir = tempfile::tempdir().unwrap();
    let tgt = write_asr_checkpoint(dir.path());

    let engine = Seq2SeqEngine::load(dir.path(), &Device::Cpu).unwrap();
    assert_eq!(engine.task(), Task::Recognition);
    assert_eq!(engine.sample_rate(), Some(8000));
    assert_eq!(engine.tgt_vocab(), &tgt);

    let out = engine
        .transcribe(&sine(0.5, 16000), 16000, &SearchConfig::greedy(6))
        .unwrap();
    assert!(out.tokens.len() <= 6);
    assert!((out.input_duration_secs - 0.5).abs() < 1e-3);
    assert!(out.rtf > 0.0);

    let err = engine.translate("да", &SearchConfig::greedy(6)).unwrap_err();
    assert!(matches!(err, S2sError::Config(_)));
}

#[test]
fn test_missing_features_file_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_asr_checkpoint(dir.path());
    std::fs::remove_file(dir.path().join(FEATURES_FILE)).unwrap();
    assert!(Seq2SeqEngine::load(dir.path(), &Device::Cpu).is_err());
}

#[test]
fn test_missing_directory() {
    let err = Seq2SeqEngine::load("/nonexistent/checkpoint", &Device::Cpu).unwrap_err();
    assert!(matches!(err, S2sError::Model(_)));
}
