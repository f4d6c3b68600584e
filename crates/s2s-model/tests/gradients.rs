//! Градиенты доходят до всех параметров модели.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

use s2s_core::{
    AttentionConfig, AttentionKind, DecoderConfig, EncoderConfig, EncoderInput, ModelConfig,
    RnnType,
};
use s2s_model::Seq2Seq;

fn config(rnn_type: RnnType, kind: AttentionKind, input: EncoderInput) -> ModelConfig {
    ModelConfig {
        name: "grad-check".into(),
        encoder: EncoderConfig {
            input,
            hidden_size: 4,
            n_layers: 2,
            bidirectional: true,
            rnn_type,
            dropout_p: 0.0,
        },
        attention: AttentionConfig {
            kind,
            attn_dim: 5,
            location_channels: 2,
            location_kernel: 3,
        },
        decoder: DecoderConfig {
            vocab_size: 7,
            embed_dim: 3,
            hidden_size: 8,
            n_layers: 2,
            rnn_type,
            dropout_p: 0.0,
            max_length: 5,
        },
    }
}

fn check_all_params_get_gradients(cfg: &ModelConfig, source: Tensor, lengths: &[usize]) {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Seq2Seq::new(cfg, vb).unwrap();

    let targets = Tensor::new(&[[1u32, 4, 5], [1, 6, 4]], &device).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let log_probs = model
        .forward(&source, lengths, &targets, 1.0, &mut rng, true)
        .unwrap();
    let loss = log_probs.mean_all().unwrap().neg().unwrap();
    let grads = loss.backward().unwrap();

    let data = varmap.data().lock().unwrap();
    for (name, var) in data.iter() {
        let grad = grads
            .get(var.as_tensor())
            .unwrap_or_else(|| panic!("{}: нет градиента для {name}", cfg.name));
        let sum: f32 = grad.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(sum.is_finite(), "{name}: градиент не конечен");
    }
}

#[test]
fn test_token_model_gradients() {
    for rnn_type in [RnnType::Lstm, RnnType::Gru, RnnType::Rnn] {
        for kind in [AttentionKind::General, AttentionKind::Additive] {
            let cfg = config(rnn_type, kind, EncoderInput::Tokens { vocab_size: 9 });
            let source = Tensor::new(&[[4u32, 5, 6, 7], [8, 4, 0, 0]], &Device::Cpu).unwrap();
            check_all_params_get_gradients(&cfg, source, &[4, 2]);
        }
    }
}

#[test]
fn test_feature_model_gradients() {
    let cfg = config(
        RnnType::Gru,
        AttentionKind::Location,
        EncoderInput::Features {
            feature_dim: 3,
            frame_stack: 2,
        },
    );
    let source = Tensor::randn(0f32, 1f32, (2, 6, 3), &Device::Cpu).unwrap();
    check_all_params_get_gradients(&cfg, source, &[6, 3]);
}
