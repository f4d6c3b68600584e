//! Команда `train`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use tracing::{info, warn};

use audio::FeatureExtractor;
use s2s_core::{
    CheckpointFiles, EncoderInput, FeatureConfig, Granularity, ModelConfig, TrainConfig,
    Vocabulary,
};
use s2s_model::{parameter_count, Seq2Seq};
use s2s_train::{
    encode_manifest, encode_parallel, load_manifest_tsv, load_parallel_tsv, Checkpointer,
    Example, Trainer, TrainerState,
};

use crate::TaskArg;

pub struct TrainArgs {
    pub config: Option<PathBuf>,
    pub train_config: Option<PathBuf>,
    pub train: PathBuf,
    pub valid: Option<PathBuf>,
    pub task: TaskArg,
    pub src_vocab: Option<PathBuf>,
    pub tgt_vocab: Option<PathBuf>,
    pub granularity: Option<Granularity>,
    pub features: Option<PathBuf>,
    pub out: PathBuf,
    pub resume: bool,
    pub device: Device,
}

/// Всё, что описывает модель и хранится в статической части чекпоинта.
struct Setup {
    config: ModelConfig,
    src_vocab: Option<Vocabulary>,
    tgt_vocab: Vocabulary,
    features: Option<FeatureConfig>,
}

pub fn run_train(args: TrainArgs) -> Result<()> {
    let train_config = match &args.train_config {
        Some(path) => TrainConfig::from_file(path)?,
        None => TrainConfig::default(),
    };

    let (setup, resume_state) = if args.resume {
        resume_setup(&args)?
    } else {
        (fresh_setup(&args)?, None)
    };

    let train = encode_corpus(&args.train, args.task, &setup)?;
    let valid = match &args.valid {
        Some(path) => encode_corpus(path, args.task, &setup)?,
        None => Vec::new(),
    };

    let checkpoint = Checkpointer::create(
        &args.out,
        &setup.config,
        &setup.tgt_vocab,
        setup.src_vocab.as_ref(),
        setup.features.as_ref(),
    )?;

    let weights = resume_state
        .as_ref()
        .map(|_| checkpoint.weights_path().to_path_buf());
    let (varmap, model) = Seq2Seq::trainable(&setup.config, weights.as_deref(), &args.device)?;
    info!(
        model = %setup.config.name,
        params = parameter_count(&varmap),
        train = train.len(),
        valid = valid.len(),
        "Модель готова к обучению"
    );

    let mut trainer = Trainer::new(&model, &varmap, train_config)?;
    if let Some(state) = resume_state {
        info!(epoch = state.epoch, "Продолжение обучения");
        trainer = trainer.resume(state);
    }

    let report = trainer.fit(&train, &valid, &setup.tgt_vocab, Some(&checkpoint))?;

    println!();
    println!("Эпох: {}, шагов: {}", report.history.len(), report.global_step);
    if let (Some(loss), Some(epoch)) = (report.best_loss, report.best_epoch) {
        println!("Лучшая потеря: {loss:.4} (эпоха {epoch})");
    }
    if let Some(last) = report.history.last() {
        if let (Some(cer), Some(wer)) = (last.valid_cer, last.valid_wer) {
            println!("CER: {:.2}%, WER: {:.2}%", cer * 100.0, wer * 100.0);
        }
    }
    println!("Чекпоинт: {}", checkpoint.dir().display());
    Ok(())
}

fn fresh_setup(args: &TrainArgs) -> Result<Setup> {
    let config_path = args
        .config
        .as_ref()
        .context("--config обязателен для нового обучения")?;
    let mut config = ModelConfig::from_file(config_path)?;

    let granularity = args.granularity.unwrap_or(match args.task {
        TaskArg::Nmt => Granularity::Word,
        TaskArg::Asr => Granularity::Char,
    });
    let pairs = load_parallel_tsv(&args.train)?;

    let tgt_vocab = match &args.tgt_vocab {
        Some(path) => Vocabulary::load(path)?,
        None => Vocabulary::build(pairs.iter().map(|p| &p.1), granularity, 1, None),
    };
    if config.decoder.vocab_size != tgt_vocab.len() {
        warn!(
            "decoder.vocab_size {} → {} по целевому словарю",
            config.decoder.vocab_size,
            tgt_vocab.len()
        );
        config.decoder.vocab_size = tgt_vocab.len();
    }

    let (src_vocab, features) = match (args.task, &mut config.encoder.input) {
        (TaskArg::Nmt, EncoderInput::Tokens { vocab_size }) => {
            let vocab = match &args.src_vocab {
                Some(path) => Vocabulary::load(path)?,
                None => Vocabulary::build(pairs.iter().map(|p| &p.0), granularity, 1, None),
            };
            if *vocab_size != vocab.len() {
                warn!(
                    "encoder.input.vocab_size {} → {} по исходному словарю",
                    vocab_size,
                    vocab.len()
                );
                *vocab_size = vocab.len();
            }
            (Some(vocab), None)
        }
        (TaskArg::Asr, EncoderInput::Features { feature_dim, .. }) => {
            let features = match &args.features {
                Some(path) => FeatureConfig::from_file(path)?,
                None => FeatureConfig::default(),
            };
            if features.n_mels != *feature_dim {
                anyhow::bail!(
                    "n_mels ({}) не совпадает с encoder.input.feature_dim ({})",
                    features.n_mels,
                    feature_dim
                );
            }
            (None, Some(features))
        }
        (task, _) => anyhow::bail!("Вход энкодера в конфиге не подходит для задачи {task:?}"),
    };

    config.validate()?;
    Ok(Setup {
        config,
        src_vocab,
        tgt_vocab,
        features,
    })
}

fn resume_setup(args: &TrainArgs) -> Result<(Setup, Option<TrainerState>)> {
    let files = CheckpointFiles::resolve(&args.out)
        .with_context(|| format!("Нечего продолжать в {}", args.out.display()))?;
    let setup = Setup {
        config: ModelConfig::from_file(&files.config)?,
        src_vocab: files.src_vocab.as_ref().map(Vocabulary::load).transpose()?,
        tgt_vocab: Vocabulary::load(&files.tgt_vocab)?,
        features: files
            .features
            .as_ref()
            .map(FeatureConfig::from_file)
            .transpose()?,
    };
    let state = match &files.trainer_state {
        Some(path) => TrainerState::load(path)?,
        None => TrainerState::default(),
    };
    Ok((setup, Some(state)))
}

fn encode_corpus(path: &Path, task: TaskArg, setup: &Setup) -> Result<Vec<Example>> {
    let examples = match (task, &setup.src_vocab, &setup.features) {
        (TaskArg::Nmt, Some(src_vocab), _) => {
            encode_parallel(&load_parallel_tsv(path)?, src_vocab, &setup.tgt_vocab)?
        }
        (TaskArg::Asr, _, Some(features)) => {
            let extractor = FeatureExtractor::new(features.clone())?;
            encode_manifest(&load_manifest_tsv(path)?, &extractor, &setup.tgt_vocab)?
        }
        _ => anyhow::bail!("Чекпоинт не подходит для задачи {task:?}"),
    };
    Ok(examples)
}
