//!
//! CLI для seq2seq-моделей с вниманием: перевод текста и распознавание речи.

mod decode;
mod train;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use s2s_core::model_files::{
    CONFIG_FILE, FEATURES_FILE, SRC_VOCAB_FILE, TGT_VOCAB_FILE, TRAINER_STATE_FILE, WEIGHTS_FILE,
};
use s2s_core::{CheckpointFiles, Granularity, ModelConfig, Vocabulary};
use s2s_train::{load_parallel_tsv, TrainerState};

/// Вид задачи.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskArg {
    /// Перевод: TSV `source<TAB>target`
    Nmt,
    /// Распознавание: манифест `wav_path<TAB>transcript`
    Asr,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum GranularityArg {
    Char,
    Word,
}

impl From<GranularityArg> for Granularity {
    fn from(v: GranularityArg) -> Self {
        match v {
            GranularityArg::Char => Granularity::Char,
            GranularityArg::Word => Granularity::Word,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ColumnArg {
    Source,
    Target,
}

/// Параметры поиска, общие для decode / transcribe / eval.
#[derive(clap::Args, Debug, Clone)]
pub struct SearchArgs {
    /// Ширина луча (1: жадный поиск)
    #[arg(long, default_value_t = 1)]
    pub beam: usize,

    /// Максимум генерируемых токенов (по умолчанию из конфига модели)
    #[arg(long)]
    pub max_length: Option<usize>,

    /// Показатель степени нормализации длины в beam search
    #[arg(long, default_value_t = 1.0)]
    pub length_penalty: f32,

    /// Останавливать beam search, как только набрано `beam` гипотез
    #[arg(long, default_value_t = false)]
    pub early_stopping: bool,

    /// Сэмплирование с температурой вместо argmax (только при --beam 1)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Seed для сэмплирования
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

#[derive(Parser)]
#[command(name = "s2s")]
#[command(author, version, about = "RustSeq2Seq: attention-based sequence-to-sequence models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Словари токенов
    Vocab {
        #[command(subcommand)]
        command: VocabCommands,
    },

    /// Обучить модель
    Train {
        /// ModelConfig (JSON); не нужен при --resume
        #[arg(long)]
        config: Option<PathBuf>,

        /// TrainConfig (JSON); по умолчанию стандартные гиперпараметры
        #[arg(long)]
        train_config: Option<PathBuf>,

        /// Обучающий корпус (TSV)
        #[arg(long)]
        train: PathBuf,

        /// Валидационный корпус (TSV)
        #[arg(long)]
        valid: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "nmt")]
        task: TaskArg,

        /// Готовый исходный словарь (NMT); иначе строится по обучающему корпусу
        #[arg(long)]
        src_vocab: Option<PathBuf>,

        /// Готовый целевой словарь; иначе строится по обучающему корпусу
        #[arg(long)]
        tgt_vocab: Option<PathBuf>,

        /// Гранулярность строящихся словарей (по умолчанию word для nmt, char для asr)
        #[arg(long, value_enum)]
        granularity: Option<GranularityArg>,

        /// FeatureConfig (JSON) для asr; по умолчанию 80 log-mel при 16 кГц
        #[arg(long)]
        features: Option<PathBuf>,

        /// Директория чекпоинта
        #[arg(long)]
        out: PathBuf,

        /// Продолжить обучение из --out
        #[arg(long, default_value_t = false)]
        resume: bool,

        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Перевести текст построчно (файл или `-` для stdin)
    Decode {
        /// Директория чекпоинта
        #[arg(long)]
        model: PathBuf,

        #[arg(long, default_value = "-")]
        input: String,

        /// Печатать N лучших гипотез с оценками
        #[arg(long)]
        n_best: Option<usize>,

        #[command(flatten)]
        search: SearchArgs,

        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Распознать WAV-файл
    Transcribe {
        /// Директория чекпоинта
        #[arg(long)]
        model: PathBuf,

        /// Path to the audio file (WAV format)
        #[arg(long)]
        audio: PathBuf,

        #[command(flatten)]
        search: SearchArgs,

        /// Вывести результат в JSON
        #[arg(long, default_value_t = false)]
        json: bool,

        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Посчитать CER/WER на корпусе
    Eval {
        /// Директория чекпоинта
        #[arg(long)]
        model: PathBuf,

        /// Тестовый корпус (TSV)
        #[arg(long)]
        data: PathBuf,

        #[arg(long, value_enum, default_value = "nmt")]
        task: TaskArg,

        #[command(flatten)]
        search: SearchArgs,

        /// Размер батча для жадного перевода
        #[arg(long, default_value_t = 32)]
        batch_size: usize,

        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Работа с чекпоинтами
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },

    /// Run a simple test to verify the setup
    Test {
        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,
    },
}

#[derive(Subcommand)]
enum VocabCommands {
    /// Построить словарь по колонке TSV-корпуса
    Build {
        #[arg(long)]
        corpus: PathBuf,

        #[arg(long, value_enum, default_value = "target")]
        column: ColumnArg,

        #[arg(long, value_enum, default_value = "word")]
        granularity: GranularityArg,

        /// Минимальная частота токена
        #[arg(long, default_value_t = 1)]
        min_freq: usize,

        /// Максимум обычных токенов
        #[arg(long)]
        max_size: Option<usize>,

        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// Проверить директорию чекпоинта и вывести, какие файлы найдены
    Check {
        /// Путь к директории чекпоинта
        #[arg(long)]
        model: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Vocab { command } => match command {
            VocabCommands::Build {
                corpus,
                column,
                granularity,
                min_freq,
                max_size,
                out,
            } => run_vocab_build(corpus, column, granularity.into(), min_freq, max_size, out),
        },

        Commands::Train {
            config,
            train_config,
            train,
            valid,
            task,
            src_vocab,
            tgt_vocab,
            granularity,
            features,
            out,
            resume,
            device,
        } => {
            let device = create_device(&device)?;
            train::run_train(train::TrainArgs {
                config,
                train_config,
                train,
                valid,
                task,
                src_vocab,
                tgt_vocab,
                granularity: granularity.map(Granularity::from),
                features,
                out,
                resume,
                device,
            })
        }

        Commands::Decode {
            model,
            input,
            n_best,
            search,
            device,
        } => decode::run_decode(&model, &input, n_best, &search, &create_device(&device)?),

        Commands::Transcribe {
            model,
            audio,
            search,
            json,
            device,
        } => decode::run_transcribe(&model, &audio, &search, json, &create_device(&device)?),

        Commands::Eval {
            model,
            data,
            task,
            search,
            batch_size,
            device,
        } => decode::run_eval(
            &model,
            &data,
            task,
            &search,
            batch_size,
            &create_device(&device)?,
        ),

        Commands::Checkpoint { command } => match command {
            CheckpointCommands::Check { model } => run_checkpoint_check(model),
        },

        Commands::Test { device } => {
            println!("🧪 RustSeq2Seq - Setup Test");
            println!("===========================");
            println!("Testing {device} device...");

            let device = create_device(&device)?;
            let a = candle_core::Tensor::randn(0f32, 1f32, (2, 3), &device)?;
            let b = candle_core::Tensor::randn(0f32, 1f32, (3, 4), &device)?;
            let c = a.matmul(&b)?;
            println!("✅ Test passed. Output shape: {:?}", c.dims());
            Ok(())
        }
    }
}

fn run_vocab_build(
    corpus: PathBuf,
    column: ColumnArg,
    granularity: Granularity,
    min_freq: usize,
    max_size: Option<usize>,
    out: PathBuf,
) -> Result<()> {
    let pairs = load_parallel_tsv(&corpus)?;
    let lines = pairs.iter().map(|(src, tgt)| match column {
        ColumnArg::Source => src,
        ColumnArg::Target => tgt,
    });
    let vocab = Vocabulary::build(lines, granularity, min_freq, max_size);
    vocab.save(&out)?;
    println!(
        "Словарь: {} токенов ({:?}) → {}",
        vocab.len(),
        granularity,
        out.display()
    );
    Ok(())
}

fn run_checkpoint_check(model_dir: PathBuf) -> Result<()> {
    if !model_dir.is_dir() {
        anyhow::bail!("Директория чекпоинта не найдена: {}", model_dir.display());
    }

    let status = |name: &str| {
        if model_dir.join(name).is_file() {
            "OK"
        } else {
            "MISSING"
        }
    };
    println!("Чекпоинт: {}", model_dir.display());
    println!("Файлы:");
    for name in [CONFIG_FILE, WEIGHTS_FILE, TGT_VOCAB_FILE] {
        println!("- {name}: {}", status(name));
    }
    for name in [SRC_VOCAB_FILE, FEATURES_FILE, TRAINER_STATE_FILE] {
        println!("- {name}: {} (опционально)", status(name));
    }

    let files = CheckpointFiles::resolve(&model_dir)?;
    let config = ModelConfig::from_file(&files.config)?;
    println!();
    println!("Модель: {}", config.name);
    println!(
        "- энкодер: {} × {} {}{}",
        config.encoder.n_layers,
        config.encoder.hidden_size,
        config.encoder.rnn_type.as_str(),
        if config.encoder.bidirectional {
            " (bi)"
        } else {
            ""
        }
    );
    println!("- внимание: {:?}", config.attention.kind);
    println!(
        "- декодер: {} × {} {}, словарь {}",
        config.decoder.n_layers,
        config.decoder.hidden_size,
        config.decoder.rnn_type.as_str(),
        config.decoder.vocab_size
    );

    let tensors = candle_core::safetensors::load(&files.weights, &candle_core::Device::Cpu)
        .with_context(|| format!("Не удалось прочитать {}", files.weights.display()))?;
    let params: usize = tensors.values().map(|t| t.elem_count()).sum();
    println!("- веса: {} тензоров, {params} параметров", tensors.len());

    if let Some(path) = &files.trainer_state {
        let state = TrainerState::load(path)?;
        println!(
            "- обучение: {} эпох, {} шагов, лучшая потеря {:?} (эпоха {:?})",
            state.epoch, state.global_step, state.best_loss, state.best_epoch
        );
    }

    s2s_engine::Seq2SeqEngine::load(&model_dir, &candle_core::Device::Cpu)
        .context("Веса не соответствуют конфигу модели")?;
    println!();
    println!("Итог: OK");
    Ok(())
}

fn create_device(device: &str) -> Result<candle_core::Device> {
    match device {
        "metal" => {
            // candle может panic при инициализации Metal, если устройство недоступно.
            let prev_hook = std::panic::take_hook();
            std::panic::set_hook(Box::new(|_| {}));
            let res = std::panic::catch_unwind(|| candle_core::Device::new_metal(0));
            std::panic::set_hook(prev_hook);

            match res {
                Ok(Ok(dev)) => Ok(dev),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow::anyhow!(
                    "Инициализация Metal недоступна в этом окружении. Попробуйте --device cpu."
                )),
            }
        }
        "cuda" => Ok(candle_core::Device::new_cuda(0)?),
        _ => Ok(candle_core::Device::Cpu),
    }
}
