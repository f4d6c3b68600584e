//! Команды инференса: decode, transcribe, eval.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::Device;
use tracing::info;

use audio::{load_wav, to_mono};
use s2s_core::{SearchConfig, SearchStrategy};
use s2s_engine::{Input, Seq2SeqEngine, Task};
use s2s_train::{load_manifest_tsv, load_parallel_tsv, ErrorCounter};

use crate::{SearchArgs, TaskArg};

impl SearchArgs {
    /// Собрать конфиг поиска; `default_max_length` берётся из модели.
    pub fn to_config(&self, default_max_length: usize) -> SearchConfig {
        let max_length = self.max_length.unwrap_or(default_max_length);
        let strategy = match (self.beam, self.temperature) {
            (beam, _) if beam > 1 => SearchStrategy::Beam {
                beam_size: beam,
                length_penalty: self.length_penalty,
                early_stopping: self.early_stopping,
            },
            (_, Some(temperature)) => SearchStrategy::Sample {
                temperature,
                seed: self.seed,
            },
            _ => SearchStrategy::Greedy,
        };
        SearchConfig {
            strategy,
            max_length,
        }
    }
}

fn load_engine(model: &Path, device: &Device, expected: Task) -> Result<Seq2SeqEngine> {
    let engine = Seq2SeqEngine::load(model, device)
        .with_context(|| format!("Не удалось загрузить чекпоинт {}", model.display()))?;
    if engine.task() != expected {
        anyhow::bail!(
            "Модель '{}' предназначена для {:?}, а не для {:?}",
            engine.name(),
            engine.task(),
            expected
        );
    }
    Ok(engine)
}

fn default_max_length(engine: &Seq2SeqEngine) -> usize {
    engine.model().config().decoder.max_length
}

pub fn run_decode(
    model: &Path,
    input: &str,
    n_best: Option<usize>,
    search: &SearchArgs,
    device: &Device,
) -> Result<()> {
    let engine = load_engine(model, device, Task::Translation)?;
    let config = search.to_config(default_max_length(&engine));

    let reader: Box<dyn BufRead> = if input == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(input)
            .with_context(|| format!("Не удалось открыть {input}"))?;
        Box::new(BufReader::new(file))
    };

    let start = Instant::now();
    let mut count = 0usize;
    for line in reader.lines() {
        let line = line?;
        let text = line.trim();
        if text.is_empty() {
            println!();
            continue;
        }
        match n_best {
            Some(n) => {
                let outs = engine.n_best(Input::Text(text), &config)?;
                for out in outs.iter().take(n.max(1)) {
                    println!("{:.4}\t{}", out.score, out.text);
                }
                println!();
            }
            None => println!("{}", engine.translate(text, &config)?.text),
        }
        count += 1;
    }
    info!(
        lines = count,
        "Перевод завершён за {:.2}с",
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

pub fn run_transcribe(
    model: &Path,
    audio: &Path,
    search: &SearchArgs,
    json: bool,
    device: &Device,
) -> Result<()> {
    let engine = load_engine(model, device, Task::Recognition)?;
    let config = search.to_config(default_max_length(&engine));

    let buffer = to_mono(&load_wav(audio)?);
    info!(
        "{}: {} Гц, {:.2}с",
        audio.display(),
        buffer.sample_rate,
        buffer.duration()
    );
    let result = engine.transcribe(&buffer.samples, buffer.sample_rate, &config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("📝 {}", result.text);
        println!(
            "⏱  {:.2}с (RTF: {:.3})",
            result.inference_time_secs, result.rtf
        );
    }
    Ok(())
}

pub fn run_eval(
    model: &Path,
    data: &Path,
    task: TaskArg,
    search: &SearchArgs,
    batch_size: usize,
    device: &Device,
) -> Result<()> {
    let expected = match task {
        TaskArg::Nmt => Task::Translation,
        TaskArg::Asr => Task::Recognition,
    };
    let engine = load_engine(model, device, expected)?;
    let config = search.to_config(default_max_length(&engine));

    let start = Instant::now();
    let mut errors = ErrorCounter::new();
    let mut count = 0usize;

    match task {
        TaskArg::Nmt => {
            let pairs = load_parallel_tsv(data)?;
            for chunk in pairs.chunks(batch_size.max(1)) {
                let sources: Vec<&str> = chunk.iter().map(|(s, _)| s.as_str()).collect();
                let outs = engine.translate_batch(&sources, &config)?;
                for ((_, reference), out) in chunk.iter().zip(&outs) {
                    errors.add(reference, &out.text);
                }
                count += chunk.len();
            }
        }
        TaskArg::Asr => {
            for entry in load_manifest_tsv(data)? {
                let buffer = to_mono(&load_wav(&entry.audio)?);
                let out = engine.transcribe(&buffer.samples, buffer.sample_rate, &config)?;
                errors.add(&entry.transcript, &out.text);
                count += 1;
            }
        }
    }

    println!("Примеров: {count}");
    println!("CER: {:.2}%", errors.cer() * 100.0);
    println!("WER: {:.2}%", errors.wer() * 100.0);
    println!("Время: {:.2}с", start.elapsed().as_secs_f64());
    Ok(())
}
