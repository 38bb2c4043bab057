// Copyright 2024 The mt5-translator Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tch::Device;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mt5_translator::data::{load_corpus, train_test_split, TranslationDataModule};
use mt5_translator::mt5::{MT5ConfigResources, MT5VocabResources};
use mt5_translator::pipelines::tokenizers::MT5Tokenizer;
use mt5_translator::pipelines::translation::{
    checkpoint_config_path, TranslationConfig, TranslationDirection, TranslationModel,
};
use mt5_translator::resources::{LocalResource, ResourceProvider};
use mt5_translator::training::{CheckpointRecord, Trainer, TrainingConfig, TranslationModule};
use mt5_translator::Config;

#[derive(Parser, Debug)]
#[command(name = "mt5-translator", version, about = "Fine-tune and run an MT5 Korean/English translator")]
struct Cli {
    /// Run on the CPU even when a CUDA device is available
    #[arg(long, global = true)]
    cpu: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fine-tune a pretrained model on a parallel corpus, then evaluate it on the held-out set
    Train(TrainArgs),
    /// Evaluate a checkpoint on a parallel corpus
    Test(TestArgs),
    /// Translate the given texts, or every line of the standard input when none is given
    Translate(TranslateArgs),
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Directory of training CSV files
    #[arg(long, default_value = "dataset/training")]
    train_dir: PathBuf,
    /// Directory of validation CSV files, a share of the training corpus is held out when absent
    #[arg(long)]
    validation_dir: Option<PathBuf>,
    /// Share of the training corpus held out when no validation directory is given
    #[arg(long, default_value_t = 0.2)]
    test_fraction: f64,
    /// Seed of the held-out split
    #[arg(long, default_value_t = 42)]
    split_seed: u64,
    /// JSON training configuration, overridden by the flags below
    #[arg(long)]
    config: Option<PathBuf>,
    /// Model configuration (`config.json`), mt5-small when absent
    #[arg(long)]
    model_config: Option<PathBuf>,
    /// Pretrained `.ot` weights, random initialization when absent
    #[arg(long)]
    weights: Option<PathBuf>,
    /// Sentencepiece model, the mt5-small one when absent
    #[arg(long)]
    vocab: Option<PathBuf>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    korean_max_token_length: Option<usize>,
    #[arg(long)]
    english_max_token_length: Option<usize>,
    /// en-ko or ko-en
    #[arg(long)]
    direction: Option<TranslationDirection>,
    /// Shuffles the training set every epoch with this seed
    #[arg(long)]
    shuffle_seed: Option<u64>,
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TestArgs {
    /// Checkpoint weights, with its `config.json` in the same directory
    #[arg(long, default_value = "checkpoints/best-checkpoint.ot")]
    checkpoint: PathBuf,
    /// Directory of CSV files to evaluate on
    #[arg(long, default_value = "dataset/validation")]
    data_dir: PathBuf,
    #[arg(long)]
    vocab: Option<PathBuf>,
    #[arg(long, default_value_t = 16)]
    batch_size: usize,
    #[arg(long, default_value_t = 512)]
    korean_max_token_length: usize,
    #[arg(long, default_value_t = 512)]
    english_max_token_length: usize,
    /// en-ko or ko-en, defaults to the direction recorded with the checkpoint
    #[arg(long)]
    direction: Option<TranslationDirection>,
}

#[derive(Args, Debug)]
struct TranslateArgs {
    #[arg(long, default_value = "checkpoints/best-checkpoint.ot")]
    checkpoint: PathBuf,
    #[arg(long)]
    vocab: Option<PathBuf>,
    /// en-ko or ko-en, defaults to the direction recorded with the checkpoint
    #[arg(long)]
    direction: Option<TranslationDirection>,
    #[arg(long)]
    num_beams: Option<i64>,
    #[arg(long)]
    max_length: Option<i64>,
    texts: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mt5_translator=info")),
        )
        .init();

    let cli = Cli::parse();
    let device = if cli.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    match cli.command {
        Command::Train(args) => train(args, device),
        Command::Test(args) => test(args, device),
        Command::Translate(args) => translate(args, device),
    }
}

#[cfg(feature = "remote")]
fn pretrained_resource(
    path: Option<PathBuf>,
    pretrained: (&str, &str),
) -> anyhow::Result<Box<dyn ResourceProvider>> {
    Ok(match path {
        Some(path) => Box::new(LocalResource::from(path)),
        None => Box::new(mt5_translator::resources::RemoteResource::from_pretrained(
            pretrained,
        )),
    })
}

#[cfg(not(feature = "remote"))]
fn pretrained_resource(
    path: Option<PathBuf>,
    pretrained: (&str, &str),
) -> anyhow::Result<Box<dyn ResourceProvider>> {
    match path {
        Some(path) => Ok(Box::new(LocalResource::from(path))),
        None => bail!(
            "{} must be provided as a local file without the remote feature",
            pretrained.0
        ),
    }
}

fn training_config(args: &TrainArgs) -> anyhow::Result<TrainingConfig> {
    let mut config = match &args.config {
        Some(path) => TrainingConfig::from_file(path)
            .with_context(|| format!("reading training configuration {}", path.display()))?,
        None => TrainingConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        config.max_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(learning_rate) = args.learning_rate {
        config.learning_rate = learning_rate;
    }
    if let Some(length) = args.korean_max_token_length {
        config.korean_max_token_length = length;
    }
    if let Some(length) = args.english_max_token_length {
        config.english_max_token_length = length;
    }
    if let Some(direction) = args.direction {
        config.direction = direction;
    }
    if args.shuffle_seed.is_some() {
        config.shuffle_seed = args.shuffle_seed;
    }
    if let Some(dir) = &args.checkpoint_dir {
        config.checkpoint_dir = dir.clone();
    }
    if let Some(dir) = &args.log_dir {
        config.log_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn train(args: TrainArgs, device: Device) -> anyhow::Result<()> {
    let config = training_config(&args)?;

    let corpus = load_corpus(&args.train_dir)
        .with_context(|| format!("loading corpus from {}", args.train_dir.display()))?;
    let (train_pairs, held_out_pairs) = match &args.validation_dir {
        Some(dir) => (
            corpus,
            load_corpus(dir).with_context(|| format!("loading corpus from {}", dir.display()))?,
        ),
        None => train_test_split(corpus, args.test_fraction, args.split_seed)?,
    };
    info!(
        train = train_pairs.len(),
        held_out = held_out_pairs.len(),
        "loaded corpus"
    );

    let vocab = pretrained_resource(args.vocab.clone(), MT5VocabResources::MT5_SMALL)?;
    let tokenizer = Arc::new(MT5Tokenizer::from_resource(vocab.as_ref())?);
    let data = TranslationDataModule::new(
        train_pairs,
        held_out_pairs,
        tokenizer.clone(),
        config.data_module_config(device),
    );

    let model_config = pretrained_resource(args.model_config.clone(), MT5ConfigResources::MT5_SMALL)?;
    let weights = args.weights.clone().map(LocalResource::from);
    if weights.is_none() {
        warn!("no pretrained weights given, training from a random initialization");
    }
    let mut module = TranslationModule::new(
        model_config.as_ref(),
        weights.as_ref().map(|weights| weights as &dyn ResourceProvider),
        device,
    )?;

    let mut trainer = Trainer::new(config)?;
    let summary = trainer.fit(&mut module, &data)?;
    let test_loss = trainer.test(&module, &data)?;

    match &summary.best_model_path {
        Some(path) => println!(
            "best checkpoint: {} (score {:.4}), test loss {test_loss:.4}",
            path.display(),
            summary.best_model_score.unwrap_or(f64::NAN)
        ),
        None => println!("no checkpoint saved, test loss {test_loss:.4}"),
    }
    if let Some(log_dir) = &summary.log_dir {
        println!("metrics: {}", log_dir.display());
    }
    Ok(())
}

fn checkpoint_dir(checkpoint: &Path) -> PathBuf {
    checkpoint
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn evaluation_config(args: &TestArgs) -> TrainingConfig {
    TrainingConfig {
        batch_size: args.batch_size,
        korean_max_token_length: args.korean_max_token_length,
        english_max_token_length: args.english_max_token_length,
        direction: TranslationDirection::resolve(
            args.direction,
            CheckpointRecord::recorded_direction(&args.checkpoint),
        ),
        checkpoint_dir: checkpoint_dir(&args.checkpoint),
        ..Default::default()
    }
}

fn test(args: TestArgs, device: Device) -> anyhow::Result<()> {
    if !args.checkpoint.exists() {
        bail!("checkpoint {} does not exist", args.checkpoint.display());
    }
    let config = evaluation_config(&args);
    let pairs = load_corpus(&args.data_dir)
        .with_context(|| format!("loading corpus from {}", args.data_dir.display()))?;
    let vocab = pretrained_resource(args.vocab, MT5VocabResources::MT5_SMALL)?;
    let tokenizer = Arc::new(MT5Tokenizer::from_resource(vocab.as_ref())?);
    let data = TranslationDataModule::new(
        Vec::new(),
        pairs,
        tokenizer,
        config.data_module_config(device),
    );

    let module = TranslationModule::new(
        &LocalResource::from(checkpoint_config_path(&args.checkpoint)),
        Some(&LocalResource::from(args.checkpoint.clone())),
        device,
    )?;
    let mut trainer = Trainer::with_logger(config, None)?;
    let test_loss = trainer.test(&module, &data)?;
    println!("test loss {test_loss:.4}");
    Ok(())
}

fn translate(args: TranslateArgs, device: Device) -> anyhow::Result<()> {
    let vocab = pretrained_resource(args.vocab, MT5VocabResources::MT5_SMALL)?;
    let mut config = TranslationConfig::from_checkpoint(&args.checkpoint, vocab, device);
    config.direction = TranslationDirection::resolve(
        args.direction,
        CheckpointRecord::recorded_direction(&args.checkpoint),
    );
    if let Some(num_beams) = args.num_beams {
        config.generate_config.num_beams = num_beams;
    }
    if let Some(max_length) = args.max_length {
        config.generate_config.max_length = max_length;
    }
    let model = TranslationModel::new(config)
        .with_context(|| format!("loading checkpoint {}", args.checkpoint.display()))?;

    if args.texts.is_empty() {
        for line in io::stdin().lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            println!("{}", model.translate_joined(&line)?);
        }
    } else {
        for text in &args.texts {
            println!("{}", model.translate_joined(text)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_args(flags: &[&str]) -> TestArgs {
        let arguments = ["mt5-translator", "test"].iter().chain(flags);
        match Cli::try_parse_from(arguments).map(|cli| cli.command) {
            Ok(Command::Test(args)) => args,
            other => panic!("unexpected parse result {other:?}"),
        }
    }

    #[test]
    fn test_lengths_are_set_per_language() {
        let args = test_args(&[
            "--checkpoint",
            "missing/best-checkpoint.ot",
            "--korean-max-token-length",
            "128",
            "--english-max-token-length",
            "96",
            "--direction",
            "ko-en",
        ]);
        let config = evaluation_config(&args);
        assert_eq!(config.korean_max_token_length, 128);
        assert_eq!(config.english_max_token_length, 96);
        assert_eq!(config.direction, TranslationDirection::KoreanToEnglish);
        assert_eq!(config.checkpoint_dir, PathBuf::from("missing"));
    }

    #[test]
    fn test_lengths_default_to_512() {
        let config = evaluation_config(&test_args(&["--checkpoint", "missing/best.ot"]));
        assert_eq!(config.korean_max_token_length, 512);
        assert_eq!(config.english_max_token_length, 512);
        assert_eq!(config.direction, TranslationDirection::EnglishToKorean);
    }

    #[test]
    fn single_length_flag_is_rejected() {
        assert!(Cli::try_parse_from(["mt5-translator", "test", "--max-token-length", "64"]).is_err());
    }
}
