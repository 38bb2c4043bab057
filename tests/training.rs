mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{tiny_config, ByteTokenizer, PAIRS};
use mt5_translator::data::{DataModuleConfig, SentencePair, TranslationDataModule};
use mt5_translator::pipelines::generation_utils::{GenerateConfig, LanguageGenerator};
use mt5_translator::pipelines::translation::{checkpoint_config_path, TranslationDirection};
use mt5_translator::resources::LocalResource;
use mt5_translator::training::{
    CheckpointRecord, Trainer, TrainingConfig, TranslationModule,
    HPARAMS_FILE, METRICS_FILE,
};
use mt5_translator::TranslatorError;
use tch::{Device, Tensor};

fn data_module(held_out: usize) -> TranslationDataModule {
    let pairs: Vec<SentencePair> = PAIRS
        .iter()
        .map(|(korean, english)| SentencePair::new(*korean, *english))
        .collect();
    let split = pairs.len() - held_out;
    TranslationDataModule::new(
        pairs[..split].to_vec(),
        pairs[split..].to_vec(),
        Arc::new(ByteTokenizer),
        DataModuleConfig {
            batch_size: 2,
            korean_max_token_length: 20,
            english_max_token_length: 16,
            device: Device::Cpu,
            ..Default::default()
        },
    )
}

fn training_config(root: &Path) -> TrainingConfig {
    TrainingConfig {
        max_epochs: 2,
        batch_size: 2,
        learning_rate: 1e-3,
        log_every_n_steps: 1,
        korean_max_token_length: 20,
        english_max_token_length: 16,
        checkpoint_dir: root.join("checkpoints"),
        log_dir: root.join("lightning_logs"),
        ..Default::default()
    }
}

fn module() -> TranslationModule {
    tch::manual_seed(7);
    TranslationModule::from_config(tiny_config(), Device::Cpu)
}

#[test]
fn fit_saves_best_checkpoint_and_metrics() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let data = data_module(2);
    let mut module = module();
    let mut trainer = Trainer::new(training_config(root.path()))?;

    let summary = trainer.fit(&mut module, &data)?;

    assert_eq!(summary.epochs, 2);
    assert_eq!(summary.global_step, 4);
    assert_eq!(summary.train_losses.len(), 2);
    assert_eq!(summary.val_losses.len(), 2);
    assert!(summary.train_losses.iter().all(|loss| loss.is_finite()));

    let best_path = summary
        .best_model_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no checkpoint saved"))?;
    assert_eq!(
        best_path,
        root.path().join("checkpoints").join("best-checkpoint.ot")
    );
    assert!(best_path.is_file());
    assert!(checkpoint_config_path(&best_path).is_file());
    let best_score = summary
        .best_model_score
        .ok_or_else(|| anyhow::anyhow!("no best score"))?;
    let lowest = summary
        .val_losses
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min);
    assert_eq!(best_score, lowest);

    let record = CheckpointRecord::from_checkpoint(&best_path)?;
    assert_eq!(record.monitor, "val_loss");
    assert_eq!(record.score, best_score);
    assert_eq!(record.direction, Some(TranslationDirection::EnglishToKorean));

    let log_dir = summary
        .log_dir
        .ok_or_else(|| anyhow::anyhow!("no log directory"))?;
    assert!(log_dir.ends_with("translator/version_0"));
    assert!(log_dir.join(HPARAMS_FILE).is_file());
    let mut reader = csv::Reader::from_path(log_dir.join(METRICS_FILE))?;
    let metrics = reader
        .records()
        .map(|record| record.map(|record| record[2].to_string()))
        .collect::<Result<Vec<String>, _>>()?;
    assert_eq!(metrics.iter().filter(|m| *m == "train_loss_step").count(), 4);
    assert_eq!(metrics.iter().filter(|m| *m == "train_loss").count(), 2);
    assert_eq!(metrics.iter().filter(|m| *m == "val_loss").count(), 2);
    Ok(())
}

#[test]
fn best_checkpoint_reloads_with_its_score() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let data = data_module(2);
    let mut module = module();
    let mut trainer = Trainer::new(training_config(root.path()))?;
    let summary = trainer.fit(&mut module, &data)?;
    let best_path: PathBuf = summary
        .best_model_path
        .ok_or_else(|| anyhow::anyhow!("no checkpoint saved"))?;

    let reloaded = TranslationModule::new(
        &LocalResource::from(checkpoint_config_path(&best_path)),
        Some(&LocalResource::from(best_path.clone())),
        Device::Cpu,
    )?;
    let val_loss = trainer.validate(&reloaded, &data)?;
    let best_score = summary.best_model_score.unwrap_or(f64::NAN);
    assert!((val_loss - best_score).abs() < 1e-5);

    let test_loss = trainer.test(&reloaded, &data)?;
    assert!((test_loss - val_loss).abs() < 1e-6);

    let generator = reloaded.into_generator(GenerateConfig {
        max_length: 5,
        ..Default::default()
    })?;
    let input_ids = Tensor::from_slice(&[40i64, 41, 1]).unsqueeze(0);
    let output = generator.generate_indices(&input_ids, None, None, None)?;
    assert_eq!(output.len(), 1);
    Ok(())
}

#[test]
fn second_run_versions_checkpoint_and_logs() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let data = data_module(2);
    let config = TrainingConfig {
        max_epochs: 1,
        ..training_config(root.path())
    };

    let first = Trainer::new(config.clone())?.fit(&mut module(), &data)?;
    let second = Trainer::new(config)?.fit(&mut module(), &data)?;

    let checkpoints = root.path().join("checkpoints");
    assert_eq!(
        first.best_model_path,
        Some(checkpoints.join("best-checkpoint.ot"))
    );
    assert_eq!(
        second.best_model_path,
        Some(checkpoints.join("best-checkpoint-v1.ot"))
    );
    assert!(second
        .log_dir
        .is_some_and(|dir| dir.ends_with("translator/version_1")));
    Ok(())
}

#[test]
fn train_loss_can_be_monitored_without_held_out_set() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let data = data_module(0);
    let config = TrainingConfig {
        monitor: "train_loss".to_string(),
        save_top_k: -1,
        ..training_config(root.path())
    };

    let summary = Trainer::new(config)?.fit(&mut module(), &data)?;

    assert!(summary.val_losses.is_empty());
    let checkpoints = root.path().join("checkpoints");
    assert!(checkpoints.join("best-checkpoint-epoch=0-step=3.ot").is_file());
    assert!(checkpoints.join("best-checkpoint-epoch=1-step=6.ot").is_file());
    Ok(())
}

#[test]
fn validation_loss_needs_held_out_set() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let data = data_module(0);
    let result = Trainer::new(training_config(root.path()))?.fit(&mut module(), &data);
    assert!(matches!(result, Err(TranslatorError::DatasetError(_))));
    Ok(())
}

#[test]
fn invalid_training_configuration_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let config = TrainingConfig {
        monitor: "bleu".to_string(),
        ..training_config(root.path())
    };
    assert!(matches!(
        Trainer::new(config),
        Err(TranslatorError::InvalidConfigurationError(_))
    ));
}

#[test]
fn fit_with_linear_schedule_and_clipping() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let data = data_module(2);
    let config = TrainingConfig {
        linear_schedule: true,
        warmup_steps: 1,
        gradient_clip_norm: Some(1.0),
        ..training_config(root.path())
    };

    let summary = Trainer::new(config)?.fit(&mut module(), &data)?;

    assert_eq!(summary.global_step, 4);
    assert!(summary.val_losses.iter().all(|loss| loss.is_finite()));
    Ok(())
}
