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

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::data::{DataLoader, TranslationDataModule};
use crate::training::checkpoint::ModelCheckpoint;
use crate::training::config::TrainingConfig;
use crate::training::logger::MetricsLogger;
use crate::training::module::TranslationModule;
use crate::training::scheduler::LinearScheduleWithWarmup;
use crate::TranslatorError;

/// Outcome of `Trainer::fit`
#[derive(Debug, Clone)]
pub struct FitSummary {
    pub epochs: usize,
    pub global_step: usize,
    /// Mean training loss of every epoch
    pub train_losses: Vec<f64>,
    /// Mean validation loss of every epoch, empty when the held-out set is not evaluated
    pub val_losses: Vec<f64>,
    pub best_model_path: Option<PathBuf>,
    pub best_model_score: Option<f64>,
    pub log_dir: Option<PathBuf>,
}

/// Running mean weighted by batch sizes
#[derive(Debug, Default)]
struct MeanLoss {
    total: f64,
    count: usize,
}

impl MeanLoss {
    fn update(&mut self, loss: f64, batch_size: usize) {
        self.total += loss * batch_size as f64;
        self.count += batch_size;
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total / self.count as f64)
    }
}

/// # Training loop
/// Runs epochs of optimization followed by validation, logs metrics and keeps the best checkpoints.
pub struct Trainer {
    config: TrainingConfig,
    checkpoint: ModelCheckpoint,
    logger: Option<MetricsLogger>,
    global_step: usize,
    current_epoch: usize,
}

impl Trainer {
    /// Creates the checkpoint directory and a new metric log version.
    pub fn new(config: TrainingConfig) -> Result<Trainer, TranslatorError> {
        config.validate()?;
        let logger = MetricsLogger::new(&config.log_dir, &config.experiment_name)?;
        Self::with_logger(config, Some(logger))
    }

    pub fn with_logger(
        config: TrainingConfig,
        logger: Option<MetricsLogger>,
    ) -> Result<Trainer, TranslatorError> {
        config.validate()?;
        let checkpoint = ModelCheckpoint::from_config(&config)?;
        Ok(Trainer {
            config,
            checkpoint,
            logger,
            global_step: 0,
            current_epoch: 0,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn checkpoint(&self) -> &ModelCheckpoint {
        &self.checkpoint
    }

    pub fn logger(&self) -> Option<&MetricsLogger> {
        self.logger.as_ref()
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    fn log_metric(&mut self, metric: &str, value: f64) -> Result<(), TranslatorError> {
        if let Some(logger) = self.logger.as_mut() {
            logger.log_metric(metric, value, self.current_epoch, self.global_step)?;
        }
        Ok(())
    }

    /// Trains `module` for `max_epochs` epochs on the training set of `data`, validating on
    /// the held-out set after every epoch.
    pub fn fit(
        &mut self,
        module: &mut TranslationModule,
        data: &TranslationDataModule,
    ) -> Result<FitSummary, TranslatorError> {
        let train_loader = data.train_dataloader()?;
        if train_loader.is_empty() {
            return Err(TranslatorError::DatasetError(
                "the training set is empty".to_string(),
            ));
        }
        let validate_each_epoch = !data.test_dataset().is_empty();
        if !validate_each_epoch && self.checkpoint.monitor() == "val_loss" {
            return Err(TranslatorError::DatasetError(
                "val_loss is monitored but the held-out set is empty".to_string(),
            ));
        }

        if let Some(logger) = self.logger.as_ref() {
            logger.log_hyperparams(&self.config)?;
        }

        let mut optimizer = module.configure_optimizer(&self.config)?;
        let total_steps = train_loader.len() * self.config.max_epochs;
        let mut scheduler = self.config.linear_schedule.then(|| {
            LinearScheduleWithWarmup::new(
                self.config.learning_rate,
                self.config.warmup_steps,
                total_steps,
            )
        });
        if let Some(scheduler) = scheduler.as_ref() {
            optimizer.set_lr(scheduler.learning_rate());
        }

        info!(
            epochs = self.config.max_epochs,
            steps_per_epoch = train_loader.len(),
            train = data.train_dataset().len(),
            held_out = data.test_dataset().len(),
            learning_rate = self.config.learning_rate,
            "starting training"
        );

        let mut train_losses = Vec::with_capacity(self.config.max_epochs);
        let mut val_losses = Vec::with_capacity(self.config.max_epochs);
        let first_epoch = self.current_epoch;
        for epoch in first_epoch..first_epoch + self.config.max_epochs {
            self.current_epoch = epoch;
            let mut epoch_loss = MeanLoss::default();
            for (batch_index, batch) in train_loader.iter_epoch(epoch).enumerate() {
                let batch = batch?;
                optimizer.zero_grad();
                let loss = module.training_step(&batch)?;
                loss.backward();
                if let Some(max_norm) = self.config.gradient_clip_norm {
                    optimizer.clip_grad_norm(max_norm);
                }
                optimizer.step();
                if let Some(scheduler) = scheduler.as_mut() {
                    optimizer.set_lr(scheduler.step());
                }
                self.global_step += 1;

                let loss_value = loss.double_value(&[]);
                if !loss_value.is_finite() {
                    warn!(epoch, batch_index, loss = loss_value, "non-finite training loss");
                }
                epoch_loss.update(loss_value, batch.len());
                debug!(epoch, batch_index, step = self.global_step, loss = loss_value, "training step");
                if self.global_step % self.config.log_every_n_steps == 0 {
                    self.log_metric("train_loss_step", loss_value)?;
                }
            }
            let train_loss = epoch_loss.value().unwrap_or(f64::NAN);
            train_losses.push(train_loss);
            self.log_metric("train_loss", train_loss)?;

            let val_loss = if validate_each_epoch {
                let val_loss = self.evaluate(module, &data.val_dataloader()?)?;
                val_losses.push(val_loss);
                self.log_metric("val_loss", val_loss)?;
                Some(val_loss)
            } else {
                None
            };
            info!(epoch, step = self.global_step, train_loss, val_loss = ?val_loss, "epoch finished");

            let score = match self.checkpoint.monitor() {
                "train_loss" => train_loss,
                _ => val_loss.unwrap_or(f64::NAN),
            };
            self.checkpoint.update(
                module.var_store(),
                module.model_config(),
                score,
                epoch,
                self.global_step,
            )?;
        }
        self.current_epoch = first_epoch + self.config.max_epochs;

        Ok(FitSummary {
            epochs: self.config.max_epochs,
            global_step: self.global_step,
            train_losses,
            val_losses,
            best_model_path: self.checkpoint.best_model_path().map(PathBuf::from),
            best_model_score: self.checkpoint.best_model_score(),
            log_dir: self.logger.as_ref().map(|logger| logger.log_dir().to_path_buf()),
        })
    }

    fn evaluate(
        &self,
        module: &TranslationModule,
        loader: &DataLoader<'_>,
    ) -> Result<f64, TranslatorError> {
        let mut mean_loss = MeanLoss::default();
        for batch in loader.iter() {
            let batch = batch?;
            mean_loss.update(module.validation_step(&batch)?, batch.len());
        }
        mean_loss.value().ok_or_else(|| {
            TranslatorError::DatasetError("cannot evaluate on an empty dataset".to_string())
        })
    }

    /// Mean loss over the validation loader of `data`
    pub fn validate(
        &mut self,
        module: &TranslationModule,
        data: &TranslationDataModule,
    ) -> Result<f64, TranslatorError> {
        let val_loss = self.evaluate(module, &data.val_dataloader()?)?;
        self.log_metric("val_loss", val_loss)?;
        info!(val_loss, "validation finished");
        Ok(val_loss)
    }

    /// Mean loss over the test loader of `data`
    pub fn test(
        &mut self,
        module: &TranslationModule,
        data: &TranslationDataModule,
    ) -> Result<f64, TranslatorError> {
        let mut mean_loss = MeanLoss::default();
        for batch in data.test_dataloader()?.iter() {
            let batch = batch?;
            mean_loss.update(module.test_step(&batch)?, batch.len());
        }
        let test_loss = mean_loss.value().ok_or_else(|| {
            TranslatorError::DatasetError("cannot test on an empty dataset".to_string())
        })?;
        self.log_metric("test_loss", test_loss)?;
        info!(test_loss, "test finished");
        Ok(test_loss)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mean_loss_weights_by_batch_size() {
        let mut mean = MeanLoss::default();
        assert_eq!(mean.value(), None);
        mean.update(1.0, 3);
        mean.update(3.0, 1);
        assert_eq!(mean.value(), Some(1.5));
    }
}
