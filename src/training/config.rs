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

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tch::Device;

use crate::data::DataModuleConfig;
use crate::pipelines::translation::TranslationDirection;
use crate::{Config, TranslatorError};

/// Metrics that can drive checkpoint selection
pub const MONITORED_METRICS: [&str; 2] = ["val_loss", "train_loss"];

/// Whether lower or higher monitored values are better
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    #[default]
    Min,
    Max,
}

impl MonitorMode {
    /// True if `candidate` strictly improves on `reference`. NaN never improves.
    pub fn is_better(&self, candidate: f64, reference: f64) -> bool {
        match self {
            MonitorMode::Min => candidate < reference,
            MonitorMode::Max => candidate > reference,
        }
    }
}

impl fmt::Display for MonitorMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MonitorMode::Min => write!(f, "min"),
            MonitorMode::Max => write!(f, "max"),
        }
    }
}

impl FromStr for MonitorMode {
    type Err = TranslatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "min" => Ok(MonitorMode::Min),
            "max" => Ok(MonitorMode::Max),
            _ => Err(TranslatorError::ValueError(format!(
                "unknown monitor mode {s}, expected min or max"
            ))),
        }
    }
}

/// # Training run configuration
/// Can be loaded from a JSON file with `TrainingConfig::from_file`; missing fields take their default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of passes over the training set (default: 10)
    pub max_epochs: usize,
    /// Examples per batch (default: 16)
    pub batch_size: usize,
    /// AdamW learning rate (default: 1e-5)
    pub learning_rate: f64,
    /// AdamW decoupled weight decay (default: 0.0)
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    /// Enables the linear warm-up and decay schedule (default: false, constant learning rate)
    pub linear_schedule: bool,
    /// Warm-up steps of the linear schedule (default: 0)
    pub warmup_steps: usize,
    /// Maximum global gradient norm, no clipping when absent
    pub gradient_clip_norm: Option<f64>,
    /// Interval, in optimizer steps, between two `train_loss` log rows (default: 50)
    pub log_every_n_steps: usize,
    /// Maximum Korean token count, end-of-sequence included (default: 512)
    pub korean_max_token_length: usize,
    /// Maximum English token count, end-of-sequence included (default: 512)
    pub english_max_token_length: usize,
    pub direction: TranslationDirection,
    /// Seed for shuffling the training set, corpus order when absent
    pub shuffle_seed: Option<u64>,
    /// Directory receiving checkpoints (default: `checkpoints`)
    pub checkpoint_dir: PathBuf,
    /// Checkpoint file stem (default: `best-checkpoint`)
    pub checkpoint_filename: String,
    /// Number of best checkpoints kept: 0 saves none, -1 keeps all (default: 1)
    pub save_top_k: i64,
    /// Metric driving checkpoint selection (default: `val_loss`)
    pub monitor: String,
    pub mode: MonitorMode,
    /// Root of the metric logs (default: `lightning_logs`)
    pub log_dir: PathBuf,
    /// Experiment name, a sub-directory of `log_dir` (default: `translator`)
    pub experiment_name: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            max_epochs: 10,
            batch_size: 16,
            learning_rate: 1e-5,
            weight_decay: 0.0,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-6,
            linear_schedule: false,
            warmup_steps: 0,
            gradient_clip_norm: None,
            log_every_n_steps: 50,
            korean_max_token_length: 512,
            english_max_token_length: 512,
            direction: TranslationDirection::EnglishToKorean,
            shuffle_seed: None,
            checkpoint_dir: PathBuf::from("checkpoints"),
            checkpoint_filename: "best-checkpoint".to_string(),
            save_top_k: 1,
            monitor: "val_loss".to_string(),
            mode: MonitorMode::Min,
            log_dir: PathBuf::from("lightning_logs"),
            experiment_name: "translator".to_string(),
        }
    }
}

impl Config for TrainingConfig {}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), TranslatorError> {
        let invalid = |message: String| Err(TranslatorError::InvalidConfigurationError(message));
        if self.max_epochs == 0 {
            return invalid("max_epochs must be strictly greater than 0".into());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be strictly greater than 0".into());
        }
        if !(self.learning_rate > 0.0) {
            return invalid(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            ));
        }
        if self.log_every_n_steps == 0 {
            return invalid("log_every_n_steps must be strictly greater than 0".into());
        }
        if (self.korean_max_token_length == 0) | (self.english_max_token_length == 0) {
            return invalid("max token lengths must be strictly greater than 0".into());
        }
        if self.save_top_k < -1 {
            return invalid(format!("save_top_k must be -1 or more, got {}", self.save_top_k));
        }
        if !MONITORED_METRICS.contains(&self.monitor.as_str()) {
            return invalid(format!(
                "cannot monitor {}, expected one of {:?}",
                self.monitor, MONITORED_METRICS
            ));
        }
        if let Some(max_norm) = self.gradient_clip_norm {
            if !(max_norm > 0.0) {
                return invalid(format!(
                    "gradient_clip_norm must be positive, got {max_norm}"
                ));
            }
        }
        if self.checkpoint_filename.is_empty() {
            return invalid("checkpoint_filename must not be empty".into());
        }
        Ok(())
    }

    pub fn data_module_config(&self, device: Device) -> DataModuleConfig {
        DataModuleConfig {
            batch_size: self.batch_size,
            korean_max_token_length: self.korean_max_token_length,
            english_max_token_length: self.english_max_token_length,
            direction: self.direction,
            shuffle_seed: self.shuffle_seed,
            device,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_follow_reference_run() {
        let config = TrainingConfig::default();
        assert_eq!(config.max_epochs, 10);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.learning_rate, 1e-5);
        assert_eq!(config.monitor, "val_loss");
        assert_eq!(config.mode, MonitorMode::Min);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: TrainingConfig =
            serde_json::from_str(r#"{"max_epochs": 2, "mode": "max", "direction": "korean-to-english"}"#)
                .unwrap();
        assert_eq!(config.max_epochs, 2);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.mode, MonitorMode::Max);
        assert_eq!(config.direction, TranslationDirection::KoreanToEnglish);
    }

    #[test]
    fn unknown_monitor_is_rejected() {
        let config = TrainingConfig {
            monitor: "bleu".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TranslatorError::InvalidConfigurationError(_))
        ));
    }

    #[test]
    fn monitor_modes_compare() {
        assert!(MonitorMode::Min.is_better(0.5, 1.0));
        assert!(MonitorMode::Max.is_better(1.0, 0.5));
        assert!(!MonitorMode::Min.is_better(f64::NAN, 1.0));
        assert_eq!("max".parse::<MonitorMode>().unwrap(), MonitorMode::Max);
    }
}
