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

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tch::nn;
use tracing::{debug, info, warn};

use crate::mt5::MT5Config;
use crate::pipelines::translation::{TranslationDirection, CHECKPOINT_CONFIG_FILE};
use crate::training::config::{MonitorMode, TrainingConfig};
use crate::{Config, TranslatorError};

/// Extension of checkpoint weight files
pub const CHECKPOINT_EXTENSION: &str = "ot";

/// Metadata written next to each checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub path: PathBuf,
    pub epoch: usize,
    pub step: usize,
    pub monitor: String,
    pub score: f64,
    /// Direction the weights were trained for, absent from sidecars of older runs
    #[serde(default)]
    pub direction: Option<TranslationDirection>,
}

impl CheckpointRecord {
    /// Sidecar file holding this record
    pub fn metadata_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }

    /// Reads the sidecar of a checkpoint weights file.
    pub fn from_checkpoint<P: AsRef<Path>>(path: P) -> Result<CheckpointRecord, TranslatorError> {
        let metadata_path = path.as_ref().with_extension("json");
        let file = fs::File::open(&metadata_path).map_err(|error| {
            TranslatorError::IOError(format!("{}: {}", metadata_path.display(), error))
        })?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Training direction stored in the sidecar of a checkpoint, if any.
    pub fn recorded_direction<P: AsRef<Path>>(path: P) -> Option<TranslationDirection> {
        match Self::from_checkpoint(path) {
            Ok(record) => record.direction,
            Err(error) => {
                debug!(%error, "no checkpoint metadata");
                None
            }
        }
    }

    /// Deletes the weights and the sidecar. A sidecar already gone is not an error.
    fn remove_files(&self) -> Result<(), TranslatorError> {
        fs::remove_file(&self.path)?;
        match fs::remove_file(self.metadata_path()) {
            Err(error) if error.kind() == ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "checkpoint metadata was already removed");
                Ok(())
            }
            result => Ok(result?),
        }
    }
}

/// # Best-checkpoint tracking
/// Saves the variable store when the monitored metric improves on the `save_top_k` best
/// values seen so far and removes checkpoints falling out of the top `k`.
#[derive(Debug)]
pub struct ModelCheckpoint {
    dirpath: PathBuf,
    filename: String,
    monitor: String,
    mode: MonitorMode,
    save_top_k: i64,
    direction: Option<TranslationDirection>,
    saved: Vec<CheckpointRecord>,
}

impl ModelCheckpoint {
    /// Creates the checkpoint directory. If `<filename>.ot` already exists there, the stem
    /// becomes `<filename>-v1`, `<filename>-v2`, ... until a free name is found.
    pub fn new<P: AsRef<Path>>(
        dirpath: P,
        filename: &str,
        monitor: &str,
        mode: MonitorMode,
        save_top_k: i64,
    ) -> Result<ModelCheckpoint, TranslatorError> {
        let dirpath = dirpath.as_ref().to_path_buf();
        fs::create_dir_all(&dirpath)?;
        let filename = Self::available_filename(&dirpath, filename);
        debug!(dir = %dirpath.display(), %filename, monitor, %mode, save_top_k, "checkpointing");
        Ok(ModelCheckpoint {
            dirpath,
            filename,
            monitor: monitor.to_string(),
            mode,
            save_top_k,
            direction: None,
            saved: Vec::new(),
        })
    }

    /// Records the training direction in every sidecar.
    pub fn with_direction(mut self, direction: TranslationDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn from_config(config: &TrainingConfig) -> Result<ModelCheckpoint, TranslatorError> {
        Self::new(
            &config.checkpoint_dir,
            &config.checkpoint_filename,
            &config.monitor,
            config.mode,
            config.save_top_k,
        )
        .map(|checkpoint| checkpoint.with_direction(config.direction))
    }

    fn available_filename(dirpath: &Path, filename: &str) -> String {
        let taken = |stem: &str| {
            dirpath
                .join(format!("{stem}.{CHECKPOINT_EXTENSION}"))
                .exists()
        };
        if !taken(filename) {
            return filename.to_string();
        }
        (1..)
            .map(|version| format!("{filename}-v{version}"))
            .find(|stem| !taken(stem))
            .unwrap_or_else(|| filename.to_string())
    }

    pub fn monitor(&self) -> &str {
        &self.monitor
    }

    pub fn dirpath(&self) -> &Path {
        &self.dirpath
    }

    /// File stem used for checkpoints, versioned if needed
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Checkpoints currently kept, in save order
    pub fn saved(&self) -> &[CheckpointRecord] {
        &self.saved
    }

    fn best(&self) -> Option<&CheckpointRecord> {
        let ordered = self.saved.iter();
        match self.mode {
            MonitorMode::Min => ordered.min_by_key(|record| OrderedFloat(record.score)),
            MonitorMode::Max => ordered.max_by_key(|record| OrderedFloat(record.score)),
        }
    }

    fn worst_index(&self) -> Option<usize> {
        let ordered = self.saved.iter().enumerate();
        let worst = match self.mode {
            MonitorMode::Min => ordered.max_by_key(|(_, record)| OrderedFloat(record.score)),
            MonitorMode::Max => ordered.min_by_key(|(_, record)| OrderedFloat(record.score)),
        };
        worst.map(|(index, _)| index)
    }

    pub fn best_model_path(&self) -> Option<&Path> {
        self.best().map(|record| record.path.as_path())
    }

    pub fn best_model_score(&self) -> Option<f64> {
        self.best().map(|record| record.score)
    }

    fn checkpoint_path(&self, epoch: usize, step: usize) -> PathBuf {
        let stem = if self.save_top_k == 1 {
            self.filename.clone()
        } else {
            format!("{}-epoch={epoch}-step={step}", self.filename)
        };
        self.dirpath.join(format!("{stem}.{CHECKPOINT_EXTENSION}"))
    }

    fn should_save(&self, score: f64) -> bool {
        if self.save_top_k == 0 || score.is_nan() {
            return false;
        }
        if self.save_top_k < 0 || (self.saved.len() as i64) < self.save_top_k {
            return true;
        }
        self.worst_index()
            .map_or(true, |index| self.mode.is_better(score, self.saved[index].score))
    }

    /// Records the monitored `score` for an epoch, saving the weights if it ranks in the top `k`.
    ///
    /// # Returns
    ///
    /// * path of the saved checkpoint, `None` if the score did not rank
    pub fn update(
        &mut self,
        var_store: &nn::VarStore,
        model_config: &MT5Config,
        score: f64,
        epoch: usize,
        step: usize,
    ) -> Result<Option<PathBuf>, TranslatorError> {
        if !self.should_save(score) {
            info!(
                epoch,
                step,
                monitor = %self.monitor,
                score,
                best = ?self.best_model_score(),
                "monitored metric did not rank in the top checkpoints"
            );
            return Ok(None);
        }

        let previous_best = self.best_model_score();
        let path = self.checkpoint_path(epoch, step);
        var_store.save(&path)?;
        let record = CheckpointRecord {
            path: path.clone(),
            epoch,
            step,
            monitor: self.monitor.clone(),
            score,
            direction: self.direction,
        };
        fs::write(
            record.metadata_path(),
            serde_json::to_string_pretty(&record)?,
        )?;
        model_config.to_file(self.dirpath.join(CHECKPOINT_CONFIG_FILE))?;

        self.saved.retain(|saved| saved.path != path);
        self.saved.push(record);
        if self.save_top_k > 0 && self.saved.len() as i64 > self.save_top_k {
            if let Some(index) = self.worst_index() {
                let removed = self.saved.remove(index);
                if removed.path != path {
                    removed.remove_files()?;
                }
            }
        }

        info!(
            epoch,
            step,
            monitor = %self.monitor,
            score,
            previous_best = ?previous_best,
            path = %path.display(),
            "saved checkpoint"
        );
        Ok(Some(path))
    }
}
