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

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::TranslatorError;

pub const METRICS_FILE: &str = "metrics.csv";
pub const HPARAMS_FILE: &str = "hparams.json";

#[derive(Debug, Serialize)]
struct MetricRow<'a> {
    step: usize,
    epoch: usize,
    metric: &'a str,
    value: f64,
}

/// # Metric logger
/// Each run writes to `<root>/<name>/version_<n>`, where `n` is the next free version, a
/// `metrics.csv` file with one `(step, epoch, metric, value)` row per logged value and the
/// run hyper-parameters in `hparams.json`.
pub struct MetricsLogger {
    log_dir: PathBuf,
    version: usize,
    writer: csv::Writer<File>,
}

impl MetricsLogger {
    pub fn new<P: AsRef<Path>>(root: P, name: &str) -> Result<MetricsLogger, TranslatorError> {
        let experiment_dir = root.as_ref().join(name);
        fs::create_dir_all(&experiment_dir)?;
        let version = Self::next_version(&experiment_dir)?;
        let log_dir = experiment_dir.join(format!("version_{version}"));
        fs::create_dir_all(&log_dir)?;
        let writer = csv::Writer::from_path(log_dir.join(METRICS_FILE))?;
        debug!(log_dir = %log_dir.display(), "metrics logger ready");
        Ok(MetricsLogger {
            log_dir,
            version,
            writer,
        })
    }

    fn next_version(experiment_dir: &Path) -> Result<usize, TranslatorError> {
        let mut next = 0;
        for entry in fs::read_dir(experiment_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(version) = name
                .to_str()
                .and_then(|name| name.strip_prefix("version_"))
                .and_then(|version| version.parse::<usize>().ok())
            {
                next = next.max(version + 1);
            }
        }
        Ok(next)
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn version(&self) -> usize {
        self.version
    }

    pub fn log_metric(
        &mut self,
        metric: &str,
        value: f64,
        epoch: usize,
        step: usize,
    ) -> Result<(), TranslatorError> {
        self.writer.serialize(MetricRow {
            step,
            epoch,
            metric,
            value,
        })?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn log_hyperparams<T: Serialize>(&self, hyperparams: &T) -> Result<(), TranslatorError> {
        fs::write(
            self.log_dir.join(HPARAMS_FILE),
            serde_json::to_string_pretty(hyperparams)?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn runs_get_successive_versions() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let first = MetricsLogger::new(root.path(), "translator")?;
        let second = MetricsLogger::new(root.path(), "translator")?;
        assert_eq!(first.version(), 0);
        assert_eq!(second.version(), 1);
        assert!(second.log_dir().ends_with("translator/version_1"));
        Ok(())
    }

    #[test]
    fn metrics_are_written_as_rows() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let mut logger = MetricsLogger::new(root.path(), "translator")?;
        logger.log_metric("train_loss", 1.5, 0, 10)?;
        logger.log_metric("val_loss", 1.25, 0, 10)?;
        logger.log_hyperparams(&serde_json::json!({ "learning_rate": 1e-5 }))?;

        let content = fs::read_to_string(logger.log_dir().join(METRICS_FILE))?;
        let lines = content.lines().collect::<Vec<&str>>();
        assert_eq!(lines[0], "step,epoch,metric,value");
        assert_eq!(lines[1], "10,0,train_loss,1.5");
        assert_eq!(lines.len(), 3);
        assert!(logger.log_dir().join(HPARAMS_FILE).exists());
        Ok(())
    }
}
