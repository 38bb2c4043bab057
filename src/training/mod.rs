//! # Fine-tuning
//!
//! A `Trainer` drives a `TranslationModule` over the loaders of a `TranslationDataModule`:
//! AdamW optimization with an optional linear warm-up schedule and gradient clipping, a
//! validation pass after each epoch, best-checkpoint selection by `ModelCheckpoint` and
//! metric logging by `MetricsLogger`.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use mt5_translator::data::{load_corpus, TranslationDataModule};
//! use mt5_translator::mt5::MT5ConfigResources;
//! use mt5_translator::pipelines::tokenizers::MT5Tokenizer;
//! use mt5_translator::resources::{LocalResource, RemoteResource};
//! use mt5_translator::training::{Trainer, TrainingConfig, TranslationModule};
//! use std::path::PathBuf;
//! use tch::Device;
//!
//! let device = Device::cuda_if_available();
//! let config = TrainingConfig::default();
//! let tokenizer = Arc::new(MT5Tokenizer::from_file("path/to/spiece.model")?);
//! let data = TranslationDataModule::new(
//!     load_corpus("dataset/training")?,
//!     load_corpus("dataset/validation")?,
//!     tokenizer,
//!     config.data_module_config(device),
//! );
//! let mut module = TranslationModule::new(
//!     &RemoteResource::from_pretrained(MT5ConfigResources::MT5_SMALL),
//!     Some(&LocalResource::from(PathBuf::from("path/to/rust_model.ot"))),
//!     device,
//! )?;
//! let mut trainer = Trainer::new(config)?;
//! let summary = trainer.fit(&mut module, &data)?;
//! println!("best checkpoint: {:?}", summary.best_model_path);
//! # Ok(())
//! # }
//! ```

mod checkpoint;
mod config;
mod logger;
mod module;
mod scheduler;
mod trainer;

pub use checkpoint::{CheckpointRecord, ModelCheckpoint, CHECKPOINT_EXTENSION};
pub use config::{MonitorMode, TrainingConfig, MONITORED_METRICS};
pub use logger::{MetricsLogger, HPARAMS_FILE, METRICS_FILE};
pub use module::TranslationModule;
pub use scheduler::LinearScheduleWithWarmup;
pub use trainer::{FitSummary, Trainer};
