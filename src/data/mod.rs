//! # Parallel corpus loading and batching
//!
//! The corpus is a directory of CSV files with Korean (`한국어`) and English (`영어`) columns,
//! optional word counts (`한국어_어절수`, `영어_단어수`) and metadata columns that are ignored.
//! `load_corpus` assembles the sentence pairs, `TranslationDataset` tokenizes them,
//! `DataLoader` stacks them into `TranslationBatch` tensors and `TranslationDataModule`
//! hands out the training and held-out loaders.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use mt5_translator::data::{load_corpus, DataModuleConfig, TranslationDataModule};
//! use mt5_translator::pipelines::tokenizers::MT5Tokenizer;
//!
//! let tokenizer = Arc::new(MT5Tokenizer::from_file("path/to/spiece.model")?);
//! let train = load_corpus("dataset/training")?;
//! let validation = load_corpus("dataset/validation")?;
//! let data_module = TranslationDataModule::new(
//!     train,
//!     validation,
//!     tokenizer,
//!     DataModuleConfig {
//!         batch_size: 16,
//!         ..Default::default()
//!     },
//! );
//! for batch in data_module.train_dataloader()?.iter() {
//!     let batch = batch?;
//! }
//! # Ok(())
//! # }
//! ```

mod corpus;
mod data_module;
mod dataset;
mod loader;
mod split;

pub use corpus::{corpus_files, load_corpus, read_corpus_file, SentencePair, DROPPED_COLUMNS};
pub use data_module::{DataModuleConfig, TranslationDataModule};
pub use dataset::{TranslationDataset, TranslationItem};
pub use loader::{DataLoader, DataLoaderIter, TranslationBatch};
pub use split::train_test_split;
