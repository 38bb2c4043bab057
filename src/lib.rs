//! Korean/English machine translation by fine-tuning a pretrained MT5 model, on top of the
//! [tch-rs](https://github.com/LaurentMazare/tch-rs) libtorch bindings and the sentencepiece
//! tokenizer of [rust_tokenizers](https://github.com/guillaume-be/rust-tokenizers).
//!
//! The crate covers the full pipeline:
//! - `data`: loading a directory of parallel-corpus CSV files, tokenized datasets and batching
//! - `mt5`: the MT5 encoder-decoder with a language modeling head
//! - `training`: the optimization loop, checkpointing of the best model and metric logging
//! - `pipelines`: greedy and beam search decoding, and the `TranslationModel` inference pipeline
//!
//! # Quick start
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use mt5_translator::mt5::MT5VocabResources;
//! use mt5_translator::pipelines::translation::TranslationModel;
//! use mt5_translator::resources::RemoteResource;
//!
//! let model = TranslationModel::from_checkpoint(
//!     "checkpoints/best-checkpoint.ot",
//!     RemoteResource::from_pretrained(MT5VocabResources::MT5_SMALL),
//!     None,
//! )?;
//! let output = model.translate_joined("The weather is nice today.")?;
//! println!("{output}");
//! # Ok(())
//! # }
//! ```
//!
//! # Loading pretrained weights
//!
//! Pretrained weights published as PyTorch checkpoints must be converted to the `.ot` format:
//! 1. export the state dictionary to a numpy `.npz` archive
//! 2. run `cargo run --bin=convert-tensor --release -- model.npz rust_model.ot`
//!
//! Checkpoints written by the `Trainer` are already in this format and come with their
//! `config.json`.

pub mod common;
pub mod data;
pub mod mt5;
pub mod pipelines;
pub mod training;

pub use common::error::TranslatorError;
pub use common::resources;
pub use common::Config;
