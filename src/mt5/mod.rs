//! # MT5 (Multilingual Text-To-Text Transfer Transformer)
//!
//! Implementation of the MT5 language model ([mT5: A massively multilingual pre-trained text-to-text transformer](https://arxiv.org/abs/2010.11934) Xue, Constant, Roberts, Kale, Al-Rfou, Siddhant, Barua, Raffel, 2020).
//! The base model is implemented in the `mt5_model::MT5Model` struct. A language modeling head with
//! a label-conditioned loss is implemented in `MT5ForConditionalGeneration`, and `MT5Generator` binds it
//! to the decoding utilities of `pipelines::generation_utils`.
//!
//! # Model set-up and pre-trained weights loading
//!
//! Pretrained weights published as PyTorch checkpoints are first exported to `.npz` and converted
//! with the `convert-tensor` binary. The configuration and sentencepiece model can be fetched from
//! the Hugging Face hub with the `MT5ConfigResources` and `MT5VocabResources` presets.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use mt5_translator::mt5::{MT5Config, MT5ForConditionalGeneration};
//! use mt5_translator::resources::{LocalResource, ResourceProvider};
//! use mt5_translator::Config;
//! use std::path::PathBuf;
//! use tch::{nn, Device};
//!
//! let config_resource = LocalResource {
//!     local_path: PathBuf::from("path/to/config.json"),
//! };
//! let weights_resource = LocalResource {
//!     local_path: PathBuf::from("path/to/model.ot"),
//! };
//! let config = MT5Config::from_file(config_resource.get_local_path()?)?;
//! let mut vs = nn::VarStore::new(Device::cuda_if_available());
//! let mt5_model = MT5ForConditionalGeneration::new(vs.root(), &config);
//! vs.load(weights_resource.get_local_path()?)?;
//! # Ok(())
//! # }
//! ```

mod attention;
mod encoder;
mod layer_norm;
mod mt5_model;

pub use attention::LayerState;
pub use encoder::DecoderLayerCache;
pub use mt5_model::{
    FeedForwardProj, MT5Config, MT5ConfigResources, MT5ForConditionalGeneration, MT5Generator,
    MT5Model, MT5ModelOutput, MT5VocabResources, Seq2SeqLMOutput, IGNORE_INDEX,
};
