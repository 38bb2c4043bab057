//! # Inference pipelines
//!
//! - `generation_utils`: greedy, sampling and beam search decoding for encoder-decoder models
//! - `tokenizers`: the `Seq2SeqTokenizer` abstraction and the sentencepiece `MT5Tokenizer`
//! - `translation`: end-to-end English/Korean translation from a trained checkpoint
//!
//! ```no_run
//! use mt5_translator::mt5::MT5VocabResources;
//! use mt5_translator::pipelines::translation::TranslationModel;
//! use mt5_translator::resources::RemoteResource;
//!
//! # fn main() -> anyhow::Result<()> {
//! let model = TranslationModel::from_checkpoint(
//!     "checkpoints/best-checkpoint.ot",
//!     RemoteResource::from_pretrained(MT5VocabResources::MT5_SMALL),
//!     None,
//! )?;
//! let korean = model.translate_joined("How are you?")?;
//! # Ok(())
//! # }
//! ```

pub mod generation_utils;
pub mod tokenizers;
pub mod translation;
