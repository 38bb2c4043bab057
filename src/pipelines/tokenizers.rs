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

//! # Tokenization for sequence-to-sequence models
//!
//! The `Seq2SeqTokenizer` trait is the seam between text and the model: datasets and the
//! translation pipeline only rely on encoding a sentence to ids (with truncation and a trailing
//! end-of-sequence token) and decoding ids back to text.

use std::fmt::Debug;
use std::path::Path;

use rust_tokenizers::tokenizer::{T5Tokenizer, Tokenizer, TruncationStrategy};
use rust_tokenizers::vocab::T5Vocab;

use crate::resources::ResourceProvider;
use crate::TranslatorError;

/// Tokenizer interface used by datasets and translation.
pub trait Seq2SeqTokenizer: Debug + Send + Sync {
    /// Encodes a single sentence, truncated so that the ids (end-of-sequence included) fit in `max_len`.
    fn encode(&self, text: &str, max_len: usize) -> Vec<i64>;

    /// Decodes token ids to a string.
    fn decode(
        &self,
        token_ids: &[i64],
        skip_special_tokens: bool,
        clean_up_tokenization_spaces: bool,
    ) -> String;

    fn pad_id(&self) -> i64;

    fn eos_id(&self) -> i64;
}

/// # Sentencepiece tokenizer for MT5
pub struct MT5Tokenizer {
    tokenizer: T5Tokenizer,
    pad_id: i64,
    eos_id: i64,
}

impl Debug for MT5Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MT5Tokenizer")
            .field("pad_id", &self.pad_id)
            .field("eos_id", &self.eos_id)
            .finish()
    }
}

impl MT5Tokenizer {
    /// Loads a sentencepiece model file (`spiece.model`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<MT5Tokenizer, TranslatorError> {
        let tokenizer = T5Tokenizer::from_file(&path.as_ref().to_string_lossy(), false)?;
        let special_ids =
            tokenizer.convert_tokens_to_ids(&[T5Vocab::pad_value(), T5Vocab::eos_value()]);
        let (pad_id, eos_id) = match special_ids.as_slice() {
            [pad_id, eos_id] => (*pad_id, *eos_id),
            _ => {
                return Err(TranslatorError::TokenizerError(
                    "sentencepiece model is missing the padding or end-of-sequence token"
                        .to_string(),
                ))
            }
        };
        Ok(MT5Tokenizer {
            tokenizer,
            pad_id,
            eos_id,
        })
    }

    pub fn from_resource(resource: &dyn ResourceProvider) -> Result<MT5Tokenizer, TranslatorError> {
        Self::from_file(resource.get_local_path()?)
    }
}

impl Seq2SeqTokenizer for MT5Tokenizer {
    fn encode(&self, text: &str, max_len: usize) -> Vec<i64> {
        self.tokenizer
            .encode(text, None, max_len, &TruncationStrategy::LongestFirst, 0)
            .token_ids
    }

    fn decode(
        &self,
        token_ids: &[i64],
        skip_special_tokens: bool,
        clean_up_tokenization_spaces: bool,
    ) -> String {
        self.tokenizer
            .decode(token_ids, skip_special_tokens, clean_up_tokenization_spaces)
    }

    fn pad_id(&self) -> i64 {
        self.pad_id
    }

    fn eos_id(&self) -> i64 {
        self.eos_id
    }
}
