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

use std::sync::Arc;

use crate::data::corpus::SentencePair;
use crate::mt5::IGNORE_INDEX;
use crate::pipelines::tokenizers::Seq2SeqTokenizer;
use crate::pipelines::translation::{pad_sequence, TranslationDirection};
use crate::TranslatorError;

/// A tokenized training example
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationItem {
    pub english: String,
    pub korean: String,
    /// Source token ids padded to the source max length
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    /// Target token ids padded to the target max length, with padding replaced by `IGNORE_INDEX`
    pub labels: Vec<i64>,
    pub labels_attention_mask: Vec<i64>,
}

/// # Translation dataset
/// Tokenizes sentence pairs on access. Sources and targets are padded to their own
/// maximum lengths so that every item of a dataset has the same shape.
#[derive(Debug, Clone)]
pub struct TranslationDataset {
    pairs: Vec<SentencePair>,
    tokenizer: Arc<dyn Seq2SeqTokenizer>,
    direction: TranslationDirection,
    korean_max_token_length: usize,
    english_max_token_length: usize,
}

impl TranslationDataset {
    /// Creates an English to Korean dataset.
    pub fn new(
        pairs: Vec<SentencePair>,
        tokenizer: Arc<dyn Seq2SeqTokenizer>,
        korean_max_token_length: usize,
        english_max_token_length: usize,
    ) -> TranslationDataset {
        TranslationDataset {
            pairs,
            tokenizer,
            direction: TranslationDirection::EnglishToKorean,
            korean_max_token_length,
            english_max_token_length,
        }
    }

    pub fn with_direction(mut self, direction: TranslationDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[SentencePair] {
        &self.pairs
    }

    pub fn direction(&self) -> TranslationDirection {
        self.direction
    }

    /// Length of every source sequence
    pub fn source_length(&self) -> usize {
        match self.direction {
            TranslationDirection::EnglishToKorean => self.english_max_token_length,
            TranslationDirection::KoreanToEnglish => self.korean_max_token_length,
        }
    }

    /// Length of every target sequence
    pub fn target_length(&self) -> usize {
        match self.direction {
            TranslationDirection::EnglishToKorean => self.korean_max_token_length,
            TranslationDirection::KoreanToEnglish => self.english_max_token_length,
        }
    }

    pub fn get(&self, index: usize) -> Result<TranslationItem, TranslatorError> {
        let pair = self.pairs.get(index).ok_or_else(|| {
            TranslatorError::ValueError(format!(
                "index {index} out of range for a dataset of {} items",
                self.len()
            ))
        })?;
        let (source, target) = match self.direction {
            TranslationDirection::EnglishToKorean => (&pair.english, &pair.korean),
            TranslationDirection::KoreanToEnglish => (&pair.korean, &pair.english),
        };
        let pad_id = self.tokenizer.pad_id();

        let (input_ids, attention_mask) =
            self.encode_padded(source, self.source_length(), pad_id);
        let (labels, labels_attention_mask) =
            self.encode_padded(target, self.target_length(), pad_id);
        let labels = labels
            .into_iter()
            .map(|id| if id == pad_id { IGNORE_INDEX } else { id })
            .collect();

        Ok(TranslationItem {
            english: pair.english.clone(),
            korean: pair.korean.clone(),
            input_ids,
            attention_mask,
            labels,
            labels_attention_mask,
        })
    }

    fn encode_padded(&self, text: &str, max_length: usize, pad_id: i64) -> (Vec<i64>, Vec<i64>) {
        pad_sequence(&self.tokenizer.encode(text, max_length), max_length, pad_id)
    }
}
