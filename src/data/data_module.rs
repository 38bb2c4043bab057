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

use tch::Device;
use tracing::info;

use crate::data::corpus::SentencePair;
use crate::data::dataset::TranslationDataset;
use crate::data::loader::DataLoader;
use crate::pipelines::tokenizers::Seq2SeqTokenizer;
use crate::pipelines::translation::TranslationDirection;
use crate::TranslatorError;

/// Batching and tokenization settings shared by the training and held-out datasets
#[derive(Debug, Clone)]
pub struct DataModuleConfig {
    pub batch_size: usize,
    pub korean_max_token_length: usize,
    pub english_max_token_length: usize,
    pub direction: TranslationDirection,
    /// Seed for shuffling the training set, `None` keeps corpus order
    pub shuffle_seed: Option<u64>,
    pub device: Device,
}

impl Default for DataModuleConfig {
    fn default() -> Self {
        DataModuleConfig {
            batch_size: 8,
            korean_max_token_length: 512,
            english_max_token_length: 512,
            direction: TranslationDirection::EnglishToKorean,
            shuffle_seed: None,
            device: Device::cuda_if_available(),
        }
    }
}

/// # Training and held-out datasets
/// Validation and test loaders both iterate over the held-out set.
#[derive(Debug)]
pub struct TranslationDataModule {
    train_dataset: TranslationDataset,
    test_dataset: TranslationDataset,
    config: DataModuleConfig,
}

impl TranslationDataModule {
    pub fn new(
        train_pairs: Vec<SentencePair>,
        test_pairs: Vec<SentencePair>,
        tokenizer: Arc<dyn Seq2SeqTokenizer>,
        config: DataModuleConfig,
    ) -> TranslationDataModule {
        let build = |pairs: Vec<SentencePair>| {
            TranslationDataset::new(
                pairs,
                tokenizer.clone(),
                config.korean_max_token_length,
                config.english_max_token_length,
            )
            .with_direction(config.direction)
        };
        let train_dataset = build(train_pairs);
        let test_dataset = build(test_pairs);
        info!(
            train = train_dataset.len(),
            held_out = test_dataset.len(),
            batch_size = config.batch_size,
            direction = %config.direction,
            "data module ready"
        );
        TranslationDataModule {
            train_dataset,
            test_dataset,
            config,
        }
    }

    pub fn train_dataset(&self) -> &TranslationDataset {
        &self.train_dataset
    }

    pub fn test_dataset(&self) -> &TranslationDataset {
        &self.test_dataset
    }

    pub fn config(&self) -> &DataModuleConfig {
        &self.config
    }

    pub fn train_dataloader(&self) -> Result<DataLoader<'_>, TranslatorError> {
        Ok(
            DataLoader::new(&self.train_dataset, self.config.batch_size, self.config.device)?
                .with_shuffle(self.config.shuffle_seed),
        )
    }

    pub fn val_dataloader(&self) -> Result<DataLoader<'_>, TranslatorError> {
        DataLoader::new(&self.test_dataset, self.config.batch_size, self.config.device)
    }

    pub fn test_dataloader(&self) -> Result<DataLoader<'_>, TranslatorError> {
        DataLoader::new(&self.test_dataset, self.config.batch_size, self.config.device)
    }
}
