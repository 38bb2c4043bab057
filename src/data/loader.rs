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

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tch::{Device, Tensor};

use crate::data::dataset::{TranslationDataset, TranslationItem};
use crate::TranslatorError;

/// A batch of tokenized examples stacked into tensors of shape (*batch size*, *sequence length*)
#[derive(Debug)]
pub struct TranslationBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub labels: Tensor,
    pub labels_attention_mask: Tensor,
    pub english: Vec<String>,
    pub korean: Vec<String>,
}

impl TranslationBatch {
    /// Stacks items of identical shapes.
    pub fn collate(items: Vec<TranslationItem>, device: Device) -> Result<Self, TranslatorError> {
        let first = items
            .first()
            .ok_or_else(|| TranslatorError::DatasetError("cannot collate an empty batch".into()))?;
        let source_length = first.input_ids.len();
        let target_length = first.labels.len();
        if items.iter().any(|item| {
            item.input_ids.len() != source_length
                || item.attention_mask.len() != source_length
                || item.labels.len() != target_length
                || item.labels_attention_mask.len() != target_length
        }) {
            return Err(TranslatorError::DatasetError(
                "batch items have inconsistent sequence lengths".into(),
            ));
        }

        let batch_size = items.len() as i64;
        let stack = |rows: Vec<&[i64]>, length: usize| {
            Tensor::from_slice(&rows.concat())
                .view((batch_size, length as i64))
                .to(device)
        };
        let input_ids = stack(items.iter().map(|i| i.input_ids.as_slice()).collect(), source_length);
        let attention_mask = stack(
            items.iter().map(|i| i.attention_mask.as_slice()).collect(),
            source_length,
        );
        let labels = stack(items.iter().map(|i| i.labels.as_slice()).collect(), target_length);
        let labels_attention_mask = stack(
            items
                .iter()
                .map(|i| i.labels_attention_mask.as_slice())
                .collect(),
            target_length,
        );
        let (english, korean) = items
            .into_iter()
            .map(|item| (item.english, item.korean))
            .unzip();

        Ok(TranslationBatch {
            input_ids,
            attention_mask,
            labels,
            labels_attention_mask,
            english,
            korean,
        })
    }

    pub fn len(&self) -> usize {
        self.english.len()
    }

    pub fn is_empty(&self) -> bool {
        self.english.is_empty()
    }
}

/// # Batched iteration over a `TranslationDataset`
/// Batches follow dataset order unless shuffling is enabled. The last batch may be smaller.
#[derive(Debug)]
pub struct DataLoader<'a> {
    dataset: &'a TranslationDataset,
    batch_size: usize,
    shuffle_seed: Option<u64>,
    device: Device,
}

impl<'a> DataLoader<'a> {
    pub fn new(
        dataset: &'a TranslationDataset,
        batch_size: usize,
        device: Device,
    ) -> Result<DataLoader<'a>, TranslatorError> {
        if batch_size == 0 {
            return Err(TranslatorError::ValueError(
                "batch_size must be strictly greater than 0".into(),
            ));
        }
        Ok(DataLoader {
            dataset,
            batch_size,
            shuffle_seed: None,
            device,
        })
    }

    /// Shuffles the dataset order at every epoch, from a generator seeded with `seed + epoch`.
    pub fn with_shuffle(mut self, seed: impl Into<Option<u64>>) -> Self {
        self.shuffle_seed = seed.into();
        self
    }

    /// Number of batches per epoch
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn iter(&self) -> DataLoaderIter<'_> {
        self.iter_epoch(0)
    }

    pub fn iter_epoch(&self, epoch: usize) -> DataLoaderIter<'_> {
        let mut order = (0..self.dataset.len()).collect::<Vec<usize>>();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        DataLoaderIter {
            dataset: self.dataset,
            order,
            position: 0,
            batch_size: self.batch_size,
            device: self.device,
        }
    }
}

pub struct DataLoaderIter<'a> {
    dataset: &'a TranslationDataset,
    order: Vec<usize>,
    position: usize,
    batch_size: usize,
    device: Device,
}

impl<'a> Iterator for DataLoaderIter<'a> {
    type Item = Result<TranslationBatch, TranslatorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let indices = &self.order[self.position..end];
        self.position = end;
        Some(
            indices
                .iter()
                .map(|index| self.dataset.get(*index))
                .collect::<Result<Vec<TranslationItem>, TranslatorError>>()
                .and_then(|items| TranslationBatch::collate(items, self.device)),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.position).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for DataLoaderIter<'a> {}
