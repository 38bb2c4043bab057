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

//! # Translation pipeline
//!
//! Translation between English and Korean with a fine-tuned MT5 model. The `TranslationConfig`
//! holds the model resources (weights, configuration and sentencepiece model), the device and
//! the decoding settings. Defaults reproduce the reference inference call: beam search with
//! 8 beams, outputs of at most 256 tokens, a repetition penalty of 2.5 and a length penalty of 2.0.
//!
//! ```no_run
//! use mt5_translator::pipelines::translation::TranslationModel;
//! use mt5_translator::mt5::MT5VocabResources;
//! use mt5_translator::resources::RemoteResource;
//! use tch::Device;
//!
//! fn main() -> anyhow::Result<()> {
//!     let vocab_resource = RemoteResource::from_pretrained(MT5VocabResources::MT5_SMALL);
//!     let model = TranslationModel::from_checkpoint(
//!         "checkpoints/best-checkpoint.ot",
//!         vocab_resource,
//!         Device::cuda_if_available(),
//!     )?;
//!     let output = model.translate(&["The weather is nice today."])?;
//!     println!("{:?}", output);
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};
use tracing::{debug, warn};

use crate::mt5::MT5Generator;
use crate::pipelines::generation_utils::{GenerateConfig, LanguageGenerator};
use crate::pipelines::tokenizers::{MT5Tokenizer, Seq2SeqTokenizer};
use crate::resources::{LocalResource, ResourceProvider};
use crate::training::CheckpointRecord;
use crate::TranslatorError;

/// Name of the model configuration file stored next to checkpoint weights
pub const CHECKPOINT_CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    Korean,
    English,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Language::Korean => "Korean",
                Language::English => "English",
            }
        )
    }
}

/// Source and target languages of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TranslationDirection {
    /// English sources, Korean targets
    #[default]
    EnglishToKorean,
    KoreanToEnglish,
}

impl TranslationDirection {
    pub fn source(&self) -> Language {
        match self {
            TranslationDirection::EnglishToKorean => Language::English,
            TranslationDirection::KoreanToEnglish => Language::Korean,
        }
    }

    pub fn target(&self) -> Language {
        match self {
            TranslationDirection::EnglishToKorean => Language::Korean,
            TranslationDirection::KoreanToEnglish => Language::English,
        }
    }

    /// Direction to run a checkpoint in: the requested one, else the one recorded at training time.
    pub fn resolve(
        requested: Option<TranslationDirection>,
        recorded: Option<TranslationDirection>,
    ) -> TranslationDirection {
        match (requested, recorded) {
            (Some(requested), Some(recorded)) if requested != recorded => {
                warn!(%requested, %recorded, "checkpoint was trained for the other direction");
                requested
            }
            (requested, recorded) => requested.or(recorded).unwrap_or_default(),
        }
    }
}

impl fmt::Display for TranslationDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TranslationDirection::EnglishToKorean => write!(f, "en-ko"),
            TranslationDirection::KoreanToEnglish => write!(f, "ko-en"),
        }
    }
}

impl FromStr for TranslationDirection {
    type Err = TranslatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "en-ko" | "english-to-korean" => Ok(TranslationDirection::EnglishToKorean),
            "ko-en" | "korean-to-english" => Ok(TranslationDirection::KoreanToEnglish),
            _ => Err(TranslatorError::ValueError(format!(
                "unknown translation direction {s}, expected en-ko or ko-en"
            ))),
        }
    }
}

/// Decoding settings of the reference inference call
pub fn default_translation_generate_config() -> GenerateConfig {
    GenerateConfig {
        max_length: 256,
        num_beams: 8,
        repetition_penalty: 2.5,
        length_penalty: 2.0,
        early_stopping: true,
        ..Default::default()
    }
}

/// # Configuration for text translation
/// Contains information regarding the model to load and the decoding settings, and sets the device to place the model on.
pub struct TranslationConfig {
    /// Model weights resource (converted pretrained weights or a training checkpoint)
    pub model_resource: Box<dyn ResourceProvider>,
    /// Config resource
    pub config_resource: Box<dyn ResourceProvider>,
    /// Sentencepiece model resource
    pub vocab_resource: Box<dyn ResourceProvider>,
    /// Direction the model was trained for (default: English to Korean)
    pub direction: TranslationDirection,
    /// Optional prefix prepended to every source sentence
    pub prefix: Option<String>,
    /// Maximum number of source tokens, end-of-sequence included (default: 512)
    pub source_max_length: usize,
    /// Pads every batch to `source_max_length` instead of the longest source (default: false)
    pub pad_to_max_length: bool,
    /// Decoding settings
    pub generate_config: GenerateConfig,
    /// Device to place the model on (default: CUDA/GPU when available)
    pub device: Device,
}

impl TranslationConfig {
    /// Create a new `TranslationConfig` from resources.
    ///
    /// # Arguments
    ///
    /// * `model_resource` - weights to load
    /// * `config_resource` - model configuration
    /// * `vocab_resource` - sentencepiece model
    /// * `device` - `Device` to place the model on (CPU/GPU), defaults to CUDA when available
    pub fn new<RM, RC, RV>(
        model_resource: RM,
        config_resource: RC,
        vocab_resource: RV,
        device: impl Into<Option<Device>>,
    ) -> TranslationConfig
    where
        RM: ResourceProvider + 'static,
        RC: ResourceProvider + 'static,
        RV: ResourceProvider + 'static,
    {
        TranslationConfig {
            model_resource: Box::new(model_resource),
            config_resource: Box::new(config_resource),
            vocab_resource: Box::new(vocab_resource),
            direction: TranslationDirection::default(),
            prefix: None,
            source_max_length: 512,
            pad_to_max_length: false,
            generate_config: default_translation_generate_config(),
            device: device.into().unwrap_or_else(Device::cuda_if_available),
        }
    }

    /// Configuration for a training checkpoint: the weights file and the `config.json` saved next to it.
    /// The direction is read from the checkpoint metadata when present.
    pub fn from_checkpoint<P, RV>(
        checkpoint_path: P,
        vocab_resource: RV,
        device: impl Into<Option<Device>>,
    ) -> TranslationConfig
    where
        P: AsRef<Path>,
        RV: ResourceProvider + 'static,
    {
        let checkpoint_path = checkpoint_path.as_ref().to_path_buf();
        let config_path = checkpoint_config_path(&checkpoint_path);
        let recorded_direction = CheckpointRecord::recorded_direction(&checkpoint_path);
        TranslationConfig {
            direction: recorded_direction.unwrap_or_default(),
            ..TranslationConfig::new(
                LocalResource::from(checkpoint_path),
                LocalResource::from(config_path),
                vocab_resource,
                device,
            )
        }
    }
}

/// Location of the model configuration written alongside checkpoint weights
pub fn checkpoint_config_path(checkpoint_path: &Path) -> PathBuf {
    checkpoint_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(CHECKPOINT_CONFIG_FILE)
}

/// # TranslationModel to perform translation
pub struct TranslationModel {
    generator: MT5Generator,
    tokenizer: Arc<dyn Seq2SeqTokenizer>,
    direction: TranslationDirection,
    prefix: Option<String>,
    source_max_length: usize,
    pad_to_max_length: bool,
}

impl TranslationModel {
    /// Build a new `TranslationModel`
    ///
    /// # Arguments
    ///
    /// * `translation_config` - `TranslationConfig` object containing the resource references (model, vocabulary, configuration), translation options and device placement (CPU/GPU)
    pub fn new(translation_config: TranslationConfig) -> Result<TranslationModel, TranslatorError> {
        let tokenizer = MT5Tokenizer::from_resource(translation_config.vocab_resource.as_ref())?;
        let generator = MT5Generator::new(
            translation_config.config_resource.as_ref(),
            translation_config.model_resource.as_ref(),
            translation_config.device,
            translation_config.generate_config,
        )?;
        Ok(TranslationModel {
            generator,
            tokenizer: Arc::new(tokenizer),
            direction: translation_config.direction,
            prefix: translation_config.prefix,
            source_max_length: translation_config.source_max_length,
            pad_to_max_length: translation_config.pad_to_max_length,
        })
    }

    /// Loads frozen weights from a training checkpoint, with the default decoding settings.
    pub fn from_checkpoint<P, RV>(
        checkpoint_path: P,
        vocab_resource: RV,
        device: impl Into<Option<Device>>,
    ) -> Result<TranslationModel, TranslatorError>
    where
        P: AsRef<Path>,
        RV: ResourceProvider + 'static,
    {
        Self::new(TranslationConfig::from_checkpoint(
            checkpoint_path,
            vocab_resource,
            device,
        ))
    }

    /// Assembles a model from an existing generator and tokenizer, e.g. right after training.
    pub fn from_parts(
        generator: MT5Generator,
        tokenizer: Arc<dyn Seq2SeqTokenizer>,
        direction: TranslationDirection,
        source_max_length: usize,
    ) -> TranslationModel {
        TranslationModel {
            generator,
            tokenizer,
            direction,
            prefix: None,
            source_max_length,
            pad_to_max_length: false,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<Option<String>>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_pad_to_max_length(mut self, pad_to_max_length: bool) -> Self {
        self.pad_to_max_length = pad_to_max_length;
        self
    }

    pub fn direction(&self) -> TranslationDirection {
        self.direction
    }

    pub fn generator_mut(&mut self) -> &mut MT5Generator {
        &mut self.generator
    }

    /// Translates texts provided
    ///
    /// # Arguments
    /// * `texts` - `&[&str]` Array of texts to translate.
    ///
    /// # Returns
    /// * `Vec<String>` Translated texts, `num_return_sequences` per input
    pub fn translate<S>(&self, texts: &[S]) -> Result<Vec<String>, TranslatorError>
    where
        S: AsRef<str>,
    {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let (input_ids, attention_mask) = self.encode_sources(texts)?;
        debug!(
            source = %self.direction.source(),
            target = %self.direction.target(),
            batch_size = texts.len(),
            source_length = input_ids.size()[1],
            "translating"
        );
        let generated = self
            .generator
            .generate_indices(&input_ids, Some(&attention_mask), None, None)?;
        Ok(generated
            .iter()
            .map(|token_ids| self.tokenizer.decode(token_ids, true, true))
            .collect())
    }

    /// Translates a single text and concatenates the decoded outputs.
    pub fn translate_joined(&self, text: &str) -> Result<String, TranslatorError> {
        Ok(self.translate(&[text])?.join(""))
    }

    fn encode_sources<S>(&self, texts: &[S]) -> Result<(Tensor, Tensor), TranslatorError>
    where
        S: AsRef<str>,
    {
        let token_ids = texts
            .iter()
            .map(|text| match &self.prefix {
                Some(prefix) => self
                    .tokenizer
                    .encode(&format!("{}{}", prefix, text.as_ref()), self.source_max_length),
                None => self.tokenizer.encode(text.as_ref(), self.source_max_length),
            })
            .collect::<Vec<Vec<i64>>>();

        let longest = token_ids.iter().map(Vec::len).max().unwrap_or(0);
        let padded_length = if self.pad_to_max_length {
            self.source_max_length.max(longest)
        } else {
            longest
        };
        if padded_length == 0 {
            return Err(TranslatorError::ValueError(
                "tokenizer produced no tokens for the inputs".to_string(),
            ));
        }

        let pad_id = self.tokenizer.pad_id();
        let device = self.generator_device();
        let mut input_ids = Vec::with_capacity(token_ids.len());
        let mut attention_masks = Vec::with_capacity(token_ids.len());
        for ids in token_ids {
            let (padded, mask) = pad_sequence(&ids, padded_length, pad_id);
            input_ids.push(Tensor::from_slice(&padded));
            attention_masks.push(Tensor::from_slice(&mask));
        }
        Ok((
            Tensor::stack(&input_ids, 0).to(device),
            Tensor::stack(&attention_masks, 0)
                .to_kind(Kind::Int64)
                .to(device),
        ))
    }

    fn generator_device(&self) -> Device {
        use crate::pipelines::generation_utils::private_generation_utils::PrivateLanguageGenerator;
        self.generator.get_var_store().device()
    }
}

/// Right-pads token ids to `length`, returning the ids and the matching attention mask.
pub(crate) fn pad_sequence(token_ids: &[i64], length: usize, pad_id: i64) -> (Vec<i64>, Vec<i64>) {
    let kept = token_ids.len().min(length);
    let mut padded = token_ids[..kept].to_vec();
    let mut mask = vec![1i64; kept];
    padded.resize(length, pad_id);
    mask.resize(length, 0);
    (padded, mask)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn direction_round_trips_through_strings() {
        for direction in [
            TranslationDirection::EnglishToKorean,
            TranslationDirection::KoreanToEnglish,
        ] {
            assert_eq!(
                direction.to_string().parse::<TranslationDirection>().unwrap(),
                direction
            );
        }
        assert!("fr-en".parse::<TranslationDirection>().is_err());
        assert_eq!(
            TranslationDirection::default().source(),
            Language::English
        );
    }

    #[test]
    fn requested_direction_overrides_recorded_one() {
        use TranslationDirection::{EnglishToKorean, KoreanToEnglish};
        assert_eq!(TranslationDirection::resolve(None, None), EnglishToKorean);
        assert_eq!(TranslationDirection::resolve(None, Some(KoreanToEnglish)), KoreanToEnglish);
        assert_eq!(
            TranslationDirection::resolve(Some(EnglishToKorean), Some(KoreanToEnglish)),
            EnglishToKorean
        );
        assert_eq!(TranslationDirection::resolve(Some(KoreanToEnglish), None), KoreanToEnglish);
    }

    #[test]
    fn checkpoint_configuration_reads_recorded_direction() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let weights = dir.path().join("best-checkpoint.ot");
        std::fs::write(
            weights.with_extension("json"),
            r#"{"path": "best-checkpoint.ot", "epoch": 1, "step": 8, "monitor": "val_loss",
               "score": 0.7, "direction": "korean-to-english"}"#,
        )?;
        let config = TranslationConfig::from_checkpoint(
            &weights,
            LocalResource::from(dir.path().join("spiece.model")),
            Device::Cpu,
        );
        assert_eq!(config.direction, TranslationDirection::KoreanToEnglish);

        let converted = TranslationConfig::from_checkpoint(
            dir.path().join("converted.ot"),
            LocalResource::from(dir.path().join("spiece.model")),
            Device::Cpu,
        );
        assert_eq!(converted.direction, TranslationDirection::EnglishToKorean);
        Ok(())
    }

    #[test]
    fn sequences_are_right_padded() {
        let (ids, mask) = pad_sequence(&[5, 6, 1], 5, 0);
        assert_eq!(ids, vec![5, 6, 1, 0, 0]);
        assert_eq!(mask, vec![1, 1, 1, 0, 0]);
    }

    #[test]
    fn checkpoint_config_is_a_sibling() {
        let path = checkpoint_config_path(Path::new("checkpoints/best-checkpoint.ot"));
        assert_eq!(path, Path::new("checkpoints").join(CHECKPOINT_CONFIG_FILE));
    }

    #[test]
    fn default_decoding_matches_reference_call() {
        let config = default_translation_generate_config();
        assert_eq!(config.num_beams, 8);
        assert_eq!(config.max_length, 256);
        assert!(config.early_stopping);
        assert!(config.validate().is_ok());
    }
}
