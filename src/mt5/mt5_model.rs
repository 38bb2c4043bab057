// Copyright 2018 Mesh TensorFlow authors, T5 Authors and HuggingFace Inc. team.
// Copyright 2020 Guillaume Becquin
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

use std::borrow::Borrow;

use serde::{Deserialize, Serialize};
use tch::nn::{embedding, LinearConfig};
use tch::{nn, Device, Kind, Reduction, Tensor};

use crate::mt5::encoder::{DecoderLayerCache, MT5Stack, MT5StackOutput, StackSetup};
use crate::pipelines::generation_utils::private_generation_utils::{
    PrivateLanguageGenerator, StepInput,
};
use crate::pipelines::generation_utils::{Cache, GenerateConfig, LMModelOutput, LanguageGenerator};
use crate::resources::ResourceProvider;
use crate::{Config, TranslatorError};

/// Label value excluded from the loss, used for padding positions of the targets.
pub const IGNORE_INDEX: i64 = -100;

/// # MT5 Pretrained model config files
pub struct MT5ConfigResources;

/// # MT5 Pretrained sentencepiece model files
pub struct MT5VocabResources;

impl MT5ConfigResources {
    /// Shared under Apache 2.0 license by the Google team at <https://github.com/google-research/multilingual-t5>.
    pub const MT5_SMALL: (&'static str, &'static str) = (
        "mt5-small/config",
        "https://huggingface.co/google/mt5-small/resolve/main/config.json",
    );
    /// Shared under Apache 2.0 license by the Google team at <https://github.com/google-research/multilingual-t5>.
    pub const MT5_BASE: (&'static str, &'static str) = (
        "mt5-base/config",
        "https://huggingface.co/google/mt5-base/resolve/main/config.json",
    );
}

impl MT5VocabResources {
    /// Shared under Apache 2.0 license by the Google team at <https://github.com/google-research/multilingual-t5>.
    pub const MT5_SMALL: (&'static str, &'static str) = (
        "mt5-small/spiece",
        "https://huggingface.co/google/mt5-small/resolve/main/spiece.model",
    );
    /// Shared under Apache 2.0 license by the Google team at <https://github.com/google-research/multilingual-t5>.
    pub const MT5_BASE: (&'static str, &'static str) = (
        "mt5-base/spiece",
        "https://huggingface.co/google/mt5-base/resolve/main/spiece.model",
    );
}

#[derive(Clone, Debug, Serialize, Deserialize, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
/// # Options for MT5 Feed-forward projection layer
pub enum FeedForwardProj {
    /// ReLU
    Relu,
    /// Gated geLU
    GatedGelu,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
/// # MT5 model configuration
/// Defines the MT5 model architecture (e.g. number of layers, hidden layer size, vocabulary size...).
/// Field names follow the `config.json` files published on the Hugging Face hub.
pub struct MT5Config {
    pub dropout_rate: f64,
    pub d_model: i64,
    pub d_ff: i64,
    pub d_kv: i64,
    pub decoder_start_token_id: Option<i64>,
    pub eos_token_id: Option<i64>,
    pub initializer_factor: f64,
    pub is_encoder_decoder: Option<bool>,
    pub layer_norm_epsilon: f64,
    pub num_heads: i64,
    pub num_layers: i64,
    pub num_decoder_layers: Option<i64>,
    pub pad_token_id: Option<i64>,
    pub relative_attention_num_buckets: i64,
    pub relative_attention_max_distance: Option<i64>,
    pub vocab_size: i64,
    pub feed_forward_proj: Option<FeedForwardProj>,
    pub tie_word_embeddings: Option<bool>,
    pub output_attentions: Option<bool>,
    pub output_hidden_states: Option<bool>,
}

impl Config for MT5Config {}

impl Default for MT5Config {
    /// Architecture of `google/mt5-small`
    fn default() -> Self {
        MT5Config {
            dropout_rate: 0.1,
            d_model: 512,
            d_ff: 1024,
            d_kv: 64,
            decoder_start_token_id: Some(0),
            eos_token_id: Some(1),
            initializer_factor: 1.0,
            is_encoder_decoder: Some(true),
            layer_norm_epsilon: 1e-6,
            num_heads: 6,
            num_layers: 8,
            num_decoder_layers: Some(8),
            pad_token_id: Some(0),
            relative_attention_num_buckets: 32,
            relative_attention_max_distance: Some(128),
            vocab_size: 250112,
            feed_forward_proj: Some(FeedForwardProj::GatedGelu),
            tie_word_embeddings: Some(false),
            output_attentions: None,
            output_hidden_states: None,
        }
    }
}

impl MT5Config {
    pub fn pad_id(&self) -> i64 {
        self.pad_token_id.unwrap_or(0)
    }

    pub fn eos_id(&self) -> i64 {
        self.eos_token_id.unwrap_or(1)
    }

    pub fn decoder_start_id(&self) -> i64 {
        self.decoder_start_token_id.unwrap_or_else(|| self.pad_id())
    }
}

/// # MT5 Base model
/// Encoder-decoder transformer without a head:
/// - `embeddings`: token embeddings shared by the encoder and the decoder
/// - `encoder`: bidirectional `MT5Stack`
/// - `decoder`: causal `MT5Stack` attending to the encoder output, with a key/value cache
pub struct MT5Model {
    pub(crate) encoder: MT5Stack,
    decoder: MT5Stack,
    pub(crate) embeddings: nn::Embedding,
}

impl MT5Model {
    /// Build a new `MT5Model`
    ///
    /// # Arguments
    ///
    /// * `p` - Variable store path for the root of the MT5 model
    /// * `config` - `MT5Config` object defining the model architecture
    ///
    /// # Example
    ///
    /// ```no_run
    /// use mt5_translator::mt5::{MT5Config, MT5Model};
    /// use tch::{nn, Device};
    ///
    /// let p = nn::VarStore::new(Device::Cpu);
    /// let config = MT5Config::default();
    /// let mt5: MT5Model = MT5Model::new(p.root(), &config);
    /// ```
    pub fn new<'p, P>(p: P, config: &MT5Config) -> MT5Model
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        MT5Model {
            encoder: MT5Stack::new(p / "encoder", config, StackSetup::encoder(config)),
            decoder: MT5Stack::new(p / "decoder", config, StackSetup::decoder(config)),
            embeddings: embedding(
                p / "shared",
                config.vocab_size,
                config.d_model,
                Default::default(),
            ),
        }
    }

    fn run_encoder(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<MT5StackOutput, TranslatorError> {
        self.encoder.forward_t(
            input_ids,
            attention_mask,
            None,
            None,
            &self.embeddings,
            None,
            train,
        )
    }

    /// Forward pass through the model
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Optional source ids of shape (*batch size*, *source_sequence_length*). Required if `encoder_outputs` is not provided.
    /// * `attention_mask` - Optional source mask of shape (*batch size*, *source_sequence_length*), 0 for padding.
    /// * `encoder_outputs` - Optional encoder last hidden state of shape (*batch size*, *source_sequence_length*, *d_model*), skips the encoder.
    /// * `decoder_input_ids` - Decoder ids of shape (*batch size*, *target_sequence_length*), only the new positions when a cache is given.
    /// * `decoder_attention_mask` - Optional decoder mask of shape (*batch size*, *target_sequence_length*).
    /// * `old_layer_states` - Optional decoder cache from the previous step, one entry per decoder block.
    /// * `train` - enables dropout
    pub fn forward_t(
        &self,
        input_ids: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        encoder_outputs: Option<&Tensor>,
        decoder_input_ids: &Tensor,
        decoder_attention_mask: Option<&Tensor>,
        old_layer_states: Option<Vec<DecoderLayerCache>>,
        train: bool,
    ) -> Result<MT5ModelOutput, TranslatorError> {
        let computed_encoder = match (encoder_outputs, input_ids) {
            (Some(_), _) => None,
            (None, Some(input_ids)) => Some(self.run_encoder(input_ids, attention_mask, train)?),
            (None, None) => {
                return Err(TranslatorError::ValueError(
                    "Either input_ids or encoder_outputs must be provided".into(),
                ));
            }
        };
        let (encoder_hidden_state, all_encoder_hidden_states, all_encoder_attentions) =
            computed_encoder.map_or((None, None, None), |output| {
                (
                    Some(output.hidden_state),
                    output.all_hidden_states,
                    output.all_attentions,
                )
            });
        let encoder_output = encoder_outputs
            .or(encoder_hidden_state.as_ref())
            .ok_or_else(|| {
                TranslatorError::ValueError("encoder outputs were not computed".into())
            })?;

        let decoder = self.decoder.forward_t(
            decoder_input_ids,
            decoder_attention_mask,
            Some(encoder_output),
            attention_mask,
            &self.embeddings,
            old_layer_states,
            train,
        )?;

        Ok(MT5ModelOutput {
            decoder_output: decoder.hidden_state,
            encoder_hidden_state,
            next_cache: decoder.next_cache,
            all_decoder_hidden_states: decoder.all_hidden_states,
            all_decoder_attentions: decoder.all_attentions,
            all_encoder_hidden_states,
            all_encoder_attentions,
        })
    }
}

/// Projection of decoder states to vocabulary logits
enum LMHead {
    /// Separate output projection, as in MT5 checkpoints
    Untied(nn::Linear),
    /// Transposed shared embeddings, applied to states rescaled by `d_model^-0.5`
    Tied { scale: f64 },
}

/// # MT5 Model for conditional generation
/// `MT5Model` with a language modeling head. Computes the sequence-to-sequence loss when
/// given labels, and implements the decoding steps used by `MT5Generator`.
pub struct MT5ForConditionalGeneration {
    base_model: MT5Model,
    lm_head: LMHead,
    pad_token_id: i64,
    decoder_start_token_id: i64,
}

impl MT5ForConditionalGeneration {
    /// Build a new `MT5ForConditionalGeneration`
    ///
    /// # Example
    ///
    /// ```no_run
    /// use mt5_translator::mt5::{MT5Config, MT5ForConditionalGeneration};
    /// use mt5_translator::Config;
    /// use tch::{nn, Device};
    ///
    /// let config = MT5Config::from_file("path/to/config.json")?;
    /// let mut vs = nn::VarStore::new(Device::cuda_if_available());
    /// let mt5 = MT5ForConditionalGeneration::new(vs.root(), &config);
    /// vs.load("path/to/rust_model.ot")?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn new<'p, P>(p: P, config: &MT5Config) -> MT5ForConditionalGeneration
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let lm_head = if config.tie_word_embeddings.unwrap_or(false) {
            LMHead::Tied {
                scale: (config.d_model as f64).powf(-0.5),
            }
        } else {
            let no_bias = LinearConfig {
                bias: false,
                ..Default::default()
            };
            LMHead::Untied(nn::linear(
                p / "lm_head",
                config.d_model,
                config.vocab_size,
                no_bias,
            ))
        };

        MT5ForConditionalGeneration {
            base_model: MT5Model::new(p, config),
            lm_head,
            pad_token_id: config.pad_id(),
            decoder_start_token_id: config.decoder_start_id(),
        }
    }

    fn logits(&self, decoder_output: Tensor) -> Tensor {
        match &self.lm_head {
            LMHead::Untied(lm_head) => decoder_output.apply(lm_head),
            LMHead::Tied { scale } => (decoder_output * *scale)
                .linear::<Tensor>(&self.base_model.embeddings.ws, None),
        }
    }

    /// Forward pass through the model, returning vocabulary logits in `decoder_output`.
    ///
    /// Arguments are identical to `MT5Model::forward_t`.
    pub fn forward_t(
        &self,
        input_ids: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        encoder_outputs: Option<&Tensor>,
        decoder_input_ids: &Tensor,
        decoder_attention_mask: Option<&Tensor>,
        old_layer_states: Option<Vec<DecoderLayerCache>>,
        train: bool,
    ) -> Result<MT5ModelOutput, TranslatorError> {
        let output = self.base_model.forward_t(
            input_ids,
            attention_mask,
            encoder_outputs,
            decoder_input_ids,
            decoder_attention_mask,
            old_layer_states,
            train,
        )?;
        Ok(MT5ModelOutput {
            decoder_output: self.logits(output.decoder_output),
            ..output
        })
    }

    /// Forward pass conditioned on the shifted `labels`, computing the cross-entropy loss against them.
    ///
    /// # Arguments
    ///
    /// * `input_ids` - source token ids of shape (*batch size*, *source_sequence_length*)
    /// * `attention_mask` - source padding mask of shape (*batch size*, *source_sequence_length*)
    /// * `labels` - target token ids of shape (*batch size*, *target_sequence_length*), `-100` at ignored positions
    /// * `decoder_attention_mask` - target padding mask of shape (*batch size*, *target_sequence_length*)
    /// * `train` - enables dropout
    ///
    /// # Returns
    ///
    /// * `Seq2SeqLMOutput` with the mean loss over non-ignored positions and the logits.
    pub fn forward_with_labels(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        labels: &Tensor,
        decoder_attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Seq2SeqLMOutput, TranslatorError> {
        let logits = self
            .forward_t(
                Some(input_ids),
                attention_mask,
                None,
                &self.shift_right(labels),
                decoder_attention_mask,
                None,
                train,
            )?
            .decoder_output;
        let loss = sequence_cross_entropy(&logits, labels);
        Ok(Seq2SeqLMOutput { loss, logits })
    }

    /// Builds decoder inputs from labels: prepend the decoder start token, drop the last position
    /// and replace ignored positions by the padding token.
    pub fn shift_right(&self, labels: &Tensor) -> Tensor {
        shift_tokens_right(labels, self.pad_token_id, self.decoder_start_token_id)
    }

    /// Encoder last hidden state, dropout disabled
    pub fn encode(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor, TranslatorError> {
        Ok(self
            .base_model
            .run_encoder(input_ids, attention_mask, false)?
            .hidden_state)
    }
}

/// Mean token cross-entropy of (*batch*, *length*, *vocab*) logits, skipping `IGNORE_INDEX` labels
fn sequence_cross_entropy(logits: &Tensor, labels: &Tensor) -> Tensor {
    let vocab_size = logits.size()[2];
    logits
        .view((-1, vocab_size))
        .to_kind(Kind::Float)
        .cross_entropy_loss::<Tensor>(&labels.view(-1), None, Reduction::Mean, IGNORE_INDEX, 0.0)
}

pub(crate) fn shift_tokens_right(
    input_ids: &Tensor,
    pad_token_id: i64,
    decoder_start_token_id: i64,
) -> Tensor {
    let kept = input_ids.size()[1] - 1;
    let start = input_ids.narrow(1, 0, 1).full_like(decoder_start_token_id);
    let shifted = Tensor::cat(&[&start, &input_ids.narrow(1, 0, kept)], 1);
    shifted.masked_fill(&shifted.eq(IGNORE_INDEX), pad_token_id)
}

/// Output of an MT5 forward pass
pub struct MT5ModelOutput {
    /// Last decoder hidden state for `MT5Model`, vocabulary logits for `MT5ForConditionalGeneration`
    pub decoder_output: Tensor,
    /// Last encoder hidden state, when the encoder ran in this pass
    pub encoder_hidden_state: Option<Tensor>,
    /// Decoder key/value cache for the next decoding step
    pub next_cache: Option<Vec<DecoderLayerCache>>,
    pub all_decoder_hidden_states: Option<Vec<Tensor>>,
    pub all_decoder_attentions: Option<Vec<Tensor>>,
    pub all_encoder_hidden_states: Option<Vec<Tensor>>,
    pub all_encoder_attentions: Option<Vec<Tensor>>,
}

/// Output of a forward pass with labels.
pub struct Seq2SeqLMOutput {
    /// Scalar mean cross-entropy over positions whose label is not `IGNORE_INDEX`
    pub loss: Tensor,
    /// Vocabulary logits of shape (*batch size*, *target_sequence_length*, *vocab_size*)
    pub logits: Tensor,
}

/// # Language generation model based on the MT5 architecture
/// Owns the model weights and the decoding settings.
pub struct MT5Generator {
    model: MT5ForConditionalGeneration,
    var_store: nn::VarStore,
    generate_config: GenerateConfig,
    eos_token_ids: Vec<i64>,
    pad_token_id: i64,
    vocab_size: i64,
    decoder_start_id: i64,
}

impl MT5Generator {
    /// Build a new `MT5Generator` from a configuration resource and a weights resource.
    ///
    /// # Arguments
    ///
    /// * `config_resource` - model `config.json`
    /// * `weights_resource` - `.ot` weights (converted pretrained weights or a training checkpoint)
    /// * `device` - device to load the model on
    /// * `generate_config` - decoding settings
    pub fn new(
        config_resource: &dyn ResourceProvider,
        weights_resource: &dyn ResourceProvider,
        device: Device,
        generate_config: GenerateConfig,
    ) -> Result<MT5Generator, TranslatorError> {
        let config_path = config_resource.get_local_path()?;
        let weights_path = weights_resource.get_local_path()?;
        let config = MT5Config::from_file(config_path)?;

        let mut var_store = nn::VarStore::new(device);
        let model = MT5ForConditionalGeneration::new(var_store.root(), &config);
        var_store.load(weights_path)?;
        var_store.freeze();

        Self::from_parts(model, var_store, &config, generate_config)
    }

    /// Wraps an already built model and its variable store, e.g. right after training.
    pub fn from_parts(
        model: MT5ForConditionalGeneration,
        var_store: nn::VarStore,
        config: &MT5Config,
        generate_config: GenerateConfig,
    ) -> Result<MT5Generator, TranslatorError> {
        generate_config.validate()?;
        Ok(MT5Generator {
            model,
            var_store,
            generate_config,
            eos_token_ids: vec![config.eos_id()],
            pad_token_id: config.pad_id(),
            vocab_size: config.vocab_size,
            decoder_start_id: config.decoder_start_id(),
        })
    }

    pub fn set_generate_config(
        &mut self,
        generate_config: GenerateConfig,
    ) -> Result<(), TranslatorError> {
        generate_config.validate()?;
        self.generate_config = generate_config;
        Ok(())
    }
}

impl PrivateLanguageGenerator for MT5Generator {
    fn get_var_store(&self) -> &nn::VarStore {
        &self.var_store
    }
    fn get_config(&self) -> &GenerateConfig {
        &self.generate_config
    }
    fn get_eos_ids(&self) -> &[i64] {
        &self.eos_token_ids
    }
    fn get_pad_id(&self) -> i64 {
        self.pad_token_id
    }
    fn get_vocab_size(&self) -> i64 {
        self.vocab_size
    }
    fn get_decoder_start_id(&self) -> i64 {
        self.decoder_start_id
    }

    fn forward_t(
        &self,
        cache: Cache,
        attention_mask: Option<&Tensor>,
        encoder_outputs: Option<&Tensor>,
        decoder_input_ids: &Tensor,
        train: bool,
    ) -> Result<LMModelOutput, TranslatorError> {
        let cached_layer_states = match cache {
            Cache::MT5Cache(cached_layer_states) => cached_layer_states,
            Cache::None => None,
        };
        let base_model_output = self.model.forward_t(
            None,
            attention_mask,
            encoder_outputs,
            decoder_input_ids,
            None,
            cached_layer_states,
            train,
        )?;

        Ok(LMModelOutput {
            lm_logits: base_model_output.decoder_output,
            cache: Cache::MT5Cache(base_model_output.next_cache),
        })
    }

    fn encode(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor, TranslatorError> {
        self.model.encode(input_ids, attention_mask)
    }

    fn prepare_inputs_for_generation(&self, input_ids: &Tensor, past: Cache) -> StepInput {
        match past {
            Cache::MT5Cache(Some(layers)) => StepInput {
                decoder_input_ids: input_ids.narrow(1, -1, 1),
                cache: Cache::MT5Cache(Some(layers)),
            },
            Cache::MT5Cache(None) | Cache::None => StepInput {
                decoder_input_ids: input_ids.shallow_clone(),
                cache: Cache::None,
            },
        }
    }

    fn reorder_cache(&self, past: &mut Cache, beam_indices: &Tensor) {
        if let Cache::MT5Cache(Some(layers)) = past {
            layers
                .iter_mut()
                .for_each(|layer| layer.reorder(beam_indices));
        }
    }
}

impl LanguageGenerator for MT5Generator {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shift_right_replaces_ignored_labels() {
        let labels = Tensor::from_slice(&[5i64, 6, 1, IGNORE_INDEX, 7, 1, IGNORE_INDEX, IGNORE_INDEX])
            .view((2, 4));
        let shifted = shift_tokens_right(&labels, 0, 0);
        let shifted = Vec::<i64>::try_from(&shifted.view(-1)).unwrap();
        assert_eq!(shifted, vec![0, 5, 6, 1, 0, 7, 1, 0]);
    }

    #[test]
    fn default_config_matches_mt5_small() {
        let config = MT5Config::default();
        assert_eq!(config.vocab_size, 250112);
        assert_eq!(config.feed_forward_proj, Some(FeedForwardProj::GatedGelu));
        assert_eq!(config.decoder_start_id(), config.pad_id());
    }

    #[test]
    fn config_parses_hub_format() {
        let json = r#"{
            "d_ff": 1024, "d_kv": 64, "d_model": 512, "decoder_start_token_id": 0,
            "dropout_rate": 0.1, "eos_token_id": 1, "feed_forward_proj": "gated-gelu",
            "initializer_factor": 1.0, "is_encoder_decoder": true, "layer_norm_epsilon": 1e-06,
            "model_type": "mt5", "num_decoder_layers": 8, "num_heads": 6, "num_layers": 8,
            "pad_token_id": 0, "relative_attention_num_buckets": 32, "tie_word_embeddings": false,
            "tokenizer_class": "T5Tokenizer", "vocab_size": 250112
        }"#;
        let config: MT5Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_decoder_layers, Some(8));
        assert_eq!(config.tie_word_embeddings, Some(false));
        assert_eq!(config.relative_attention_max_distance, None);
    }
}
