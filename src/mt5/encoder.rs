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

use crate::common::tensor_ops::{min_value, Activation, Dropout};
use crate::mt5::attention::{AttentionOutput, LayerState, MT5LayerAttention};
use crate::mt5::layer_norm::MT5LayerNorm;
use crate::mt5::mt5_model::FeedForwardProj;
use crate::mt5::MT5Config;
use crate::TranslatorError;
use std::borrow::Borrow;
use tch::nn::LinearConfig;
use tch::{nn, Device, Kind, Tensor};

/// # Key/value cache of a decoder block
/// The self-attention cache grows by one position per generated token, the cross-attention
/// cache holds the projected encoder states and is computed once.
#[derive(Debug, Default, Clone)]
pub struct DecoderLayerCache {
    pub self_attention: Option<LayerState>,
    pub cross_attention: Option<LayerState>,
}

impl DecoderLayerCache {
    /// Keeps the cache rows of the selected beams.
    pub(crate) fn reorder(&mut self, beam_indices: &Tensor) {
        for state in [&mut self.self_attention, &mut self.cross_attention]
            .into_iter()
            .flatten()
        {
            state.reorder_cache(beam_indices);
        }
    }

    fn cached_length(&self) -> i64 {
        self.self_attention
            .as_ref()
            .map_or(0, LayerState::cached_length)
    }
}

enum FeedForwardInput {
    Relu(nn::Linear),
    GatedGelu { gate: nn::Linear, linear: nn::Linear },
}

/// Position-wise feed-forward network: `wo(act(wi(x)))`, or `wo(gelu(wi_0(x)) * wi_1(x))` for
/// the gated variant used by MT5 checkpoints.
pub struct MT5DenseActDense {
    input: FeedForwardInput,
    wo: nn::Linear,
    dropout: Dropout,
}

impl MT5DenseActDense {
    pub fn new<'p, P>(p: P, config: &MT5Config) -> MT5DenseActDense
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let no_bias = LinearConfig {
            bias: false,
            ..Default::default()
        };
        let projection = |name: &str| nn::linear(p / name, config.d_model, config.d_ff, no_bias);

        let input = match config.feed_forward_proj.unwrap_or(FeedForwardProj::Relu) {
            FeedForwardProj::Relu => FeedForwardInput::Relu(projection("wi")),
            FeedForwardProj::GatedGelu => FeedForwardInput::GatedGelu {
                gate: projection("wi_0"),
                linear: projection("wi_1"),
            },
        };

        MT5DenseActDense {
            input,
            wo: nn::linear(p / "wo", config.d_ff, config.d_model, no_bias),
            dropout: Dropout::new(config.dropout_rate),
        }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let activated = match &self.input {
            FeedForwardInput::Relu(wi) => Activation::Relu.apply(&x.apply(wi)),
            FeedForwardInput::GatedGelu { gate, linear } => {
                Activation::GeluNew.apply(&x.apply(gate)) * x.apply(linear)
            }
        };
        activated.apply_t(&self.dropout, train).apply(&self.wo)
    }
}

/// Pre-norm residual wrapper around the feed-forward network
pub struct MT5LayerFeedForward {
    // checkpoints name the module `DenseReluDense` whatever the activation
    dense: MT5DenseActDense,
    layer_norm: MT5LayerNorm,
    dropout: Dropout,
}

impl MT5LayerFeedForward {
    pub fn new<'p, P>(p: P, config: &MT5Config) -> MT5LayerFeedForward
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        MT5LayerFeedForward {
            dense: MT5DenseActDense::new(p / "DenseReluDense", config),
            layer_norm: MT5LayerNorm::new(p / "layer_norm", config.d_model, config.layer_norm_epsilon),
            dropout: Dropout::new(config.dropout_rate),
        }
    }

    pub fn forward_t(&self, hidden_states: &Tensor, train: bool) -> Tensor {
        let update = self
            .dense
            .forward_t(&hidden_states.apply(&self.layer_norm), train)
            .apply_t(&self.dropout, train);
        hidden_states + update
    }
}

/// Flags shared by every block of a stack
#[derive(Debug, Clone, Copy)]
pub(crate) struct StackSetup {
    pub is_decoder: bool,
    pub store_cache: bool,
    pub output_attentions: bool,
    pub output_hidden_states: bool,
}

impl StackSetup {
    pub(crate) fn encoder(config: &MT5Config) -> StackSetup {
        StackSetup {
            is_decoder: false,
            store_cache: false,
            output_attentions: config.output_attentions.unwrap_or(false),
            output_hidden_states: config.output_hidden_states.unwrap_or(false),
        }
    }

    pub(crate) fn decoder(config: &MT5Config) -> StackSetup {
        StackSetup {
            is_decoder: true,
            store_cache: true,
            ..Self::encoder(config)
        }
    }
}

/// Encoder states attended to by a decoder block, with their additive mask
#[derive(Clone, Copy)]
pub(crate) struct EncoderContext<'a> {
    pub hidden_states: &'a Tensor,
    pub attention_mask: Option<&'a Tensor>,
}

/// Relative position biases computed by the first block and re-used by the following ones.
/// They already include the additive attention masks.
#[derive(Default)]
pub(crate) struct PositionBiases {
    self_attention: Option<Tensor>,
    cross_attention: Option<Tensor>,
}

pub struct MT5Block {
    self_attention: MT5LayerAttention,
    cross_attention: Option<MT5LayerAttention>,
    feed_forward: MT5LayerFeedForward,
}

pub(crate) struct MT5BlockOutput {
    pub hidden_states: Tensor,
    pub attention_weights: Option<Tensor>,
    pub biases: PositionBiases,
    pub cache: DecoderLayerCache,
}

impl MT5Block {
    pub(crate) fn new<'p, P>(p: P, config: &MT5Config, setup: StackSetup, first: bool) -> MT5Block
    where
        P: Borrow<nn::Path<'p>>,
    {
        // sub-layers are numbered in order: self-attention, cross-attention (decoder), feed-forward
        let p = p.borrow() / "layer";
        let self_attention = MT5LayerAttention::self_attention(
            &p / 0,
            config,
            first,
            setup.is_decoder,
            setup.store_cache,
            setup.output_attentions,
        );
        let (cross_attention, feed_forward_index) = if setup.is_decoder {
            let layer = MT5LayerAttention::cross_attention(
                &p / 1,
                config,
                setup.store_cache,
                setup.output_attentions,
            );
            (Some(layer), 2)
        } else {
            (None, 1)
        };

        MT5Block {
            self_attention,
            cross_attention,
            feed_forward: MT5LayerFeedForward::new(&p / feed_forward_index, config),
        }
    }

    /// Half precision activations can overflow in the feed-forward layers: values are clamped
    /// just below the largest finite `f16`.
    pub(crate) fn clamp_hidden_states(hidden_states: Tensor) -> Tensor {
        if hidden_states.kind() != Kind::Half
            || hidden_states.isinf().any().int64_value(&[]) == 0
        {
            return hidden_states;
        }
        let bound = f64::from(half::f16::MAX) - 1000.0;
        hidden_states.clamp(-bound, bound)
    }

    pub(crate) fn forward_t(
        &self,
        hidden_states: &Tensor,
        attention_mask: &Tensor,
        encoder: Option<EncoderContext>,
        biases: &PositionBiases,
        cache: DecoderLayerCache,
        train: bool,
    ) -> MT5BlockOutput {
        let self_attended = self.self_attention.forward_t(
            hidden_states,
            None,
            biases.self_attention.as_ref(),
            Some(attention_mask),
            cache.self_attention,
            None,
            train,
        );
        let hidden_states = Self::clamp_hidden_states(self_attended.hidden_states);

        let cross_attended = match (&self.cross_attention, encoder) {
            (Some(layer), Some(encoder)) => {
                let query_length = self_attended
                    .layer_state
                    .as_ref()
                    .map(LayerState::cached_length);
                layer.forward_t(
                    &hidden_states,
                    Some(encoder.hidden_states),
                    biases.cross_attention.as_ref(),
                    encoder.attention_mask,
                    cache.cross_attention,
                    query_length,
                    train,
                )
            }
            _ => AttentionOutput {
                hidden_states,
                attention_weights: None,
                position_bias: None,
                layer_state: None,
            },
        };
        let hidden_states = Self::clamp_hidden_states(cross_attended.hidden_states);
        let hidden_states =
            Self::clamp_hidden_states(self.feed_forward.forward_t(&hidden_states, train));

        MT5BlockOutput {
            hidden_states,
            attention_weights: self_attended.attention_weights,
            biases: PositionBiases {
                self_attention: self_attended.position_bias,
                cross_attention: cross_attended.position_bias,
            },
            cache: DecoderLayerCache {
                self_attention: self_attended.layer_state,
                cross_attention: cross_attended.layer_state,
            },
        }
    }
}

/// Turns a (*batch size*, *key length*) mask with 1 for attended positions into an additive
/// mask of shape (*batch size*, 1, 1, *key length*).
fn additive_mask(mask: &Tensor, kind: Kind) -> Result<Tensor, TranslatorError> {
    let mask = mask.unsqueeze(1).unsqueeze(1);
    Ok(Tensor::zeros_like(&mask)
        .to_kind(kind)
        .masked_fill(&mask.eq(0), min_value(kind)?))
}

/// Lower-triangular mask for the last `query_length` of `key_length` positions, shaped
/// (1, 1, *query length*, *key length*).
fn causal_mask(query_length: i64, key_length: i64, mask: &Tensor) -> Tensor {
    Tensor::ones([key_length, key_length], (mask.kind(), mask.device()))
        .tril(0)
        .narrow(0, key_length - query_length, query_length)
        .unsqueeze(0)
        .unsqueeze(0)
}

/// # MT5 encoder or decoder
/// Stack of `MT5Block`s sharing the relative position bias of the first block, followed by a
/// final layer norm. Token embeddings are owned by the parent model and passed in.
pub struct MT5Stack {
    blocks: Vec<MT5Block>,
    final_layer_norm: MT5LayerNorm,
    dropout: Dropout,
    setup: StackSetup,
}

/// Output of an encoder or decoder stack.
pub struct MT5StackOutput {
    /// Last hidden state, (*batch size*, *sequence_length*, *d_model*)
    pub hidden_state: Tensor,
    /// Input of every block, if requested
    pub all_hidden_states: Option<Vec<Tensor>>,
    /// Self-attention weights of every block, if requested
    pub all_attentions: Option<Vec<Tensor>>,
    /// Updated cache, decoder only
    pub next_cache: Option<Vec<DecoderLayerCache>>,
}

impl MT5Stack {
    pub(crate) fn new<'p, P>(p: P, config: &MT5Config, setup: StackSetup) -> MT5Stack
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let num_blocks = match setup.is_decoder {
            true => config.num_decoder_layers.unwrap_or(config.num_layers),
            false => config.num_layers,
        };
        let p_blocks = p / "block";
        let blocks = (0..num_blocks)
            .map(|index| MT5Block::new(&p_blocks / index, config, setup, index == 0))
            .collect();

        MT5Stack {
            blocks,
            final_layer_norm: MT5LayerNorm::new(
                p / "final_layer_norm",
                config.d_model,
                config.layer_norm_epsilon,
            ),
            dropout: Dropout::new(config.dropout_rate),
            setup,
        }
    }

    /// Additive self-attention mask over cached and new positions. A mask covering only the
    /// new positions is extended with ones over the cached ones.
    fn self_attention_mask(
        &self,
        attention_mask: Option<&Tensor>,
        batch_size: i64,
        past_length: i64,
        query_length: i64,
        (kind, device): (Kind, Device),
    ) -> Result<Tensor, TranslatorError> {
        let key_length = past_length + query_length;
        let mask = match attention_mask {
            Some(mask) if mask.size()[1] == key_length => mask.shallow_clone(),
            Some(mask) => Tensor::cat(
                &[
                    &Tensor::ones([batch_size, past_length], (mask.kind(), mask.device())),
                    mask,
                ],
                1,
            ),
            None => Tensor::ones([batch_size, key_length], (Kind::Int64, device)),
        };
        if !self.setup.is_decoder {
            return additive_mask(&mask, kind);
        }
        let combined = causal_mask(query_length, key_length, &mask)
            * mask.unsqueeze(1).unsqueeze(1);
        Ok(Tensor::zeros_like(&combined)
            .to_kind(kind)
            .masked_fill(&combined.eq(0), min_value(kind)?))
    }

    /// # Arguments
    ///
    /// * `input_ids` - token ids, (*batch size*, *sequence_length*)
    /// * `attention_mask` - 1 for positions to attend, over the new positions or over cached and new positions
    /// * `encoder_hidden_states` - encoder output attended by the decoder
    /// * `encoder_attention_mask` - source padding mask, (*batch size*, *source_sequence_length*)
    /// * `embeddings` - shared token embeddings
    /// * `cache` - decoder cache from the previous step, one entry per block
    /// * `train` - enables dropout
    pub fn forward_t(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        encoder_hidden_states: Option<&Tensor>,
        encoder_attention_mask: Option<&Tensor>,
        embeddings: &nn::Embedding,
        cache: Option<Vec<DecoderLayerCache>>,
        train: bool,
    ) -> Result<MT5StackOutput, TranslatorError> {
        let embedded = input_ids.apply(embeddings);
        let kind = embedded.kind();
        let (batch_size, sequence_length) = (input_ids.size()[0], input_ids.size()[1]);
        let mut cache = cache.unwrap_or_default();
        let past_length = cache.first().map_or(0, DecoderLayerCache::cached_length);

        let self_mask = self.self_attention_mask(
            attention_mask,
            batch_size,
            past_length,
            sequence_length,
            (kind, input_ids.device()),
        )?;
        let cross_mask = match (self.setup.is_decoder, encoder_attention_mask) {
            (true, Some(mask)) => Some(additive_mask(mask, kind)?),
            _ => None,
        };
        let encoder = encoder_hidden_states
            .filter(|_| self.setup.is_decoder)
            .map(|hidden_states| EncoderContext {
                hidden_states,
                attention_mask: cross_mask.as_ref(),
            });

        let mut all_hidden_states = self.setup.output_hidden_states.then(Vec::new);
        let mut all_attentions = self.setup.output_attentions.then(Vec::new);
        let mut next_cache = (self.setup.is_decoder && self.setup.store_cache)
            .then(|| Vec::with_capacity(self.blocks.len()));

        let mut biases = PositionBiases::default();
        let mut hidden_state = embedded.apply_t(&self.dropout, train);
        for (index, block) in self.blocks.iter().enumerate() {
            if let Some(states) = all_hidden_states.as_mut() {
                states.push(hidden_state.copy());
            }
            let block_cache = cache.get_mut(index).map(std::mem::take).unwrap_or_default();
            let output = block.forward_t(
                &hidden_state,
                &self_mask,
                encoder,
                &biases,
                block_cache,
                train,
            );
            if index == 0 {
                biases = output.biases;
            }
            hidden_state = output.hidden_states;
            if let (Some(attentions), Some(weights)) =
                (all_attentions.as_mut(), output.attention_weights)
            {
                attentions.push(weights);
            }
            if let Some(next_cache) = next_cache.as_mut() {
                next_cache.push(output.cache);
            }
        }

        Ok(MT5StackOutput {
            hidden_state: hidden_state
                .apply(&self.final_layer_norm)
                .apply_t(&self.dropout, train),
            all_hidden_states,
            all_attentions,
            next_cache,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn causal_mask_covers_cached_positions() {
        let mask = Tensor::ones([1, 4], (Kind::Int64, Device::Cpu));
        let last_row = causal_mask(1, 4, &mask).view(-1);
        assert_eq!(Vec::<i64>::try_from(&last_row).unwrap(), vec![1, 1, 1, 1]);
        let full = causal_mask(3, 3, &mask.narrow(1, 0, 3)).view(-1);
        assert_eq!(
            Vec::<i64>::try_from(&full).unwrap(),
            vec![1, 0, 0, 1, 1, 0, 1, 1, 1]
        );
    }

    #[test]
    fn additive_mask_blocks_padding() {
        let mask = Tensor::from_slice(&[1i64, 1, 0]).view((1, 3));
        let additive = additive_mask(&mask, Kind::Float).unwrap();
        assert_eq!(additive.size(), vec![1, 1, 1, 3]);
        let values = Vec::<f32>::try_from(&additive.view(-1)).unwrap();
        assert_eq!(values[0], 0.0);
        assert_eq!(values[2], f32::MIN);
    }
}
