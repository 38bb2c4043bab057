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

use crate::common::tensor_ops::Dropout;
use crate::mt5::layer_norm::MT5LayerNorm;
use crate::mt5::MT5Config;
use std::borrow::Borrow;
use tch::nn::LinearConfig;
use tch::{nn, Device, Kind, Tensor};

#[derive(Debug)]
/// # Cache for MT5 attention layers
/// Stores the cached value of key and value projections, shaped
/// (*batch size*, *num_heads*, *sequence_length*, *d_kv*).
pub struct LayerState {
    /// Cached keys
    pub prev_key: Tensor,
    /// Cached values
    pub prev_value: Tensor,
}

impl Clone for LayerState {
    fn clone(&self) -> Self {
        LayerState {
            prev_key: self.prev_key.copy(),
            prev_value: self.prev_value.copy(),
        }
    }
}

impl LayerState {
    /// Keeps the cache rows of the selected beams.
    pub(crate) fn reorder_cache(&mut self, new_indices: &Tensor) {
        self.prev_key = self.prev_key.index_select(0, new_indices);
        self.prev_value = self.prev_value.index_select(0, new_indices);
    }

    pub(crate) fn cached_length(&self) -> i64 {
        self.prev_key.size()[2]
    }
}

/// Output of an attention layer
pub struct AttentionOutput {
    /// Attention output, (*batch size*, *query length*, *d_model*)
    pub hidden_states: Tensor,
    /// Attention probabilities when requested
    pub attention_weights: Option<Tensor>,
    /// Position bias (mask included) when computed by this layer, re-used by the next layers
    pub position_bias: Option<Tensor>,
    /// Updated key/value cache of a decoder layer
    pub layer_state: Option<LayerState>,
}

/// Role of an attention module in the stack
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttentionSetup {
    pub is_decoder: bool,
    pub bidirectional: bool,
    pub store_cache: bool,
    pub output_attentions: bool,
    pub relative_attention_bias: bool,
}

#[derive(Debug)]
pub struct MT5Attention {
    setup: AttentionSetup,
    num_buckets: i64,
    max_distance: i64,
    num_heads: i64,
    head_dim: i64,
    q: nn::Linear,
    k: nn::Linear,
    v: nn::Linear,
    o: nn::Linear,
    relative_attention_bias: Option<nn::Embedding>,
    dropout: Dropout,
}

impl MT5Attention {
    pub(crate) fn new<'p, P>(p: P, config: &MT5Config, setup: AttentionSetup) -> MT5Attention
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let no_bias = LinearConfig {
            bias: false,
            ..Default::default()
        };
        let inner_dim = config.num_heads * config.d_kv;
        let relative_attention_bias = setup.relative_attention_bias.then(|| {
            nn::embedding(
                p / "relative_attention_bias",
                config.relative_attention_num_buckets,
                config.num_heads,
                Default::default(),
            )
        });

        MT5Attention {
            setup,
            num_buckets: config.relative_attention_num_buckets,
            max_distance: config.relative_attention_max_distance.unwrap_or(128),
            num_heads: config.num_heads,
            head_dim: config.d_kv,
            q: nn::linear(p / "q", config.d_model, inner_dim, no_bias),
            k: nn::linear(p / "k", config.d_model, inner_dim, no_bias),
            v: nn::linear(p / "v", config.d_model, inner_dim, no_bias),
            o: nn::linear(p / "o", inner_dim, config.d_model, no_bias),
            relative_attention_bias,
            dropout: Dropout::new(config.dropout_rate),
        }
    }

    /// (*batch*, *length*, *heads x head_dim*) to (*batch*, *heads*, *length*, *head_dim*)
    fn split_heads(&self, x: Tensor, batch_size: i64) -> Tensor {
        x.view((batch_size, -1, self.num_heads, self.head_dim))
            .transpose(1, 2)
    }

    fn merge_heads(&self, x: Tensor, batch_size: i64) -> Tensor {
        x.transpose(1, 2)
            .contiguous()
            .view((batch_size, -1, self.num_heads * self.head_dim))
    }

    /// Keys and values for the current step. Cross-attention projects the encoder states once and
    /// then re-uses the cache; self-attention appends the new positions to the cache.
    fn keys_values(
        &self,
        hidden_states: &Tensor,
        encoder_states: Option<&Tensor>,
        layer_state: Option<&LayerState>,
        batch_size: i64,
    ) -> (Tensor, Tensor) {
        let project = |source: &Tensor| {
            (
                self.split_heads(source.apply(&self.k), batch_size),
                self.split_heads(source.apply(&self.v), batch_size),
            )
        };
        match (encoder_states, layer_state) {
            (Some(_), Some(cache)) => (
                cache.prev_key.shallow_clone(),
                cache.prev_value.shallow_clone(),
            ),
            (Some(encoder_states), None) => project(encoder_states),
            (None, Some(cache)) => {
                let (key, value) = project(hidden_states);
                (
                    Tensor::cat(&[&cache.prev_key, &key], 2),
                    Tensor::cat(&[&cache.prev_value, &value], 2),
                )
            }
            (None, None) => project(hidden_states),
        }
    }

    /// Attention forward pass.
    ///
    /// * `hidden_states` - queries (and keys/values for self-attention), (*batch size*, *query length*, *d_model*)
    /// * `encoder_states` - encoder hidden states for cross-attention
    /// * `position_bias` - bias computed by the first layer of the stack, re-used by the following layers
    /// * `attention_mask` - additive mask broadcastable to (*batch size*, *num_heads*, *query length*, *key length*)
    /// * `layer_state` - cached keys and values from previous decoding steps
    /// * `query_length` - full query length (cached and new positions), needed for cross-attention with cache
    pub fn forward_t(
        &self,
        hidden_states: &Tensor,
        encoder_states: Option<&Tensor>,
        position_bias: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        layer_state: Option<LayerState>,
        query_length: Option<i64>,
        train: bool,
    ) -> AttentionOutput {
        let (batch_size, new_positions) = (hidden_states.size()[0], hidden_states.size()[1]);
        let full_query_length = match &layer_state {
            Some(cache) => query_length.unwrap_or(new_positions + cache.cached_length()),
            None => new_positions,
        };

        let query = self.split_heads(hidden_states.apply(&self.q), batch_size);
        let (key, value) =
            self.keys_values(hidden_states, encoder_states, layer_state.as_ref(), batch_size);
        let key_length = key.size()[2];

        // no 1/sqrt(d_kv) scaling, it is folded into the initialization
        let mut scores = query.matmul(&key.transpose(3, 2));

        let computed_bias = match position_bias {
            Some(_) => None,
            None => {
                let bias = match &self.relative_attention_bias {
                    Some(embedding) => self
                        .compute_bias(embedding, full_query_length, key_length, scores.device())
                        .narrow(2, full_query_length - new_positions, new_positions),
                    None => Tensor::zeros(
                        [1, self.num_heads, new_positions, key_length],
                        (scores.kind(), scores.device()),
                    ),
                };
                Some(match attention_mask {
                    Some(mask) => bias + mask,
                    None => bias,
                })
            }
        };
        if let Some(bias) = position_bias.or(computed_bias.as_ref()) {
            scores += bias;
        }

        let attention_weights = scores
            .softmax(-1, Kind::Float)
            .to_kind(scores.kind())
            .apply_t(&self.dropout, train);
        let hidden_states = self
            .merge_heads(attention_weights.matmul(&value), batch_size)
            .apply(&self.o);

        let layer_state = (self.setup.is_decoder && self.setup.store_cache).then(|| LayerState {
            prev_key: key,
            prev_value: value,
        });

        AttentionOutput {
            hidden_states,
            attention_weights: self.setup.output_attentions.then_some(attention_weights),
            position_bias: computed_bias,
            layer_state,
        }
    }

    /// Maps relative positions (key minus query) to buckets: half of the buckets hold exact small
    /// distances, the other half logarithmically larger ones up to `max_distance`. Bidirectional
    /// attention spends half of the buckets on keys after the query.
    pub(crate) fn relative_position_bucket(
        relative_position: &Tensor,
        bidirectional: bool,
        num_buckets: i64,
        max_distance: i64,
    ) -> Tensor {
        let (num_buckets, offset, distance) = if bidirectional {
            let half = num_buckets / 2;
            let offset = relative_position.gt(0).to_kind(Kind::Int64) * half;
            (half, offset, relative_position.abs())
        } else {
            let distance = (-relative_position).clamp_min(0);
            (num_buckets, distance.zeros_like(), distance)
        };

        let max_exact = num_buckets / 2;
        let log_ratio = (distance.to_kind(Kind::Float) / max_exact as f64).log()
            / (max_distance as f64 / max_exact as f64).ln();
        let log_bucket = (log_ratio * (num_buckets - max_exact) as f64)
            .to_kind(Kind::Int64)
            .clamp_max(num_buckets - 1 - max_exact)
            + max_exact;

        offset + distance.where_self(&distance.lt(max_exact), &log_bucket)
    }

    /// Bias of shape (1, *num_heads*, *query length*, *key length*)
    fn compute_bias(
        &self,
        embedding: &nn::Embedding,
        query_length: i64,
        key_length: i64,
        device: Device,
    ) -> Tensor {
        let query_positions = Tensor::arange(query_length, (Kind::Int64, device)).unsqueeze(1);
        let key_positions = Tensor::arange(key_length, (Kind::Int64, device)).unsqueeze(0);
        Self::relative_position_bucket(
            &(key_positions - query_positions),
            self.setup.bidirectional,
            self.num_buckets,
            self.max_distance,
        )
        .apply(embedding)
        .permute([2, 0, 1])
        .unsqueeze(0)
    }
}

/// Pre-norm residual sub-layer wrapping an `MT5Attention`
pub struct MT5LayerAttention {
    attention: MT5Attention,
    layer_norm: MT5LayerNorm,
    dropout: Dropout,
}

impl MT5LayerAttention {
    /// Self-attention sub-layer, stored as `SelfAttention` in checkpoints
    pub(crate) fn self_attention<'p, P>(
        p: P,
        config: &MT5Config,
        has_relative_attention_bias: bool,
        is_decoder: bool,
        store_cache: bool,
        output_attentions: bool,
    ) -> MT5LayerAttention
    where
        P: Borrow<nn::Path<'p>>,
    {
        let setup = AttentionSetup {
            is_decoder,
            bidirectional: !is_decoder,
            store_cache,
            output_attentions,
            relative_attention_bias: has_relative_attention_bias,
        };
        Self::new(p.borrow(), "SelfAttention", config, setup)
    }

    /// Encoder-decoder attention sub-layer, stored as `EncDecAttention` in checkpoints
    pub(crate) fn cross_attention<'p, P>(
        p: P,
        config: &MT5Config,
        store_cache: bool,
        output_attentions: bool,
    ) -> MT5LayerAttention
    where
        P: Borrow<nn::Path<'p>>,
    {
        let setup = AttentionSetup {
            is_decoder: true,
            bidirectional: true,
            store_cache,
            output_attentions,
            relative_attention_bias: false,
        };
        Self::new(p.borrow(), "EncDecAttention", config, setup)
    }

    fn new(p: &nn::Path, name: &str, config: &MT5Config, setup: AttentionSetup) -> MT5LayerAttention {
        MT5LayerAttention {
            attention: MT5Attention::new(p / name, config, setup),
            layer_norm: MT5LayerNorm::new(p / "layer_norm", config.d_model, config.layer_norm_epsilon),
            dropout: Dropout::new(config.dropout_rate),
        }
    }

    /// Normalizes the input, attends and adds the result to the residual stream.
    pub fn forward_t(
        &self,
        hidden_states: &Tensor,
        encoder_states: Option<&Tensor>,
        position_bias: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        layer_state: Option<LayerState>,
        query_length: Option<i64>,
        train: bool,
    ) -> AttentionOutput {
        let output = self.attention.forward_t(
            &hidden_states.apply(&self.layer_norm),
            encoder_states,
            position_bias,
            attention_mask,
            layer_state,
            query_length,
            train,
        );
        AttentionOutput {
            hidden_states: hidden_states + output.hidden_states.apply_t(&self.dropout, train),
            ..output
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn relative_position_buckets() {
        let relative_position = Tensor::from_slice(&[-200i64, -10, -1, 0, 1, 10, 200]);

        let bidirectional =
            MT5Attention::relative_position_bucket(&relative_position, true, 32, 128);
        let bidirectional = Vec::<i64>::try_from(&bidirectional).unwrap();
        // keys before the query use the first half of the buckets, keys after it the second half
        assert_eq!(bidirectional, vec![15, 8, 1, 0, 17, 24, 31]);

        let causal = MT5Attention::relative_position_bucket(&relative_position, false, 32, 128);
        let causal = Vec::<i64>::try_from(&causal).unwrap();
        assert_eq!(causal, vec![31, 10, 1, 0, 0, 0, 0]);
    }
}
