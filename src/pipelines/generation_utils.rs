// Copyright 2018 The Google AI Language Team Authors, Facebook AI Research authors.
// Copyright 2018 Google AI, Google Brain and Carnegie Mellon University Authors and the HuggingFace Inc. team.
// Copyright (c) 2018, NVIDIA CORPORATION.  All rights reserved.
// Copyright 2019 Guillaume Becquin
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

//! # Natural Language Generation utilities
//! Decoding utilities for the encoder-decoder models of this crate, serving as a basis for the `TranslationModel`.
//! Include techniques such as beam search, top-k and nucleus sampling, temperature setting and repetition penalty.
//! Generation operates on token ids: the caller encodes the source sentences, pads them to a common length and
//! provides the matching attention mask.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use mt5_translator::mt5::MT5Generator;
//! use mt5_translator::pipelines::generation_utils::{GenerateConfig, LanguageGenerator};
//! use mt5_translator::resources::LocalResource;
//! use std::path::PathBuf;
//! use tch::{Device, Tensor};
//!
//! let generate_config = GenerateConfig {
//!     max_length: 64,
//!     num_beams: 4,
//!     ..Default::default()
//! };
//! let config_resource = LocalResource::from(PathBuf::from("path/to/config.json"));
//! let weights_resource = LocalResource::from(PathBuf::from("path/to/model.ot"));
//! let generator = MT5Generator::new(
//!     &config_resource,
//!     &weights_resource,
//!     Device::Cpu,
//!     generate_config,
//! )?;
//!
//! let input_ids = Tensor::from_slice(&[1042i64, 259, 7, 1]).unsqueeze(0);
//! let output = generator.generate_indices(&input_ids, None, None, None)?;
//! # Ok(())
//! # }
//! ```

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tch::kind::Kind::Int64;
use tch::{no_grad, Tensor};

use crate::mt5::DecoderLayerCache;
use crate::pipelines::generation_utils::private_generation_utils::{
    DecodingOptions, PrivateLanguageGenerator,
};
use crate::TranslatorError;

/// # Configuration for text generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateConfig {
    /// Minimum sequence length (default: 0)
    pub min_length: i64,
    /// Maximum sequence length, decoder start token included (default: 20)
    pub max_length: i64,
    /// Sampling flag. If true, will perform top-k and/or nucleus sampling on generated tokens, otherwise greedy (deterministic) decoding (default: false)
    pub do_sample: bool,
    /// Early stopping flag indicating if the beam search should stop as soon as `num_beam` hypotheses have been generated (default: false)
    pub early_stopping: bool,
    /// Number of beams for beam search (default: 1)
    pub num_beams: i64,
    /// Temperature setting. Values higher than 1 will improve originality at the risk of reducing relevance (default: 1.0)
    pub temperature: f64,
    /// Top_k values for sampling tokens. Value higher than 0 will enable the feature (default: 50)
    pub top_k: i64,
    /// Top_p value for [Nucleus sampling, Holtzman et al.](http://arxiv.org/abs/1904.09751). Keep top tokens until cumulative probability reaches top_p (default: 1.0)
    pub top_p: f64,
    /// Repetition penalty. Values higher than 1 will penalize tokens that have been already generated. (default: 1.0)
    pub repetition_penalty: f64,
    /// Exponential penalty based on the length of the hypotheses generated (default: 1.0)
    pub length_penalty: f64,
    /// Number of allowed repetitions of n-grams. Values higher than 0 turn on this feature (default: 0)
    pub no_repeat_ngram_size: i64,
    /// Number of sequences to return for each input (default: 1)
    pub num_return_sequences: i64,
}

impl Default for GenerateConfig {
    fn default() -> GenerateConfig {
        GenerateConfig {
            min_length: 0,
            max_length: 20,
            do_sample: false,
            early_stopping: false,
            num_beams: 1,
            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
            repetition_penalty: 1.0,
            length_penalty: 1.0,
            no_repeat_ngram_size: 0,
            num_return_sequences: 1,
        }
    }
}

impl GenerateConfig {
    /// Checks the consistency of the decoding settings.
    pub fn validate(&self) -> Result<(), TranslatorError> {
        let check = |condition: bool, message: &str| {
            if condition {
                Ok(())
            } else {
                Err(TranslatorError::InvalidConfigurationError(
                    message.to_string(),
                ))
            }
        };
        check(self.temperature > 0f64, "temperature must be positive")?;
        check(
            (self.top_p >= 0f64) & (self.top_p <= 1f64),
            "top_p must be between 0 and 1",
        )?;
        check(
            self.repetition_penalty >= 1f64,
            "repetition_penalty must be greater than 1",
        )?;
        check(
            self.length_penalty > 0f64,
            "length_penalty must be strictly greater than 0",
        )?;
        check(
            self.num_return_sequences > 0i64,
            "num_return_sequences must be strictly greater than 0",
        )?;
        check(self.num_beams > 0i64, "num_beams must be strictly greater than 0")?;
        check(
            self.max_length > 1,
            "max_length must leave room for at least one generated token",
        )?;
        check(
            self.min_length <= self.max_length,
            "min_length must not exceed max_length",
        )?;
        check(
            self.no_repeat_ngram_size >= 0,
            "no_repeat_ngram_size must be positive",
        )?;

        if !self.do_sample {
            if self.num_beams == 1 {
                check(
                    self.num_return_sequences == 1,
                    "num_return_sequences must be set to 1 for greedy decoding",
                )?;
            } else {
                check(
                    self.num_beams >= self.num_return_sequences,
                    "num_return_sequences must be lower than the number of beams",
                )?;
            }
        }
        Ok(())
    }
}

/// Decoder cache carried between generation steps
#[derive(Debug)]
pub enum Cache {
    MT5Cache(Option<Vec<DecoderLayerCache>>),
    None,
}

/// Output of a single decoding step
pub struct LMModelOutput {
    /// Vocabulary logits of shape (*batch size*, *decoder sequence length*, *vocab_size*)
    pub lm_logits: Tensor,
    /// Updated decoder cache
    pub cache: Cache,
}

pub(crate) mod private_generation_utils {
    use std::cmp::{max, min};
    use std::collections::HashMap;

    use ordered_float::OrderedFloat;
    use tch::kind::Kind::{Bool, Float, Int64};
    use tch::{nn, Device, Tensor};

    use super::{BeamHypotheses, Cache, GenerateConfig, LMModelOutput};
    use crate::TranslatorError;

    /// Decoding settings of a single `generate_indices` call, length overrides applied
    pub struct DecodingOptions {
        pub config: GenerateConfig,
        pub pad_token_id: i64,
        pub eos_token_ids: Vec<i64>,
    }

    impl DecodingOptions {
        /// Repetition penalty, applied to the raw logits of the last position.
        pub(crate) fn penalize(&self, logits: &Tensor, input_ids: &Tensor) -> Tensor {
            let mut logits = logits.select(1, -1).to_kind(Float);
            if self.config.repetition_penalty > 1f64 {
                enforce_repetition_penalty(&mut logits, input_ids, self.config.repetition_penalty);
            }
            logits
        }

        /// Bans repeated n-grams, and end-of-sequence tokens before `min_length`.
        pub(crate) fn restrict(&self, scores: &mut Tensor, input_ids: &Tensor, current_length: i64) {
            if self.config.no_repeat_ngram_size > 0 {
                let banned = get_banned_tokens(
                    input_ids,
                    self.config.no_repeat_ngram_size,
                    current_length,
                );
                ban_tokens(scores, banned);
            }
            if current_length < self.config.min_length {
                let eos_ids = Tensor::from_slice(&self.eos_token_ids).to(scores.device());
                let _ = scores.index_fill_(1, &eos_ids, f64::NEG_INFINITY);
            }
        }

        fn sample(&self, mut logits: Tensor, min_tokens_to_keep: i64, num_samples: i64) -> Tensor {
            top_k_top_p_filtering(
                &mut logits,
                self.config.top_k,
                self.config.top_p,
                min_tokens_to_keep,
            );
            logits.softmax(-1, Float).multinomial(num_samples, false)
        }

        fn eos_mask(&self, tokens: &Tensor) -> Tensor {
            self.eos_token_ids
                .iter()
                .fold(tokens.zeros_like().to_kind(Bool), |mask, eos_id| {
                    mask.logical_or(&tokens.eq(*eos_id))
                })
        }

        /// Top `2 * num_beams` continuations of every input, scored by cumulated log-probability.
        /// Candidate `c` extends beam `c / vocab_size` with token `c % vocab_size`.
        fn beam_candidates(&self, scores: Tensor, batch_size: i64, vocab_size: i64) -> (Tensor, Tensor) {
            let num_beams = self.config.num_beams;
            let width = 2 * num_beams;
            if self.config.do_sample {
                let mut scores = scores;
                top_k_top_p_filtering(&mut scores, self.config.top_k, self.config.top_p, 2);
                let scores = scores.contiguous().view((batch_size, num_beams * vocab_size));
                let candidates = scores.softmax(-1, Float).multinomial(width, false);
                let (candidate_scores, order) = scores.gather(-1, &candidates, false).sort(1, true);
                (candidate_scores, candidates.gather(-1, &order, false))
            } else {
                scores
                    .contiguous()
                    .view((batch_size, num_beams * vocab_size))
                    .topk(width, 1, true, true)
            }
        }
    }

    /// Inputs of the next decoder call: the full sequence on the first step, then only the last
    /// token with the cache.
    pub struct StepInput {
        pub decoder_input_ids: Tensor,
        pub cache: Cache,
    }

    /// Divides positive logits and multiplies negative logits of previously generated tokens by the penalty.
    pub(crate) fn enforce_repetition_penalty(
        next_token_logits: &mut Tensor,
        prev_output_tokens: &Tensor,
        repetition_penalty: f64,
    ) {
        let prev_output_tokens = prev_output_tokens.to_device(next_token_logits.device());
        let scores = next_token_logits.gather(1, &prev_output_tokens, false);
        let penalized =
            (&scores * repetition_penalty).where_self(&scores.lt(0.0), &(&scores / repetition_penalty));
        let _ = next_token_logits.scatter_(1, &prev_output_tokens, &penalized);
    }

    /// Tokens that would complete an n-gram already present in each hypothesis.
    pub(crate) fn get_banned_tokens(
        input_ids: &Tensor,
        no_repeat_ngram_size: i64,
        cur_len: i64,
    ) -> Vec<Vec<i64>> {
        // Ported from hugging face's transformers and fairseq (https://github.com/pytorch/fairseq/blob/master/fairseq/sequence_generator.py)
        let num_hypotheses = input_ids.size()[0];
        if cur_len + 1 < no_repeat_ngram_size {
            return vec![vec![]; num_hypotheses as usize];
        }
        let input_ids = input_ids.to(Device::Cpu);
        let ngram_size = no_repeat_ngram_size as usize;
        let query_start = (cur_len as usize + 1).saturating_sub(ngram_size);
        (0..num_hypotheses)
            .map(|index| {
                let tokens = Vec::<i64>::try_from(&input_ids.get(index)).unwrap_or_default();
                let mut continuations: HashMap<&[i64], Vec<i64>> = HashMap::new();
                for ngram in tokens.windows(ngram_size) {
                    let (prefix, last) = ngram.split_at(ngram_size - 1);
                    continuations.entry(prefix).or_default().push(last[0]);
                }
                continuations
                    .get(&tokens[query_start..cur_len as usize])
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }

    pub(crate) fn top_k_top_p_filtering(
        logits: &mut Tensor,
        top_k: i64,
        top_p: f64,
        min_tokens_to_keep: i64,
    ) {
        // Nucleus and top-k filtering introduced by Holtzman et al. (http://arxiv.org/abs/1904.09751)
        // Ported from https://gist.github.com/thomwolf/1a5a29f6962089e871b94cbd09daf317
        let vocab_size = logits.size()[logits.dim() - 1];
        if top_k > 0 {
            let top_k = min(max(top_k, min_tokens_to_keep), vocab_size);
            let (top_values, _) = logits.topk(top_k, -1, true, true);
            let threshold = top_values.narrow(-1, top_k - 1, 1);
            let below_threshold = logits.lt_tensor(&threshold);
            let _ = logits.masked_fill_(&below_threshold, f64::NEG_INFINITY);
        }
        if top_p < 1f64 {
            let (sorted_logits, sorted_indices) = logits.sort(-1, true);
            let cumulative_probabilities = sorted_logits.softmax(-1, Float).cumsum(-1, Float);
            let outside_nucleus = cumulative_probabilities.gt(top_p).to_kind(Int64);
            // shifted right: the token crossing the threshold stays
            let sorted_to_remove = Tensor::cat(
                &[
                    outside_nucleus.narrow(-1, 0, 1).zeros_like(),
                    outside_nucleus.narrow(-1, 0, vocab_size - 1),
                ],
                -1,
            );
            if min_tokens_to_keep > 1 {
                let _ = sorted_to_remove
                    .narrow(-1, 0, min(min_tokens_to_keep, vocab_size))
                    .fill_(0);
            }
            let to_remove = sorted_to_remove
                .scatter(-1, &sorted_indices, &sorted_to_remove)
                .to_kind(Bool);
            let _ = logits.masked_fill_(&to_remove, f64::NEG_INFINITY);
        }
    }

    fn ban_tokens(scores: &mut Tensor, banned_tokens: Vec<Vec<i64>>) {
        for (row, banned) in banned_tokens.iter().enumerate() {
            if banned.is_empty() {
                continue;
            }
            let banned = Tensor::from_slice(banned).to_device(scores.device());
            let _ = scores
                .get(row as i64)
                .index_fill_(0, &banned, f64::NEG_INFINITY);
        }
    }

    /// Keeps the tokens of a greedy sequence up to its first end-of-sequence token, dropping
    /// the padding added once the sequence finished.
    fn trim_finished(tokens: Vec<i64>, eos_token_ids: &[i64]) -> Vec<i64> {
        match tokens
            .iter()
            .skip(1)
            .position(|token| eos_token_ids.contains(token))
        {
            Some(position) => tokens[..position + 2].to_vec(),
            None => tokens,
        }
    }

    pub trait PrivateLanguageGenerator {
        fn get_var_store(&self) -> &nn::VarStore;
        fn get_config(&self) -> &GenerateConfig;
        fn get_eos_ids(&self) -> &[i64];
        fn get_pad_id(&self) -> i64;
        fn get_vocab_size(&self) -> i64;
        fn get_decoder_start_id(&self) -> i64;

        fn forward_t(
            &self,
            cache: Cache,
            attention_mask: Option<&Tensor>,
            encoder_outputs: Option<&Tensor>,
            decoder_input_ids: &Tensor,
            train: bool,
        ) -> Result<LMModelOutput, TranslatorError>;

        fn encode(
            &self,
            input_ids: &Tensor,
            attention_mask: Option<&Tensor>,
        ) -> Result<Tensor, TranslatorError>;

        fn prepare_inputs_for_generation(&self, input_ids: &Tensor, past: Cache) -> StepInput;

        /// Re-orders the cache rows after beams were selected. Encoder outputs need no
        /// re-ordering: the beams of an input share its encoder rows.
        fn reorder_cache(&self, past: &mut Cache, beam_indices: &Tensor);

        /// Runs the decoder on the sequences generated so far and returns the logits with the updated cache.
        fn decode_step(
            &self,
            input_ids: &Tensor,
            encoder_outputs: &Tensor,
            attention_mask: &Tensor,
            past: Cache,
        ) -> Result<LMModelOutput, TranslatorError> {
            let step = self.prepare_inputs_for_generation(input_ids, past);
            self.forward_t(
                step.cache,
                Some(attention_mask),
                Some(encoder_outputs),
                &step.decoder_input_ids,
                false,
            )
        }

        /// Greedy decoding, or sampling when `do_sample` is set. Sequences that produced an
        /// end-of-sequence token are padded until every sequence finished.
        fn generate_no_beam_search(
            &self,
            mut input_ids: Tensor,
            encoder_outputs: &Tensor,
            attention_mask: &Tensor,
            options: &DecodingOptions,
        ) -> Result<Vec<Vec<i64>>, TranslatorError> {
            let config = &options.config;
            let mut unfinished = Tensor::ones([input_ids.size()[0]], (Bool, input_ids.device()));
            let mut past = Cache::None;

            for current_length in input_ids.size()[1]..config.max_length {
                let output = self.decode_step(&input_ids, encoder_outputs, attention_mask, past)?;
                past = output.cache;
                let mut logits = options.penalize(&output.lm_logits, &input_ids);
                options.restrict(&mut logits, &input_ids, current_length);

                let next_tokens = if config.do_sample {
                    if config.temperature != 1f64 {
                        logits /= config.temperature;
                    }
                    options.sample(logits, 1, 1).squeeze_dim(1)
                } else {
                    logits.argmax(-1, false)
                };
                let next_tokens =
                    next_tokens.where_self(&unfinished, &next_tokens.full_like(options.pad_token_id));

                unfinished = unfinished.logical_and(&options.eos_mask(&next_tokens).logical_not());
                input_ids = Tensor::cat(&[input_ids, next_tokens.unsqueeze(-1)], -1);
                if unfinished.any().int64_value(&[]) == 0 {
                    break;
                }
            }

            (0..input_ids.size()[0])
                .map(|row| -> Result<Vec<i64>, TranslatorError> {
                    let tokens = Vec::<i64>::try_from(&input_ids.get(row))?;
                    Ok(trim_finished(tokens, &options.eos_token_ids))
                })
                .collect()
        }

        /// Beam search keeping `num_beams` live hypotheses per input. Beams ending with an
        /// end-of-sequence token are moved to the input's finished hypotheses.
        fn generate_beam_search(
            &self,
            mut input_ids: Tensor,
            encoder_outputs: &Tensor,
            attention_mask: &Tensor,
            batch_size: i64,
            options: &DecodingOptions,
        ) -> Result<Vec<Vec<i64>>, TranslatorError> {
            let config = &options.config;
            let num_beams = config.num_beams;
            let vocab_size = self.get_vocab_size();
            let device = input_ids.device();
            let mut hypotheses = (0..batch_size)
                .map(|_| BeamHypotheses::new(config))
                .collect::<Vec<BeamHypotheses>>();
            let mut done = vec![false; batch_size as usize];

            let beam_scores = Tensor::zeros([batch_size, num_beams], (Float, device));
            if !config.do_sample {
                // beams of an input start identical: only the first one is expanded
                let _ = beam_scores.narrow(1, 1, num_beams - 1).fill_(-1e9);
            }
            let mut beam_scores = beam_scores.view(-1);
            let batch_offsets = Tensor::arange(batch_size, (Int64, device)).unsqueeze(1) * num_beams;
            let mut past = Cache::None;

            for current_length in input_ids.size()[1]..config.max_length {
                let output = self.decode_step(&input_ids, encoder_outputs, attention_mask, past)?;
                past = output.cache;
                let mut logits = options.penalize(&output.lm_logits, &input_ids);
                if config.do_sample && config.temperature != 1f64 {
                    logits /= config.temperature;
                }
                let mut scores = logits.log_softmax(-1, Float);
                options.restrict(&mut scores, &input_ids, current_length);

                let (candidate_scores, candidates) = options.beam_candidates(
                    scores + beam_scores.unsqueeze(-1),
                    batch_size,
                    vocab_size,
                );
                let source_beams = candidates.floor_divide_scalar(vocab_size);
                let tokens = &candidates - &source_beams * vocab_size;
                let source_rows = &source_beams + &batch_offsets;
                let (best_candidate_scores, _) = candidate_scores.max_dim(1, false);

                let is_eos = options.eos_mask(&tokens);
                let continuing = is_eos.logical_not();
                // an input has at most `num_beams` end-of-sequence candidates: the first
                // `num_beams` others always exist
                let keep = continuing
                    .to_kind(Int64)
                    .cumsum(1, Int64)
                    .le(num_beams)
                    .logical_and(&continuing);

                let finished = is_eos.narrow(1, 0, num_beams).nonzero();
                for index in 0..finished.size()[0] {
                    let batch_index = finished.int64_value(&[index, 0]);
                    let rank = finished.int64_value(&[index, 1]);
                    if done[batch_index as usize] {
                        continue;
                    }
                    let source_row = source_rows.int64_value(&[batch_index, rank]);
                    hypotheses[batch_index as usize].add(
                        input_ids.get(source_row).copy(),
                        candidate_scores.double_value(&[batch_index, rank]),
                    );
                }

                let next_scores = candidate_scores.masked_select(&keep);
                let next_tokens = tokens.masked_select(&keep);
                let next_rows = source_rows.masked_select(&keep);
                for batch_index in 0..batch_size {
                    let input_done = &mut done[batch_index as usize];
                    if *input_done {
                        let slots = |tensor: &Tensor| tensor.narrow(0, batch_index * num_beams, num_beams);
                        let _ = slots(&next_scores).fill_(0f64);
                        let _ = slots(&next_tokens).fill_(options.pad_token_id);
                        let _ = slots(&next_rows).fill_(batch_index * num_beams);
                    } else {
                        *input_done = hypotheses[batch_index as usize].is_done(
                            best_candidate_scores.double_value(&[batch_index]),
                            current_length,
                        );
                    }
                }
                if done.iter().all(|&input_done| input_done) {
                    break;
                }

                input_ids = Tensor::cat(
                    &[input_ids.index_select(0, &next_rows), next_tokens.unsqueeze(1)],
                    -1,
                );
                self.reorder_cache(&mut past, &next_rows);
                beam_scores = next_scores;
            }

            for (batch_index, input_hypotheses) in hypotheses.iter_mut().enumerate() {
                if done[batch_index] {
                    continue;
                }
                for beam in 0..num_beams {
                    let row = batch_index as i64 * num_beams + beam;
                    input_hypotheses.add(input_ids.get(row), beam_scores.double_value(&[row]));
                }
            }

            let per_input = if config.do_sample {
                1
            } else {
                config.num_return_sequences
            };
            let mut output = Vec::with_capacity((batch_size * per_input) as usize);
            for input_hypotheses in hypotheses {
                let mut ranked = input_hypotheses.beams;
                ranked.sort_by_key(|(score, _)| OrderedFloat(-*score));
                if (ranked.len() as i64) < per_input {
                    return Err(TranslatorError::ValueError(
                        "beam search finished with fewer hypotheses than requested sequences"
                            .to_string(),
                    ));
                }
                for (_, tokens) in ranked.into_iter().take(per_input as usize) {
                    let mut tokens = Vec::<i64>::try_from(&tokens)?;
                    if (tokens.len() as i64) < config.max_length {
                        tokens.push(options.eos_token_ids[0]);
                    }
                    output.push(tokens);
                }
            }
            Ok(output)
        }
    }
}

/// # Common trait for text generation models.
/// Main API for generation from token ids
pub trait LanguageGenerator: PrivateLanguageGenerator {
    /// Generate token ids from a batch of encoded source sequences.
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Tensor of shape (*batch size*, *source sequence length*) holding the encoder inputs
    /// * `attention_mask` - Optional attention mask of shape (*batch size*, *source sequence length*). Computed from the padding token if not provided.
    /// * `min_length` - Optional override of the minimum generated length
    /// * `max_length` - Optional override of the maximum generated length
    ///
    /// # Returns
    /// * `Vec<Vec<i64>>` generated token ids, starting with the decoder start token and ending with the
    ///   end-of-sequence token unless `max_length` was reached. *batch size* x *num_return_sequences* entries,
    ///   grouped by input.
    fn generate_indices(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        min_length: impl Into<Option<i64>>,
        max_length: impl Into<Option<i64>>,
    ) -> Result<Vec<Vec<i64>>, TranslatorError> {
        let base_config = PrivateLanguageGenerator::get_config(self);
        let config = GenerateConfig {
            min_length: min_length.into().unwrap_or(base_config.min_length),
            max_length: max_length.into().unwrap_or(base_config.max_length),
            ..base_config.clone()
        };
        if config.max_length < 2 {
            return Err(TranslatorError::ValueError(format!(
                "max_length must be at least 2, got {}",
                config.max_length
            )));
        }

        let device = self.get_var_store().device();
        let input_ids = input_ids.to_device(device);
        let (batch_size, source_length) = (input_ids.size()[0], input_ids.size()[1]);
        let attention_mask = match attention_mask {
            Some(mask) => mask.to_device(device),
            None => input_ids.ne(self.get_pad_id()).to_kind(Int64),
        };

        // sampled sequences are drawn independently: every input is repeated
        let copies_per_input = if config.do_sample {
            config.num_return_sequences
        } else {
            1
        };
        let effective_batch_size = batch_size * copies_per_input;
        let rows_per_input = copies_per_input * config.num_beams;
        let options = DecodingOptions {
            config,
            pad_token_id: self.get_pad_id(),
            eos_token_ids: self.get_eos_ids().to_vec(),
        };

        no_grad(|| {
            let row_sources = Tensor::arange(batch_size, (Int64, device))
                .view((-1, 1))
                .repeat([1, rows_per_input])
                .view(-1);
            let encoder_outputs = self
                .encode(&input_ids, Some(&attention_mask))?
                .index_select(0, &row_sources);
            let attention_mask = if rows_per_input > 1 {
                attention_mask
                    .unsqueeze(1)
                    .expand([batch_size, rows_per_input, source_length], true)
                    .contiguous()
                    .view((batch_size * rows_per_input, source_length))
            } else {
                attention_mask
            };
            let decoder_input_ids = Tensor::full(
                [batch_size * rows_per_input, 1],
                self.get_decoder_start_id(),
                (Int64, device),
            );

            if options.config.num_beams > 1 {
                self.generate_beam_search(
                    decoder_input_ids,
                    &encoder_outputs,
                    &attention_mask,
                    effective_batch_size,
                    &options,
                )
            } else {
                self.generate_no_beam_search(
                    decoder_input_ids,
                    &encoder_outputs,
                    &attention_mask,
                    &options,
                )
            }
        })
    }
}

/// Finished hypotheses of one input, at most `num_beams`, scored by
/// `sum_log_probabilities / length^length_penalty`.
#[derive(Debug)]
struct BeamHypotheses {
    max_length: i64,
    length_penalty: f64,
    early_stopping: bool,
    num_beams: i64,
    beams: Vec<(f64, Tensor)>,
    worst_score: f64,
}

impl BeamHypotheses {
    fn new(config: &GenerateConfig) -> BeamHypotheses {
        BeamHypotheses {
            max_length: config.max_length - 1,
            length_penalty: config.length_penalty,
            early_stopping: config.early_stopping,
            num_beams: config.num_beams,
            beams: Vec::with_capacity(config.num_beams as usize + 1),
            worst_score: 1e9f64,
        }
    }

    fn len(&self) -> i64 {
        self.beams.len() as i64
    }

    fn is_full(&self) -> bool {
        self.len() >= self.num_beams
    }

    fn add(&mut self, hypothesis: Tensor, sum_log_probabilities: f64) {
        let length = hypothesis.size()[0] as f64;
        let score = sum_log_probabilities / length.powf(self.length_penalty);
        if self.is_full() && score <= self.worst_score {
            return;
        }
        self.beams.push((score, hypothesis));
        if self.len() > self.num_beams {
            if let Some(worst) = self
                .beams
                .iter()
                .enumerate()
                .min_by_key(|(_, (score, _))| OrderedFloat(*score))
                .map(|(position, _)| position)
            {
                self.beams.remove(worst);
            }
        }
        self.worst_score = self
            .beams
            .iter()
            .map(|(score, _)| OrderedFloat(*score))
            .min()
            .map_or(score, |score| score.0);
    }

    /// True when no live beam can beat the worst finished hypothesis any more.
    fn is_done(&self, best_sum_log_probabilities: f64, current_length: i64) -> bool {
        if !self.is_full() {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        let length = current_length.min(self.max_length) as f64;
        self.worst_score >= best_sum_log_probabilities / length.powf(self.length_penalty)
    }
}

#[cfg(test)]
mod test {
    use super::private_generation_utils::{
        enforce_repetition_penalty, get_banned_tokens, top_k_top_p_filtering,
    };
    use super::*;
    use tch::Kind;

    #[test]
    fn default_config_is_valid() {
        assert!(GenerateConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let too_many_sequences = GenerateConfig {
            num_beams: 2,
            num_return_sequences: 3,
            ..Default::default()
        };
        assert!(matches!(
            too_many_sequences.validate(),
            Err(TranslatorError::InvalidConfigurationError(_))
        ));
        let negative_length_penalty = GenerateConfig {
            length_penalty: -1.0,
            ..Default::default()
        };
        assert!(negative_length_penalty.validate().is_err());
        let short = GenerateConfig {
            max_length: 1,
            ..Default::default()
        };
        assert!(short.validate().is_err());
    }

    fn beam_config(num_beams: i64, length_penalty: f64, early_stopping: bool) -> GenerateConfig {
        GenerateConfig {
            max_length: 10,
            num_beams,
            length_penalty,
            early_stopping,
            ..Default::default()
        }
    }

    #[test]
    fn hypotheses_keep_best_scores() {
        let mut hypotheses = BeamHypotheses::new(&beam_config(2, 1.0, false));
        hypotheses.add(Tensor::from_slice(&[0i64, 5]), -4.0);
        hypotheses.add(Tensor::from_slice(&[0i64, 6]), -1.0);
        hypotheses.add(Tensor::from_slice(&[0i64, 7]), -3.0);
        assert_eq!(hypotheses.len(), 2);
        assert_eq!(hypotheses.worst_score, -1.5);
        assert!(!hypotheses.is_done(0.0, 3));
        assert!(hypotheses.is_done(-6.0, 3));
    }

    #[test]
    fn early_stopping_hypotheses_are_done_when_full() {
        let mut hypotheses = BeamHypotheses::new(&beam_config(1, 2.0, true));
        assert!(!hypotheses.is_done(0.0, 2));
        hypotheses.add(Tensor::from_slice(&[0i64, 5, 6]), -9.0);
        assert_eq!(hypotheses.worst_score, -1.0);
        assert!(hypotheses.is_done(0.0, 2));
    }

    #[test]
    fn repetition_penalty_scales_previous_tokens() {
        let mut logits = Tensor::from_slice(&[2.0f32, -2.0, 1.0]).view((1, 3));
        let previous = Tensor::from_slice(&[0i64, 1]).view((1, 2));
        enforce_repetition_penalty(&mut logits, &previous, 2.0);
        let values = Vec::<f32>::try_from(&logits.view(-1)).unwrap();
        assert_eq!(values, vec![1.0, -4.0, 1.0]);
    }

    #[test]
    fn repeated_ngrams_are_banned() {
        let input_ids = Tensor::from_slice(&[0i64, 3, 4, 5, 3]).view((1, 5));
        let banned = get_banned_tokens(&input_ids, 2, 5);
        assert_eq!(banned, vec![vec![4]]);
        let banned = get_banned_tokens(&input_ids, 3, 1);
        assert_eq!(banned, vec![Vec::<i64>::new()]);
    }

    #[test]
    fn top_k_keeps_highest_logits() {
        let mut logits = Tensor::from_slice(&[1.0f32, 4.0, 3.0, 2.0]).view((1, 4));
        top_k_top_p_filtering(&mut logits, 2, 1.0, 1);
        let kept = logits.isfinite().to_kind(Kind::Int64).view(-1);
        assert_eq!(Vec::<i64>::try_from(&kept).unwrap(), vec![0, 1, 1, 0]);
    }

    #[test]
    fn top_p_keeps_nucleus() {
        let mut logits = Tensor::from_slice(&[10.0f32, 0.0, 9.5, -5.0]).view((1, 4));
        top_k_top_p_filtering(&mut logits, 0, 0.9, 1);
        let kept = logits.isfinite().to_kind(Kind::Int64).view(-1);
        assert_eq!(Vec::<i64>::try_from(&kept).unwrap(), vec![1, 0, 1, 0]);
    }
}
