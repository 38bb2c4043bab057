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

use tch::{nn, no_grad, Device, Tensor};
use tracing::info;

use crate::data::TranslationBatch;
use crate::mt5::{MT5Config, MT5ForConditionalGeneration, MT5Generator, Seq2SeqLMOutput};
use crate::pipelines::generation_utils::GenerateConfig;
use crate::resources::ResourceProvider;
use crate::training::config::TrainingConfig;
use crate::{Config, TranslatorError};

/// # Trainable translation model
/// Owns an `MT5ForConditionalGeneration` and its variable store. Each step computes the
/// cross-entropy of a batch against its labels.
pub struct TranslationModule {
    model: MT5ForConditionalGeneration,
    var_store: nn::VarStore,
    config: MT5Config,
}

impl TranslationModule {
    /// Builds the model described by `config_resource` and loads pretrained weights if provided.
    pub fn new(
        config_resource: &dyn ResourceProvider,
        weights_resource: Option<&dyn ResourceProvider>,
        device: Device,
    ) -> Result<TranslationModule, TranslatorError> {
        let config = MT5Config::from_file(config_resource.get_local_path()?)?;
        let mut module = Self::from_config(config, device);
        if let Some(weights_resource) = weights_resource {
            let weights_path = weights_resource.get_local_path()?;
            module.var_store.load(&weights_path)?;
            info!(path = %weights_path.display(), "loaded pretrained weights");
        }
        Ok(module)
    }

    /// Randomly initialized model
    pub fn from_config(config: MT5Config, device: Device) -> TranslationModule {
        let var_store = nn::VarStore::new(device);
        let model = MT5ForConditionalGeneration::new(var_store.root(), &config);
        TranslationModule {
            model,
            var_store,
            config,
        }
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.var_store
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.var_store
    }

    pub fn model_config(&self) -> &MT5Config {
        &self.config
    }

    pub fn model(&self) -> &MT5ForConditionalGeneration {
        &self.model
    }

    pub fn forward(
        &self,
        batch: &TranslationBatch,
        train: bool,
    ) -> Result<Seq2SeqLMOutput, TranslatorError> {
        self.model.forward_with_labels(
            &batch.input_ids,
            Some(&batch.attention_mask),
            &batch.labels,
            Some(&batch.labels_attention_mask),
            train,
        )
    }

    /// Loss of a training batch, with dropout enabled and gradients tracked
    pub fn training_step(&self, batch: &TranslationBatch) -> Result<Tensor, TranslatorError> {
        Ok(self.forward(batch, true)?.loss)
    }

    fn evaluation_step(&self, batch: &TranslationBatch) -> Result<f64, TranslatorError> {
        no_grad(|| Ok(self.forward(batch, false)?.loss.double_value(&[])))
    }

    pub fn validation_step(&self, batch: &TranslationBatch) -> Result<f64, TranslatorError> {
        self.evaluation_step(batch)
    }

    pub fn test_step(&self, batch: &TranslationBatch) -> Result<f64, TranslatorError> {
        self.evaluation_step(batch)
    }

    /// AdamW over every trainable variable
    pub fn configure_optimizer(
        &self,
        config: &TrainingConfig,
    ) -> Result<nn::Optimizer, TranslatorError> {
        let adam = nn::AdamW {
            beta1: config.adam_beta1,
            beta2: config.adam_beta2,
            wd: config.weight_decay,
            eps: config.adam_epsilon,
            amsgrad: false,
        };
        Ok(nn::OptimizerConfig::build(
            adam,
            &self.var_store,
            config.learning_rate,
        )?)
    }

    /// Freezes the weights and wraps the model for generation.
    pub fn into_generator(
        mut self,
        generate_config: GenerateConfig,
    ) -> Result<MT5Generator, TranslatorError> {
        self.var_store.freeze();
        MT5Generator::from_parts(self.model, self.var_store, &self.config, generate_config)
    }
}
