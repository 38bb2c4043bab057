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

//! Small tensor building blocks shared by the model layers.

use std::f64::consts::PI;

use tch::nn::ModuleT;
use tch::{Kind, Scalar, Tensor};

use crate::TranslatorError;

/// Non-linearities of the feed-forward sub-layers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activation {
    Relu,
    /// tanh approximation of GeLU
    GeluNew,
}

impl Activation {
    pub(crate) fn apply(&self, x: &Tensor) -> Tensor {
        match self {
            Activation::Relu => x.relu(),
            Activation::GeluNew => {
                let inner = (x + x.pow_tensor_scalar(3.0) * 0.044715) * (2.0 / PI).sqrt();
                x * 0.5 * (inner.tanh() + 1.0)
            }
        }
    }
}

/// Dropout layer, a no-op outside training or when the probability is 0
#[derive(Debug, Clone, Copy)]
pub(crate) struct Dropout {
    probability: f64,
}

impl Dropout {
    pub(crate) fn new(probability: f64) -> Dropout {
        Dropout { probability }
    }
}

impl ModuleT for Dropout {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        if train && self.probability > 0.0 {
            input.dropout(self.probability, true)
        } else {
            input.shallow_clone()
        }
    }
}

/// Lowest finite value of `kind`, used to fill masked attention scores.
pub(crate) fn min_value(kind: Kind) -> Result<Scalar, TranslatorError> {
    match kind {
        Kind::Half => Ok(Scalar::float(half::f16::MIN.into())),
        Kind::BFloat16 => Ok(Scalar::float(half::bf16::MIN.into())),
        Kind::Float => Ok(Scalar::float(f32::MIN.into())),
        Kind::Double => Ok(Scalar::float(f64::MIN)),
        Kind::Int => Ok(Scalar::int(i32::MIN.into())),
        Kind::Int64 => Ok(Scalar::int(i64::MIN)),
        _ => Err(TranslatorError::ValueError(format!(
            "no minimum value for attention masks of kind {kind:?}"
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tch::Device;

    #[test]
    fn gelu_matches_exact_definition_closely() {
        let x = Tensor::from_slice(&[-2.0f32, -0.5, 0.0, 0.5, 2.0]);
        let exact = &x * 0.5 * ((&x / 2f64.sqrt()).erf() + 1.0);
        let difference = (Activation::GeluNew.apply(&x) - exact)
            .abs()
            .max()
            .double_value(&[]);
        assert!(difference < 1e-3);
        assert_eq!(Activation::Relu.apply(&x).double_value(&[1]), 0.0);
    }

    #[test]
    fn dropout_is_identity_in_eval_mode() {
        let x = Tensor::ones([4, 4], (Kind::Float, Device::Cpu));
        let output = x.apply_t(&Dropout::new(0.5), false);
        assert_eq!(output.sum(Kind::Float).double_value(&[]), 16.0);
    }

    #[test]
    fn min_value_per_kind() {
        let float_min = Tensor::full([1], min_value(Kind::Float).unwrap(), (Kind::Float, Device::Cpu));
        assert_eq!(float_min.double_value(&[0]), f32::MIN as f64);
        assert!(min_value(Kind::Bool).is_err());
    }
}
