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

/// # Linear learning rate schedule with warm-up
/// The learning rate grows linearly from 0 to the base rate over `warmup_steps`, then decays
/// linearly to 0 at `total_steps`.
#[derive(Debug, Clone)]
pub struct LinearScheduleWithWarmup {
    base_learning_rate: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LinearScheduleWithWarmup {
    pub fn new(
        base_learning_rate: f64,
        warmup_steps: usize,
        total_steps: usize,
    ) -> LinearScheduleWithWarmup {
        LinearScheduleWithWarmup {
            base_learning_rate,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    fn factor(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            step as f64 / self.warmup_steps.max(1) as f64
        } else {
            let remaining = self.total_steps.saturating_sub(step) as f64;
            let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
            (remaining / decay_steps).max(0.0)
        }
    }

    /// Learning rate for the current step
    pub fn learning_rate(&self) -> f64 {
        self.base_learning_rate * self.factor(self.current_step)
    }

    /// Advances by one optimizer step and returns the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.learning_rate()
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }
}
