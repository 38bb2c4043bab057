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
use tracing::debug;

use crate::TranslatorError;

/// Shuffles `items` with a seeded generator and splits them into `(train, test)`.
///
/// The test set holds `ceil(test_fraction * n)` items, as scikit-learn's `train_test_split` does.
pub fn train_test_split<T>(
    mut items: Vec<T>,
    test_fraction: f64,
    seed: u64,
) -> Result<(Vec<T>, Vec<T>), TranslatorError> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(TranslatorError::ValueError(format!(
            "test_fraction must be in (0, 1), got {test_fraction}"
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);

    let total = items.len();
    let test_size = ((total as f64) * test_fraction).ceil() as usize;
    let train = items.split_off(test_size.min(total));
    let test = items;

    debug!(train = train.len(), test = test.len(), "split corpus");
    Ok((train, test))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_sizes_round_test_up() {
        let items: Vec<usize> = (0..10).collect();
        let (train, test) = train_test_split(items, 0.25, 0).unwrap();
        assert_eq!(test.len(), 3);
        assert_eq!(train.len(), 7);
    }

    #[test]
    fn split_preserves_items_and_is_reproducible() {
        let items: Vec<usize> = (0..50).collect();
        let (train, test) = train_test_split(items.clone(), 0.2, 42).unwrap();
        let (train_again, test_again) = train_test_split(items, 0.2, 42).unwrap();
        assert_eq!(train, train_again);
        assert_eq!(test, test_again);
        let mut all = train.into_iter().chain(test).collect::<Vec<usize>>();
        all.sort_unstable();
        assert_eq!(all, (0..50).collect::<Vec<usize>>());
    }

    #[test]
    fn empty_input_gives_empty_sets() {
        let (train, test) = train_test_split(Vec::<usize>::new(), 0.2, 1).unwrap();
        assert!(train.is_empty());
        assert!(test.is_empty());
    }

    #[test]
    fn invalid_fraction_is_rejected() {
        assert!(train_test_split(vec![1, 2, 3], 0.0, 0).is_err());
        assert!(train_test_split(vec![1, 2, 3], 1.0, 0).is_err());
    }
}
