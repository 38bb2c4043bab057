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

use rust_tokenizers::error::TokenizerError;
use tch::TchError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranslatorError {
    #[error("Endpoint not available error: {0}")]
    FileDownloadError(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Tch tensor error: {0}")]
    TchError(String),

    #[error("Tokenizer error: {0}")]
    TokenizerError(String),

    #[error("Corpus parsing error: {0}")]
    CsvError(String),

    #[error("Invalid configuration error: {0}")]
    InvalidConfigurationError(String),

    #[error("Value error: {0}")]
    ValueError(String),

    #[error("Dataset error: {0}")]
    DatasetError(String),
}

#[cfg(feature = "remote")]
impl From<cached_path::Error> for TranslatorError {
    fn from(error: cached_path::Error) -> Self {
        TranslatorError::FileDownloadError(error.to_string())
    }
}

impl From<std::io::Error> for TranslatorError {
    fn from(error: std::io::Error) -> Self {
        TranslatorError::IOError(error.to_string())
    }
}

impl From<TokenizerError> for TranslatorError {
    fn from(error: TokenizerError) -> Self {
        TranslatorError::TokenizerError(error.to_string())
    }
}

impl From<TchError> for TranslatorError {
    fn from(error: TchError) -> Self {
        TranslatorError::TchError(error.to_string())
    }
}

impl From<csv::Error> for TranslatorError {
    fn from(error: csv::Error) -> Self {
        TranslatorError::CsvError(error.to_string())
    }
}

impl From<serde_json::Error> for TranslatorError {
    fn from(error: serde_json::Error) -> Self {
        TranslatorError::InvalidConfigurationError(error.to_string())
    }
}
