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

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::TranslatorError;

/// Columns of the parallel corpus that carry no training signal
pub const DROPPED_COLUMNS: [&str; 5] = ["sid", "분야", "난이도", "수행기관", "길이_분류"];

/// Field values read as missing, as pandas does by default
const MISSING_VALUES: [&str; 19] = [
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

const KOREAN_COLUMNS: [&str; 2] = ["한국어", "korean"];
const ENGLISH_COLUMNS: [&str; 2] = ["영어", "english"];
const KOREAN_LENGTH_COLUMNS: [&str; 2] = ["한국어_어절수", "korean_length"];
const ENGLISH_LENGTH_COLUMNS: [&str; 2] = ["영어_단어수", "english_length"];

/// A Korean sentence and its English translation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentencePair {
    pub korean: String,
    pub english: String,
    /// Number of Korean words (어절)
    pub korean_length: Option<u32>,
    /// Number of English words
    pub english_length: Option<u32>,
}

impl SentencePair {
    pub fn new(korean: impl Into<String>, english: impl Into<String>) -> SentencePair {
        SentencePair {
            korean: korean.into(),
            english: english.into(),
            korean_length: None,
            english_length: None,
        }
    }
}

fn is_missing(value: &str) -> bool {
    MISSING_VALUES.contains(&value)
}

fn find_column(headers: &[String], candidates: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|header| candidates.contains(&header.as_str()))
}

fn parse_length(
    value: &str,
    column: &str,
    path: &Path,
    line: u64,
) -> Result<u32, TranslatorError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|length| length.is_finite() && *length >= 0.0)
        .map(|length| length.round() as u32)
        .ok_or_else(|| {
            TranslatorError::DatasetError(format!(
                "{}:{line}: invalid {column} value {value:?}",
                path.display()
            ))
        })
}

/// Reads a single corpus file. Rows with a missing value in any column are dropped.
pub fn read_corpus_file<P: AsRef<Path>>(path: P) -> Result<Vec<SentencePair>, TranslatorError> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)?;
    let headers = reader
        .headers()?
        .iter()
        .map(|header| header.trim_start_matches('\u{feff}').trim().to_string())
        .collect::<Vec<String>>();

    let korean_column = find_column(&headers, &KOREAN_COLUMNS).ok_or_else(|| {
        TranslatorError::DatasetError(format!("{}: missing 한국어 column", path.display()))
    })?;
    let english_column = find_column(&headers, &ENGLISH_COLUMNS).ok_or_else(|| {
        TranslatorError::DatasetError(format!("{}: missing 영어 column", path.display()))
    })?;
    let korean_length_column = find_column(&headers, &KOREAN_LENGTH_COLUMNS);
    let english_length_column = find_column(&headers, &ENGLISH_LENGTH_COLUMNS);
    let ignored = headers
        .iter()
        .filter(|header| DROPPED_COLUMNS.contains(&header.as_str()))
        .count();
    debug!(path = %path.display(), columns = headers.len(), ignored, "reading corpus file");

    let mut pairs = Vec::new();
    let mut dropped = 0usize;
    for record in reader.records() {
        let record = record?;
        if record.iter().any(is_missing) {
            dropped += 1;
            continue;
        }
        let line = record.position().map_or(0, |position| position.line());
        let length = |column: Option<usize>, name: &str| -> Result<Option<u32>, TranslatorError> {
            column
                .and_then(|index| record.get(index))
                .map(|value| parse_length(value, name, path, line))
                .transpose()
        };
        pairs.push(SentencePair {
            korean: record[korean_column].to_string(),
            english: record[english_column].to_string(),
            korean_length: length(korean_length_column, "korean_length")?,
            english_length: length(english_length_column, "english_length")?,
        });
    }
    if dropped > 0 {
        warn!(path = %path.display(), dropped, "dropped rows with missing values");
    }
    Ok(pairs)
}

/// Lists the `*.csv` files directly under `dir`, sorted by name.
pub fn corpus_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>, TranslatorError> {
    let mut files = fs::read_dir(dir.as_ref())?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<PathBuf>, _>>()?;
    files.retain(|path| path.is_file() && path.extension().map_or(false, |ext| ext == "csv"));
    files.sort();
    Ok(files)
}

/// Loads and concatenates every corpus file of a directory.
///
/// Metadata columns (`sid`, `분야`, `난이도`, `수행기관`, `길이_분류`) are discarded and the
/// Korean headers are mapped to `korean`, `english`, `korean_length` and `english_length`.
/// A directory without corpus files yields an empty corpus.
pub fn load_corpus<P: AsRef<Path>>(dir: P) -> Result<Vec<SentencePair>, TranslatorError> {
    let dir = dir.as_ref();
    let files = corpus_files(dir)?;
    if files.is_empty() {
        warn!(dir = %dir.display(), "no csv files found");
    }
    let mut pairs = Vec::new();
    for file in &files {
        pairs.extend(read_corpus_file(file)?);
    }
    info!(dir = %dir.display(), files = files.len(), pairs = pairs.len(), "loaded corpus");
    Ok(pairs)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pandas_missing_markers_are_recognized() {
        assert!(is_missing(""));
        assert!(is_missing("NaN"));
        assert!(is_missing("null"));
        assert!(!is_missing(" "));
        assert!(!is_missing("Nan bread"));
    }

    #[test]
    fn lengths_accept_float_formatting() {
        let path = Path::new("corpus.csv");
        assert_eq!(parse_length("12", "korean_length", path, 2).unwrap(), 12);
        assert_eq!(parse_length("7.0", "korean_length", path, 2).unwrap(), 7);
        assert!(parse_length("seven", "korean_length", path, 2).is_err());
        assert!(parse_length("-3", "korean_length", path, 2).is_err());
    }

    #[test]
    fn columns_match_either_header_language() {
        let headers = vec!["sid".to_string(), "korean".to_string(), "영어".to_string()];
        assert_eq!(find_column(&headers, &KOREAN_COLUMNS), Some(1));
        assert_eq!(find_column(&headers, &ENGLISH_COLUMNS), Some(2));
        assert_eq!(find_column(&headers, &KOREAN_LENGTH_COLUMNS), None);
    }
}
