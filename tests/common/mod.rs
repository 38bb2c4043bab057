#![allow(dead_code)]

use std::fs;
use std::path::Path;

use mt5_translator::mt5::{FeedForwardProj, MT5Config};
use mt5_translator::pipelines::tokenizers::Seq2SeqTokenizer;

pub const PAD_ID: i64 = 0;
pub const EOS_ID: i64 = 1;
const BYTE_OFFSET: i64 = 3;
pub const BYTE_VOCAB_SIZE: i64 = 256 + BYTE_OFFSET;

/// Maps every UTF-8 byte to its own id, after the padding, end-of-sequence and unknown tokens.
#[derive(Debug, Default)]
pub struct ByteTokenizer;

impl Seq2SeqTokenizer for ByteTokenizer {
    fn encode(&self, text: &str, max_len: usize) -> Vec<i64> {
        let mut ids: Vec<i64> = text
            .bytes()
            .take(max_len.saturating_sub(1))
            .map(|byte| byte as i64 + BYTE_OFFSET)
            .collect();
        if max_len > 0 {
            ids.push(EOS_ID);
        }
        ids
    }

    fn decode(
        &self,
        token_ids: &[i64],
        skip_special_tokens: bool,
        _clean_up_tokenization_spaces: bool,
    ) -> String {
        let bytes: Vec<u8> = token_ids
            .iter()
            .filter_map(|&id| match id {
                id if id >= BYTE_OFFSET => Some((id - BYTE_OFFSET) as u8),
                _ if skip_special_tokens => None,
                _ => Some(b'?'),
            })
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn pad_id(&self) -> i64 {
        PAD_ID
    }

    fn eos_id(&self) -> i64 {
        EOS_ID
    }
}

/// Two-layer model small enough for CPU tests
pub fn tiny_config() -> MT5Config {
    MT5Config {
        dropout_rate: 0.0,
        d_model: 16,
        d_ff: 32,
        d_kv: 8,
        num_heads: 2,
        num_layers: 2,
        num_decoder_layers: Some(2),
        relative_attention_num_buckets: 8,
        relative_attention_max_distance: Some(16),
        vocab_size: BYTE_VOCAB_SIZE,
        feed_forward_proj: Some(FeedForwardProj::GatedGelu),
        ..Default::default()
    }
}

pub const CORPUS_HEADER: &str = "sid,분야,한국어,영어,한국어_어절수,영어_단어수,난이도,수행기관,길이_분류";

pub fn write_corpus(dir: &Path, file_name: &str, rows: &[(&str, &str)]) -> anyhow::Result<()> {
    let mut content = String::from(CORPUS_HEADER);
    content.push('\n');
    for (index, (korean, english)) in rows.iter().enumerate() {
        content.push_str(&format!(
            "{index},일상,{korean},{english},{},{},1,기관,짧음\n",
            korean.split_whitespace().count(),
            english.split_whitespace().count()
        ));
    }
    fs::write(dir.join(file_name), content)?;
    Ok(())
}

pub const PAIRS: [(&str, &str); 6] = [
    ("안녕하세요", "Hello"),
    ("감사합니다", "Thank you"),
    ("좋은 아침", "Good morning"),
    ("잘 자요", "Good night"),
    ("사랑해요", "I love you"),
    ("미안해요", "I am sorry"),
];
