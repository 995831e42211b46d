//! Prompt tokenizers producing fixed-length id tensors.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use std::path::Path;
use tokenizers::Tokenizer;

pub trait PromptTokenizer {
    /// Every tokenized prompt is truncated or padded to this length.
    fn model_max_length(&self) -> usize;

    fn pad_token_id(&self) -> u32;

    /// Ids of one prompt including start/end tokens, before truncation.
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>>;

    /// Tokenize a batch into a `[B, model_max_length]` u32 tensor.
    fn tokenize(&self, texts: &[String], device: &Device) -> Result<Tensor> {
        let max_len = self.model_max_length();
        let mut flat = Vec::with_capacity(texts.len() * max_len);
        for text in texts {
            let mut ids = self.encode_ids(text)?;
            ids.truncate(max_len);
            ids.resize(max_len, self.pad_token_id());
            flat.extend(ids);
        }
        Ok(Tensor::from_vec(flat, (texts.len(), max_len), device)?)
    }
}

/// Wrapper over a HuggingFace `tokenizer.json`.
pub struct HfPromptTokenizer {
    tokenizer: Tokenizer,
    max_length: usize,
    pad_id: u32,
}

impl HfPromptTokenizer {
    pub fn new(tokenizer: Tokenizer, max_length: usize, pad_token: Option<&str>) -> Self {
        let pad_id = pad_token
            .and_then(|t| tokenizer.token_to_id(t))
            .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
            .unwrap_or(0);
        Self {
            tokenizer,
            max_length,
            pad_id,
        }
    }

    /// Load `tokenizer.json` from `dir`, taking `model_max_length` and `pad_token` from
    /// `tokenizer_config.json` when present.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(dir.join("tokenizer.json"))
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer from {}: {}", dir.display(), e))?;

        let mut max_length = 77;
        let mut pad_token = None;
        let config_path = dir.join("tokenizer_config.json");
        if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            if let Some(len) = value.get("model_max_length").and_then(|v| v.as_u64()) {
                max_length = len as usize;
            }
            pad_token = value.get("pad_token").and_then(|v| v.as_str()).map(str::to_string);
        }
        Ok(Self::new(tokenizer, max_length, pad_token.as_deref()))
    }
}

impl PromptTokenizer for HfPromptTokenizer {
    fn model_max_length(&self) -> usize {
        self.max_length
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_id
    }

    fn encode_ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {:?}", e))?;
        Ok(encoding.get_ids().to_vec())
    }
}

/// Vocabulary-free tokenizer for freshly initialised text encoders.
///
/// Words are lower-cased and hashed (FNV-1a) into `[0, vocab_size - 2)`; the last two ids are
/// reserved for the start and end tokens, and the end token also pads.
#[derive(Debug, Clone)]
pub struct HashingTokenizer {
    vocab_size: usize,
    max_length: usize,
}

impl HashingTokenizer {
    pub fn new(vocab_size: usize, max_length: usize) -> Self {
        Self {
            vocab_size,
            max_length,
        }
    }

    pub fn bos_token_id(&self) -> u32 {
        (self.vocab_size - 2) as u32
    }

    pub fn eos_token_id(&self) -> u32 {
        (self.vocab_size - 1) as u32
    }

    fn word_id(&self, word: &str) -> u32 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in word.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        (hash % (self.vocab_size as u64 - 2)) as u32
    }
}

impl PromptTokenizer for HashingTokenizer {
    fn model_max_length(&self) -> usize {
        self.max_length
    }

    fn pad_token_id(&self) -> u32 {
        self.eos_token_id()
    }

    fn encode_ids(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = vec![self.bos_token_id()];
        let lowered = text.to_lowercase();
        ids.extend(
            lowered
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .map(|w| self.word_id(w)),
        );
        ids.push(self.eos_token_id());
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_tokenizer_pads_and_truncates() -> Result<()> {
        let tok = HashingTokenizer::new(1000, 8);
        let ids = tok.tokenize(
            &["a photo of sks dog".to_string(), "one two three four five six seven eight".to_string()],
            &Device::Cpu,
        )?;
        assert_eq!(ids.dims(), &[2, 8]);

        let rows = ids.to_vec2::<u32>()?;
        assert_eq!(rows[0][0], 998);
        assert_eq!(rows[0][6], 999);
        assert_eq!(rows[0][7], 999);
        assert!(rows[1].iter().skip(1).all(|&id| id < 998));
        Ok(())
    }

    #[test]
    fn hashing_is_case_insensitive_and_stable() -> Result<()> {
        let tok = HashingTokenizer::new(1000, 77);
        assert_eq!(tok.encode_ids("Red Car")?, tok.encode_ids("red, car")?);
        Ok(())
    }
}
