//! Tokenizer collaborator

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokenizers::{Encoding, Tokenizer, TruncationParams};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Token ids and attention mask of one text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedRecord {
    /// Token ids
    pub input_ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Vec<u32>,
}

impl TokenizedRecord {
    /// Build a record from ids, attending to every token
    pub fn from_ids(input_ids: Vec<u32>) -> Self {
        let attention_mask = vec![1; input_ids.len()];
        Self {
            input_ids,
            attention_mask,
        }
    }

    /// Number of tokens
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Whether the record has no tokens
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    fn from_encoding(encoding: &Encoding) -> Self {
        Self {
            input_ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        }
    }
}

/// Anything that turns texts into token ids
#[cfg_attr(test, mockall::automock)]
pub trait TextTokenizer {
    /// Encode a batch of texts, truncating each to at most `max_length` tokens
    fn encode_batch(&self, texts: &[String], max_length: usize) -> Result<Vec<TokenizedRecord>>;

    /// Id used to pad batches, if the tokenizer defines one
    fn pad_token_id(&self) -> Option<u32>;
}

/// [`TextTokenizer`] backed by a HuggingFace `tokenizer.json`
#[derive(Clone)]
pub struct HfTokenizer {
    tokenizer: Tokenizer,
    pad_token_id: Option<u32>,
    add_special_tokens: bool,
}

impl HfTokenizer {
    /// Wrap a tokenizer, padding with the id of `eos_token`
    pub fn new(tokenizer: Tokenizer, eos_token: &str) -> Self {
        let pad_token_id = tokenizer.token_to_id(eos_token);
        if pad_token_id.is_none() {
            warn!("EOS token '{}' not in vocabulary; batches cannot be padded", eos_token);
        }
        Self {
            tokenizer,
            pad_token_id,
            add_special_tokens: true,
        }
    }

    /// Load a `tokenizer.json`
    pub fn from_file(path: impl AsRef<Path>, eos_token: &str) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            Error::tokenization(format!(
                "cannot load tokenizer from '{}': {}",
                path.display(),
                e
            ))
        })?;
        debug!("Loaded tokenizer from {}", path.display());
        Ok(Self::new(tokenizer, eos_token))
    }

    /// Whether BOS/EOS style special tokens are added while encoding
    pub fn with_special_tokens(mut self, add: bool) -> Self {
        self.add_special_tokens = add;
        self
    }

    /// Vocabulary size including added tokens
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode_batch(&self, texts: &[String], max_length: usize) -> Result<Vec<TokenizedRecord>> {
        let mut tokenizer = self.tokenizer.clone();
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| Error::tokenization(format!("invalid truncation: {}", e)))?;
        tokenizer.with_padding(None);

        let encodings = tokenizer
            .encode_batch(texts.to_vec(), self.add_special_tokens)
            .map_err(|e| Error::tokenization(format!("batch encoding failed: {}", e)))?;

        Ok(encodings.iter().map(TokenizedRecord::from_encoding).collect())
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }
}
