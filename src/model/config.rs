//! Model configuration as published alongside pretrained checkpoints

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::debug;

use crate::error::Result;

/// Subset of a HuggingFace `config.json` the pipeline reads.
///
/// Unknown keys are kept in `extra` so attribute lookups can reach them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Architecture family, e.g. `llama`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    /// GPT-2 style context length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_positions: Option<usize>,
    /// LLaMA / BERT style context length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_position_embeddings: Option<usize>,
    /// Context length used by some custom architectures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_length: Option<usize>,
    /// Model width
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden_size: Option<usize>,
    /// MLP width
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_size: Option<usize>,
    /// Number of decoder layers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_hidden_layers: Option<usize>,
    /// Number of attention heads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_attention_heads: Option<usize>,
    /// Number of key/value heads (grouped-query attention)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_key_value_heads: Option<usize>,
    /// Vocabulary size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocab_size: Option<usize>,
    /// Whether the output head shares the embedding matrix
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Every other key of the file
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelConfig {
    /// Load a `config.json`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading model configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Look up an integer attribute by name.
    ///
    /// Typed fields are consulted first, then `extra`. Values that are not
    /// non-negative integers read as absent.
    pub fn attr(&self, name: &str) -> Option<usize> {
        let typed = match name {
            "n_positions" => self.n_positions,
            "max_position_embeddings" => self.max_position_embeddings,
            "seq_length" => self.seq_length,
            "hidden_size" => self.hidden_size,
            "intermediate_size" => self.intermediate_size,
            "num_hidden_layers" => self.num_hidden_layers,
            "num_attention_heads" => self.num_attention_heads,
            "num_key_value_heads" => self.num_key_value_heads,
            "vocab_size" => self.vocab_size,
            _ => None,
        };
        typed.or_else(|| {
            self.extra
                .get(name)
                .and_then(Value::as_u64)
                .and_then(|v| usize::try_from(v).ok())
        })
    }
}
