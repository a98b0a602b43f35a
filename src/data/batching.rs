//! Causal language-modeling batch collation

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use super::tokenizer::TokenizedRecord;
use crate::error::{Error, Result};

/// Label value ignored by the loss
pub const IGNORE_INDEX: i64 = -100;

/// Which side of a sequence receives padding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingSide {
    /// Pad after the tokens
    #[default]
    Right,
    /// Pad before the tokens
    Left,
}

/// A padded batch ready for a causal-LM forward pass
#[derive(Debug, Clone)]
pub struct CausalLmBatch {
    /// `(batch, seq_len)` u32 token ids
    pub input_ids: Tensor,
    /// `(batch, seq_len)` u32, 0 at padding
    pub attention_mask: Tensor,
    /// `(batch, seq_len)` i64, [`IGNORE_INDEX`] wherever the id is the pad id
    pub labels: Tensor,
}

/// Pads records to the longest one in the batch and derives labels.
///
/// Labels copy the input ids; every position holding the pad id is set to
/// [`IGNORE_INDEX`]. Since the pad id is the EOS id, real EOS tokens are
/// masked too.
#[derive(Debug, Clone)]
pub struct CausalLmCollator {
    pad_token_id: u32,
    padding_side: PaddingSide,
}

impl CausalLmCollator {
    /// Create a right-padding collator
    pub fn new(pad_token_id: u32) -> Self {
        Self {
            pad_token_id,
            padding_side: PaddingSide::Right,
        }
    }

    /// Set the padding side
    pub fn with_padding_side(mut self, side: PaddingSide) -> Self {
        self.padding_side = side;
        self
    }

    /// Pad id used by this collator
    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// Collate records into tensors on `device`
    pub fn collate(&self, records: &[TokenizedRecord], device: &Device) -> Result<CausalLmBatch> {
        if records.is_empty() {
            return Err(Error::invalid_input("cannot collate an empty batch"));
        }

        let batch = records.len();
        let seq_len = records.iter().map(TokenizedRecord::len).max().unwrap_or(0);
        if seq_len == 0 {
            return Err(Error::invalid_input("cannot collate a batch of empty records"));
        }

        let mut ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len);
        for record in records {
            let pad = seq_len - record.len();
            if self.padding_side == PaddingSide::Left {
                ids.extend(std::iter::repeat(self.pad_token_id).take(pad));
                mask.extend(std::iter::repeat(0u32).take(pad));
            }
            ids.extend_from_slice(&record.input_ids);
            mask.extend_from_slice(&record.attention_mask);
            if self.padding_side == PaddingSide::Right {
                ids.extend(std::iter::repeat(self.pad_token_id).take(pad));
                mask.extend(std::iter::repeat(0u32).take(pad));
            }
        }

        let labels: Vec<i64> = ids
            .iter()
            .map(|&id| {
                if id == self.pad_token_id {
                    IGNORE_INDEX
                } else {
                    i64::from(id)
                }
            })
            .collect();

        Ok(CausalLmBatch {
            input_ids: Tensor::from_vec(ids, (batch, seq_len), device)?,
            attention_mask: Tensor::from_vec(mask, (batch, seq_len), device)?,
            labels: Tensor::from_vec(labels, (batch, seq_len), device)?,
        })
    }
}
