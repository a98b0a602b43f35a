//! Dataset preprocessing: format, tokenize, filter, shuffle

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, instrument};

use super::tokenizer::TextTokenizer;
pub use super::tokenizer::TokenizedRecord;
use crate::error::{Error, Result};
use crate::prompt::{PromptTemplate, RawRecord};

/// Default number of texts handed to the tokenizer at once
pub const DEFAULT_TOKENIZE_BATCH_SIZE: usize = 1000;

/// Counts gathered while preprocessing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessStats {
    /// Records received
    pub input_records: usize,
    /// Records whose token count reached the max length
    pub dropped_too_long: usize,
    /// Records in the final dataset
    pub output_records: usize,
}

/// Training-ready token records in shuffled order
#[derive(Debug, Clone, Default)]
pub struct TokenizedDataset {
    records: Vec<TokenizedRecord>,
    stats: PreprocessStats,
}

impl TokenizedDataset {
    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record survived preprocessing
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record at `index` in shuffled order
    pub fn get(&self, index: usize) -> Option<&TokenizedRecord> {
        self.records.get(index)
    }

    /// Records in shuffled order
    pub fn iter(&self) -> impl Iterator<Item = &TokenizedRecord> {
        self.records.iter()
    }

    /// All records as a slice, shuffled
    pub fn records(&self) -> &[TokenizedRecord] {
        &self.records
    }

    /// Counts gathered while building the dataset
    pub fn stats(&self) -> PreprocessStats {
        self.stats
    }

    /// Longest record in tokens
    pub fn max_record_len(&self) -> usize {
        self.records.iter().map(TokenizedRecord::len).max().unwrap_or(0)
    }

    /// Write one JSON object per record
    pub fn write_jsonl(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        for record in &self.records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl IntoIterator for TokenizedDataset {
    type Item = TokenizedRecord;
    type IntoIter = std::vec::IntoIter<TokenizedRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Turns raw instruction records into shuffled token records
#[derive(Debug, Clone)]
pub struct Preprocessor {
    max_length: usize,
    seed: u64,
    batch_size: usize,
}

impl Preprocessor {
    /// Create a preprocessor for the given max length and shuffle seed
    pub fn new(max_length: usize, seed: u64) -> Self {
        Self {
            max_length,
            seed,
            batch_size: DEFAULT_TOKENIZE_BATCH_SIZE,
        }
    }

    /// Number of texts per tokenizer call
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Truncation and filter bound
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Seed of the shuffle
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Format every record, tokenize with truncation at `max_length`, keep
    /// records shorter than `max_length` and shuffle them with the seed.
    ///
    /// Any tokenizer failure fails the whole run.
    #[instrument(skip(self, records, tokenizer), fields(records = records.len()))]
    pub fn run(
        &self,
        records: &[RawRecord],
        tokenizer: &dyn TextTokenizer,
    ) -> Result<TokenizedDataset> {
        if self.max_length == 0 {
            return Err(Error::invalid_input("max_length must be positive"));
        }
        if self.batch_size == 0 {
            return Err(Error::invalid_input("tokenize batch size must be positive"));
        }

        info!("Preprocessing dataset...");
        let texts: Vec<String> = records
            .iter()
            .map(|record| PromptTemplate::DOLLY.render(record))
            .collect();

        let mut tokenized = Vec::with_capacity(texts.len());
        for (batch_index, batch) in texts.chunks(self.batch_size).enumerate() {
            let encoded = tokenizer.encode_batch(batch, self.max_length)?;
            check_batch(batch_index, batch.len(), &encoded)?;
            tokenized.extend(encoded);
        }

        // Truncation already bounds every record at max_length, so this only
        // drops records that were cut exactly at the bound.
        let before = tokenized.len();
        let mut kept: Vec<TokenizedRecord> = tokenized
            .into_iter()
            .filter(|record| record.len() < self.max_length)
            .collect();
        let dropped = before - kept.len();
        debug!("Dropped {} records at or above {} tokens", dropped, self.max_length);

        let mut rng = StdRng::seed_from_u64(self.seed);
        kept.shuffle(&mut rng);

        let stats = PreprocessStats {
            input_records: records.len(),
            dropped_too_long: dropped,
            output_records: kept.len(),
        };
        info!(
            "Preprocessed {} of {} records (max_length={}, seed={})",
            stats.output_records, stats.input_records, self.max_length, self.seed
        );

        Ok(TokenizedDataset {
            records: kept,
            stats,
        })
    }
}

fn check_batch(batch_index: usize, expected: usize, encoded: &[TokenizedRecord]) -> Result<()> {
    if encoded.len() != expected {
        return Err(Error::tokenization(format!(
            "batch {}: tokenizer returned {} encodings for {} texts",
            batch_index,
            encoded.len(),
            expected
        )));
    }
    if let Some(position) = encoded
        .iter()
        .position(|record| record.input_ids.len() != record.attention_mask.len())
    {
        return Err(Error::tokenization(format!(
            "batch {}: record {} has {} ids but {} mask entries",
            batch_index,
            position,
            encoded[position].input_ids.len(),
            encoded[position].attention_mask.len()
        )));
    }
    Ok(())
}
