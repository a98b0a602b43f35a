//! Dataset path: loading, tokenization, preprocessing and batch collation

pub mod batching;
pub mod loader;
pub mod preprocess;
pub mod tokenizer;

pub use batching::{CausalLmBatch, CausalLmCollator, PaddingSide, IGNORE_INDEX};
pub use loader::{load_records, parse_records};
pub use preprocess::{PreprocessStats, Preprocessor, TokenizedDataset, DEFAULT_TOKENIZE_BATCH_SIZE};
pub use tokenizer::{HfTokenizer, TextTokenizer, TokenizedRecord};
