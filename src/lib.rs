//! LoRAX fine-tuning preparation
//!
//! The data and adapter side of a QLoRA fine-tuning run: Dolly-style prompt
//! formatting, max-length resolution from a model configuration, dataset
//! tokenization with length filtering and seeded shuffling, discovery of the
//! quantized linear layers adapters attach to, and trainable parameter
//! accounting. The optimization itself is delegated to a
//! [`pipeline::TrainingLoop`] implementation.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod lora;
pub mod model;
pub mod pipeline;
pub mod prompt;
pub mod utils;

// Re-exports
pub use config::{ConfigOverrides, CredentialSource, FinetuneConfig, HubToken};
pub use data::{
    load_records, CausalLmCollator, HfTokenizer, Preprocessor, TextTokenizer, TokenizedDataset,
    TokenizedRecord,
};
pub use error::{Error, Result};
pub use lora::{
    find_target_modules, merge_adapters, report_trainable_parameters, AdapterWeights,
    LoraSettings, ParameterTally, PeftAdapterConfig, QuantizationConfig,
    SafetensorsAdapterWeights, TrainableReport,
};
pub use model::{build_causal_lm, resolve_max_length, ModelConfig, ModelGraph, ModuleKind};
pub use pipeline::{
    AdapterPlan, DeviceScope, FinetunePipeline, MergeOutcome, TrainingJob, TrainingLoop,
};
pub use prompt::{format_prompt, FormattedRecord, PromptTemplate, RawRecord};
