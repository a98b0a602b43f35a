//! LoRA adapter planning: configuration, target discovery, injection,
//! parameter accounting and merging

pub mod accounting;
pub mod config;
pub mod inject;
pub mod merge;
pub mod targets;

pub use accounting::{report_trainable_parameters, DtypeBreakdown, ParameterTally, TrainableReport};
pub use config::{
    BiasType, ComputeDtype, LoraSettings, PeftAdapterConfig, QuantType, QuantizationConfig,
    TaskType,
};
pub use inject::{inject_adapters, prepare_for_kbit_training, ADAPTER_NAME};
pub use merge::{merge_adapters, merge_lora_weight, AdapterWeights, SafetensorsAdapterWeights, PEFT_PREFIX};
pub use targets::{find_target_modules, TargetSelector, OUTPUT_HEAD};
