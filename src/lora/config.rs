//! LoRA and quantization configuration types

use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::model::ModuleKind;

/// 4-bit quantization data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    /// NormalFloat4
    Nf4,
    /// Plain 4-bit float
    Fp4,
}

/// Dtype used for computation on dequantized weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDtype {
    /// bfloat16
    Bf16,
    /// float16
    F16,
    /// float32
    F32,
}

impl ComputeDtype {
    /// Corresponding candle dtype
    pub fn dtype(&self) -> DType {
        match self {
            ComputeDtype::Bf16 => DType::BF16,
            ComputeDtype::F16 => DType::F16,
            ComputeDtype::F32 => DType::F32,
        }
    }
}

/// Quantized model loading configuration (bitsandbytes style)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    /// Load linear weights in 4 bits
    pub load_in_4bit: bool,
    /// Load linear weights in 8 bits
    pub load_in_8bit: bool,
    /// Quantize the quantization constants as well
    pub double_quant: bool,
    /// 4-bit data type
    pub quant_type: QuantType,
    /// Compute dtype of dequantized matmuls
    pub compute_dtype: ComputeDtype,
    /// Halve the trainable count when reporting under 4-bit loading
    pub halve_trainable_count: bool,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            load_in_4bit: true,
            load_in_8bit: false,
            double_quant: true,
            quant_type: QuantType::Nf4,
            compute_dtype: ComputeDtype::Bf16,
            halve_trainable_count: false,
        }
    }
}

impl QuantizationConfig {
    /// Configuration for loading without quantization
    pub fn full_precision(compute_dtype: ComputeDtype) -> Self {
        Self {
            load_in_4bit: false,
            load_in_8bit: false,
            double_quant: false,
            compute_dtype,
            ..Self::default()
        }
    }

    /// Effective weight bit width
    pub fn bits(&self) -> u8 {
        if self.load_in_4bit {
            4
        } else if self.load_in_8bit {
            8
        } else {
            16
        }
    }

    /// Linear layer type adapters are injected into at this bit width
    pub fn target_kind(&self) -> ModuleKind {
        match self.bits() {
            4 => ModuleKind::Linear4bit,
            8 => ModuleKind::Linear8bitLt,
            _ => ModuleKind::Linear,
        }
    }

    /// Whether the trainable count is halved in reports
    pub fn packed_4bit_accounting(&self) -> bool {
        self.load_in_4bit && self.halve_trainable_count
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.load_in_4bit && self.load_in_8bit {
            return Err(Error::config(
                "load_in_4bit and load_in_8bit are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// Types of bias handling in LoRA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasType {
    /// No bias adaptation
    None,
    /// Adapt all bias terms
    All,
    /// Only adapt LoRA bias terms
    LoraOnly,
}

impl BiasType {
    fn as_str(&self) -> &'static str {
        match self {
            BiasType::None => "none",
            BiasType::All => "all",
            BiasType::LoraOnly => "lora_only",
        }
    }
}

/// Model head the adapter is trained for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Next-token prediction
    CausalLm,
    /// Sequence classification
    SeqCls,
    /// Encoder-decoder generation
    #[serde(rename = "SEQ_2_SEQ_LM")]
    Seq2SeqLm,
}

impl TaskType {
    fn as_str(&self) -> &'static str {
        match self {
            TaskType::CausalLm => "CAUSAL_LM",
            TaskType::SeqCls => "SEQ_CLS",
            TaskType::Seq2SeqLm => "SEQ_2_SEQ_LM",
        }
    }
}

/// LoRA adapter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraSettings {
    /// Rank of the update matrices
    pub r: usize,
    /// Scaling numerator
    pub alpha: f32,
    /// Dropout probability on the adapter input
    pub dropout: f32,
    /// Bias handling
    pub bias: BiasType,
    /// Task head
    pub task_type: TaskType,
    /// Explicit target module names; discovered from the model when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_modules: Option<Vec<String>>,
}

impl Default for LoraSettings {
    fn default() -> Self {
        Self {
            r: 16,
            alpha: 64.0,
            dropout: 0.1,
            bias: BiasType::None,
            task_type: TaskType::CausalLm,
            target_modules: None,
        }
    }
}

impl LoraSettings {
    /// Effective scaling factor (alpha / r)
    pub fn scaling(&self) -> f64 {
        self.alpha as f64 / self.r as f64
    }

    /// Create a copy with explicit target modules
    pub fn with_target_modules(&self, modules: Vec<String>) -> Self {
        let mut settings = self.clone();
        settings.target_modules = Some(modules);
        settings
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(Error::config("LoRA rank must be greater than 0"));
        }
        if self.alpha <= 0.0 {
            return Err(Error::config("LoRA alpha must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::config("LoRA dropout must be in [0.0, 1.0)"));
        }
        if let Some(modules) = &self.target_modules {
            if modules.is_empty() {
                return Err(Error::config(
                    "target_modules must not be empty when given",
                ));
            }
            let mut seen = HashSet::new();
            for module in modules {
                if !seen.insert(module) {
                    return Err(Error::config(format!("Duplicate target module: {}", module)));
                }
            }
        }
        Ok(())
    }
}

/// PEFT `adapter_config.json` contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeftAdapterConfig {
    /// Adapter type, always `LORA`
    pub peft_type: String,
    /// Task type
    pub task_type: String,
    /// Whether the adapter is frozen for inference
    pub inference_mode: bool,
    /// LoRA rank
    pub r: usize,
    /// LoRA alpha
    pub lora_alpha: f32,
    /// LoRA dropout
    pub lora_dropout: f32,
    /// Modules the adapter is attached to
    pub target_modules: Vec<String>,
    /// Bias handling
    pub bias: String,
    /// Base model identifier
    pub base_model_name_or_path: String,
}

impl PeftAdapterConfig {
    /// Describe an adapter trained with `settings` on `targets` of `base_model`
    pub fn new(settings: &LoraSettings, targets: &[String], base_model: &str) -> Self {
        let mut target_modules = targets.to_vec();
        target_modules.sort();
        Self {
            peft_type: "LORA".to_string(),
            task_type: settings.task_type.as_str().to_string(),
            inference_mode: false,
            r: settings.r,
            lora_alpha: settings.alpha,
            lora_dropout: settings.dropout,
            target_modules,
            bias: settings.bias.as_str().to_string(),
            base_model_name_or_path: base_model.to_string(),
        }
    }
}
