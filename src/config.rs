//! Configuration for a fine-tuning run

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lora::{LoraSettings, QuantizationConfig};

/// Complete configuration of a QLoRA fine-tuning run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneConfig {
    /// Base model settings
    pub model: ModelSection,
    /// Quantized loading
    pub quantization: QuantizationConfig,
    /// Adapter settings
    pub lora: LoraSettings,
    /// Dataset preparation
    pub data: DataSection,
    /// Trainer hyperparameters
    pub training: TrainingSection,
    /// Output locations
    pub output: OutputSection,
    /// Where the model hub token comes from
    pub credentials: CredentialSource,
}

impl FinetuneConfig {
    /// Load configuration from a JSON or YAML file, picked by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config: Self = if is_json(path) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to a JSON or YAML file, picked by extension
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        if self.model.model_id.trim().is_empty() {
            return Err(Error::config("model.model_id must not be empty"));
        }
        if self.model.eos_token.is_empty() {
            return Err(Error::config("model.eos_token must not be empty"));
        }
        self.quantization.validate()?;
        self.lora.validate()?;
        if self.data.tokenize_batch_size == 0 {
            return Err(Error::config("data.tokenize_batch_size must be greater than 0"));
        }
        self.training.validate()?;
        Ok(())
    }

    /// Apply command-line overrides, then re-validate
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<()> {
        if let Some(model_id) = &overrides.model_id {
            self.model.model_id = model_id.clone();
        }
        if let Some(output_dir) = &overrides.output_dir {
            self.output.output_dir = output_dir.clone();
        }
        if let Some(credentials) = &overrides.credentials {
            self.credentials = credentials.clone();
        }
        if let Some(seed) = overrides.seed {
            self.data.seed = seed;
        }
        if let Some(batch_size) = overrides.batch_size {
            self.training.per_device_train_batch_size = batch_size;
        }
        if let Some(max_steps) = overrides.max_steps {
            self.training.max_steps = max_steps;
        }
        self.validate()
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("json")
}

/// Values that may replace configured settings at run time
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Model identifier
    pub model_id: Option<String>,
    /// Adapter output directory
    pub output_dir: Option<PathBuf>,
    /// Credential source
    pub credentials: Option<CredentialSource>,
    /// Shuffle seed
    pub seed: Option<u64>,
    /// Per-device training batch size
    pub batch_size: Option<usize>,
    /// Maximum optimizer steps
    pub max_steps: Option<usize>,
}

/// Base model settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Hub identifier or local path of the base model
    pub model_id: String,
    /// Memory budget per device in MiB
    pub max_memory_mb: u64,
    /// End-of-sequence token, also used for padding
    pub eos_token: String,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            model_id: "meta-llama/Llama-2-7b-hf".to_string(),
            max_memory_mb: 40960,
            eos_token: "</s>".to_string(),
        }
    }
}

/// Dataset preparation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSection {
    /// Shuffle seed
    pub seed: u64,
    /// Texts per tokenizer call
    pub tokenize_batch_size: usize,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            seed: 42,
            tokenize_batch_size: 1000,
        }
    }
}

/// Optimizer used by the trainer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Paged 8-bit AdamW
    #[serde(rename = "paged_adamw_8bit")]
    PagedAdamw8bit,
    /// Full-precision AdamW
    AdamwTorch,
    /// Plain SGD
    Sgd,
}

/// Trainer hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSection {
    /// Batch size per device
    pub per_device_train_batch_size: usize,
    /// Micro-batches per optimizer step
    pub gradient_accumulation_steps: usize,
    /// Linear warmup steps
    pub warmup_steps: usize,
    /// Optimizer steps to run
    pub max_steps: usize,
    /// Peak learning rate
    pub learning_rate: f64,
    /// Mixed precision
    pub fp16: bool,
    /// Steps between log lines
    pub logging_steps: usize,
    /// Optimizer
    pub optim: OptimizerKind,
    /// Key/value cache during training; off since it conflicts with
    /// gradient checkpointing
    pub use_cache: bool,
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            per_device_train_batch_size: 1,
            gradient_accumulation_steps: 4,
            warmup_steps: 2,
            max_steps: 20,
            learning_rate: 2e-4,
            fp16: true,
            logging_steps: 1,
            optim: OptimizerKind::PagedAdamw8bit,
            use_cache: false,
        }
    }
}

impl TrainingSection {
    /// Samples consumed per optimizer step on one device
    pub fn effective_batch_size(&self) -> usize {
        self.per_device_train_batch_size * self.gradient_accumulation_steps
    }

    fn validate(&self) -> Result<()> {
        if self.per_device_train_batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(Error::config(
                "Gradient accumulation steps must be greater than 0",
            ));
        }
        if self.max_steps == 0 {
            return Err(Error::config("max_steps must be greater than 0"));
        }
        if self.learning_rate <= 0.0 {
            return Err(Error::config("Learning rate must be positive"));
        }
        if self.logging_steps == 0 {
            return Err(Error::config("logging_steps must be greater than 0"));
        }
        Ok(())
    }
}

/// Output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    /// Trained adapter checkpoint
    pub output_dir: PathBuf,
    /// Base model with the adapter merged in
    pub merged_dir: PathBuf,
    /// Trainer scratch directory
    pub trainer_dir: PathBuf,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("results/llama2/final_checkpoint"),
            merged_dir: PathBuf::from("results/llama2/final_merged_checkpoint"),
            trainer_dir: PathBuf::from("outputs"),
        }
    }
}

/// Source of the model hub access token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSource {
    /// Anonymous access
    None,
    /// Read from an environment variable
    Env {
        /// Variable name
        var: String,
    },
    /// Read from a file holding only the token
    File {
        /// Token file
        path: PathBuf,
    },
}

impl Default for CredentialSource {
    fn default() -> Self {
        CredentialSource::Env {
            var: "HF_TOKEN".to_string(),
        }
    }
}

impl CredentialSource {
    /// Resolve the token. An unset variable means anonymous access; an
    /// unreadable or empty token file is an error.
    pub fn resolve(&self) -> Result<Option<HubToken>> {
        match self {
            CredentialSource::None => Ok(None),
            CredentialSource::Env { var } => match std::env::var(var) {
                Ok(value) if !value.trim().is_empty() => Ok(Some(HubToken::new(value.trim()))),
                _ => {
                    warn!("{} is not set; accessing the model hub anonymously", var);
                    Ok(None)
                }
            },
            CredentialSource::File { path } => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::config(format!("cannot read token file '{}': {}", path.display(), e))
                })?;
                let token = content.trim();
                if token.is_empty() {
                    return Err(Error::config(format!(
                        "token file '{}' is empty",
                        path.display()
                    )));
                }
                Ok(Some(HubToken::new(token)))
            }
        }
    }
}

/// Model hub access token; never printed
#[derive(Clone, PartialEq, Eq)]
pub struct HubToken(String);

impl HubToken {
    /// Wrap a token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for request headers
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for HubToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HubToken(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::{ComputeDtype, QuantType, TaskType};

    #[test]
    fn test_default_config() {
        let config = FinetuneConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lora.r, 16);
        assert_eq!(config.lora.alpha, 64.0);
        assert_eq!(config.quantization.quant_type, QuantType::Nf4);
        assert_eq!(config.quantization.compute_dtype, ComputeDtype::Bf16);
        assert_eq!(config.data.seed, 42);
        assert_eq!(config.training.effective_batch_size(), 4);
    }

    #[test]
    fn test_yaml_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("finetune.yaml");
        let mut config = FinetuneConfig::default();
        config.training.max_steps = 100;
        config.credentials = CredentialSource::None;

        config.to_file(&path).unwrap();
        let loaded = FinetuneConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("finetune.json");
        std::fs::write(
            &path,
            r#"{"lora": {"r": 8, "task_type": "CAUSAL_LM"}, "training": {"optim": "paged_adamw_8bit"}}"#,
        )
        .unwrap();

        let config = FinetuneConfig::from_file(&path).unwrap();
        assert_eq!(config.lora.r, 8);
        assert_eq!(config.lora.task_type, TaskType::CausalLm);
        assert_eq!(config.training.optim, OptimizerKind::PagedAdamw8bit);
        assert_eq!(config.model.model_id, "meta-llama/Llama-2-7b-hf");
    }

    #[test]
    fn test_credentials_yaml_shape() {
        let source: CredentialSource =
            serde_yaml::from_str("type: file\npath: /run/secrets/hf\n").unwrap();
        assert_eq!(
            source,
            CredentialSource::File {
                path: PathBuf::from("/run/secrets/hf")
            }
        );
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config = FinetuneConfig::default();
        config.quantization.load_in_8bit = true;
        assert!(config.validate().is_err());

        let mut config = FinetuneConfig::default();
        config.training.learning_rate = 0.0;
        assert!(config.validate().is_err());

        let mut config = FinetuneConfig::default();
        config.data.tokenize_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = FinetuneConfig::default();
        config.model.model_id = "  ".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_overrides() {
        let mut config = FinetuneConfig::default();
        config
            .apply_overrides(&ConfigOverrides {
                model_id: Some("mistralai/Mistral-7B-v0.1".to_string()),
                seed: Some(7),
                max_steps: Some(500),
                credentials: Some(CredentialSource::None),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(config.model.model_id, "mistralai/Mistral-7B-v0.1");
        assert_eq!(config.data.seed, 7);
        assert_eq!(config.training.max_steps, 500);
        assert_eq!(config.credentials, CredentialSource::None);
        assert_eq!(config.training.per_device_train_batch_size, 1);
    }

    #[test]
    fn test_zero_batch_override_rejected() {
        let mut config = FinetuneConfig::default();
        let result = config.apply_overrides(&ConfigOverrides {
            batch_size: Some(0),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "hf_secret\n").unwrap();

        let token = CredentialSource::File { path }.resolve().unwrap().unwrap();
        assert_eq!(token.expose(), "hf_secret");
        assert_eq!(format!("{:?}", token), "HubToken(***)");
    }

    #[test]
    fn test_empty_token_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "  \n").unwrap();
        assert!(CredentialSource::File { path }.resolve().is_err());
    }

    #[test]
    fn test_unset_env_is_anonymous() {
        let source = CredentialSource::Env {
            var: "LORAX_FINETUNE_TEST_TOKEN_NEVER_SET".to_string(),
        };
        assert!(source.resolve().unwrap().is_none());
        assert!(CredentialSource::None.resolve().unwrap().is_none());
    }
}
