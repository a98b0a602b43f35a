//! End-to-end fine-tuning stages
//!
//! Each stage takes its inputs explicitly: `prepare_dataset` turns raw
//! records into a shuffled token dataset, `plan_adapters` freezes and
//! adapts a module graph, `train` hands both to a [`TrainingLoop`] while a
//! [`DeviceScope`] guarantees device memory is released afterwards, and
//! `merge` folds the trained adapter into the base weights.

use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use crate::config::{FinetuneConfig, TrainingSection};
use crate::data::{CausalLmCollator, Preprocessor, TextTokenizer, TokenizedDataset};
use crate::error::{Error, Result};
use crate::lora::{
    find_target_modules, inject_adapters, merge_adapters, prepare_for_kbit_training,
    report_trainable_parameters, AdapterWeights, DtypeBreakdown, LoraSettings, PeftAdapterConfig,
    TrainableReport,
};
use crate::model::{resolve_max_length, ModelConfig, ModelGraph, ResolvedLength};
use crate::prompt::RawRecord;
use crate::utils::format::human_bytes;
use crate::utils::io::{directory_size, ensure_dir_exists};
use crate::utils::timing::Timer;

/// File name of the PEFT adapter description
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// File name of merged model weights
pub const MERGED_WEIGHTS_FILE: &str = "model.safetensors";

/// Output of the dataset stage
#[derive(Debug, Clone)]
pub struct PreparedDataset {
    /// Shuffled token records
    pub dataset: TokenizedDataset,
    /// Max length used for truncation and filtering
    pub max_length: ResolvedLength,
}

/// Output of the adapter stage
#[derive(Debug, Clone, Serialize)]
pub struct AdapterPlan {
    /// Leaf names adapters were attached to
    pub target_modules: Vec<String>,
    /// Full paths of the adapted modules
    pub adapted_modules: Vec<String>,
    /// Adapter settings with the resolved targets filled in
    pub settings: LoraSettings,
    /// Trainable share after injection
    pub report: TrainableReport,
    /// Stored elements per dtype after injection
    pub breakdown: DtypeBreakdown,
    /// PEFT description of the adapter
    pub adapter_config: PeftAdapterConfig,
}

impl AdapterPlan {
    /// Write `adapter_config.json` into `dir`
    pub fn write_adapter_config(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        ensure_dir_exists(dir)?;
        let path = dir.join(ADAPTER_CONFIG_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(&self.adapter_config)?)?;
        Ok(path)
    }
}

/// Everything a training loop needs for one run
pub struct TrainingJob<'a> {
    /// Training records
    pub dataset: &'a TokenizedDataset,
    /// Batch collation
    pub collator: CausalLmCollator,
    /// Hyperparameters
    pub training: &'a TrainingSection,
    /// Adapter being trained
    pub plan: &'a AdapterPlan,
    /// Scratch directory for trainer state
    pub trainer_dir: &'a Path,
    /// Where the final adapter checkpoint goes
    pub output_dir: &'a Path,
    /// Memory budget per device in MiB
    pub max_memory_mb: u64,
}

/// Result reported by a training loop
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainOutcome {
    /// Optimizer steps taken
    pub steps: usize,
    /// Loss at the last logged step
    pub final_loss: Option<f64>,
}

/// Result of folding the adapter into the base model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeOutcome {
    /// Modules whose weights changed
    pub merged_modules: usize,
    /// Tensors written, merged or not
    pub tensors: usize,
    /// Written weights file
    pub path: PathBuf,
    /// Size of the merged directory in bytes
    pub bytes: u64,
}

/// External trainer driving the optimization
pub trait TrainingLoop {
    /// Run training and save the adapter checkpoint to `job.output_dir`
    fn train(&mut self, job: &TrainingJob<'_>) -> Result<TrainOutcome>;

    /// Release model, optimizer and device caches
    fn release(&mut self) -> Result<()>;
}

/// Holds a training loop for the duration of a run and releases it on drop
pub struct DeviceScope<'a, T: TrainingLoop + ?Sized> {
    trainer: &'a mut T,
}

impl<'a, T: TrainingLoop + ?Sized> DeviceScope<'a, T> {
    /// Enter the scope
    pub fn new(trainer: &'a mut T) -> Self {
        Self { trainer }
    }
}

impl<T: TrainingLoop + ?Sized> Deref for DeviceScope<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.trainer
    }
}

impl<T: TrainingLoop + ?Sized> DerefMut for DeviceScope<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.trainer
    }
}

impl<T: TrainingLoop + ?Sized> Drop for DeviceScope<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.trainer.release() {
            warn!("Failed to release device memory: {}", e);
        }
    }
}

/// Fine-tuning driver over an explicit configuration
#[derive(Debug, Clone)]
pub struct FinetunePipeline {
    config: FinetuneConfig,
}

impl FinetunePipeline {
    /// Create a pipeline, validating the configuration
    pub fn new(config: FinetuneConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configuration in use
    pub fn config(&self) -> &FinetuneConfig {
        &self.config
    }

    /// Resolve the max length from `model_config` and preprocess `records`
    #[instrument(skip_all)]
    pub fn prepare_dataset(
        &self,
        model_config: &ModelConfig,
        records: &[RawRecord],
        tokenizer: &dyn TextTokenizer,
    ) -> Result<PreparedDataset> {
        let timer = Timer::new("prepare_dataset");
        let max_length = resolve_max_length(model_config);
        let dataset = Preprocessor::new(max_length.value, self.config.data.seed)
            .with_batch_size(self.config.data.tokenize_batch_size)
            .run(records, tokenizer)?;
        timer.stop();
        Ok(PreparedDataset {
            dataset,
            max_length,
        })
    }

    /// Freeze `graph`, attach adapters to the configured or discovered
    /// targets and account for the result
    #[instrument(skip_all)]
    pub fn plan_adapters(&self, graph: &mut ModelGraph) -> Result<AdapterPlan> {
        let quant = &self.config.quantization;
        if quant.bits() < 16 {
            prepare_for_kbit_training(graph);
        } else {
            graph.set_requires_grad(false);
        }

        let kind = quant.target_kind();
        let target_modules = match &self.config.lora.target_modules {
            Some(modules) => modules.clone(),
            None => {
                let mut found = find_target_modules(graph, kind.clone());
                found.sort();
                found
            }
        };
        if target_modules.is_empty() {
            return Err(Error::config(format!(
                "model has no {} layers to attach adapters to",
                kind
            )));
        }
        info!("Adapter target modules: {:?}", target_modules);

        let settings = self.config.lora.with_target_modules(target_modules.clone());
        let adapted_modules = inject_adapters(graph, &kind, &target_modules, &settings)?;

        let breakdown = DtypeBreakdown::from_graph(graph);
        for (dtype, count, fraction) in breakdown.rows() {
            info!("{}: {} ({:.4})", dtype, count, fraction);
        }
        let report = report_trainable_parameters(graph, quant.packed_4bit_accounting())?;
        let adapter_config =
            PeftAdapterConfig::new(&settings, &target_modules, &self.config.model.model_id);

        Ok(AdapterPlan {
            target_modules,
            adapted_modules,
            settings,
            report,
            breakdown,
            adapter_config,
        })
    }

    /// Train inside a [`DeviceScope`] and report the checkpoint size
    #[instrument(skip_all)]
    pub fn train(
        &self,
        trainer: &mut dyn TrainingLoop,
        dataset: &TokenizedDataset,
        plan: &AdapterPlan,
        pad_token_id: u32,
    ) -> Result<TrainOutcome> {
        if dataset.is_empty() {
            return Err(Error::invalid_input("training dataset is empty"));
        }

        let output = &self.config.output;
        ensure_dir_exists(&output.trainer_dir)?;
        ensure_dir_exists(&output.output_dir)?;

        let job = TrainingJob {
            dataset,
            collator: CausalLmCollator::new(pad_token_id),
            training: &self.config.training,
            plan,
            trainer_dir: &output.trainer_dir,
            output_dir: &output.output_dir,
            max_memory_mb: self.config.model.max_memory_mb,
        };

        let timer = Timer::new("train");
        let outcome = {
            let mut scope = DeviceScope::new(trainer);
            scope.train(&job)?
        };
        let elapsed = timer.stop();
        info!(
            "Training finished after {} steps in {:.1}s",
            outcome.steps,
            elapsed.as_secs_f64()
        );

        plan.write_adapter_config(&output.output_dir)?;
        let size = directory_size(&output.output_dir)?;
        info!(
            "Adapter checkpoint at {} is {}",
            output.output_dir.display(),
            human_bytes(size)
        );
        Ok(outcome)
    }

    /// Merge the trained adapter of every planned module into the base
    /// weights and save them to the merged directory
    #[instrument(skip_all)]
    pub fn merge(&self, weights: &dyn AdapterWeights, plan: &AdapterPlan) -> Result<MergeOutcome> {
        let merged_dir = &self.config.output.merged_dir;
        let scaling = plan.settings.scaling();
        info!(
            "Merging {} adapters (scaling {}) into base weights",
            plan.adapted_modules.len(),
            scaling
        );

        let tensors = merge_adapters(weights, &plan.adapted_modules, scaling)?;
        ensure_dir_exists(merged_dir)?;
        let path = merged_dir.join(MERGED_WEIGHTS_FILE);
        candle_core::safetensors::save(&tensors, &path)?;

        let bytes = directory_size(merged_dir)?;
        info!(
            "Merged checkpoint at {} is {}",
            merged_dir.display(),
            human_bytes(bytes)
        );
        Ok(MergeOutcome {
            merged_modules: plan.adapted_modules.len(),
            tensors: tensors.len(),
            path,
            bytes,
        })
    }

    /// Run every stage in order
    #[instrument(skip_all, fields(model = %self.config.model.model_id))]
    pub fn run(
        &self,
        model_config: &ModelConfig,
        graph: &mut ModelGraph,
        records: &[RawRecord],
        tokenizer: &dyn TextTokenizer,
        trainer: &mut dyn TrainingLoop,
        weights: &dyn AdapterWeights,
    ) -> Result<(TrainOutcome, MergeOutcome)> {
        let pad_token_id = tokenizer.pad_token_id().ok_or_else(|| {
            Error::config(format!(
                "tokenizer has no id for pad token '{}'",
                self.config.model.eos_token
            ))
        })?;

        let prepared = self.prepare_dataset(model_config, records, tokenizer)?;
        let plan = self.plan_adapters(graph)?;
        let trained = self.train(trainer, &prepared.dataset, &plan, pad_token_id)?;
        let merged = self.merge(weights, &plan)?;
        Ok((trained, merged))
    }
}
