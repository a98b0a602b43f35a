use anyhow::{bail, Context, Result};
use candle_core::Device;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use lorax_finetune::{
    build_causal_lm, format_prompt, load_records, logging, resolve_max_length, ConfigOverrides,
    CredentialSource, FinetuneConfig, FinetunePipeline, HfTokenizer, ModelConfig, RawRecord,
    SafetensorsAdapterWeights,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "lorax-finetune")]
#[command(about = "QLoRA fine-tuning preparation: prompts, datasets and adapter plans", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct OverrideArgs {
    /// Base model identifier
    #[arg(long)]
    model_id: Option<String>,

    /// Adapter output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Environment variable holding the hub token
    #[arg(long, conflicts_with = "token_file")]
    token_env: Option<String>,

    /// File holding the hub token
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Shuffle seed
    #[arg(long)]
    seed: Option<u64>,

    /// Per-device training batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Maximum training steps
    #[arg(long)]
    max_steps: Option<usize>,
}

impl OverrideArgs {
    fn into_overrides(self) -> ConfigOverrides {
        let credentials = match (self.token_env, self.token_file) {
            (Some(var), _) => Some(CredentialSource::Env { var }),
            (None, Some(path)) => Some(CredentialSource::File { path }),
            (None, None) => None,
        };
        ConfigOverrides {
            model_id: self.model_id,
            output_dir: self.output_dir,
            credentials,
            seed: self.seed,
            batch_size: self.batch_size,
            max_steps: self.max_steps,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Render the training prompt of every record in a dataset
    Format {
        /// JSONL or JSON array dataset
        #[arg(short, long)]
        input: PathBuf,

        /// Only render the first N records
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Resolve the maximum sequence length from a model config.json
    MaxLength {
        /// Model configuration file
        #[arg(short, long)]
        model_config: PathBuf,
    },

    /// Tokenize, filter and shuffle a dataset
    Prepare {
        /// JSONL or JSON array dataset
        #[arg(short, long)]
        input: PathBuf,

        /// tokenizer.json of the base model
        #[arg(short, long)]
        tokenizer: PathBuf,

        /// Model configuration file
        #[arg(short, long)]
        model_config: PathBuf,

        /// Directory for train.jsonl and manifest.json
        #[arg(short, long)]
        output: PathBuf,

        /// Fine-tuning configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Encode without the tokenizer's special tokens
        #[arg(long)]
        no_special_tokens: bool,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Fold a trained adapter into the base weights, writing to the merged directory
    Merge {
        /// Model configuration file
        #[arg(short, long)]
        model_config: PathBuf,

        /// Base model weights (.safetensors)
        #[arg(short, long)]
        base: PathBuf,

        /// Trained adapter weights (.safetensors)
        #[arg(short, long)]
        adapter: PathBuf,

        /// Fine-tuning configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Plan adapter injection on a model skeleton and report trainable parameters
    Plan {
        /// Model configuration file
        #[arg(short, long)]
        model_config: PathBuf,

        /// Fine-tuning configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Validate a fine-tuning configuration file
    ValidateConfig {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Write a default configuration file
    InitConfig {
        /// Destination (.json or .yaml)
        #[arg(short, long, default_value = "finetune.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Serialize)]
struct Manifest {
    created_at: String,
    source: PathBuf,
    model_id: String,
    max_length: usize,
    max_length_source: String,
    seed: u64,
    input_records: usize,
    dropped_too_long: usize,
    output_records: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.quiet, cli.json)?;

    match cli.command {
        Commands::Format { input, limit } => format_dataset(&input, limit),
        Commands::MaxLength { model_config } => max_length(&model_config),
        Commands::Prepare {
            input,
            tokenizer,
            model_config,
            output,
            config,
            no_special_tokens,
            overrides,
        } => prepare(
            &input,
            &tokenizer,
            &model_config,
            &output,
            config,
            !no_special_tokens,
            overrides,
        ),
        Commands::Merge {
            model_config,
            base,
            adapter,
            config,
            overrides,
        } => merge(&model_config, &base, &adapter, config, overrides),
        Commands::Plan {
            model_config,
            config,
            overrides,
        } => plan(&model_config, config, overrides),
        Commands::ValidateConfig { file } => validate_config(&file),
        Commands::InitConfig { output, force } => init_config(&output, force),
    }
}

fn load_config(path: Option<PathBuf>, overrides: OverrideArgs) -> Result<FinetuneConfig> {
    let mut config = match path {
        Some(path) => FinetuneConfig::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => FinetuneConfig::default(),
    };
    config
        .apply_overrides(&overrides.into_overrides())
        .context("Invalid configuration overrides")?;
    Ok(config)
}

fn load_model_config(path: &Path) -> Result<ModelConfig> {
    ModelConfig::from_file(path)
        .with_context(|| format!("Failed to load model config from {}", path.display()))
}

fn format_dataset(input: &Path, limit: Option<usize>) -> Result<()> {
    let records = load_records(input).context("Failed to load dataset")?;
    let take = limit.unwrap_or(records.len());
    for record in records.into_iter().take(take) {
        println!("{}", serde_json::to_string(&format_prompt(record))?);
    }
    Ok(())
}

fn max_length(model_config: &Path) -> Result<()> {
    let resolved = resolve_max_length(&load_model_config(model_config)?);
    println!("{} ({})", resolved.value, resolved.source);
    Ok(())
}

fn prepare(
    input: &Path,
    tokenizer: &Path,
    model_config: &Path,
    output: &Path,
    config: Option<PathBuf>,
    special_tokens: bool,
    overrides: OverrideArgs,
) -> Result<()> {
    let config = load_config(config, overrides)?;
    let records: Vec<RawRecord> = load_records(input).context("Failed to load dataset")?;
    let tokenizer = HfTokenizer::from_file(tokenizer, &config.model.eos_token)
        .context("Failed to load tokenizer")?
        .with_special_tokens(special_tokens);
    let model_config = load_model_config(model_config)?;

    let model_id = config.model.model_id.clone();
    let seed = config.data.seed;
    let pipeline = FinetunePipeline::new(config)?;
    let prepared = pipeline
        .prepare_dataset(&model_config, &records, &tokenizer)
        .context("Failed to preprocess dataset")?;
    let (dataset, max_length) = (prepared.dataset, prepared.max_length);

    fs::create_dir_all(output).context("Failed to create output directory")?;
    dataset
        .write_jsonl(output.join("train.jsonl"))
        .context("Failed to write train.jsonl")?;

    let stats = dataset.stats();
    let manifest = Manifest {
        created_at: Utc::now().to_rfc3339(),
        source: input.to_path_buf(),
        model_id,
        max_length: max_length.value,
        max_length_source: max_length.source.to_string(),
        seed,
        input_records: stats.input_records,
        dropped_too_long: stats.dropped_too_long,
        output_records: stats.output_records,
    };
    fs::write(
        output.join("manifest.json"),
        serde_json::to_string_pretty(&manifest)?,
    )
    .context("Failed to write manifest.json")?;

    info!(
        "Wrote {} records to {}",
        stats.output_records,
        output.display()
    );
    Ok(())
}

fn plan(model_config: &Path, config: Option<PathBuf>, overrides: OverrideArgs) -> Result<()> {
    let config = load_config(config, overrides)?;
    let model_config = load_model_config(model_config)?;
    let mut graph = build_causal_lm(&model_config, &config.quantization)
        .context("Failed to build model skeleton")?;

    let output_dir = config.output.output_dir.clone();
    let pipeline = FinetunePipeline::new(config)?;
    let plan = pipeline
        .plan_adapters(&mut graph)
        .context("Failed to plan adapters")?;
    let path = plan.write_adapter_config(&output_dir)?;

    println!("{}", plan.report);
    for (dtype, count, fraction) in plan.breakdown.rows() {
        println!("{:>6} {:>16} {:.4}", dtype, count, fraction);
    }
    info!("Adapter config written to {}", path.display());
    Ok(())
}

fn merge(
    model_config: &Path,
    base: &Path,
    adapter: &Path,
    config: Option<PathBuf>,
    overrides: OverrideArgs,
) -> Result<()> {
    let config = load_config(config, overrides)?;
    let model_config = load_model_config(model_config)?;
    let mut graph = build_causal_lm(&model_config, &config.quantization)
        .context("Failed to build model skeleton")?;

    let pipeline = FinetunePipeline::new(config)?;
    let plan = pipeline
        .plan_adapters(&mut graph)
        .context("Failed to plan adapters")?;
    let weights = SafetensorsAdapterWeights::from_files(base, adapter, &Device::Cpu)
        .context("Failed to load base or adapter weights")?;
    let outcome = pipeline
        .merge(&weights, &plan)
        .context("Failed to merge adapters")?;

    println!(
        "Merged {} modules into {} ({} tensors)",
        outcome.merged_modules,
        outcome.path.display(),
        outcome.tensors
    );
    Ok(())
}

fn validate_config(path: &Path) -> Result<()> {
    info!("Validating configuration file: {}", path.display());
    let config = FinetuneConfig::from_file(path)
        .with_context(|| format!("Invalid configuration: {}", path.display()))?;
    if let Err(e) = config.credentials.resolve() {
        bail!("Credential source is unusable: {}", e);
    }
    println!("Configuration is valid");
    println!("  model: {}", config.model.model_id);
    println!(
        "  quantization: {}-bit, lora r={} alpha={}",
        config.quantization.bits(),
        config.lora.r,
        config.lora.alpha
    );
    println!(
        "  training: {} steps, effective batch size {}",
        config.training.max_steps,
        config.training.effective_batch_size()
    );
    Ok(())
}

fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }
    FinetuneConfig::default()
        .to_file(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Wrote default configuration to {}", output.display());
    Ok(())
}
