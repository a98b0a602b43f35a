//! End-to-end tests over the public API: dataset file to token records,
//! model config to adapter plan, and a full run against a fake trainer.

use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tempfile::TempDir;
use tokenizers::Tokenizer;

use lorax_finetune::data::{CausalLmCollator, IGNORE_INDEX};
use lorax_finetune::lora::PEFT_PREFIX;
use lorax_finetune::model::Module;
use lorax_finetune::pipeline::{TrainOutcome, ADAPTER_CONFIG_FILE, MERGED_WEIGHTS_FILE};
use lorax_finetune::{
    build_causal_lm, load_records, CredentialSource, Error, FinetuneConfig, FinetunePipeline,
    HfTokenizer, ModelConfig, ModelGraph, PeftAdapterConfig, Preprocessor, QuantizationConfig,
    Result, SafetensorsAdapterWeights, TrainingJob, TrainingLoop,
};

const DOLLY: &str = r#"{"instruction": "What is the capital of France?", "context": "", "response": "Paris.", "category": "open_qa"}
{"instruction": "Summarize the passage.", "context": "The quick brown fox jumps over the lazy dog.", "response": "A fox jumps over a dog.", "category": "summarization"}
{"instruction": "Name a color.", "context": null, "response": "Brown.", "category": "brainstorming"}
{"instruction": "Is the fox quick?", "context": "The fox is quick.", "response": "Yes.", "category": "closed_qa"}
"#;

fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn tokenizer() -> HfTokenizer {
    let words = [
        "[UNK]", "</s>", "Below", "is", "an", "instruction", "that", "describes", "a", "task",
        ".", "###", "Instruction", ":", "Input", "Response", "End", "the", "fox", "quick",
    ];
    let vocab: serde_json::Map<String, serde_json::Value> = words
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), serde_json::json!(i)))
        .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "[UNK]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 1, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]"}
    });
    HfTokenizer::new(Tokenizer::from_str(&json.to_string()).unwrap(), "</s>")
}

fn model_config(dir: &Path) -> ModelConfig {
    let path = write(
        dir,
        "config.json",
        r#"{
            "architectures": ["LlamaForCausalLM"],
            "model_type": "llama",
            "hidden_size": 32,
            "intermediate_size": 64,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 4,
            "vocab_size": 20,
            "max_position_embeddings": 512,
            "rms_norm_eps": 1e-6,
            "tie_word_embeddings": false
        }"#,
    );
    ModelConfig::from_file(path).unwrap()
}

struct RecordingTrainer {
    released: usize,
    first_batch_shape: Option<Vec<usize>>,
    max_memory_mb: u64,
}

/// Base and PEFT-named adapter tensors for every linear of `graph`, with
/// A filled with ones and B with `b`
fn safetensors_weights(graph: &ModelGraph, rank: usize, b: f32) -> SafetensorsAdapterWeights {
    let mut base = HashMap::new();
    let mut adapter = HashMap::new();
    for module in graph.modules() {
        let Some(shape) = module.linear_shape() else {
            continue;
        };
        let (out, inp) = (shape.out_features, shape.in_features);
        let name = module.name();
        base.insert(
            format!("{}.weight", name),
            Tensor::ones((out, inp), DType::F32, &Device::Cpu).unwrap(),
        );
        adapter.insert(
            format!("{}{}.lora_A.weight", PEFT_PREFIX, name),
            Tensor::ones((rank, inp), DType::F32, &Device::Cpu).unwrap(),
        );
        adapter.insert(
            format!("{}{}.lora_B.weight", PEFT_PREFIX, name),
            Tensor::full(b, (out, rank), &Device::Cpu).unwrap(),
        );
    }
    SafetensorsAdapterWeights::new(base, adapter)
}

impl TrainingLoop for RecordingTrainer {
    fn train(&mut self, job: &TrainingJob<'_>) -> Result<TrainOutcome> {
        let batch_size = job.training.per_device_train_batch_size;
        let batch: Vec<_> = job.dataset.iter().take(batch_size).cloned().collect();
        let collated = job.collator.collate(&batch, &Device::Cpu)?;
        self.first_batch_shape = Some(collated.input_ids.dims().to_vec());
        self.max_memory_mb = job.max_memory_mb;
        std::fs::write(job.output_dir.join("adapter_model.safetensors"), [0u8; 256])?;
        Ok(TrainOutcome {
            steps: job.training.max_steps,
            final_loss: Some(0.5),
        })
    }

    fn release(&mut self) -> Result<()> {
        self.released += 1;
        Ok(())
    }
}

#[test]
fn test_dataset_file_to_token_records() {
    let dir = TempDir::new().unwrap();
    let path = write(dir.path(), "dolly.jsonl", DOLLY);
    let records = load_records(&path).unwrap();
    assert_eq!(records.len(), 4);
    assert!(!records[2].has_context());

    let dataset = Preprocessor::new(64, 42).run(&records, &tokenizer()).unwrap();
    assert_eq!(dataset.len(), 4);
    assert!(dataset.iter().all(|r| r.len() < 64));

    let again = Preprocessor::new(64, 42).run(&records, &tokenizer()).unwrap();
    assert_eq!(dataset.records(), again.records());
}

#[test]
fn test_short_max_length_drops_every_record() {
    let dir = TempDir::new().unwrap();
    let records = load_records(write(dir.path(), "dolly.jsonl", DOLLY)).unwrap();

    let dataset = Preprocessor::new(8, 42).run(&records, &tokenizer()).unwrap();
    assert!(dataset.is_empty());
    assert_eq!(dataset.stats().dropped_too_long, 4);
}

#[test]
fn test_malformed_record_fails_load() {
    let dir = TempDir::new().unwrap();
    let path = write(
        dir.path(),
        "broken.jsonl",
        "{\"instruction\": \"a\", \"response\": \"b\"}\n{\"instruction\": \"c\"}\n",
    );
    assert!(matches!(
        load_records(path),
        Err(Error::MissingField {
            field: "response",
            index: 1
        })
    ));
}

#[test]
fn test_collated_labels_mask_padding() {
    let dir = TempDir::new().unwrap();
    let records = load_records(write(dir.path(), "dolly.jsonl", DOLLY)).unwrap();
    let dataset = Preprocessor::new(128, 1).run(&records, &tokenizer()).unwrap();

    let collated = CausalLmCollator::new(1)
        .collate(dataset.records(), &Device::Cpu)
        .unwrap();
    let ids = collated.input_ids.to_vec2::<u32>().unwrap();
    let labels = collated.labels.to_vec2::<i64>().unwrap();
    for (row_ids, row_labels) in ids.iter().zip(labels.iter()) {
        for (&id, &label) in row_ids.iter().zip(row_labels.iter()) {
            if id == 1 {
                assert_eq!(label, IGNORE_INDEX);
            } else {
                assert_eq!(label, i64::from(id));
            }
        }
    }
}

#[test]
fn test_full_run_writes_peft_adapter_config() {
    let dir = TempDir::new().unwrap();
    let records = load_records(write(dir.path(), "dolly.jsonl", DOLLY)).unwrap();
    let model_config = model_config(dir.path());

    let mut config = FinetuneConfig::default();
    config.credentials = CredentialSource::None;
    config.output.output_dir = dir.path().join("final_checkpoint");
    config.output.trainer_dir = dir.path().join("outputs");
    config.output.merged_dir = dir.path().join("merged");
    config.model.max_memory_mb = 8192;
    config.training.per_device_train_batch_size = 2;
    config.training.max_steps = 3;
    let pipeline = FinetunePipeline::new(config).unwrap();

    let mut graph = build_causal_lm(&model_config, &QuantizationConfig::default()).unwrap();
    let weights = safetensors_weights(&graph, 16, 0.0);
    let mut trainer = RecordingTrainer {
        released: 0,
        first_batch_shape: None,
        max_memory_mb: 0,
    };
    let (trained, merged) = pipeline
        .run(&model_config, &mut graph, &records, &tokenizer(), &mut trainer, &weights)
        .unwrap();

    assert_eq!(trained.steps, 3);
    assert_eq!(trainer.released, 1);
    assert_eq!(trainer.max_memory_mb, 8192);
    assert_eq!(trainer.first_batch_shape.as_ref().map(|s| s[0]), Some(2));
    assert_eq!(merged.merged_modules, 14);
    assert!(dir.path().join("merged").join(MERGED_WEIGHTS_FILE).exists());

    let written = std::fs::read_to_string(
        dir.path().join("final_checkpoint").join(ADAPTER_CONFIG_FILE),
    )
    .unwrap();
    let adapter: PeftAdapterConfig = serde_json::from_str(&written).unwrap();
    assert_eq!(adapter.peft_type, "LORA");
    assert_eq!(adapter.task_type, "CAUSAL_LM");
    assert_eq!(adapter.r, 16);
    assert_eq!(adapter.base_model_name_or_path, "meta-llama/Llama-2-7b-hf");
    assert!(!adapter.target_modules.contains(&"lm_head".to_string()));
    assert_eq!(adapter.target_modules.len(), 7);
}

#[test]
fn test_full_precision_plan_targets_plain_linears() {
    let dir = TempDir::new().unwrap();
    let model_config = model_config(dir.path());

    let mut config = FinetuneConfig::default();
    config.quantization.load_in_4bit = false;
    let quant = config.quantization.clone();
    let pipeline = FinetunePipeline::new(config).unwrap();

    let mut graph = build_causal_lm(&model_config, &quant).unwrap();
    let plan = pipeline.plan_adapters(&mut graph).unwrap();

    // lm_head shares the plain Linear type here and must still be excluded
    assert_eq!(plan.target_modules.len(), 7);
    assert!(!plan.target_modules.iter().any(|m| m == "lm_head"));
    assert!(plan.report.trainable_percent > 0.0 && plan.report.trainable_percent < 100.0);
}

#[test]
fn test_merged_checkpoint_reloads_with_scaled_update() {
    let dir = TempDir::new().unwrap();
    let model_config = model_config(dir.path());

    let mut config = FinetuneConfig::default();
    config.quantization.load_in_4bit = false;
    config.output.merged_dir = dir.path().join("merged");
    config.lora.r = 2;
    config.lora.alpha = 4.0;
    config.lora.target_modules = Some(vec!["q_proj".to_string()]);
    let quant = config.quantization.clone();
    let pipeline = FinetunePipeline::new(config).unwrap();

    let mut graph = build_causal_lm(&model_config, &quant).unwrap();
    let weights = safetensors_weights(&graph, 2, 0.25);
    let plan = pipeline.plan_adapters(&mut graph).unwrap();
    let outcome = pipeline.merge(&weights, &plan).unwrap();
    assert_eq!(outcome.merged_modules, 2);

    let saved = candle_core::safetensors::load(&outcome.path, &Device::Cpu).unwrap();
    // 1 + (4 / 2) * (0.25 * 2)
    let q = saved["model.layers.1.self_attn.q_proj.weight"]
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    assert!(q.iter().all(|&v| (v - 2.0).abs() < 1e-6));
    let k = saved["model.layers.1.self_attn.k_proj.weight"]
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    assert!(k.iter().all(|&v| v == 1.0));
}
