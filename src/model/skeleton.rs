//! Shape-only module graphs of decoder-only models
//!
//! Lets adapter planning and parameter accounting run against a model's
//! published configuration without loading any weights.

use candle_core::DType;
use tracing::{debug, instrument};

use super::config::ModelConfig;
use super::graph::{ModelGraph, ModuleKind, ModuleNode, Parameter};
use crate::error::{Error, Result};
use crate::lora::QuantizationConfig;

/// Architectures sharing the LLaMA module layout
const LLAMA_FAMILY: [&str; 2] = ["llama", "mistral"];

fn required(config: &ModelConfig, name: &'static str) -> Result<usize> {
    config
        .attr(name)
        .filter(|&v| v > 0)
        .ok_or_else(|| Error::config(format!("model config is missing '{}'", name)))
}

/// Linear layer as loaded under the given quantization.
///
/// 4-bit weights are packed two per byte into a `(n / 2, 1)` u8 tensor;
/// 8-bit weights keep their `(out, in)` layout in one byte each.
fn linear(
    path: String,
    in_features: usize,
    out_features: usize,
    quant: &QuantizationConfig,
) -> ModuleNode {
    let numel = in_features * out_features;
    let node = ModuleNode::new(path, quant.target_kind()).with_linear_shape(in_features, out_features);
    let weight = match quant.bits() {
        4 => Parameter::new("weight", (numel.div_ceil(2), 1), DType::U8),
        8 => Parameter::new("weight", (out_features, in_features), DType::U8),
        _ => Parameter::new(
            "weight",
            (out_features, in_features),
            quant.compute_dtype.dtype(),
        ),
    };
    node.with_param(weight)
}

fn rms_norm(path: String, hidden: usize, dtype: DType) -> ModuleNode {
    ModuleNode::new(path, ModuleKind::RmsNorm).with_param(Parameter::new("weight", (hidden,), dtype))
}

/// Build the module graph of a LLaMA-family causal language model.
///
/// Every projection inside the decoder layers is quantized according to
/// `quant`; the output head stays a full precision `Linear`.
#[instrument(skip_all)]
pub fn build_causal_lm(config: &ModelConfig, quant: &QuantizationConfig) -> Result<ModelGraph> {
    let model_type = config.model_type.as_deref().unwrap_or("llama");
    if !LLAMA_FAMILY.contains(&model_type) {
        return Err(Error::config(format!(
            "unsupported model_type '{}', expected one of {:?}",
            model_type, LLAMA_FAMILY
        )));
    }

    let hidden = required(config, "hidden_size")?;
    let intermediate = required(config, "intermediate_size")?;
    let layers = required(config, "num_hidden_layers")?;
    let heads = required(config, "num_attention_heads")?;
    let vocab = required(config, "vocab_size")?;
    let kv_heads = config.attr("num_key_value_heads").unwrap_or(heads);
    if hidden % heads != 0 {
        return Err(Error::config(format!(
            "hidden_size {} is not divisible by num_attention_heads {}",
            hidden, heads
        )));
    }
    let kv_dim = hidden / heads * kv_heads;
    let dtype = quant.compute_dtype.dtype();

    debug!(
        "Building {} skeleton: {} layers, hidden={}, intermediate={}, vocab={}, {}-bit",
        model_type,
        layers,
        hidden,
        intermediate,
        vocab,
        quant.bits()
    );

    let mut graph = ModelGraph::new();
    graph.add_module(
        ModuleNode::new("model.embed_tokens", ModuleKind::Embedding)
            .with_param(Parameter::new("weight", (vocab, hidden), dtype)),
    )?;

    for i in 0..layers {
        let prefix = format!("model.layers.{}", i);
        let projections = [
            ("self_attn.q_proj", hidden, hidden),
            ("self_attn.k_proj", hidden, kv_dim),
            ("self_attn.v_proj", hidden, kv_dim),
            ("self_attn.o_proj", hidden, hidden),
            ("mlp.gate_proj", hidden, intermediate),
            ("mlp.up_proj", hidden, intermediate),
            ("mlp.down_proj", intermediate, hidden),
        ];
        for (name, in_features, out_features) in projections {
            graph.add_module(linear(
                format!("{}.{}", prefix, name),
                in_features,
                out_features,
                quant,
            ))?;
        }
        graph.add_module(rms_norm(format!("{}.input_layernorm", prefix), hidden, dtype))?;
        graph.add_module(rms_norm(
            format!("{}.post_attention_layernorm", prefix),
            hidden,
            dtype,
        ))?;
    }

    graph.add_module(rms_norm("model.norm".to_string(), hidden, dtype))?;

    let mut lm_head = ModuleNode::new("lm_head", ModuleKind::Linear).with_linear_shape(hidden, vocab);
    if !config.tie_word_embeddings {
        lm_head = lm_head.with_param(Parameter::new("weight", (vocab, hidden), dtype));
    }
    graph.add_module(lm_head)?;

    Ok(graph)
}
