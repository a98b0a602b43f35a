//! Freezing base weights and attaching LoRA update matrices

use candle_core::DType;
use tracing::{debug, info};

use super::config::LoraSettings;
use crate::error::{Error, Result};
use crate::model::{ModelGraph, Module, ModuleKind, ModuleNode, Parameter};

/// Adapter name used in parameter paths
pub const ADAPTER_NAME: &str = "default";

/// Prepare a quantized model for adapter training.
///
/// Freezes every parameter and upcasts half-precision parameters of
/// non-quantized modules to f32 for numerical stability.
pub fn prepare_for_kbit_training(graph: &mut ModelGraph) {
    graph.set_requires_grad(false);

    let mut upcast = 0usize;
    for module in graph.modules_mut() {
        if module.kind().is_quantized() {
            continue;
        }
        for param in module.parameters_mut() {
            if matches!(param.dtype, DType::F16 | DType::BF16) {
                param.dtype = DType::F32;
                upcast += 1;
            }
        }
    }
    debug!("Froze base model, upcast {} parameters to f32", upcast);
}

/// Attach `lora_A` / `lora_B` children to every module of `kind` whose leaf
/// name is in `targets`.
///
/// Returns the paths of the adapted modules. A targeted module without a
/// known linear shape is an error.
pub fn inject_adapters(
    graph: &mut ModelGraph,
    kind: &ModuleKind,
    targets: &[String],
    settings: &LoraSettings,
) -> Result<Vec<String>> {
    settings.validate()?;

    let mut adapters = Vec::new();
    let mut adapted = Vec::new();
    for module in graph.modules() {
        if module.kind() != kind || !targets.iter().any(|t| t == module.leaf_name()) {
            continue;
        }
        let shape = module.linear_shape().ok_or_else(|| {
            Error::invalid_input(format!(
                "module '{}' has no linear shape to adapt",
                module.name()
            ))
        })?;

        adapters.push(
            ModuleNode::new(
                format!("{}.lora_A.{}", module.name(), ADAPTER_NAME),
                ModuleKind::Linear,
            )
            .with_linear_shape(shape.in_features, settings.r)
            .with_param(Parameter::trainable(
                "weight",
                (settings.r, shape.in_features),
                DType::F32,
            )),
        );
        adapters.push(
            ModuleNode::new(
                format!("{}.lora_B.{}", module.name(), ADAPTER_NAME),
                ModuleKind::Linear,
            )
            .with_linear_shape(settings.r, shape.out_features)
            .with_param(Parameter::trainable(
                "weight",
                (shape.out_features, settings.r),
                DType::F32,
            )),
        );
        adapted.push(module.name().to_string());
    }

    for adapter in adapters {
        graph.add_module(adapter)?;
    }

    info!(
        "Injected rank-{} adapters into {} modules",
        settings.r,
        adapted.len()
    );
    Ok(adapted)
}
