//! Folding trained LoRA updates back into base weights

use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};

/// Merge one adapter into its base weight: `W + scaling * (B @ A)`.
///
/// `base` is `(out, in)`, `lora_a` is `(r, in)` and `lora_b` is `(out, r)`.
/// The update is computed in f32 and the result keeps `base`'s dtype.
pub fn merge_lora_weight(
    base: &Tensor,
    lora_a: &Tensor,
    lora_b: &Tensor,
    scaling: f64,
) -> Result<Tensor> {
    let (out_features, in_features) = base.dims2()?;
    let (rank, a_in) = lora_a.dims2()?;
    let (b_out, b_rank) = lora_b.dims2()?;

    if a_in != in_features || b_out != out_features || b_rank != rank {
        return Err(Error::invalid_input(format!(
            "adapter shapes A{:?} B{:?} do not fit base weight {:?}",
            lora_a.dims(),
            lora_b.dims(),
            base.dims()
        )));
    }
    debug!(
        "Merging rank-{} update into {}x{} weight (scaling {})",
        rank, out_features, in_features, scaling
    );

    let delta = lora_b
        .to_dtype(DType::F32)?
        .matmul(&lora_a.to_dtype(DType::F32)?)?
        .affine(scaling, 0.0)?;
    let merged = base.to_dtype(DType::F32)?.add(&delta)?;
    Ok(merged.to_dtype(base.dtype())?)
}

/// Prefix PEFT puts in front of module paths in saved adapters
pub const PEFT_PREFIX: &str = "base_model.model.";

/// Weights needed to fold an adapter into its base model
pub trait AdapterWeights {
    /// Full-precision base weights keyed by qualified name (`{module}.weight`)
    fn base_weights(&self) -> Result<HashMap<String, Tensor>>;

    /// Trained `(lora_A, lora_B)` of the module at `path`
    fn adapter(&self, path: &str) -> Result<(Tensor, Tensor)>;
}

/// [`AdapterWeights`] read from a base `model.safetensors` and a PEFT
/// `adapter_model.safetensors`
#[derive(Debug, Clone)]
pub struct SafetensorsAdapterWeights {
    base: HashMap<String, Tensor>,
    adapter: HashMap<String, Tensor>,
}

impl SafetensorsAdapterWeights {
    /// Load both files onto `device`
    pub fn from_files(
        base_path: impl AsRef<Path>,
        adapter_path: impl AsRef<Path>,
        device: &Device,
    ) -> Result<Self> {
        let base = candle_core::safetensors::load(base_path.as_ref(), device)?;
        let adapter = candle_core::safetensors::load(adapter_path.as_ref(), device)?;
        debug!(
            "Loaded {} base and {} adapter tensors",
            base.len(),
            adapter.len()
        );
        Ok(Self { base, adapter })
    }

    /// Wrap tensors already in memory
    pub fn new(base: HashMap<String, Tensor>, adapter: HashMap<String, Tensor>) -> Self {
        Self { base, adapter }
    }

    fn adapter_tensor(&self, path: &str, matrix: &str) -> Result<Tensor> {
        let name = format!("{}.{}.weight", path, matrix);
        self.adapter
            .get(&format!("{}{}", PEFT_PREFIX, name))
            .or_else(|| self.adapter.get(&name))
            .cloned()
            .ok_or_else(|| Error::invalid_input(format!("adapter has no tensor '{}'", name)))
    }
}

impl AdapterWeights for SafetensorsAdapterWeights {
    fn base_weights(&self) -> Result<HashMap<String, Tensor>> {
        Ok(self.base.clone())
    }

    fn adapter(&self, path: &str) -> Result<(Tensor, Tensor)> {
        Ok((
            self.adapter_tensor(path, "lora_A")?,
            self.adapter_tensor(path, "lora_B")?,
        ))
    }
}

/// Merge the adapters of `modules` into the base weights of `weights`.
///
/// Returns every base tensor, with `{module}.weight` replaced by its merged
/// value for each adapted module.
pub fn merge_adapters(
    weights: &dyn AdapterWeights,
    modules: &[String],
    scaling: f64,
) -> Result<HashMap<String, Tensor>> {
    let mut tensors = weights.base_weights()?;
    for path in modules {
        let key = format!("{}.weight", path);
        let base = tensors
            .get(&key)
            .ok_or_else(|| Error::invalid_input(format!("base model has no tensor '{}'", key)))?;
        let (lora_a, lora_b) = weights.adapter(path)?;
        let merged = merge_lora_weight(base, &lora_a, &lora_b, scaling)?;
        tensors.insert(key, merged);
    }
    Ok(tensors)
}
