//! Typed module graph of a model
//!
//! A model is a flat list of modules addressed by dotted paths
//! (`model.layers.0.self_attn.q_proj`). Each module has a [`ModuleKind`] tag
//! and owns its parameters. Analyses walk the graph through
//! [`ModuleVisitor`] instead of inspecting concrete layer types at runtime.

use candle_core::{DType, Shape};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Implementation type of a module
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    /// 4-bit quantized linear layer (bitsandbytes `Linear4bit`)
    Linear4bit,
    /// 8-bit quantized linear layer (bitsandbytes `Linear8bitLt`)
    Linear8bitLt,
    /// Full precision linear layer
    Linear,
    /// Token embedding table
    Embedding,
    /// RMS normalization
    RmsNorm,
    /// Layer normalization
    LayerNorm,
    /// Anything else, named by its type
    Other(String),
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Linear4bit => write!(f, "Linear4bit"),
            ModuleKind::Linear8bitLt => write!(f, "Linear8bitLt"),
            ModuleKind::Linear => write!(f, "Linear"),
            ModuleKind::Embedding => write!(f, "Embedding"),
            ModuleKind::RmsNorm => write!(f, "RmsNorm"),
            ModuleKind::LayerNorm => write!(f, "LayerNorm"),
            ModuleKind::Other(name) => write!(f, "{}", name),
        }
    }
}

impl ModuleKind {
    /// Whether the kind is a linear layer of any precision
    pub fn is_linear(&self) -> bool {
        matches!(
            self,
            ModuleKind::Linear4bit | ModuleKind::Linear8bitLt | ModuleKind::Linear
        )
    }

    /// Whether the kind stores quantized weights
    pub fn is_quantized(&self) -> bool {
        matches!(self, ModuleKind::Linear4bit | ModuleKind::Linear8bitLt)
    }
}

/// Handle to a single parameter tensor.
///
/// Only shape and dtype are tracked; no storage is needed to reason about
/// counts and trainability.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Local name inside its module, e.g. `weight`
    pub name: String,
    /// Stored shape
    pub shape: Shape,
    /// Stored dtype
    pub dtype: DType,
    /// Whether the optimizer updates this parameter
    pub requires_grad: bool,
    /// Element count of the full tensor when storage is sharded away
    /// (ZeRO-3 style partitioning leaves the local tensor empty)
    pub ds_numel: Option<usize>,
}

impl Parameter {
    /// Create a frozen parameter
    pub fn new(name: impl Into<String>, shape: impl Into<Shape>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
            dtype,
            requires_grad: false,
            ds_numel: None,
        }
    }

    /// Create a trainable parameter
    pub fn trainable(name: impl Into<String>, shape: impl Into<Shape>, dtype: DType) -> Self {
        Self {
            requires_grad: true,
            ..Self::new(name, shape, dtype)
        }
    }

    /// Mark the parameter as sharded, with `numel` elements in total
    pub fn with_ds_numel(mut self, numel: usize) -> Self {
        self.ds_numel = Some(numel);
        self
    }

    /// Number of locally stored elements
    pub fn numel(&self) -> usize {
        self.shape.elem_count()
    }

    /// Element count used for accounting: the sharded count when the local
    /// tensor is empty and one is known, otherwise the local count
    pub fn effective_numel(&self) -> usize {
        match (self.numel(), self.ds_numel) {
            (0, Some(ds)) => ds,
            (n, _) => n,
        }
    }
}

/// Input/output widths of a linear module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearShape {
    /// Input features
    pub in_features: usize,
    /// Output features
    pub out_features: usize,
}

/// Statically known interface every module exposes to analyses
pub trait Module {
    /// Fully qualified dotted path
    fn name(&self) -> &str;

    /// Implementation type tag
    fn kind(&self) -> &ModuleKind;

    /// Parameters owned directly by this module
    fn parameters(&self) -> &[Parameter];

    /// Last dot-separated segment of the path
    fn leaf_name(&self) -> &str {
        let name = self.name();
        name.rsplit('.').next().unwrap_or(name)
    }
}

/// Visitor over the modules of a graph
pub trait ModuleVisitor {
    /// Called once per module, in graph order
    fn visit(&mut self, module: &dyn Module);
}

/// A module of a [`ModelGraph`]
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleNode {
    path: String,
    kind: ModuleKind,
    linear: Option<LinearShape>,
    params: Vec<Parameter>,
}

impl ModuleNode {
    /// Create a module without parameters
    pub fn new(path: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            path: path.into(),
            kind,
            linear: None,
            params: Vec::new(),
        }
    }

    /// Record the linear widths of the module
    pub fn with_linear_shape(mut self, in_features: usize, out_features: usize) -> Self {
        self.linear = Some(LinearShape {
            in_features,
            out_features,
        });
        self
    }

    /// Attach a parameter
    pub fn with_param(mut self, param: Parameter) -> Self {
        self.params.push(param);
        self
    }

    /// Linear widths, when known
    pub fn linear_shape(&self) -> Option<LinearShape> {
        self.linear
    }

    /// Mutable access to the parameters
    pub fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }
}

impl Module for ModuleNode {
    fn name(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> &ModuleKind {
        &self.kind
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }
}

/// Ordered collection of modules making up a model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelGraph {
    modules: Vec<ModuleNode>,
}

impl ModelGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a module; paths must be unique
    pub fn add_module(&mut self, module: ModuleNode) -> Result<()> {
        if self.get(module.name()).is_some() {
            return Err(Error::invalid_input(format!(
                "duplicate module path '{}'",
                module.name()
            )));
        }
        self.modules.push(module);
        Ok(())
    }

    /// Builder-style [`ModelGraph::add_module`]
    pub fn with_module(mut self, module: ModuleNode) -> Result<Self> {
        self.add_module(module)?;
        Ok(self)
    }

    /// Find a module by path
    pub fn get(&self, path: &str) -> Option<&ModuleNode> {
        self.modules.iter().find(|m| m.path == path)
    }

    /// All modules in insertion order
    pub fn modules(&self) -> &[ModuleNode] {
        &self.modules
    }

    /// Mutable access to all modules
    pub fn modules_mut(&mut self) -> &mut [ModuleNode] {
        &mut self.modules
    }

    /// Number of modules
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the graph has no modules
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Every parameter with its fully qualified name
    pub fn named_parameters(&self) -> impl Iterator<Item = (String, &Parameter)> + '_ {
        self.modules.iter().flat_map(|module| {
            module
                .params
                .iter()
                .map(move |p| (format!("{}.{}", module.path, p.name), p))
        })
    }

    /// Walk every module with a visitor
    pub fn accept(&self, visitor: &mut dyn ModuleVisitor) {
        for module in &self.modules {
            visitor.visit(module);
        }
    }

    /// Set the gradient flag of every parameter
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        for module in &mut self.modules {
            for param in &mut module.params {
                param.requires_grad = requires_grad;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_name() {
        let module = ModuleNode::new("model.layers.0.self_attn.q_proj", ModuleKind::Linear4bit);
        assert_eq!(module.leaf_name(), "q_proj");

        let root = ModuleNode::new("lm_head", ModuleKind::Linear);
        assert_eq!(root.leaf_name(), "lm_head");
    }

    #[test]
    fn test_effective_numel_prefers_local_count() {
        let local = Parameter::new("weight", (4, 8), DType::F32).with_ds_numel(99);
        assert_eq!(local.effective_numel(), 32);

        let sharded = Parameter::new("weight", (0,), DType::F32).with_ds_numel(99);
        assert_eq!(sharded.numel(), 0);
        assert_eq!(sharded.effective_numel(), 99);

        let empty = Parameter::new("weight", (0,), DType::F32);
        assert_eq!(empty.effective_numel(), 0);
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let mut graph = ModelGraph::new();
        graph
            .add_module(ModuleNode::new("a", ModuleKind::Linear))
            .unwrap();
        assert!(graph.add_module(ModuleNode::new("a", ModuleKind::Linear)).is_err());
    }

    #[test]
    fn test_named_parameters_are_qualified() {
        let graph = ModelGraph::new()
            .with_module(
                ModuleNode::new("model.norm", ModuleKind::RmsNorm)
                    .with_param(Parameter::new("weight", (16,), DType::BF16)),
            )
            .unwrap();

        let names: Vec<String> = graph.named_parameters().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["model.norm.weight".to_string()]);
    }

    #[test]
    fn test_visitor_sees_every_module() {
        struct Counter(usize);
        impl ModuleVisitor for Counter {
            fn visit(&mut self, _module: &dyn Module) {
                self.0 += 1;
            }
        }

        let graph = ModelGraph::new()
            .with_module(ModuleNode::new("a", ModuleKind::Linear))
            .unwrap()
            .with_module(ModuleNode::new("b", ModuleKind::Embedding))
            .unwrap();

        let mut counter = Counter(0);
        graph.accept(&mut counter);
        assert_eq!(counter.0, 2);
    }
}
