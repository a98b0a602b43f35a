//! Model-side collaborators: configuration, module graph and skeletons

pub mod config;
pub mod graph;
pub mod length;
pub mod skeleton;

pub use config::ModelConfig;
pub use graph::{LinearShape, ModelGraph, Module, ModuleKind, ModuleNode, ModuleVisitor, Parameter};
pub use length::{
    resolve_max_length, try_resolve_max_length, LengthSource, ResolvedLength, DEFAULT_MAX_LENGTH,
    LENGTH_SETTINGS,
};
pub use skeleton::build_causal_lm;
