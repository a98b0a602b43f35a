//! Discovery of the linear layers adapters are injected into

use std::collections::HashSet;
use tracing::debug;

use crate::model::{ModelGraph, Module, ModuleKind, ModuleVisitor};

/// Leaf name of the output head, never adapted
pub const OUTPUT_HEAD: &str = "lm_head";

/// Collects the leaf names of every module of one exact [`ModuleKind`]
#[derive(Debug, Clone)]
pub struct TargetSelector {
    kind: ModuleKind,
    excluded: String,
    names: HashSet<String>,
}

impl TargetSelector {
    /// Select modules of `kind`, excluding the output head
    pub fn new(kind: ModuleKind) -> Self {
        Self {
            kind,
            excluded: OUTPUT_HEAD.to_string(),
            names: HashSet::new(),
        }
    }

    /// Override the reserved output-head name
    pub fn excluding(mut self, name: impl Into<String>) -> Self {
        self.excluded = name.into();
        self
    }

    /// Selected names, deduplicated, in no particular order
    pub fn into_names(mut self) -> Vec<String> {
        self.names.remove(&self.excluded);
        self.names.into_iter().collect()
    }
}

impl ModuleVisitor for TargetSelector {
    fn visit(&mut self, module: &dyn Module) {
        if module.kind() == &self.kind {
            self.names.insert(module.leaf_name().to_string());
        }
    }
}

/// Leaf names of all modules of `kind` in `graph`, minus the output head
pub fn find_target_modules(graph: &ModelGraph, kind: ModuleKind) -> Vec<String> {
    let mut selector = TargetSelector::new(kind);
    graph.accept(&mut selector);
    let names = selector.into_names();
    debug!("Found {} adapter target module names: {:?}", names.len(), names);
    names
}
