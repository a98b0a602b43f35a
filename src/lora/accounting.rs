//! Trainable parameter accounting

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{ModelGraph, Module, ModuleVisitor};
use crate::utils::format::thousands;

/// Running totals over a model's parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParameterTally {
    /// Elements across all parameters
    pub all_param: u64,
    /// Elements across parameters that receive gradients
    pub trainable_params: u64,
}

impl ParameterTally {
    /// Tally from known totals
    pub fn new(all_param: u64, trainable_params: u64) -> Self {
        Self {
            all_param,
            trainable_params,
        }
    }

    /// Tally every parameter of a graph
    pub fn from_graph(graph: &ModelGraph) -> Self {
        let mut tally = Self::default();
        graph.accept(&mut tally);
        tally
    }

    /// Compute the trainable share.
    ///
    /// With `use_4bit` the trainable count is halved first. Fails with
    /// [`Error::DivisionByZero`] when the model has no parameters.
    pub fn report(&self, use_4bit: bool) -> Result<TrainableReport> {
        if self.all_param == 0 {
            return Err(Error::DivisionByZero(
                "model reports zero parameters".to_string(),
            ));
        }
        let mut trainable = self.trainable_params as f64;
        if use_4bit {
            trainable /= 2.0;
        }
        Ok(TrainableReport {
            all_params: self.all_param,
            trainable_params: trainable,
            trainable_percent: 100.0 * trainable / self.all_param as f64,
        })
    }
}

impl ModuleVisitor for ParameterTally {
    fn visit(&mut self, module: &dyn Module) {
        for param in module.parameters() {
            let numel = param.effective_numel() as u64;
            self.all_param += numel;
            if param.requires_grad {
                self.trainable_params += numel;
            }
        }
    }
}

/// Trainable share of a model
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrainableReport {
    /// Total parameter elements
    pub all_params: u64,
    /// Trainable elements, after any 4-bit correction
    pub trainable_params: f64,
    /// `trainable_params / all_params * 100`
    pub trainable_percent: f64,
}

impl fmt::Display for TrainableReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trainable = if self.trainable_params.fract() == 0.0 {
            thousands(self.trainable_params as u64)
        } else {
            format!("{}", self.trainable_params)
        };
        write!(
            f,
            "all params: {} || trainable params: {} || trainable%: {:?}",
            thousands(self.all_params),
            trainable,
            self.trainable_percent
        )
    }
}

/// Count the trainable share of `graph` and log it
pub fn report_trainable_parameters(graph: &ModelGraph, use_4bit: bool) -> Result<TrainableReport> {
    let report = ParameterTally::from_graph(graph).report(use_4bit)?;
    info!("{}", report);
    Ok(report)
}

/// Element count and share per stored dtype
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DtypeBreakdown {
    counts: BTreeMap<&'static str, u64>,
    total: u64,
}

impl DtypeBreakdown {
    /// Break down every parameter of a graph by dtype
    pub fn from_graph(graph: &ModelGraph) -> Self {
        let mut breakdown = Self::default();
        graph.accept(&mut breakdown);
        breakdown
    }

    /// Elements stored in `dtype` (by candle name, e.g. `f32`)
    pub fn count(&self, dtype: &str) -> u64 {
        self.counts.get(dtype).copied().unwrap_or(0)
    }

    /// Total elements across dtypes
    pub fn total(&self) -> u64 {
        self.total
    }

    /// `(dtype, count, fraction)` rows ordered by dtype name
    pub fn rows(&self) -> Vec<(&'static str, u64, f64)> {
        self.counts
            .iter()
            .map(|(&dtype, &count)| {
                let fraction = if self.total == 0 {
                    0.0
                } else {
                    count as f64 / self.total as f64
                };
                (dtype, count, fraction)
            })
            .collect()
    }
}

impl ModuleVisitor for DtypeBreakdown {
    fn visit(&mut self, module: &dyn Module) {
        for param in module.parameters() {
            let numel = param.numel() as u64;
            *self.counts.entry(param.dtype.as_str()).or_insert(0) += numel;
            self.total += numel;
        }
    }
}
