//! Maximum sequence length resolution

use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use super::config::ModelConfig;
use crate::error::{Error, Result};

/// Attribute names checked for a context length, highest priority first
pub const LENGTH_SETTINGS: [&str; 3] = ["n_positions", "max_position_embeddings", "seq_length"];

/// Length used when the configuration exposes none of [`LENGTH_SETTINGS`]
pub const DEFAULT_MAX_LENGTH: usize = 1024;

/// Where a resolved length came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthSource {
    /// Read from the named configuration attribute
    Attribute(&'static str),
    /// Fallback constant
    Default,
}

impl fmt::Display for LengthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LengthSource::Attribute(name) => write!(f, "config.{}", name),
            LengthSource::Default => write!(f, "default"),
        }
    }
}

/// A max length together with its source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedLength {
    /// Maximum number of tokens per sequence
    pub value: usize,
    /// Where `value` came from
    pub source: LengthSource,
}

/// Find the first positive length among [`LENGTH_SETTINGS`].
///
/// Fails with [`Error::ConfigurationNotFound`] when none is set.
pub fn try_resolve_max_length(config: &ModelConfig) -> Result<ResolvedLength> {
    LENGTH_SETTINGS
        .iter()
        .find_map(|&name| {
            config
                .attr(name)
                .filter(|&value| value > 0)
                .map(|value| ResolvedLength {
                    value,
                    source: LengthSource::Attribute(name),
                })
        })
        .ok_or_else(|| Error::ConfigurationNotFound {
            candidates: LENGTH_SETTINGS.to_vec(),
        })
}

/// Resolve the maximum sequence length, falling back to [`DEFAULT_MAX_LENGTH`]
pub fn resolve_max_length(config: &ModelConfig) -> ResolvedLength {
    match try_resolve_max_length(config) {
        Ok(resolved) => {
            info!("Found max length: {} ({})", resolved.value, resolved.source);
            resolved
        }
        Err(e) => {
            warn!("{}; using default max length: {}", e, DEFAULT_MAX_LENGTH);
            ResolvedLength {
                value: DEFAULT_MAX_LENGTH,
                source: LengthSource::Default,
            }
        }
    }
}
