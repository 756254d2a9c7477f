//! Named strategy presets, discoverable by string.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::strategy::{DdpStrategy, Strategy};
use serde_json::{Map, Value};

/// Builds a strategy from keyword overrides and the base data-parallel
/// strategy carrying device/topology settings.
pub type StrategyBuilder = fn(&Map<String, Value>, DdpStrategy) -> Result<Box<dyn Strategy>>;

/// One registered preset.
#[derive(Clone)]
pub struct RegistryEntry {
    pub name: String,
    /// Name of the strategy type the preset resolves to.
    pub strategy: &'static str,
    pub description: String,
    /// Constructor overrides applied on top of the strategy's defaults.
    pub init_params: Map<String, Value>,
    builder: StrategyBuilder,
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .field("description", &self.description)
            .field("init_params", &self.init_params)
            .finish_non_exhaustive()
    }
}

impl RegistryEntry {
    pub fn build(&self, base: DdpStrategy) -> Result<Box<dyn Strategy>> {
        (self.builder)(&self.init_params, base)
    }
}

/// Name → preset catalog.
#[derive(Debug, Default)]
pub struct StrategyRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a preset. Names must be unique.
    pub fn register(
        &mut self,
        name: &str,
        strategy: &'static str,
        builder: StrategyBuilder,
        description: &str,
        init_params: Map<String, Value>,
    ) -> Result<()> {
        if self.entries.contains_key(name) {
            return Err(Error::Misconfiguration {
                reason: format!("strategy '{name}' is already registered"),
            });
        }
        tracing::debug!(name, strategy, "registered strategy preset");
        self.entries.insert(
            name.to_string(),
            RegistryEntry {
                name: name.to_string(),
                strategy,
                description: description.to_string(),
                init_params,
                builder,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Construct the preset registered under `name`.
    pub fn build(&self, name: &str, base: DdpStrategy) -> Result<Box<dyn Strategy>> {
        let entry = self.get(name).ok_or_else(|| Error::Misconfiguration {
            reason: format!(
                "unknown strategy '{name}'; available: {}",
                self.names().join(", ")
            ),
        })?;
        entry.build(base)
    }
}
