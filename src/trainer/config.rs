//! Training configuration and precision mode

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Optimizer hyperparameters used when the trainer builds its param groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            weight_decay: 0.01,
        }
    }
}

impl TrainingConfig {
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }
}

/// Numerical precision the trainer runs the model in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Precision {
    /// Full FP32 (`"32"`)
    #[default]
    Full,
    /// Pure FP16 (`"16"`)
    Half,
    /// FP16/BF16 compute over FP32 master weights (`"mixed"`)
    Mixed,
}

impl Precision {
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Full => "32",
            Precision::Half => "16",
            Precision::Mixed => "mixed",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "32" | "full" => Ok(Precision::Full),
            "16" | "half" => Ok(Precision::Half),
            "mixed" => Ok(Precision::Mixed),
            other => Err(Error::Misconfiguration {
                reason: format!("unknown precision '{other}', expected one of 32, 16, mixed"),
            }),
        }
    }
}

impl TryFrom<String> for Precision {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Precision> for String {
    fn from(p: Precision) -> Self {
        p.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrainingConfig::default();
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.weight_decay, 0.01);
    }

    #[test]
    fn test_builder() {
        let config = TrainingConfig::default().with_lr(0.01).with_weight_decay(0.1);
        assert_eq!(config.learning_rate, 0.01);
        assert_eq!(config.weight_decay, 0.1);
    }

    #[test]
    fn test_precision_parse() {
        assert_eq!("mixed".parse::<Precision>().unwrap(), Precision::Mixed);
        assert_eq!("32".parse::<Precision>().unwrap(), Precision::Full);
        assert_eq!(Precision::Half.to_string(), "16");
        assert!("64".parse::<Precision>().is_err());
    }

    #[test]
    fn test_precision_serde() {
        let json = serde_json::to_string(&Precision::Mixed).unwrap();
        assert_eq!(json, "\"mixed\"");
        let back: Precision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Precision::Mixed);
    }
}
