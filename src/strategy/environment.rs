//! Cluster environment: where the rendezvous lives and which node we are.

use crate::error::{Error, Result};

/// Default rendezvous port, the one most launchers use.
pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// Rendezvous address and node identity, forwarded to the distributed
/// runtime unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEnvironment {
    pub master_addr: String,
    pub master_port: u16,
    pub node_rank: usize,
}

impl Default for ClusterEnvironment {
    fn default() -> Self {
        Self {
            master_addr: "127.0.0.1".to_string(),
            master_port: DEFAULT_MASTER_PORT,
            node_rank: 0,
        }
    }
}

impl ClusterEnvironment {
    /// Read `MASTER_ADDR`, `MASTER_PORT` and `NODE_RANK` from the process
    /// environment, falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an explicit variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let master_addr = lookup("MASTER_ADDR").unwrap_or(defaults.master_addr);
        let master_port = match lookup("MASTER_PORT") {
            Some(v) => v.parse().map_err(|e| Error::Misconfiguration {
                reason: format!("invalid MASTER_PORT '{v}': {e}"),
            })?,
            None => defaults.master_port,
        };
        let node_rank = match lookup("NODE_RANK") {
            Some(v) => v.parse().map_err(|e| Error::Misconfiguration {
                reason: format!("invalid NODE_RANK '{v}': {e}"),
            })?,
            None => defaults.node_rank,
        };

        Ok(Self {
            master_addr,
            master_port,
            node_rank,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let env = ClusterEnvironment::from_vars(lookup(&[])).unwrap();
        assert_eq!(env, ClusterEnvironment::default());
    }

    #[test]
    fn test_reads_all_vars() {
        let env = ClusterEnvironment::from_vars(lookup(&[
            ("MASTER_ADDR", "10.0.0.1"),
            ("MASTER_PORT", "1234"),
            ("NODE_RANK", "3"),
        ]))
        .unwrap();
        assert_eq!(env.master_addr, "10.0.0.1");
        assert_eq!(env.master_port, 1234);
        assert_eq!(env.node_rank, 3);
    }

    #[test]
    fn test_invalid_port() {
        let err = ClusterEnvironment::from_vars(lookup(&[("MASTER_PORT", "http")])).unwrap_err();
        assert!(matches!(err, Error::Misconfiguration { .. }));
    }
}
