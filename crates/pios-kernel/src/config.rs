//! Boot configuration

use alloc::string::{String, ToString};
use core::fmt;

use pios_kernel_core::types::{NENV_MAX, NODE_MAX};
use pios_kernel_core::NodeId;
use serde::{Deserialize, Serialize};

/// Fewest frames a node can boot and run one environment in
pub const MIN_PHYSICAL_PAGES: usize = 16;

/// Node configuration. Missing JSON fields take their default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// This node's identifier in the cluster
    pub node_id: NodeId,
    pub cpu_count: usize,
    /// Physical frames managed by the allocator
    pub physical_pages: usize,
    /// Environment table size, including the idle slot
    pub max_envs: usize,
    /// Preemption interval
    pub time_slice_ns: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            cpu_count: 1,
            physical_pages: 1024,
            max_envs: 64,
            time_slice_ns: 10_000_000,
        }
    }
}

/// Configuration errors
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// JSON did not parse
    Parse(String),
    ZeroCpus,
    /// Node id does not fit the identifier encoding
    NodeOutOfRange(NodeId),
    /// Table size outside 2..=NENV_MAX
    EnvCount(usize),
    InsufficientMemory { pages: usize, required: usize },
    ZeroTimeSlice,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::ZeroCpus => f.write_str("cpu_count must be at least 1"),
            ConfigError::NodeOutOfRange(n) => {
                write!(f, "node_id {} exceeds maximum {}", n, NODE_MAX)
            }
            ConfigError::EnvCount(n) => {
                write!(f, "max_envs {} outside 2..={}", n, NENV_MAX)
            }
            ConfigError::InsufficientMemory { pages, required } => {
                write!(f, "{} physical pages, need at least {}", pages, required)
            }
            ConfigError::ZeroTimeSlice => f.write_str("time_slice_ns must be nonzero"),
        }
    }
}

impl KernelConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: KernelConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_count == 0 {
            return Err(ConfigError::ZeroCpus);
        }
        if self.node_id > NODE_MAX {
            return Err(ConfigError::NodeOutOfRange(self.node_id));
        }
        if !(2..=NENV_MAX).contains(&self.max_envs) {
            return Err(ConfigError::EnvCount(self.max_envs));
        }
        if self.physical_pages < MIN_PHYSICAL_PAGES {
            return Err(ConfigError::InsufficientMemory {
                pages: self.physical_pages,
                required: MIN_PHYSICAL_PAGES,
            });
        }
        if self.time_slice_ns == 0 {
            return Err(ConfigError::ZeroTimeSlice);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = KernelConfig::from_json(r#"{"node_id": 3, "cpu_count": 4}"#).unwrap();
        assert_eq!(config.node_id, 3);
        assert_eq!(config.cpu_count, 4);
        assert_eq!(config.max_envs, KernelConfig::default().max_envs);
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert_eq!(
            KernelConfig::from_json(r#"{"cpu_count": 0}"#),
            Err(ConfigError::ZeroCpus)
        );
        assert_eq!(
            KernelConfig::from_json(r#"{"max_envs": 4096}"#),
            Err(ConfigError::EnvCount(4096))
        );
        assert_eq!(
            KernelConfig::from_json(r#"{"physical_pages": 4}"#),
            Err(ConfigError::InsufficientMemory {
                pages: 4,
                required: MIN_PHYSICAL_PAGES
            })
        );
        assert!(matches!(
            KernelConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
