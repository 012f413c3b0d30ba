//! Registry configuration types and defaults.
//!
//! This module defines the set of domain tags a registry knows about, how
//! tags map onto worker threads, and how those threads are named.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Default prefix for worker thread names
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "nexus-";

/// Default name of the main-loop dispatcher
pub const DEFAULT_MAIN_LOOP_NAME: &str = "main";

/// Smallest worker stack accepted by validation (64 KB)
pub const MIN_STACK_SIZE_BYTES: usize = 64 * 1024;

/// A single domain tag and the worker that serves it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainConfig {
    /// Logical domain tag (e.g. "fs", "db")
    pub tag: String,

    /// Worker name; tags sharing a worker name share one thread
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl DomainConfig {
    /// A domain served by its own worker
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            worker: None,
        }
    }

    /// A domain served by a (possibly shared) named worker
    pub fn aliased(tag: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            worker: Some(worker.into()),
        }
    }

    /// Name of the worker thread serving this domain
    pub fn worker_name(&self) -> &str {
        self.worker.as_deref().unwrap_or(&self.tag)
    }
}

/// Configuration for a worker registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Known domains
    #[serde(default)]
    pub domains: Vec<DomainConfig>,

    /// Prefix for worker thread names (default: "nexus-")
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,

    /// Name reported by the main-loop dispatcher (default: "main")
    #[serde(default = "default_main_loop_name")]
    pub main_loop_name: String,

    /// Stack size for worker threads in bytes (default: platform default)
    #[serde(default)]
    pub stack_size_bytes: Option<usize>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            main_loop_name: DEFAULT_MAIN_LOOP_NAME.to_string(),
            stack_size_bytes: None,
        }
    }
}

impl RegistryConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a domain served by its own worker
    pub fn with_domain(mut self, tag: impl Into<String>) -> Self {
        self.domains.push(DomainConfig::new(tag));
        self
    }

    /// Add a domain served by the named worker
    pub fn with_aliased_domain(mut self, tag: impl Into<String>, worker: impl Into<String>) -> Self {
        self.domains.push(DomainConfig::aliased(tag, worker));
        self
    }

    /// Set the worker thread name prefix
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the main-loop dispatcher name
    pub fn with_main_loop_name(mut self, name: impl Into<String>) -> Self {
        self.main_loop_name = name.into();
        self
    }

    /// Set the worker stack size
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size_bytes = Some(bytes);
        self
    }

    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Look up the domain for a tag
    pub fn domain(&self, tag: &str) -> Option<&DomainConfig> {
        self.domains.iter().find(|d| d.tag == tag)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domains.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "domains".into(),
                reason: "at least one domain is required".into(),
            });
        }

        let mut seen = HashSet::new();
        for domain in &self.domains {
            if domain.tag.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "domains.tag".into(),
                    reason: "must not be empty".into(),
                });
            }
            if domain.worker.as_deref() == Some("") {
                return Err(ConfigError::InvalidValue {
                    field: "domains.worker".into(),
                    reason: format!("worker name for '{}' must not be empty", domain.tag),
                });
            }
            if !seen.insert(domain.tag.as_str()) {
                return Err(ConfigError::DuplicateTag {
                    tag: domain.tag.clone(),
                });
            }
        }

        if let Some(stack) = self.stack_size_bytes {
            if stack < MIN_STACK_SIZE_BYTES {
                return Err(ConfigError::InvalidValue {
                    field: "stack_size_bytes".into(),
                    reason: "must be at least 64KB".into(),
                });
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// The same tag was configured twice
    #[error("Domain tag configured more than once: {tag}")]
    DuplicateTag {
        /// The repeated tag
        tag: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_thread_name_prefix() -> String {
    DEFAULT_THREAD_NAME_PREFIX.to_string()
}

fn default_main_loop_name() -> String {
    DEFAULT_MAIN_LOOP_NAME.to_string()
}
