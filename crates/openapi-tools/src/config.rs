use apigate_http_tools::safety::SafetyConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where to load an `OpenAPI` document from, plus optional integrity pinning.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpecSource {
    /// `OpenAPI` spec location (URL or file path).
    pub spec: String,

    /// Optional `sha256:<hex>` of the raw document text.
    #[serde(default)]
    pub spec_hash: Option<String>,

    /// What to do when `spec_hash` does not match.
    #[serde(default)]
    pub spec_hash_policy: HashPolicy,
}

impl SpecSource {
    #[must_use]
    pub fn new(spec: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            spec_hash: None,
            spec_hash_policy: HashPolicy::default(),
        }
    }
}

/// Hash verification policy.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HashPolicy {
    /// Log warning if hash doesn't match.
    #[default]
    Warn,
    /// Fail the load if hash doesn't match.
    Fail,
    /// Ignore hash verification.
    Ignore,
}

/// Outbound request settings shared by every dispatch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchConfig {
    /// Per-attempt upstream timeout.
    pub timeout_ms: u64,
    /// Delay before the single retry of a GET/HEAD.
    pub retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub safety: SafetyConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retry_delay_ms: 100,
            connect_timeout_ms: 10_000,
            safety: SafetyConfig::default(),
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_defaults_to_thirty_seconds() {
        let cfg: DispatchConfig = serde_yaml::from_str("{}").expect("parse");
        assert_eq!(cfg.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.retry_delay(), Duration::from_millis(100));
        assert!(cfg.safety.allow_private_networks);
    }

    #[test]
    fn spec_source_parses_camel_case() {
        let src: SpecSource = serde_yaml::from_str(
            "spec: ./bikes.yaml\nspecHash: sha256:abc\nspecHashPolicy: fail\n",
        )
        .expect("parse");
        assert_eq!(src.spec, "./bikes.yaml");
        assert_eq!(src.spec_hash.as_deref(), Some("sha256:abc"));
        assert_eq!(src.spec_hash_policy, HashPolicy::Fail);
    }
}
