//! Gateway configuration: YAML file plus command-line overrides.

use apigate_openapi_tools::config::{DispatchConfig, HashPolicy, SpecSource};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const SPEC_FILE_STEMS: [&str; 3] = ["openapi", "swagger", "api"];
const SPEC_FILE_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "apigate", version, about = "Serve OpenAPI-described REST APIs as agent tools")]
pub struct Cli {
    /// Path to the YAML config file.
    #[arg(long, env = "APIGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address, overrides `server.bind`.
    #[arg(long, env = "APIGATE_BIND")]
    pub bind: Option<String>,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, env = "APIGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Directory of API specs, one subdirectory per namespace. Overrides `specsDir`.
    #[arg(long)]
    pub specs_dir: Option<PathBuf>,

    /// Exit if any API fails to mount.
    #[arg(long)]
    pub strict: bool,
}

impl Cli {
    /// Fold command-line overrides into `config`.
    pub fn apply(&self, config: &mut GatewayConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind.clone_from(bind);
        }
        if let Some(dir) = &self.specs_dir {
            config.specs_dir = Some(dir.clone());
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub dispatch: DispatchSection,
    /// Headers sent to every upstream.
    pub default_headers: BTreeMap<String, String>,
    pub apis: BTreeMap<String, ApiConfig>,
    pub specs_dir: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            dispatch: DispatchSection::default(),
            default_headers: BTreeMap::from([
                (
                    "User-Agent".to_string(),
                    format!("apigate/{}", env!("CARGO_PKG_VERSION")),
                ),
                ("Accept".to_string(), "application/json".to_string()),
            ]),
            apis: BTreeMap::new(),
            specs_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "apigate".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            bind: "0.0.0.0:8765".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchSection {
    #[serde(flatten)]
    pub upstream: DispatchConfig,
    /// Wall-clock bound on one invocation, retries included.
    pub invocation_deadline_secs: u64,
    /// Request headers copied from the session-opening request to every upstream call.
    pub passthrough_headers: Vec<String>,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            upstream: DispatchConfig::default(),
            invocation_deadline_secs: 90,
            passthrough_headers: vec!["authorization".to_string()],
        }
    }
}

impl DispatchSection {
    #[must_use]
    pub fn invocation_deadline(&self) -> Duration {
        Duration::from_secs(self.invocation_deadline_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub spec: String,
    /// Upstream base URL; defaults to the document's first server.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_version")]
    pub version: String,
    /// Extra headers for this API only, layered over `defaultHeaders`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub spec_hash: Option<String>,
    #[serde(default)]
    pub spec_hash_policy: HashPolicy,
}

fn default_api_version() -> String {
    "v1".to_string()
}

/// Everything needed to mount one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub namespace: String,
    /// `None` takes the version from a `name-version` document title, else `v1`.
    pub version: Option<String>,
    pub source: SpecSource,
    pub base_url: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl GatewayConfig {
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Explicit `apis` entries plus namespaces discovered under `specsDir`. An explicit entry
    /// wins over a discovered one with the same namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if `specsDir` cannot be read.
    pub fn mount_specs(&self) -> Result<Vec<MountSpec>, ConfigError> {
        let mut specs: BTreeMap<String, MountSpec> = BTreeMap::new();

        if let Some(dir) = &self.specs_dir {
            for (namespace, path) in discover_specs(dir)? {
                let spec = MountSpec {
                    version: None,
                    source: SpecSource::new(path.to_string_lossy()),
                    base_url: None,
                    headers: self.headers_for(&BTreeMap::new()),
                    namespace: namespace.clone(),
                };
                specs.insert(namespace, spec);
            }
        }

        for (namespace, api) in &self.apis {
            let spec = MountSpec {
                namespace: namespace.clone(),
                version: Some(api.version.clone()),
                source: SpecSource {
                    spec: api.spec.clone(),
                    spec_hash: api.spec_hash.clone(),
                    spec_hash_policy: api.spec_hash_policy,
                },
                base_url: api.base_url.clone(),
                headers: self.headers_for(&api.headers),
            };
            specs.insert(namespace.clone(), spec);
        }

        Ok(specs.into_values().collect())
    }

    fn headers_for(&self, extra: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut merged: BTreeMap<String, (String, String)> = BTreeMap::new();
        for (k, v) in self.default_headers.iter().chain(extra) {
            merged.insert(k.to_ascii_lowercase(), (k.clone(), v.clone()));
        }
        merged.into_values().collect()
    }
}

/// One `(namespace, spec file)` per subdirectory of `dir` that contains a spec, sorted by
/// namespace.
///
/// # Errors
///
/// Returns an error if `dir` cannot be listed.
pub fn discover_specs(dir: &Path) -> Result<Vec<(String, PathBuf)>, ConfigError> {
    let read_err = |source: std::io::Error| ConfigError::Read {
        path: dir.to_path_buf(),
        source,
    };

    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(namespace) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match find_spec_file(&path) {
            Some(spec) => found.push((namespace.to_string(), spec)),
            None => tracing::warn!(dir = %path.display(), "no OpenAPI spec found; skipping"),
        }
    }
    found.sort();
    Ok(found)
}

/// `openapi.*`, then `swagger.*`, then `api.*`, then the first yaml/yml/json file by name.
fn find_spec_file(dir: &Path) -> Option<PathBuf> {
    for stem in SPEC_FILE_STEMS {
        for ext in SPEC_FILE_EXTENSIONS {
            let candidate = dir.join(format!("{stem}.{ext}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    let mut rest: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| SPEC_FILE_EXTENSIONS.contains(&e))
        })
        .collect();
    rest.sort();
    rest.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gets_defaults() {
        let cfg: GatewayConfig = serde_yaml::from_str("{}").expect("parse");
        assert_eq!(cfg.server.bind, "0.0.0.0:8765");
        assert_eq!(cfg.dispatch.upstream.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.dispatch.invocation_deadline(), Duration::from_secs(90));
        assert_eq!(cfg.dispatch.passthrough_headers, ["authorization"]);
        assert_eq!(
            cfg.default_headers.get("Accept").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn parses_apis_and_dispatch_settings() {
        let cfg: GatewayConfig = serde_yaml::from_str(
            r"
server:
  bind: 127.0.0.1:9000
dispatch:
  timeoutMs: 5000
  retryDelayMs: 20
  invocationDeadlineSecs: 12
  passthroughHeaders: [authorization, x-api-key]
  safety:
    allowPrivateNetworks: false
defaultHeaders:
  User-Agent: bikes-agent
apis:
  bikes:
    spec: ./specs/bikes.yaml
    baseUrl: https://bikes.example.com
    headers:
      user-agent: bikes-override
    specHash: sha256:abc
    specHashPolicy: fail
",
        )
        .expect("parse");

        assert_eq!(cfg.dispatch.upstream.timeout(), Duration::from_secs(5));
        assert_eq!(cfg.dispatch.upstream.retry_delay(), Duration::from_millis(20));
        assert!(!cfg.dispatch.upstream.safety.allow_private_networks);
        assert_eq!(cfg.dispatch.invocation_deadline(), Duration::from_secs(12));

        let specs = cfg.mount_specs().expect("specs");
        assert_eq!(specs.len(), 1);
        let bikes = &specs[0];
        assert_eq!(bikes.namespace, "bikes");
        assert_eq!(bikes.version.as_deref(), Some("v1"));
        assert_eq!(bikes.base_url.as_deref(), Some("https://bikes.example.com"));
        assert_eq!(bikes.source.spec_hash_policy, HashPolicy::Fail);
        assert_eq!(
            bikes.headers,
            [("user-agent".to_string(), "bikes-override".to_string())]
        );
    }

    #[test]
    fn discovers_specs_by_priority() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bikes = dir.path().join("bikes");
        let shops = dir.path().join("shops");
        let empty = dir.path().join("empty");
        for d in [&bikes, &shops, &empty] {
            std::fs::create_dir(d).expect("mkdir");
        }
        std::fs::write(bikes.join("api.json"), "{}").expect("write");
        std::fs::write(bikes.join("openapi.yml"), "{}").expect("write");
        std::fs::write(shops.join("z.yaml"), "{}").expect("write");
        std::fs::write(shops.join("b.json"), "{}").expect("write");
        std::fs::write(shops.join("notes.txt"), "").expect("write");

        let found = discover_specs(dir.path()).expect("discover");
        assert_eq!(
            found,
            [
                ("bikes".to_string(), bikes.join("openapi.yml")),
                ("shops".to_string(), shops.join("b.json")),
            ]
        );
    }

    #[test]
    fn explicit_api_wins_over_discovered() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("bikes")).expect("mkdir");
        std::fs::write(dir.path().join("bikes/openapi.yaml"), "{}").expect("write");

        let mut cfg = GatewayConfig::default();
        cfg.specs_dir = Some(dir.path().to_path_buf());
        cfg.apis.insert(
            "bikes".to_string(),
            ApiConfig {
                spec: "https://specs.example.com/bikes.yaml".to_string(),
                base_url: None,
                version: "v2".to_string(),
                headers: BTreeMap::new(),
                spec_hash: None,
                spec_hash_policy: HashPolicy::Warn,
            },
        );

        let specs = cfg.mount_specs().expect("specs");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].version.as_deref(), Some("v2"));
        assert_eq!(specs[0].source.spec, "https://specs.example.com/bikes.yaml");
    }

    #[test]
    fn discovered_specs_leave_version_to_the_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("trails")).expect("mkdir");
        std::fs::write(dir.path().join("trails/openapi.yaml"), "{}").expect("write");

        let mut cfg = GatewayConfig::default();
        cfg.specs_dir = Some(dir.path().to_path_buf());
        let specs = cfg.mount_specs().expect("specs");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].namespace, "trails");
        assert_eq!(specs[0].version, None);
    }

    #[test]
    fn cli_overrides_file_values() {
        let cli = Cli::try_parse_from([
            "apigate",
            "--bind",
            "127.0.0.1:1234",
            "--specs-dir",
            "/srv/specs",
            "--strict",
        ])
        .expect("cli");
        let mut cfg = GatewayConfig::default();
        cli.apply(&mut cfg);
        assert!(cli.strict);
        assert_eq!(cli.log_format, LogFormat::Text);
        assert_eq!(cfg.server.bind, "127.0.0.1:1234");
        assert_eq!(cfg.specs_dir.as_deref(), Some(Path::new("/srv/specs")));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = GatewayConfig::load(Path::new("/nonexistent/apigate.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
