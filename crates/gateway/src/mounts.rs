//! Mounted API namespaces.
//!
//! Each mount owns a frozen [`ToolRegistry`] and a cancellation token that every session of the
//! namespace derives from, so unmounting (or replacing) a namespace closes its sessions.

use crate::config::MountSpec;
use apigate_openapi_tools::config::SpecSource;
use apigate_openapi_tools::{LoadError, SpecLoader, ToolRegistry, TranslationError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum MountError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error("invalid namespace '{0}': use letters, digits, '-' and '_'")]
    InvalidNamespace(String),

    #[error("no upstream base URL for '{0}': set baseUrl or declare a server in the document")]
    MissingBaseUrl(String),
}

#[derive(Debug)]
pub struct Mount {
    registry: Arc<ToolRegistry>,
    version: String,
    spec_hash: Option<String>,
    closed: CancellationToken,
}

/// What callers get back from a successful mount.
pub type MountHandle = Arc<Mount>;

impl Mount {
    #[must_use]
    pub fn new(version: impl Into<String>, registry: ToolRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            version: version.into(),
            spec_hash: None,
            closed: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        self.registry.namespace()
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn spec_hash(&self) -> Option<&str> {
        self.spec_hash.as_deref()
    }

    /// `/<namespace>/<version>/<transport>`.
    #[must_use]
    pub fn path_prefix(&self, transport: &str) -> String {
        format!("/{}/{}/{transport}", self.namespace(), self.version)
    }

    /// Cancelled once the mount is removed or replaced.
    #[must_use]
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

const DEFAULT_VERSION: &str = "v1";

pub struct MountTable {
    loader: SpecLoader,
    mounts: RwLock<BTreeMap<String, MountHandle>>,
}

impl MountTable {
    #[must_use]
    pub fn new(loader: SpecLoader) -> Self {
        Self {
            loader,
            mounts: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load `locator` and expose it as `namespace` under version `v1`.
    ///
    /// # Errors
    ///
    /// See [`MountTable::mount_spec`].
    pub async fn mount(
        &self,
        namespace: &str,
        locator: &str,
        base_url: Option<&str>,
    ) -> Result<MountHandle, MountError> {
        self.mount_spec(MountSpec {
            namespace: namespace.to_string(),
            version: Some(DEFAULT_VERSION.to_string()),
            source: SpecSource::new(locator),
            base_url: base_url.map(str::to_string),
            headers: Vec::new(),
        })
        .await
    }

    /// Load, translate and register one API. An existing mount with the same namespace is
    /// replaced only once the new registry is fully built; on error the table is unchanged.
    ///
    /// # Errors
    ///
    /// Returns the load or translation error, or a config error for a bad namespace or a
    /// missing base URL.
    pub async fn mount_spec(&self, spec: MountSpec) -> Result<MountHandle, MountError> {
        if !is_valid_segment(&spec.namespace) {
            return Err(MountError::InvalidNamespace(spec.namespace));
        }
        if let Some(version) = &spec.version
            && !is_valid_segment(version)
        {
            return Err(MountError::InvalidNamespace(format!(
                "{}/{version}",
                spec.namespace
            )));
        }

        let loaded = self.loader.load_source(&spec.source).await?;
        let version = spec
            .version
            .or_else(|| version_from_title(&loaded.document.title))
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());
        let base_url = spec
            .base_url
            .or(loaded.base_url)
            .ok_or_else(|| MountError::MissingBaseUrl(spec.namespace.clone()))?;
        let registry =
            ToolRegistry::build(&spec.namespace, base_url, spec.headers, &loaded.document)?;

        let mut mount = Mount::new(version, registry);
        mount.spec_hash = Some(loaded.hash);
        let mount = Arc::new(mount);

        let previous = self
            .mounts
            .write()
            .insert(spec.namespace.clone(), Arc::clone(&mount));
        if let Some(previous) = previous {
            previous.closed.cancel();
        }

        tracing::info!(
            namespace = %mount.namespace(),
            tools = mount.registry.len(),
            base_url = %mount.registry.base_url(),
            path = %mount.path_prefix("sse"),
            "mounted API"
        );
        Ok(mount)
    }

    /// Register an already-built mount, replacing any previous one with its namespace.
    pub fn insert(&self, mount: Mount) -> MountHandle {
        let mount = Arc::new(mount);
        let previous = self
            .mounts
            .write()
            .insert(mount.namespace().to_string(), Arc::clone(&mount));
        if let Some(previous) = previous {
            previous.closed.cancel();
        }
        mount
    }

    /// Remove `namespace` and close its sessions. Returns false if it was not mounted.
    pub fn unmount(&self, namespace: &str) -> bool {
        let Some(mount) = self.mounts.write().remove(namespace) else {
            return false;
        };
        mount.closed.cancel();
        tracing::info!(namespace = %namespace, "unmounted API");
        true
    }

    #[must_use]
    pub fn get(&self, namespace: &str) -> Option<MountHandle> {
        self.mounts.read().get(namespace).cloned()
    }

    /// Mounts ordered by namespace.
    #[must_use]
    pub fn list(&self) -> Vec<MountHandle> {
        self.mounts.read().values().cloned().collect()
    }
}

/// `bikes-v2` -> `v2`. Titles without a usable suffix yield `None`.
fn version_from_title(title: &str) -> Option<String> {
    let (_, version) = title.split_once('-')?;
    let version = version.trim().to_ascii_lowercase();
    is_valid_segment(&version).then_some(version)
}

fn is_valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
