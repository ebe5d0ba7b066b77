//! Local manifest access and TTL-gated reconciliation with the state
//! manager.
//!
//! The manifest file's mtime doubles as its freshness record: younger than
//! the TTL means use as-is, older triggers a refresh attempt before
//! cross-endpoint routing. Refresh failures are non-fatal; the worker
//! continues with the stale manifest. Refresh never runs for purely local
//! functions, so the common path stays off the network.

use std::{
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

use color_eyre::{
    Result,
    eyre::{Context as _, OptionExt as _},
};
use tracing::{debug, info, instrument, warn};
use url::Url;

use clients::{
    Token,
    flash::v1::{Manifest, StateManager},
};

/// Whether this worker is part of a Flash deployment at all.
///
/// Live-serverless workers have no manifest and never reconcile.
pub fn is_flash_deployment() -> bool {
    let endpoint_id = std::env::var("RUNPOD_ENDPOINT_ID").unwrap_or_default();
    let is_flash = std::env::var("FLASH_IS_MOTHERSHIP").is_ok_and(|v| v == "true")
        || std::env::var("FLASH_RESOURCE_NAME").is_ok_and(|v| !v.is_empty())
        || std::env::var("FLASH_MOTHERSHIP_ID").is_ok_and(|v| !v.is_empty());
    !endpoint_id.is_empty() && is_flash
}

/// In-memory view of the local manifest plus the locality predicate used
/// for routing decisions.
pub struct ServiceRegistry {
    manifest_path: PathBuf,
    endpoint_id: String,

    /// The resource this worker serves, from `FLASH_RESOURCE_NAME`.
    resource_name: Option<String>,

    cached: RwLock<Option<Manifest>>,
}

impl ServiceRegistry {
    pub fn new(manifest_path: impl Into<PathBuf>, endpoint_id: impl Into<String>) -> Self {
        Self::with_resource_name(
            manifest_path,
            endpoint_id,
            std::env::var("FLASH_RESOURCE_NAME")
                .ok()
                .filter(|name| !name.is_empty()),
        )
    }

    pub fn with_resource_name(
        manifest_path: impl Into<PathBuf>,
        endpoint_id: impl Into<String>,
        resource_name: Option<String>,
    ) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            endpoint_id: endpoint_id.into(),
            resource_name,
            cached: RwLock::new(None),
        }
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Read the manifest, using the in-memory copy when present.
    pub fn load(&self) -> Result<Manifest> {
        if let Some(manifest) = self.read_cache() {
            return Ok(manifest);
        }
        let raw = std::fs::read_to_string(&self.manifest_path)
            .with_context(|| format!("read manifest: {}", self.manifest_path.display()))?;
        let manifest = serde_json::from_str::<Manifest>(&raw).context("parse manifest JSON")?;
        *self.write_cache() = Some(manifest.clone());
        Ok(manifest)
    }

    /// Drop the in-memory copy so the next [`load`](Self::load) re-reads
    /// the file.
    pub fn invalidate(&self) {
        *self.write_cache() = None;
    }

    /// Whether the function's resource is this endpoint.
    ///
    /// A resource is local when its name matches `FLASH_RESOURCE_NAME`, or
    /// (without that hint) when it has no endpoint URL yet or its endpoint
    /// URL references this worker's endpoint id.
    pub fn is_local(&self, manifest: &Manifest, function_name: &str) -> bool {
        let Some((resource_name, resource)) = manifest.resource_for(function_name) else {
            return false;
        };
        if let Some(own_resource) = &self.resource_name {
            return resource_name == own_resource;
        }
        match &resource.endpoint_url {
            None => true,
            Some(url) => url.contains(&self.endpoint_id),
        }
    }

    /// The endpoint URL the function routes to, when it is remote.
    pub fn endpoint_url_for(&self, manifest: &Manifest, function_name: &str) -> Option<String> {
        let (_, resource) = manifest.resource_for(function_name)?;
        resource.endpoint_url.clone()
    }

    /// Whether the manifest file is older than the TTL (or missing).
    pub fn is_stale(&self, ttl: Duration) -> bool {
        let age = std::fs::metadata(&self.manifest_path)
            .and_then(|meta| meta.modified())
            .and_then(|mtime| {
                mtime
                    .elapsed()
                    .map_err(|err| std::io::Error::other(err.to_string()))
            });
        match age {
            Ok(age) => {
                let stale = age >= ttl;
                if stale {
                    debug!(age_secs = age.as_secs(), ttl_secs = ttl.as_secs(), "manifest is stale");
                }
                stale
            }
            // Missing or unreadable manifests are always stale.
            Err(_) => true,
        }
    }

    /// Overwrite the local manifest atomically and drop the memory copy.
    #[instrument(skip_all)]
    pub async fn save(&self, manifest: &Manifest) -> Result<()> {
        let body = serde_json::to_vec_pretty(manifest).context("serialize manifest")?;
        let staged = self.manifest_path.with_extension("json.tmp");
        tokio::fs::write(&staged, &body)
            .await
            .with_context(|| format!("write staged manifest: {}", staged.display()))?;
        tokio::fs::rename(&staged, &self.manifest_path)
            .await
            .context("publish manifest")?;
        self.invalidate();
        Ok(())
    }

    /// Refresh the manifest from the state manager when it has gone stale.
    ///
    /// Skipped entirely outside Flash deployments, or when the state
    /// manager URL or API key is not configured. All errors degrade to
    /// "keep using the stale manifest".
    #[instrument(skip(self))]
    pub async fn refresh_if_stale(&self, ttl: Duration) {
        if !is_flash_deployment() {
            return;
        }
        let Some(token) = Token::from_env("RUNPOD_API_KEY") else {
            debug!("RUNPOD_API_KEY not set, skipping manifest refresh");
            return;
        };
        let Ok(base) = std::env::var("FLASH_STATE_MANAGER_URL") else {
            debug!("FLASH_STATE_MANAGER_URL not set, skipping manifest refresh");
            return;
        };

        if !self.is_stale(ttl) {
            debug!("manifest is fresh, skipping refresh");
            return;
        }

        debug!("manifest is stale, refreshing from state manager");
        if let Err(err) = self.fetch_and_save(&base, token).await {
            warn!(?err, "manifest refresh failed, continuing with stale manifest");
        }
    }

    async fn fetch_and_save(&self, base: &str, token: Token) -> Result<()> {
        let base = Url::parse(base).context("parse state manager url")?;
        let client = StateManager::new(base, token)?;
        let manifest = client
            .persisted_manifest(&self.endpoint_id)
            .await
            .context("query state manager")?
            .ok_or_eyre("no manifest in state manager")?;

        self.save(&manifest).await.context("save manifest")?;
        info!("manifest refreshed from state manager");
        Ok(())
    }

    fn read_cache(&self) -> Option<Manifest> {
        self.cached
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, Option<Manifest>> {
        self.cached
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn write_manifest(path: &Path, endpoint_url: Option<&str>) {
        let manifest = serde_json::json!({
            "version": "1.0",
            "resources": {
                "workers": {
                    "resource_type": "serverless",
                    "endpoint_url": endpoint_url,
                    "functions": [
                        {"name": "embed", "module": "workers.embed", "is_async": false, "is_class": false}
                    ]
                }
            },
            "function_registry": {"embed": "workers"}
        });
        std::fs::write(path, serde_json::to_vec_pretty(&manifest).unwrap()).unwrap();
    }

    #[test]
    fn load_caches_until_invalidated() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("flash_manifest.json");
        write_manifest(&path, None);

        let registry = ServiceRegistry::with_resource_name(&path, "ep-1", None);
        let manifest = registry.load().unwrap();
        assert!(manifest.function_entry("embed").is_some());

        // File changes are invisible until invalidation.
        std::fs::remove_file(&path).unwrap();
        assert!(registry.load().is_ok());
        registry.invalidate();
        assert!(registry.load().is_err());
    }

    #[test]
    fn missing_manifest_is_stale() {
        let temp = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::with_resource_name(
            temp.path().join("missing.json"),
            "ep-1",
            None,
        );
        assert!(registry.is_stale(Duration::from_secs(300)));
    }

    #[test]
    fn fresh_manifest_is_not_stale() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("flash_manifest.json");
        write_manifest(&path, None);

        let registry = ServiceRegistry::with_resource_name(&path, "ep-1", None);
        assert!(!registry.is_stale(Duration::from_secs(300)));
        assert!(registry.is_stale(Duration::ZERO));
    }

    #[test]
    fn locality_prefers_the_resource_name_hint() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("flash_manifest.json");
        write_manifest(&path, Some("https://api.example.com/v2/other-ep/run"));

        let own = ServiceRegistry::with_resource_name(&path, "ep-1", Some("workers".into()));
        let manifest = own.load().unwrap();
        assert!(own.is_local(&manifest, "embed"));

        let other = ServiceRegistry::with_resource_name(&path, "ep-1", Some("frontend".into()));
        assert!(!other.is_local(&manifest, "embed"));
    }

    #[test]
    fn locality_falls_back_to_the_endpoint_url() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("flash_manifest.json");

        write_manifest(&path, Some("https://api.example.com/v2/ep-1/run"));
        let registry = ServiceRegistry::with_resource_name(&path, "ep-1", None);
        let manifest = registry.load().unwrap();
        assert!(registry.is_local(&manifest, "embed"));

        write_manifest(&path, Some("https://api.example.com/v2/ep-9/run"));
        registry.invalidate();
        let manifest = registry.load().unwrap();
        assert!(!registry.is_local(&manifest, "embed"));
        assert_eq!(
            registry.endpoint_url_for(&manifest, "embed").unwrap(),
            "https://api.example.com/v2/ep-9/run"
        );
    }

    #[test]
    fn unprovisioned_resource_counts_as_local() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("flash_manifest.json");
        write_manifest(&path, None);

        let registry = ServiceRegistry::with_resource_name(&path, "ep-1", None);
        let manifest = registry.load().unwrap();
        assert!(registry.is_local(&manifest, "embed"));
    }

    #[test]
    fn unknown_function_is_not_local() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("flash_manifest.json");
        write_manifest(&path, None);

        let registry = ServiceRegistry::with_resource_name(&path, "ep-1", None);
        let manifest = registry.load().unwrap();
        assert!(!registry.is_local(&manifest, "missing"));
        assert_eq!(registry.endpoint_url_for(&manifest, "missing"), None);
    }

    #[tokio::test]
    async fn save_is_atomic_and_invalidates() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("flash_manifest.json");
        write_manifest(&path, None);

        let registry = ServiceRegistry::with_resource_name(&path, "ep-1", None);
        let mut manifest = registry.load().unwrap();
        manifest.version = String::from("2.0");
        registry.save(&manifest).await.unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(registry.load().unwrap().version, "2.0");
    }
}
