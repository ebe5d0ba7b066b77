//! Fire-and-forget cache synchronization to the network volume.
//!
//! Sibling workers share downloaded-package bytes through a per-endpoint
//! delta tarball, without any global lock. Before an install begins, the
//! worker records a baseline timestamp; afterwards every cache file with an
//! mtime strictly after the baseline is appended to the tarball, which is
//! only ever published via atomic rename of a `.tmp` sibling. Readers gate
//! hydration on the mtime of a local marker file, so a tarball is extracted
//! at most once per publish.
//!
//! Two siblings may publish simultaneously; the rename guarantees readers
//! never see a torn archive, and a lost delta is tolerable because the
//! contents are pure cache.

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::SystemTime,
};

use tokio::task::spawn_blocking;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    constants::{HYDRATION_MARKER, LOCAL_CACHE_DIR, VOLUME_CACHE_DIR_NAME, VOLUME_ROOT},
    subprocess::{RunOptions, run_logged},
};

struct Baseline {
    marker: PathBuf,
    at: SystemTime,
}

/// Manages baseline-delta detection, tarball publishing, and hydration.
pub struct CacheSyncManager {
    endpoint_id: Option<String>,
    local_cache_dir: PathBuf,
    volume_cache_dir: PathBuf,

    /// Extraction base for hydration; the filesystem root in production
    /// (tarball members carry cache paths with the leading `/` stripped).
    extract_root: PathBuf,

    should_sync: OnceLock<bool>,
    baseline: Mutex<Option<Baseline>>,
}

impl CacheSyncManager {
    /// Manager over the production paths.
    pub fn new() -> Self {
        Self::with_paths(
            std::env::var("RUNPOD_ENDPOINT_ID").ok().filter(|id| !id.is_empty()),
            PathBuf::from(LOCAL_CACHE_DIR),
            Path::new(VOLUME_ROOT).join(VOLUME_CACHE_DIR_NAME),
            PathBuf::from("/"),
        )
    }

    /// Manager over explicit paths.
    pub fn with_paths(
        endpoint_id: Option<String>,
        local_cache_dir: PathBuf,
        volume_cache_dir: PathBuf,
        extract_root: PathBuf,
    ) -> Self {
        Self {
            endpoint_id,
            local_cache_dir,
            volume_cache_dir,
            extract_root,
            should_sync: OnceLock::new(),
            baseline: Mutex::new(None),
        }
    }

    /// The published tarball path for this endpoint.
    pub fn tarball_path(&self) -> Option<PathBuf> {
        let endpoint_id = self.endpoint_id.as_ref()?;
        Some(self.volume_cache_dir.join(format!("cache-{endpoint_id}.tar")))
    }

    fn hydration_marker(&self) -> PathBuf {
        self.local_cache_dir.join(HYDRATION_MARKER)
    }

    /// Whether cache sync applies at all: an endpoint id is set and the
    /// volume cache directory exists or can be created. Memoized.
    pub fn should_sync(&self) -> bool {
        *self.should_sync.get_or_init(|| {
            if self.endpoint_id.is_none() {
                debug!("no endpoint id set, skipping cache sync");
                return false;
            }
            let Some(volume_root) = self.volume_cache_dir.parent() else {
                return false;
            };
            if !volume_root.exists() {
                debug!(?volume_root, "volume not mounted, skipping cache sync");
                return false;
            }
            if let Err(err) = std::fs::create_dir_all(&self.volume_cache_dir) {
                warn!(?err, "failed to create volume cache directory");
                return false;
            }
            true
        })
    }

    /// Record a baseline before any install begins.
    ///
    /// The baseline is the mtime of a freshly touched marker file, so delta
    /// comparisons use the same clock the filesystem stamps cache files
    /// with.
    #[instrument(skip(self))]
    pub fn mark_baseline(&self) {
        if !self.should_sync() {
            return;
        }

        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let marker = std::env::temp_dir().join(format!(".cache-baseline-{millis}"));

        let baseline = std::fs::write(&marker, b"")
            .and_then(|_| std::fs::metadata(&marker))
            .and_then(|meta| meta.modified());
        match baseline {
            Ok(at) => {
                debug!(?marker, "marked cache baseline");
                *self.lock_baseline() = Some(Baseline { marker, at });
            }
            Err(err) => {
                warn!(?err, "failed to mark cache baseline");
            }
        }
    }

    /// Collect the delta since the baseline and publish it to the volume.
    ///
    /// Fire-and-forget: every failure is logged and swallowed, and the
    /// baseline marker is cleaned up on all paths.
    #[instrument(skip(self))]
    pub async fn sync_to_volume(&self) {
        if !self.should_sync() {
            return;
        }
        let Some(baseline) = self.lock_baseline().take() else {
            return;
        };

        if let Err(err) = self.sync_delta(&baseline).await {
            error!(?err, "unexpected error in cache sync");
        }

        if let Err(err) = tokio::fs::remove_file(&baseline.marker).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(?err, "failed to clean up baseline marker");
            }
        }
    }

    async fn sync_delta(&self, baseline: &Baseline) -> color_eyre::Result<()> {
        use color_eyre::eyre::{Context as _, eyre};

        let Some(tarball) = self.tarball_path() else {
            return Ok(());
        };
        let tarball_exists = tarball.exists();

        debug!(from = ?self.local_cache_dir, to = ?tarball, "starting background cache sync");

        let new_files = {
            let root = self.local_cache_dir.clone();
            let at = baseline.at;
            spawn_blocking(move || files_newer_than(&root, at))
                .await
                .context("join delta enumeration")?
        };
        if new_files.is_empty() {
            debug!("no new cache files to sync");
            return Ok(());
        }
        debug!(count = new_files.len(), "found new cache files to sync");

        // tar -T wants the member list in a file.
        let list = new_files
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        let list_file = tempfile::NamedTempFile::new().context("create file list")?;
        tokio::fs::write(list_file.path(), list)
            .await
            .context("write file list")?;

        let staged = tarball.with_extension("tar.tmp");
        let result = async {
            let (flags, operation) = if tarball_exists {
                tokio::fs::copy(&tarball, &staged)
                    .await
                    .context("copy existing tarball")?;
                ("rf", "Appending to cache tarball")
            } else {
                ("cf", "Creating cache tarball")
            };

            let list_path = list_file.path().display().to_string();
            let staged_path = staged.display().to_string();
            let tar = run_logged(
                "tar",
                [flags, staged_path.as_str(), "-T", list_path.as_str()],
                operation,
                RunOptions::default(),
            )
            .await;
            if !tar.success {
                return Err(eyre!("tar failed: {}", tar.error_message()));
            }

            tokio::fs::rename(&staged, &tarball)
                .await
                .context("publish tarball")?;

            let action = if tarball_exists { "appended to" } else { "created" };
            info!(?tarball, "successfully {action} cache tarball");
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&staged).await;
        }
        result
    }

    /// Whether the published tarball is strictly newer than the last local
    /// hydration.
    pub fn should_hydrate(&self) -> bool {
        if !self.should_sync() {
            return false;
        }
        let Some(tarball) = self.tarball_path() else {
            return false;
        };
        if !tarball.exists() {
            debug!(?tarball, "tarball does not exist, skipping hydration");
            return false;
        }

        let marker = self.hydration_marker();
        if !marker.exists() {
            debug!("no hydration marker found, hydration needed");
            return true;
        }

        match (mtime(&tarball), mtime(&marker)) {
            (Some(tarball_mtime), Some(marker_mtime)) => tarball_mtime > marker_mtime,
            _ => {
                warn!("failed to check hydration status");
                true
            }
        }
    }

    /// Extract the published tarball over the local cache, then touch the
    /// hydration marker. Failures are logged and swallowed.
    #[instrument(skip(self))]
    pub async fn hydrate_from_volume(&self) {
        if !self.should_hydrate() {
            return;
        }
        let Some(tarball) = self.tarball_path() else {
            return;
        };

        debug!(?tarball, to = ?self.local_cache_dir, "hydrating cache");

        if let Err(err) = tokio::fs::create_dir_all(&self.local_cache_dir).await {
            warn!(?err, "failed to create cache directory");
            return;
        }

        let tarball_path = tarball.display().to_string();
        let extract_root = self.extract_root.display().to_string();
        let result = run_logged(
            "tar",
            ["xf", tarball_path.as_str(), "-C", extract_root.as_str()],
            "Extracting cache tarball",
            RunOptions::default(),
        )
        .await;

        if result.success {
            info!(?tarball, "successfully hydrated cache");
            if let Err(err) = std::fs::write(self.hydration_marker(), b"") {
                warn!(?err, "failed to mark cache last hydrated");
            }
        } else {
            warn!(error = result.error_message(), "failed to extract tarball");
        }
    }

    fn lock_baseline(&self) -> std::sync::MutexGuard<'_, Option<Baseline>> {
        self.baseline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CacheSyncManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Regular files under `root` with an mtime strictly after `baseline`.
fn files_newer_than(root: &Path, baseline: SystemTime) -> Vec<PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .map(|mtime| mtime > baseline)
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect()
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use filetime::FileTime;
    use pretty_assertions::assert_eq;

    use super::*;

    struct Fixture {
        _temp: tempfile::TempDir,
        manager: CacheSyncManager,
        cache_dir: PathBuf,
        volume_cache: PathBuf,
        extract_root: PathBuf,
    }

    fn fixture(endpoint_id: Option<&str>) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let cache_dir = temp.path().join("local-cache");
        let volume = temp.path().join("volume");
        let volume_cache = volume.join(".cache");
        let extract_root = temp.path().join("extract-root");
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::create_dir_all(&volume).unwrap();
        std::fs::create_dir_all(&extract_root).unwrap();

        let manager = CacheSyncManager::with_paths(
            endpoint_id.map(String::from),
            cache_dir.clone(),
            volume_cache.clone(),
            extract_root.clone(),
        );
        Fixture {
            _temp: temp,
            manager,
            cache_dir,
            volume_cache,
            extract_root,
        }
    }

    fn bump_mtime(path: &Path, forward: Duration) {
        let meta = std::fs::metadata(path).unwrap();
        let bumped = meta.modified().unwrap() + forward;
        filetime::set_file_mtime(path, FileTime::from_system_time(bumped)).unwrap();
    }

    #[test]
    fn no_endpoint_id_disables_sync() {
        let fixture = fixture(None);
        assert!(!fixture.manager.should_sync());
        assert_eq!(fixture.manager.tarball_path(), None);
    }

    #[test]
    fn missing_volume_disables_sync() {
        let temp = tempfile::tempdir().unwrap();
        let manager = CacheSyncManager::with_paths(
            Some(String::from("ep")),
            temp.path().join("cache"),
            temp.path().join("not-mounted").join(".cache"),
            temp.path().to_path_buf(),
        );
        assert!(!manager.should_sync());
    }

    #[test]
    fn should_sync_creates_the_volume_cache_dir() {
        let fixture = fixture(Some("ep"));
        assert!(fixture.manager.should_sync());
        assert!(fixture.volume_cache.is_dir());
    }

    #[test]
    fn delta_enumeration_is_strictly_after_baseline() {
        let temp = tempfile::tempdir().unwrap();
        let old = temp.path().join("old.whl");
        let new = temp.path().join("new.whl");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&new, b"new").unwrap();

        let baseline = std::fs::metadata(&old).unwrap().modified().unwrap();
        bump_mtime(&new, Duration::from_secs(5));

        let newer = files_newer_than(temp.path(), baseline);
        assert_eq!(newer, vec![new]);
    }

    #[tokio::test]
    async fn sync_publishes_a_tarball_with_no_tmp_residue() {
        let fixture = fixture(Some("ep"));
        fixture.manager.mark_baseline();

        let wheel = fixture.cache_dir.join("pkgs").join("torch.whl");
        std::fs::create_dir_all(wheel.parent().unwrap()).unwrap();
        std::fs::write(&wheel, b"wheel bytes").unwrap();
        bump_mtime(&wheel, Duration::from_secs(5));

        fixture.manager.sync_to_volume().await;

        let tarball = fixture.manager.tarball_path().unwrap();
        assert!(tarball.exists(), "tarball should be published");
        assert!(
            !tarball.with_extension("tar.tmp").exists(),
            "no .tmp residue allowed"
        );
        assert_eq!(tarball, fixture.volume_cache.join("cache-ep.tar"));
    }

    #[tokio::test]
    async fn empty_delta_publishes_nothing() {
        let fixture = fixture(Some("ep"));
        std::fs::write(fixture.cache_dir.join("pre-existing.whl"), b"old").unwrap();

        // Baseline marked after the file exists; mtimes are not after it.
        std::thread::sleep(Duration::from_millis(20));
        fixture.manager.mark_baseline();
        fixture.manager.sync_to_volume().await;

        assert!(!fixture.manager.tarball_path().unwrap().exists());
    }

    #[tokio::test]
    async fn sync_without_baseline_is_a_no_op() {
        let fixture = fixture(Some("ep"));
        fixture.manager.sync_to_volume().await;
        assert!(!fixture.manager.tarball_path().unwrap().exists());
    }

    #[tokio::test]
    async fn hydration_round_trips_the_synced_files() {
        let fixture = fixture(Some("ep"));
        fixture.manager.mark_baseline();

        let wheel = fixture.cache_dir.join("torch.whl");
        std::fs::write(&wheel, b"wheel bytes").unwrap();
        bump_mtime(&wheel, Duration::from_secs(5));
        fixture.manager.sync_to_volume().await;

        assert!(fixture.manager.should_hydrate());
        fixture.manager.hydrate_from_volume().await;

        // tar strips the leading separator, so the absolute member path is
        // recreated under the extraction root.
        let relative = wheel.strip_prefix("/").unwrap();
        let extracted = fixture.extract_root.join(relative);
        assert_eq!(std::fs::read(extracted).unwrap(), b"wheel bytes");

        // Marker was touched, so a second hydration is gated off.
        assert!(!fixture.manager.should_hydrate());
    }

    #[tokio::test]
    async fn newer_tarball_reenables_hydration() {
        let fixture = fixture(Some("ep"));
        let tarball = fixture.manager.tarball_path().unwrap();

        fixture.manager.mark_baseline();
        let wheel = fixture.cache_dir.join("a.whl");
        std::fs::write(&wheel, b"a").unwrap();
        bump_mtime(&wheel, Duration::from_secs(5));
        fixture.manager.sync_to_volume().await;

        fixture.manager.hydrate_from_volume().await;
        assert!(!fixture.manager.should_hydrate());

        // A sibling publishes a newer tarball.
        bump_mtime(&tarball, Duration::from_secs(10));
        assert!(fixture.manager.should_hydrate());
    }

    #[tokio::test]
    async fn second_sync_appends_to_the_existing_tarball() {
        let fixture = fixture(Some("ep"));

        fixture.manager.mark_baseline();
        let first = fixture.cache_dir.join("first.whl");
        std::fs::write(&first, b"first").unwrap();
        bump_mtime(&first, Duration::from_secs(5));
        fixture.manager.sync_to_volume().await;

        fixture.manager.mark_baseline();
        let second = fixture.cache_dir.join("second.whl");
        std::fs::write(&second, b"second").unwrap();
        bump_mtime(&second, Duration::from_secs(10));
        fixture.manager.sync_to_volume().await;

        // Extract and verify both members survived the append.
        fixture.manager.hydrate_from_volume().await;
        let root = &fixture.extract_root;
        assert!(root.join(first.strip_prefix("/").unwrap()).exists());
        assert!(root.join(second.strip_prefix("/").unwrap()).exists());
    }
}
