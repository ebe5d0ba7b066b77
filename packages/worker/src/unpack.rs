//! Materialization of pre-deployed code at worker startup.
//!
//! Two variants exist. The *volume archive* is a gzipped tar at a canonical
//! path on the shared volume, extracted once per worker process into the
//! app directory. The *network tarball* is named by an object-storage key
//! and downloaded through an S3-compatible API, then extracted into a
//! nested project directory with a marker file so restarts skip the
//! download.
//!
//! Both variants extract through the same checked path: every member is
//! validated against the extraction root before anything is written, and
//! the first traversal attempt aborts the whole extraction.

use std::path::{Component, Path, PathBuf};

use async_compression::tokio::bufread::GzipDecoder;
use color_eyre::{
    Result,
    eyre::{Context as _, bail, eyre},
};
use futures::StreamExt as _;
use tokio::io::BufReader;
use tokio_util::compat::TokioAsyncReadCompatExt as _;
use tracing::{debug, error, info, instrument};

use crate::{
    constants::{
        APP_DIR, DEFAULT_ARTIFACT_PATH, DEFAULT_TARBALL_BUCKET, DOWNLOAD_TIMEOUT, PROJECT_DIR,
        TARBALL_MARKER, UNPACK_ATTEMPTS, UNPACK_RETRY_INTERVAL,
    },
    manifest::is_flash_deployment,
};

/// Whether unpacking is explicitly disabled via `FLASH_DISABLE_UNPACK`.
pub fn unpack_disabled() -> bool {
    let value = std::env::var("FLASH_DISABLE_UNPACK")
        .unwrap_or_default()
        .to_lowercase();
    matches!(value.as_str(), "1" | "true" | "yes")
}

/// The canonical artifact path, overridable via `FLASH_BUILD_ARTIFACT_PATH`.
fn artifact_path() -> PathBuf {
    std::env::var("FLASH_BUILD_ARTIFACT_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_ARTIFACT_PATH))
}

// Process-wide sentinel: concurrent callers unpack at most once.
static UNPACKED: tokio::sync::Mutex<bool> = tokio::sync::Mutex::const_new(false);

/// Unpack the build artifact from the volume if conditions are met.
///
/// No-op for live-serverless deployments and when explicitly disabled.
/// Transient failures are retried a bounded number of times with constant
/// backoff; exhaustion is a startup error.
#[instrument]
pub async fn maybe_unpack() -> Result<()> {
    if unpack_disabled() {
        debug!("unpacking disabled via FLASH_DISABLE_UNPACK");
        return Ok(());
    }
    if !is_flash_deployment() {
        debug!("live serverless deployment detected, skipping unpacking");
        return Ok(());
    }

    let mut unpacked = UNPACKED.lock().await;
    if *unpacked {
        return Ok(());
    }

    info!("unpacking app from volume");
    let mut last_error = None;
    for attempt in 1..=UNPACK_ATTEMPTS {
        match unpack_app_from_volume(Path::new(APP_DIR)).await {
            Ok(()) => {
                *unpacked = true;
                return Ok(());
            }
            Err(err) => {
                error!(
                    attempt,
                    attempts = UNPACK_ATTEMPTS,
                    ?err,
                    "failed to unpack app from volume"
                );
                last_error = Some(err);
                if attempt < UNPACK_ATTEMPTS {
                    tokio::time::sleep(UNPACK_RETRY_INTERVAL).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| eyre!("unpack failed")))
        .context("failed to unpack app from volume after retries")
}

/// Extract the build artifact into the app directory.
#[instrument]
pub async fn unpack_app_from_volume(app_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(app_dir)
        .await
        .with_context(|| format!("create app dir: {}", app_dir.display()))?;

    let artifact = artifact_path();
    let metadata = tokio::fs::metadata(&artifact)
        .await
        .map_err(|_| eyre!("flash build artifact not found at {}", artifact.display()))?;
    if !metadata.is_file() {
        bail!("flash build artifact not found at {}", artifact.display());
    }

    extract_archive(&artifact, app_dir)
        .await
        .context("failed to extract flash artifact")?;
    info!(?app_dir, "successfully extracted build artifact");
    Ok(())
}

/// Extract a gzipped tar with path-traversal defense.
///
/// All member paths are validated in a first pass; nothing is written
/// unless every member stays inside the extraction root.
#[instrument]
pub async fn extract_archive(archive: &Path, target_dir: &Path) -> Result<()> {
    check_members(archive, target_dir)
        .await
        .context("validate archive members")?;

    let file = tokio::fs::File::open(archive)
        .await
        .with_context(|| format!("open archive: {}", archive.display()))?;
    let decoder = GzipDecoder::new(BufReader::new(file));
    let tar = async_tar::Archive::new(decoder.compat());
    tar.unpack(target_dir)
        .await
        .with_context(|| format!("extract archive into {}", target_dir.display()))?;
    Ok(())
}

async fn check_members(archive: &Path, target_dir: &Path) -> Result<()> {
    let file = tokio::fs::File::open(archive)
        .await
        .with_context(|| format!("open archive: {}", archive.display()))?;
    let decoder = GzipDecoder::new(BufReader::new(file));
    let tar = async_tar::Archive::new(decoder.compat());

    let mut entries = tar.entries().context("read archive entries")?;
    while let Some(entry) = entries.next().await {
        let entry = entry.context("read archive entry")?;
        let path = entry.path().context("read member path")?;
        let path: &std::path::Path = AsRef::<std::path::Path>::as_ref(&*path);
        validate_member(path, target_dir)?;
    }
    Ok(())
}

/// Reject members that would resolve outside the extraction root: absolute
/// paths and any `..` traversal.
fn validate_member(member: &Path, target_dir: &Path) -> Result<()> {
    if member.is_absolute() {
        bail!("unsafe tar member path: {}", member.display());
    }
    let mut depth = 0i32;
    for component in member.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    bail!("unsafe tar member path: {}", member.display());
                }
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                bail!("unsafe tar member path: {}", member.display());
            }
        }
    }
    debug!(member = %member.display(), root = %target_dir.display(), "member validated");
    Ok(())
}

/// Download and extract the project tarball named by `TETRA_CODE_TARBALL`.
///
/// Environment variables: `RUNPOD_VOLUME_ENDPOINT` (S3-compatible endpoint
/// URL), `RUNPOD_VOLUME_ACCESS_KEY`, `RUNPOD_VOLUME_SECRET_KEY`, and
/// `RUNPOD_VOLUME_BUCKET` (defaults to `tetra-code`). Skipped when no key
/// is configured or the marker file records a prior extraction.
#[instrument]
pub async fn load_network_tarball() -> Result<()> {
    let Ok(key) = std::env::var("TETRA_CODE_TARBALL") else {
        info!("no TETRA_CODE_TARBALL specified, skipping tarball loading");
        return Ok(());
    };

    let project_dir = Path::new(PROJECT_DIR);
    let marker = project_dir.join(TARBALL_MARKER);
    if marker.exists() {
        info!(?project_dir, "project already extracted");
        return Ok(());
    }

    let endpoint = std::env::var("RUNPOD_VOLUME_ENDPOINT").ok();
    let access_key = std::env::var("RUNPOD_VOLUME_ACCESS_KEY").ok();
    let secret_key = std::env::var("RUNPOD_VOLUME_SECRET_KEY").ok();
    let bucket = std::env::var("RUNPOD_VOLUME_BUCKET")
        .unwrap_or_else(|_| String::from(DEFAULT_TARBALL_BUCKET));

    let (Some(endpoint), Some(access_key), Some(secret_key)) = (endpoint, access_key, secret_key)
    else {
        bail!("volume not configured: missing RUNPOD_VOLUME_* environment variables");
    };

    info!(%key, %bucket, "loading project tarball");

    let staged = tempfile::Builder::new()
        .prefix("project-")
        .suffix(".tar.gz")
        .tempfile()
        .context("create staging file")?;

    tokio::time::timeout(
        DOWNLOAD_TIMEOUT,
        download_object(&endpoint, &access_key, &secret_key, &bucket, &key, staged.path()),
    )
    .await
    .map_err(|_| {
        eyre!(
            "tarball download timed out after {} seconds",
            DOWNLOAD_TIMEOUT.as_secs()
        )
    })?
    .context("download tarball")?;

    tokio::fs::create_dir_all(project_dir)
        .await
        .with_context(|| format!("create project dir: {}", project_dir.display()))?;
    extract_archive(staged.path(), project_dir)
        .await
        .context("extract project tarball")?;

    tokio::fs::write(&marker, &key)
        .await
        .context("write extraction marker")?;

    info!(?project_dir, "project tarball loaded successfully");
    Ok(())
}

async fn download_object(
    endpoint: &str,
    access_key: &str,
    secret_key: &str,
    bucket: &str,
    key: &str,
    target: &Path,
) -> Result<()> {
    let credentials =
        aws_sdk_s3::config::Credentials::new(access_key, secret_key, None, None, "environment");
    let config = aws_sdk_s3::Config::builder()
        .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
        .region(aws_sdk_s3::config::Region::new("eu-ro-1"))
        .endpoint_url(endpoint)
        .credentials_provider(credentials)
        .force_path_style(true)
        .build();
    let client = aws_sdk_s3::Client::from_conf(config);

    let object = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .with_context(|| format!("get s3://{bucket}/{key}"))?;

    let mut body = object.body.into_async_read();
    let mut file = tokio::fs::File::create(target)
        .await
        .with_context(|| format!("create {}", target.display()))?;
    let bytes = tokio::io::copy(&mut body, &mut file)
        .await
        .context("stream tarball to disk")?;
    debug!(bytes, "downloaded tarball");

    Ok(())
}
