//! Per-volume on-disk state: helper credentials files, cache
//! directories and log files at deterministic hashed paths.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::protocol::InitObjectStoreMount;

/// Roots under which the daemon keeps helper state. Paths below them
/// are derived deterministically so repeated mounts of the same target
/// reuse the same cache.
#[derive(Debug, Clone)]
pub struct RuntimeDirs {
    pub config_root: PathBuf,
    pub cache_root: PathBuf,
    pub log_root: PathBuf,
}

impl RuntimeDirs {
    pub fn from_env() -> Self {
        Self {
            config_root: crate::env::helper_config_root(),
            cache_root: crate::env::helper_cache_root(),
            log_root: crate::env::helper_log_root(),
        }
    }

    pub async fn ensure_exist(&self) -> io::Result<()> {
        for dir in [&self.config_root, &self.cache_root, &self.log_root] {
            ensure_directory_exists(dir).await?;
        }
        Ok(())
    }

    /// Cache directory and log file for one logical mount target.
    pub fn volume_paths(&self, volume_id: &str, mount_path: &str) -> VolumePaths {
        let id = cache_id(&[volume_id, mount_path]);
        VolumePaths {
            cache_dir: self.cache_root.join(volume_id).join(&id),
            log_file: self.log_root.join(volume_id).join(format!("{id}.log")),
        }
    }

    pub fn credentials_path(&self, volume_id: &str) -> PathBuf {
        self.config_root.join(format!("{volume_id}.conf"))
    }

    /// Best-effort purge of one volume's cache and log state, plus the
    /// per-volume parent directories if they are now empty. Cache
    /// cleanup is not safety-critical so failures are only logged.
    pub async fn purge_volume_state(&self, volume_id: &str, mount_path: &str) {
        let paths = self.volume_paths(volume_id, mount_path);
        if let Err(err) = tokio::fs::remove_dir_all(&paths.cache_dir).await {
            debug!(dir = %paths.cache_dir.display(), %err, "Cache directory not removed");
        }
        if let Err(err) = tokio::fs::remove_file(&paths.log_file).await {
            debug!(file = %paths.log_file.display(), %err, "Log file not removed");
        }
        for parent in [paths.log_file.parent(), paths.cache_dir.parent()]
            .into_iter()
            .flatten()
        {
            // Fails while other mounts of the volume still exist; fine.
            let _ = tokio::fs::remove_dir(parent).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct VolumePaths {
    pub cache_dir: PathBuf,
    pub log_file: PathBuf,
}

/// Stable hex id for a mount target: MD5 over the NUL-separated parts.
pub fn cache_id(parts: &[&str]) -> String {
    let mut hasher = md5::Context::new();
    for part in parts {
        hasher.consume(part.as_bytes());
        hasher.consume([0u8]);
    }
    hex::encode(*hasher.compute())
}

pub async fn ensure_directory_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists but is not a directory", path.display()),
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(path).await
        }
        Err(err) => Err(err),
    }
}

pub async fn ensure_file_not_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Write the per-volume rclone remote definition consumed via
/// `--config`. One section named after the volume; deleted again once
/// the helper process exits.
pub async fn write_credentials_file(
    dirs: &RuntimeDirs,
    cmd: &InitObjectStoreMount,
) -> io::Result<PathBuf> {
    let mut contents = String::new();
    let _ = writeln!(contents, "[{}]", cmd.volume_id);
    let mut entry = |key: &str, value: &str| {
        let _ = writeln!(contents, "{key} = {value}");
    };
    entry("type", "s3");
    entry("provider", "Other");
    entry("access_key_id", &cmd.access_key);
    entry("secret_access_key", &cmd.secret_key);
    entry("region", &cmd.s3_region);
    entry("endpoint", &cmd.s3_endpoint);
    entry("location_constraint", &cmd.s3_region);
    entry("acl", "public-read-write");
    entry("storage_class", &cmd.storage_class);
    entry("no_check_bucket", "true");
    entry("force_path_style", if cmd.s3_force_path_style { "true" } else { "false" });
    if let Some(size) = cmd.upload_chunk_size {
        entry("chunk_size", &format!("{size}b"));
    }
    if let Some(size) = cmd.upload_cutoff {
        entry("upload_cutoff", &format!("{size}b"));
    }
    if let Some(n) = cmd.upload_concurrency {
        entry("upload_concurrency", &n.to_string());
    }

    let path = dirs.credentials_path(&cmd.volume_id);
    ensure_directory_exists(&dirs.config_root).await?;
    tokio::fs::write(&path, contents).await?;
    Ok(path)
}
