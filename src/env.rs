use std::path::PathBuf;

pub const ENV_SOCKET_PATH: &str = "STRATUS_CSI_SOCKET";
pub const ENV_CONFIG_DIR: &str = "STRATUS_CSI_CONFIG_DIR";
pub const ENV_CACHE_DIR: &str = "STRATUS_CSI_CACHE_DIR";
pub const ENV_LOG_DIR: &str = "STRATUS_CSI_LOG_DIR";

const DEFAULT_SOCKET_PATH: &str = "/var/lib/stratus/csi-plugin/connector.sock";
const DEFAULT_LOG_ROOT: &str = "/var/log";
const HELPER_SUBDIR: &str = "stratus-rclone";

fn env_opt(name: &str) -> Option<PathBuf> {
    std::env::var_os(name).map(PathBuf::from)
}

/// Connector socket path ($STRATUS_CSI_SOCKET or the well-known default)
pub fn socket_path() -> PathBuf {
    let path = env_opt(ENV_SOCKET_PATH).unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
    tracing::trace!(path = %path.display(), "Resolved connector socket path");
    path
}

/// Directory holding per-volume mount helper credentials files
pub fn helper_config_root() -> PathBuf {
    let dir = env_opt(ENV_CONFIG_DIR).unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| std::env::temp_dir().join(".stratus-csi"))
            .join(HELPER_SUBDIR)
    });
    tracing::trace!(dir = %dir.display(), "Resolved helper config directory");
    dir
}

/// Root of the per-volume mount helper cache directories
pub fn helper_cache_root() -> PathBuf {
    let dir = env_opt(ENV_CACHE_DIR).unwrap_or_else(|| {
        dirs::cache_dir()
            .unwrap_or_else(|| std::env::temp_dir().join(".stratus-csi"))
            .join(HELPER_SUBDIR)
    });
    tracing::trace!(dir = %dir.display(), "Resolved helper cache directory");
    dir
}

/// Root of the per-volume mount helper log files
pub fn helper_log_root() -> PathBuf {
    let dir = env_opt(ENV_LOG_DIR)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_ROOT).join(HELPER_SUBDIR));
    tracing::trace!(dir = %dir.display(), "Resolved helper log directory");
    dir
}
