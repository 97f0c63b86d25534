//! The connector daemon: a Unix socket listener that pairs every
//! accepted connection with its own supervisor task.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConnectorError, Result};
use crate::protocol::builders::{FILESYSTEM_HELPER, FUSERMOUNT_HELPER, OBJECT_STORE_HELPER};

use super::connection::{ConnectionHandler, FIRST_READ_TIMEOUT};
use super::paths::{ensure_file_not_exists, RuntimeDirs};
use super::supervisor::{ProcessSupervisor, SupervisorConfig};

/// Value of the rclone `--user-agent` flag; the mounted volume id is
/// appended per mount.
const USER_AGENT_PREFIX: &str = "StratusCSIDriver";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub dirs: RuntimeDirs,
    /// Helper command names, resolved against PATH at startup.
    pub object_store_cmd: String,
    pub filesystem_cmd: String,
    pub fusermount_cmd: String,
    pub first_read_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: crate::env::socket_path(),
            dirs: RuntimeDirs::from_env(),
            object_store_cmd: OBJECT_STORE_HELPER.to_string(),
            filesystem_cmd: FILESYSTEM_HELPER.to_string(),
            fusermount_cmd: FUSERMOUNT_HELPER.to_string(),
            first_read_timeout: FIRST_READ_TIMEOUT,
        }
    }
}

pub struct DaemonServer {
    config: DaemonConfig,
    supervisor_config: SupervisorConfig,
}

impl DaemonServer {
    /// Resolve every helper up front so a misconfigured node fails at
    /// startup instead of at the first mount.
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        let object_store_cmd = resolve_helper(&config.object_store_cmd)?;
        let filesystem_cmd = resolve_helper(&config.filesystem_cmd)?;
        resolve_helper(&config.fusermount_cmd)?;

        let user_agent = build_user_agent(probe_helper_version(&object_store_cmd).await);
        info!(
            object_store = %object_store_cmd.display(),
            filesystem = %filesystem_cmd.display(),
            %user_agent,
            "Resolved mount helpers"
        );

        let supervisor_config = SupervisorConfig {
            dirs: config.dirs.clone(),
            user_agent,
            object_store_cmd,
            filesystem_cmd,
        };
        Ok(Self {
            config,
            supervisor_config,
        })
    }

    /// Serve until SIGTERM or SIGINT. The cancellation token fans out
    /// to every live connection so in-flight helpers get reaped.
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        info!(socket = %self.config.socket_path.display(), "Connector daemon listening");

        let shutdown = CancellationToken::new();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => self.serve_connection(stream, shutdown.child_token()),
                    Err(err) => warn!(%err, "Accept failed"),
                },
                _ = sigterm.recv() => break,
                _ = sigint.recv() => break,
            }
        }
        info!("Shutting down");
        shutdown.cancel();
        let _ = tokio::fs::remove_file(&self.config.socket_path).await;
        Ok(())
    }

    async fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.config.socket_path.parent() {
            super::paths::ensure_directory_exists(parent).await?;
        }
        self.config.dirs.ensure_exist().await?;
        // A previous daemon instance may have left its socket behind.
        ensure_file_not_exists(&self.config.socket_path).await?;

        let listener = UnixListener::bind(&self.config.socket_path)?;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&self.config.socket_path, perms)?;
        Ok(listener)
    }

    fn serve_connection(&self, stream: UnixStream, cancel: CancellationToken) {
        debug!("Accepted connection");
        // Capacity 1 keeps the client from outrunning the supervisor;
        // outbound has headroom for stdout and stderr chunks racing
        // with the final terminate.
        let (to_supervisor_tx, to_supervisor_rx) = mpsc::channel(1);
        let (from_supervisor_tx, from_supervisor_rx) = mpsc::channel(16);

        let supervisor = ProcessSupervisor::new(
            self.supervisor_config.clone(),
            to_supervisor_rx,
            from_supervisor_tx,
            cancel.clone(),
        );
        tokio::spawn(supervisor.run());

        let handler = ConnectionHandler::new(to_supervisor_tx, cancel)
            .with_first_read_timeout(self.config.first_read_timeout);
        tokio::spawn(handler.run(stream, from_supervisor_rx));
    }
}

fn resolve_helper(name: &str) -> Result<PathBuf> {
    // Absolute paths skip the PATH lookup so tests and containers can
    // pin exact binaries.
    which::which(name).map_err(|source| ConnectorError::MissingHelper {
        name: name.to_string(),
        source,
    })
}

/// Ask the object store helper for its version. rclone prints a banner
/// like `rclone v1.66.0`; anything unparseable just leaves the agent
/// without a helper version.
async fn probe_helper_version(cmd: &PathBuf) -> Option<String> {
    let output = tokio::process::Command::new(cmd)
        .arg("version")
        .output()
        .await
        .ok()?;
    parse_helper_version(&String::from_utf8_lossy(&output.stdout))
}

fn parse_helper_version(banner: &str) -> Option<String> {
    let re = Regex::new(r"rclone\s+v(\S+)").ok()?;
    Some(re.captures(banner)?.get(1)?.as_str().to_string())
}

fn build_user_agent(helper_version: Option<String>) -> String {
    let mut agent = format!("{}/{}", USER_AGENT_PREFIX, env!("CARGO_PKG_VERSION"));
    if let Some(version) = helper_version {
        agent.push_str("/rclone/");
        agent.push_str(&version);
    }
    agent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rclone_version_banner() {
        let banner = "rclone v1.66.0\n- os/version: debian 12.5\n- go/version: go1.22.1\n";
        assert_eq!(parse_helper_version(banner).as_deref(), Some("1.66.0"));
        assert_eq!(parse_helper_version("no banner here"), None);
        assert_eq!(parse_helper_version(""), None);
    }

    #[test]
    fn user_agent_with_and_without_helper_version() {
        let with = build_user_agent(Some("1.66.0".into()));
        assert!(with.starts_with("StratusCSIDriver/"));
        assert!(with.ends_with("/rclone/1.66.0"));

        let without = build_user_agent(None);
        assert!(without.starts_with("StratusCSIDriver/"));
        assert!(!without.contains("rclone"));
    }

    #[test]
    fn missing_helper_fails_resolution() {
        assert!(matches!(
            resolve_helper("definitely-not-a-real-helper-binary"),
            Err(ConnectorError::MissingHelper { .. })
        ));
    }
}
