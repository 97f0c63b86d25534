//! Client for the connector socket, used by the node plugin process.
//!
//! One connection per operation: send the init command, relay helper
//! output into our own logs, answer the filesystem helper's credential
//! prompts, and treat the final `Terminate` code as the verdict.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::{unix::OwnedReadHalf, UnixStream};
use tracing::{debug, info, warn};

use crate::error::{ConnectorError, Result};
use crate::protocol::{
    self, Command, InitFilesystemMount, InitObjectStoreMount, RequestData, Umount,
};

/// Stdout prompts the filesystem helper answers from stdin.
const MASTER_ADDRESS_PROMPT: &str =
    "please enter the master address(separate multiple addresses with commas):";
const ACCESS_TOKEN_PROMPT: &str = "please enter the AccessToken:";

/// Interactive credentials for a filesystem mount.
#[derive(Debug, Clone)]
pub struct FilesystemCredentials {
    pub master_addresses: String,
    pub access_token: String,
}

pub struct ConnectorClient {
    socket_path: PathBuf,
}

impl ConnectorClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(crate::env::socket_path())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Run an object store mount to completion. rclone daemonizes, so
    /// the conversation ends quickly with the forked-off parent's exit
    /// code.
    pub async fn mount_object_store(&self, cmd: InitObjectStoreMount) -> Result<()> {
        let mut conn = self.connect().await?;
        conn.send(Command::InitObjectStoreMount(Box::new(cmd))).await?;
        conn.wait_for_terminate().await
    }

    /// Run a filesystem mount, answering the helper's two credential
    /// prompts as they appear on stdout.
    pub async fn mount_filesystem(
        &self,
        cmd: InitFilesystemMount,
        credentials: &FilesystemCredentials,
    ) -> Result<()> {
        let mut conn = self.connect().await?;
        conn.send(Command::InitFilesystemMount(cmd)).await?;

        loop {
            match conn.recv().await? {
                Command::ResponseData(chunk) => {
                    log_helper_output(&chunk.data, chunk.is_error);
                    if chunk.is_error {
                        continue;
                    }
                    if chunk.data.contains(MASTER_ADDRESS_PROMPT) {
                        conn.send_stdin(&credentials.master_addresses).await?;
                    } else if chunk.data.contains(ACCESS_TOKEN_PROMPT) {
                        conn.send_stdin(&credentials.access_token).await?;
                    }
                }
                Command::Terminate(t) => return terminate_verdict(t.code),
                other => {
                    return Err(ConnectorError::Violation(format!(
                        "daemon sent client-only command {}",
                        other.name()
                    )))
                }
            }
        }
    }

    /// Ask the daemon to drop the cache and log state it holds for an
    /// unmounted volume. Fire and forget; there is no reply.
    pub async fn clean_after_umount(&self, volume_id: &str, mount_path: &str) -> Result<()> {
        let mut conn = self.connect().await?;
        conn.send(Command::Umount(Umount {
            volume_id: volume_id.to_string(),
            mount_path: mount_path.to_string(),
        }))
        .await?;
        conn.shutdown().await
    }

    async fn connect(&self) -> Result<Connection> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ConnectorError::Dial {
                path: self.socket_path.clone(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();
        Ok(Connection {
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
        })
    }
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl Connection {
    async fn send(&mut self, command: Command) -> Result<()> {
        let line = protocol::encode(&command)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    /// Feed one line to the helper's stdin via `RequestData`.
    async fn send_stdin(&mut self, value: &str) -> Result<()> {
        self.send(Command::RequestData(RequestData {
            data: format!("{value}\n"),
        }))
        .await
    }

    async fn recv(&mut self) -> Result<Command> {
        match self.lines.next_line().await? {
            Some(line) => Ok(protocol::decode(&line)?),
            None => Err(ConnectorError::ConnectionClosed),
        }
    }

    async fn wait_for_terminate(&mut self) -> Result<()> {
        loop {
            match self.recv().await? {
                Command::ResponseData(chunk) => log_helper_output(&chunk.data, chunk.is_error),
                Command::Terminate(t) => return terminate_verdict(t.code),
                other => {
                    return Err(ConnectorError::Violation(format!(
                        "daemon sent client-only command {}",
                        other.name()
                    )))
                }
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn terminate_verdict(code: i32) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(ConnectorError::MountFailed { code })
    }
}

fn log_helper_output(data: &str, is_error: bool) {
    for line in data.lines().filter(|l| !l.trim().is_empty()) {
        if is_error {
            warn!(target: "helper", "{line}");
        } else {
            info!(target: "helper", "{line}");
        }
    }
    if data.trim().is_empty() {
        debug!(target: "helper", "blank output chunk");
    }
}
