//! Framing layer for one accepted connection.
//!
//! The stream is split into a reader loop on the accepting task and a
//! spawned writer task. Inbound lines are decoded and forwarded to the
//! supervisor; outbound commands from the supervisor are encoded one
//! per line. The writer drains its queue before honoring cancellation
//! so the supervisor's final `Terminate` is never lost.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{self, Command};

/// Applied to the first inbound read only. A client that connects and
/// then says nothing is holding a socket slot for no reason; once a
/// mount is running the connection legitimately stays quiet for hours.
pub const FIRST_READ_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ConnectionHandler {
    to_supervisor: mpsc::Sender<Command>,
    cancel: CancellationToken,
    first_read_timeout: Duration,
}

impl ConnectionHandler {
    pub fn new(to_supervisor: mpsc::Sender<Command>, cancel: CancellationToken) -> Self {
        Self {
            to_supervisor,
            cancel,
            first_read_timeout: FIRST_READ_TIMEOUT,
        }
    }

    pub fn with_first_read_timeout(mut self, timeout: Duration) -> Self {
        self.first_read_timeout = timeout;
        self
    }

    /// Drive the connection until the peer hangs up, the supervisor
    /// cancels, or the protocol is violated.
    pub async fn run(self, stream: UnixStream, from_supervisor: mpsc::Receiver<Command>) {
        let (read_half, write_half) = stream.into_split();
        let writer = spawn_writer(write_half, from_supervisor, self.cancel.clone());

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let mut first_read = true;
        loop {
            line.clear();
            let read = reader.read_line(&mut line);
            let result = tokio::select! {
                result = async {
                    if first_read {
                        match tokio::time::timeout(self.first_read_timeout, read).await {
                            Ok(result) => result,
                            Err(_) => {
                                debug!("No command within the initial deadline");
                                Ok(0)
                            }
                        }
                    } else {
                        read.await
                    }
                } => result,
                _ = self.cancel.cancelled() => break,
            };
            first_read = false;

            match result {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches('\n');
                    let command = match protocol::decode(trimmed) {
                        Ok(command) => command,
                        Err(err) => {
                            warn!(%err, "Dropping connection");
                            break;
                        }
                    };
                    match command {
                        Command::ResponseData(_) | Command::Terminate(_) => {
                            warn!(cmd = command.name(), "Client sent daemon-only command");
                            break;
                        }
                        command => {
                            if self.to_supervisor.send(command).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    debug!(%err, "Connection read failed");
                    break;
                }
            }
        }

        // Reader is done: let the supervisor observe the closed inbound
        // channel, flush whatever it still emits, then stop the writer.
        drop(self.to_supervisor);
        self.cancel.cancelled().await;
        let _ = writer.await;
    }
}

fn spawn_writer(
    write_half: tokio::net::unix::OwnedWriteHalf,
    mut from_supervisor: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        loop {
            // Queued messages win over cancellation so the final
            // terminate still goes out after the supervisor cancels.
            let command = tokio::select! {
                biased;
                maybe = from_supervisor.recv() => match maybe {
                    Some(command) => command,
                    None => break,
                },
                _ = cancel.cancelled() => match from_supervisor.try_recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };
            let line = match protocol::encode(&command) {
                Ok(line) => line,
                Err(err) => {
                    warn!(%err, cmd = command.name(), "Could not encode outbound command");
                    continue;
                }
            };
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(b"\n").await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}
