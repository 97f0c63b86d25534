//! Per-connection helper process lifecycle.
//!
//! Each accepted connection gets one supervisor task. It receives the
//! decoded inbound commands, spawns at most one helper process, pumps
//! the helper's stdout and stderr back as `ResponseData`, and finishes
//! the conversation with a single `Terminate` carrying the exit code.
//! `Terminate` is always the last outbound message: both pumps are
//! awaited and a closed flag is set before it is queued.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command as HelperCommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConnectorError, Result};
use crate::protocol::{
    filesystem_mount_args, object_store_mount_args, Command, InitFilesystemMount,
    InitObjectStoreMount, MountContext, ResponseData, Terminate, Umount,
};

use super::paths::{ensure_directory_exists, write_credentials_file, RuntimeDirs};

/// Output pumps read the helper in chunks of this size; each chunk
/// becomes one `ResponseData`.
const PUMP_CHUNK_SIZE: usize = 4096;

/// Resolved helper executables plus the directories and user agent the
/// spawned mounts use. Built once at server startup.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub dirs: RuntimeDirs,
    pub user_agent: String,
    pub object_store_cmd: PathBuf,
    pub filesystem_cmd: PathBuf,
}

struct RunningHelper {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout_pump: JoinHandle<()>,
    stderr_pump: JoinHandle<()>,
    closed: Arc<AtomicBool>,
    credentials: Option<PathBuf>,
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    inbound: mpsc::Receiver<Command>,
    outbound: mpsc::Sender<Command>,
    cancel: CancellationToken,
    running: Option<RunningHelper>,
}

enum Flow {
    Continue,
    /// Terminate has been queued, nothing more to do.
    Finished,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        inbound: mpsc::Receiver<Command>,
        outbound: mpsc::Sender<Command>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            inbound,
            outbound,
            cancel,
            running: None,
        }
    }

    pub async fn run(mut self) {
        loop {
            let event = match self.running.as_mut() {
                Some(helper) => tokio::select! {
                    maybe = self.inbound.recv() => Event::Inbound(maybe),
                    status = helper.child.wait() => Event::Exited(status),
                    _ = self.cancel.cancelled() => Event::Cancelled,
                },
                None => tokio::select! {
                    maybe = self.inbound.recv() => Event::Inbound(maybe),
                    _ = self.cancel.cancelled() => Event::Cancelled,
                },
            };
            match event {
                Event::Inbound(Some(command)) => match self.handle(command).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Finished) => return,
                    Err(err) => {
                        warn!(%err, "Tearing down connection");
                        break;
                    }
                },
                Event::Inbound(None) | Event::Cancelled => break,
                Event::Exited(status) => {
                    self.finish(status).await;
                    return;
                }
            }
        }
        self.abort().await;
    }

    async fn handle(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::InitObjectStoreMount(cmd) => self.init_object_store(*cmd).await,
            Command::InitFilesystemMount(cmd) => self.init_filesystem(cmd).await,
            Command::RequestData(req) => {
                let helper = self.running.as_mut().ok_or_else(|| {
                    ConnectorError::Violation("request_data before a mount was initialized".into())
                })?;
                if let Some(stdin) = helper.stdin.as_mut() {
                    // A dead stdin means the helper can no longer take
                    // the data the client is waiting to deliver; keeping
                    // the connection up would just hang the client.
                    stdin.write_all(req.data.as_bytes()).await?;
                }
                Ok(Flow::Continue)
            }
            Command::Umount(cmd) => {
                self.umount(&cmd).await;
                Ok(Flow::Continue)
            }
            Command::ResponseData(_) | Command::Terminate(_) => Err(ConnectorError::Violation(
                format!("client sent daemon-only command {}", command.name()),
            )),
        }
    }

    async fn init_object_store(&mut self, cmd: InitObjectStoreMount) -> Result<Flow> {
        if self.running.is_some() {
            return Err(ConnectorError::Violation(
                "connection already supervises a mount".into(),
            ));
        }

        let dirs = &self.config.dirs;
        let paths = dirs.volume_paths(&cmd.volume_id, &cmd.mount_path);
        ensure_directory_exists(&paths.cache_dir).await?;
        if let Some(parent) = paths.log_file.parent() {
            ensure_directory_exists(parent).await?;
        }
        let credentials = write_credentials_file(dirs, &cmd).await?;

        let ctx = MountContext {
            config_path: credentials.clone(),
            user_agent: self.config.user_agent.clone(),
            log_file: paths.log_file,
            cache_dir: paths.cache_dir,
        };
        let args = object_store_mount_args(&cmd, &ctx);
        info!(
            volume_id = %cmd.volume_id,
            mount_path = %cmd.mount_path,
            "Starting object store mount"
        );
        let program = self.config.object_store_cmd.clone();
        self.spawn(program, &args, Some(credentials)).await
    }

    async fn init_filesystem(&mut self, cmd: InitFilesystemMount) -> Result<Flow> {
        if self.running.is_some() {
            return Err(ConnectorError::Violation(
                "connection already supervises a mount".into(),
            ));
        }
        let args = filesystem_mount_args(&cmd);
        info!(
            volume_id = %cmd.volume_id,
            mount_path = %cmd.mount_path,
            "Starting filesystem mount"
        );
        let program = self.config.filesystem_cmd.clone();
        self.spawn(program, &args, None).await
    }

    async fn spawn(
        &mut self,
        program: PathBuf,
        args: &[String],
        credentials: Option<PathBuf>,
    ) -> Result<Flow> {
        let spawned = HelperCommand::new(&program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                warn!(program = %program.display(), %err, "Failed to spawn mount helper");
                if let Some(path) = credentials {
                    let _ = tokio::fs::remove_file(path).await;
                }
                self.send_terminate(1).await;
                self.cancel.cancel();
                return Ok(Flow::Finished);
            }
        };

        let closed = Arc::new(AtomicBool::new(false));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();
        let stdout_pump = pump_output(stdout, self.outbound.clone(), closed.clone(), false);
        let stderr_pump = pump_output(stderr, self.outbound.clone(), closed.clone(), true);

        self.running = Some(RunningHelper {
            child,
            stdin,
            stdout_pump,
            stderr_pump,
            closed,
            credentials,
        });
        Ok(Flow::Continue)
    }

    async fn umount(&mut self, cmd: &Umount) {
        info!(
            volume_id = %cmd.volume_id,
            mount_path = %cmd.mount_path,
            "Purging mount state"
        );
        self.config
            .dirs
            .purge_volume_state(&cmd.volume_id, &cmd.mount_path)
            .await;
    }

    /// The helper exited on its own: drain the pumps, then emit the
    /// final `Terminate` and release the connection.
    async fn finish(&mut self, status: std::io::Result<ExitStatus>) {
        let Some(mut helper) = self.running.take() else {
            return;
        };
        // Pumps end on their own once the pipes hit EOF at process
        // exit; awaiting them keeps every ResponseData ahead of the
        // Terminate below.
        let _ = (&mut helper.stdout_pump).await;
        let _ = (&mut helper.stderr_pump).await;
        helper.closed.store(true, Ordering::Release);

        self.remove_credentials(&mut helper).await;

        let code = match status {
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => {
                warn!(%err, "Could not collect helper exit status");
                -1
            }
        };
        info!(code, "Mount helper exited");
        self.send_terminate(code).await;
        self.cancel.cancel();
    }

    /// The connection went away first: stop the helper and clean up
    /// without emitting anything.
    async fn abort(&mut self) {
        if let Some(mut helper) = self.running.take() {
            helper.closed.store(true, Ordering::Release);
            helper.stdout_pump.abort();
            helper.stderr_pump.abort();
            if let Err(err) = helper.child.start_kill() {
                debug!(%err, "Helper already gone");
            }
            let _ = helper.child.wait().await;
            self.remove_credentials(&mut helper).await;
        }
        self.cancel.cancel();
    }

    async fn remove_credentials(&self, helper: &mut RunningHelper) {
        if let Some(path) = helper.credentials.take() {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), %err, "Could not remove credentials file");
            }
        }
    }

    async fn send_terminate(&self, code: i32) {
        if self
            .outbound
            .send(Command::Terminate(Terminate { code }))
            .await
            .is_err()
        {
            debug!("Connection writer gone before terminate");
        }
    }
}

enum Event {
    Inbound(Option<Command>),
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
}

/// Forward one output stream of the helper as `ResponseData` chunks.
/// Stops at EOF, on a closed connection, or once the terminate flag is
/// set.
fn pump_output<R>(
    reader: Option<R>,
    outbound: mpsc::Sender<Command>,
    closed: Arc<AtomicBool>,
    is_error: bool,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut buf = [0u8; PUMP_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if closed.load(Ordering::Acquire) {
                        break;
                    }
                    let chunk = Command::ResponseData(ResponseData {
                        data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                        is_error,
                    });
                    if outbound.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(%err, is_error, "Helper output pump stopped");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn test_config(root: &std::path::Path, helper: PathBuf) -> SupervisorConfig {
        SupervisorConfig {
            dirs: RuntimeDirs {
                config_root: root.join("config"),
                cache_root: root.join("cache"),
                log_root: root.join("log"),
            },
            user_agent: "StratusCSIDriver/test".into(),
            object_store_cmd: helper.clone(),
            filesystem_cmd: helper,
        }
    }

    /// Drop the mount argv and run `body` instead, so tests control the
    /// helper's behavior regardless of the flags it was spawned with.
    fn stub_helper(root: &std::path::Path, body: &str) -> PathBuf {
        let path = root.join("helper.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn init_cmd() -> Command {
        Command::InitObjectStoreMount(Box::new(InitObjectStoreMount {
            volume_id: "v1".into(),
            mount_path: "/mnt/v1".into(),
            bucket_id: "b1".into(),
            access_key: "ak".into(),
            secret_key: "sk".into(),
            s3_region: "r1".into(),
            s3_endpoint: "http://s3.example.com".into(),
            storage_class: "STANDARD".into(),
            ..Default::default()
        }))
    }

    async fn drain(outbound_rx: &mut mpsc::Receiver<Command>) -> Vec<Command> {
        let mut messages = Vec::new();
        while let Some(cmd) = outbound_rx.recv().await {
            messages.push(cmd);
        }
        messages
    }

    #[tokio::test]
    async fn terminate_is_last_and_carries_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let helper = stub_helper(tmp.path(), "echo ready; echo oops >&2; exit 3");
        let config = test_config(tmp.path(), helper);
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let supervisor = ProcessSupervisor::new(config.clone(), in_rx, out_tx, cancel.clone());
        let task = tokio::spawn(supervisor.run());

        in_tx.send(init_cmd()).await.unwrap();
        let messages = drain(&mut out_rx).await;
        task.await.unwrap();

        match messages.last().expect("no outbound messages") {
            Command::Terminate(t) => assert_eq!(t.code, 3),
            other => panic!("last message was {:?}", other.name()),
        }
        assert_eq!(
            messages
                .iter()
                .filter(|m| matches!(m, Command::Terminate(_)))
                .count(),
            1
        );
        let stdout: String = messages
            .iter()
            .filter_map(|m| match m {
                Command::ResponseData(r) if !r.is_error => Some(r.data.as_str()),
                _ => None,
            })
            .collect();
        let stderr: String = messages
            .iter()
            .filter_map(|m| match m {
                Command::ResponseData(r) if r.is_error => Some(r.data.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, "ready\n");
        assert_eq!(stderr, "oops\n");
        assert!(cancel.is_cancelled());
        // Credentials must be gone once the helper exited.
        assert!(!config.dirs.credentials_path("v1").exists());
    }

    #[tokio::test]
    async fn spawn_failure_reports_terminate() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), PathBuf::from("/nonexistent/helper-binary"));
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let supervisor = ProcessSupervisor::new(config.clone(), in_rx, out_tx, cancel.clone());
        let task = tokio::spawn(supervisor.run());

        in_tx.send(init_cmd()).await.unwrap();
        let messages = drain(&mut out_rx).await;
        task.await.unwrap();

        assert!(matches!(
            messages.as_slice(),
            [Command::Terminate(Terminate { code: 1 })]
        ));
        assert!(!config.dirs.credentials_path("v1").exists());
    }

    #[tokio::test]
    async fn duplicate_init_is_a_violation() {
        let tmp = tempfile::tempdir().unwrap();
        // Blocks until killed, keeping the helper alive for the second
        // init to trip over.
        let helper = stub_helper(tmp.path(), "sleep 30");
        let config = test_config(tmp.path(), helper);
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let supervisor = ProcessSupervisor::new(config, in_rx, out_tx, cancel.clone());
        let task = tokio::spawn(supervisor.run());

        in_tx.send(init_cmd()).await.unwrap();
        in_tx.send(init_cmd()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert!(cancel.is_cancelled());
        // Teardown, not terminate: the violation path sends nothing.
        let messages = drain(&mut out_rx).await;
        assert!(!messages.iter().any(|m| matches!(m, Command::Terminate(_))));
    }

    #[tokio::test]
    async fn request_data_before_init_is_a_violation() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), PathBuf::from("/bin/cat"));
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, _out_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let supervisor = ProcessSupervisor::new(config, in_rx, out_tx, cancel.clone());
        let task = tokio::spawn(supervisor.run());

        in_tx
            .send(Command::RequestData(crate::protocol::RequestData {
                data: "hello\n".into(),
            }))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn request_data_reaches_helper_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        // Runs whatever arrives on stdin, mirroring how stratofs takes
        // its credentials interactively.
        let helper = stub_helper(tmp.path(), "exec /bin/sh -s");
        let config = test_config(tmp.path(), helper);
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let supervisor = ProcessSupervisor::new(config, in_rx, out_tx, cancel.clone());
        let task = tokio::spawn(supervisor.run());

        in_tx
            .send(Command::InitFilesystemMount(InitFilesystemMount::default()))
            .await
            .unwrap();
        in_tx
            .send(Command::RequestData(crate::protocol::RequestData {
                data: "echo pumped; echo failed >&2; exit 7\n".into(),
            }))
            .await
            .unwrap();

        let messages = drain(&mut out_rx).await;
        drop(in_tx);
        task.await.unwrap();

        let stdout: String = messages
            .iter()
            .filter_map(|m| match m {
                Command::ResponseData(r) if !r.is_error => Some(r.data.as_str()),
                _ => None,
            })
            .collect();
        let stderr: String = messages
            .iter()
            .filter_map(|m| match m {
                Command::ResponseData(r) if r.is_error => Some(r.data.as_str()),
                _ => None,
            })
            .collect();
        if let Some(Command::Terminate(t)) = messages.last() {
            assert_eq!(t.code, 7);
            assert_eq!(stdout, "pumped\n");
            assert_eq!(stderr, "failed\n");
        } else {
            panic!("expected terminate last, got {messages:?}");
        }
    }

    #[tokio::test]
    async fn failed_stdin_write_tears_the_connection_down() {
        let tmp = tempfile::tempdir().unwrap();
        // Closes its own stdin right away, so the write below hits a
        // broken pipe instead of hanging a prompt-answering client.
        let helper = stub_helper(tmp.path(), "exec 0<&-\nsleep 5");
        let config = test_config(tmp.path(), helper);
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let supervisor = ProcessSupervisor::new(config, in_rx, out_tx, cancel.clone());
        let task = tokio::spawn(supervisor.run());

        in_tx
            .send(Command::InitFilesystemMount(InitFilesystemMount::default()))
            .await
            .unwrap();
        // Larger than the pipe buffer, so the write cannot succeed
        // before the helper has closed its end.
        in_tx
            .send(Command::RequestData(crate::protocol::RequestData {
                data: "x".repeat(256 * 1024),
            }))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("supervisor kept the connection alive")
            .unwrap();
        assert!(cancel.is_cancelled());
        // Teardown, not terminate.
        let messages = drain(&mut out_rx).await;
        assert!(!messages.iter().any(|m| matches!(m, Command::Terminate(_))));
    }

    #[tokio::test]
    async fn dropped_connection_kills_helper() {
        let tmp = tempfile::tempdir().unwrap();
        let helper = stub_helper(tmp.path(), "sleep 30");
        let config = test_config(tmp.path(), helper);
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, out_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let supervisor = ProcessSupervisor::new(config, in_rx, out_tx, cancel.clone());
        let task = tokio::spawn(supervisor.run());

        in_tx.send(init_cmd()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(in_tx);
        drop(out_rx);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("helper not reaped after connection loss")
            .unwrap();
        assert!(cancel.is_cancelled());
    }
}
