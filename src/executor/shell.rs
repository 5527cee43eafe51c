use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::SplitStream;
use tracing::{debug, info, warn};

use super::{CommandLine, Execution, Executor};
use crate::error::FlashError;
use crate::utils::elevation;

/// Exit code reported when the process was killed or could not be waited on
const ABNORMAL_EXIT: i32 = -1;

/// Consecutive read errors tolerated before a pipe is abandoned
const MAX_READ_ERRORS: u32 = 8;

/// Runs commands through `su` unless the process is already root
#[derive(Debug, Clone)]
pub struct PrivilegedExecutor {
    su_path: PathBuf,
    direct: bool,
}

impl PrivilegedExecutor {
    pub fn new(su_path: impl Into<PathBuf>) -> Self {
        let direct = elevation::is_elevated();
        info!("{}", elevation::get_elevation_status());
        Self {
            su_path: su_path.into(),
            direct,
        }
    }

    /// Skip the `su` wrapper regardless of the current uid
    pub fn direct() -> Self {
        Self {
            su_path: PathBuf::from("su"),
            direct: true,
        }
    }

    fn build(&self, command: &CommandLine) -> Command {
        let mut cmd = if self.direct {
            let mut cmd = Command::new(&command.program);
            cmd.args(&command.args);
            cmd
        } else {
            let mut cmd = Command::new(&self.su_path);
            cmd.arg("-c").arg(command.to_shell_string());
            cmd
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

/// Decode one raw output line, dropping a trailing `\r`.
///
/// Helper scripts may print bytes that are not UTF-8; those become U+FFFD
/// instead of ending the stream.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Forward every line of `reader` to `tx` until EOF.
///
/// The pipe is drained to the end even when nobody listens any more, so the
/// child never dies of SIGPIPE because of us.
fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut segments = SplitStream::new(BufReader::new(reader).split(b'\n'));
        let mut listening = true;
        let mut errors = 0;
        while let Some(segment) = segments.next().await {
            match segment {
                Ok(raw) => {
                    errors = 0;
                    if listening && tx.send(decode_line(&raw)).is_err() {
                        debug!("Output receiver gone, draining the rest");
                        listening = false;
                    }
                }
                Err(e) => {
                    errors += 1;
                    warn!("Error reading command output: {}", e);
                    if errors >= MAX_READ_ERRORS {
                        warn!("Giving up on command output after {} errors", errors);
                        break;
                    }
                }
            }
        }
    })
}

impl Executor for PrivilegedExecutor {
    fn execute(&self, command: &CommandLine) -> Result<Execution, FlashError> {
        debug!("Executing: {} (direct={})", command, self.direct);

        let mut child = self.build(command).spawn().map_err(|e| FlashError::Spawn {
            command: command.to_string(),
            source: e,
        })?;

        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| FlashError::ExecutorIo("stdout was not captured".into()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| FlashError::ExecutorIo("stderr was not captured".into()))?;

        let (out_tx, stdout) = mpsc::unbounded_channel();
        let (err_tx, stderr) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();

        let out_task = forward_lines(stdout_pipe, out_tx);
        let err_task = forward_lines(stderr_pipe, err_tx);

        let label = command.to_string();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(ABNORMAL_EXIT),
                Err(e) => {
                    warn!("Failed to wait for {}: {}", label, e);
                    ABNORMAL_EXIT
                }
            };
            // Exit is only reported once every output line has been forwarded
            let _ = out_task.await;
            let _ = err_task.await;
            debug!("{} exited with {}", label, code);
            let _ = exit_tx.send(code);
        });

        Ok(Execution {
            stdout,
            stderr,
            exit,
        })
    }
}
