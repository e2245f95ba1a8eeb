//! Running a CLI's native login command.

use super::ProgressFn;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Program and arguments of a login command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LoginCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

/// How a login command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Exited {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    SpawnFailed(String),
    WaitFailed(String),
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, CommandOutcome::Exited { code: Some(0), .. })
    }
}

/// How long to keep reading output after the command exits. A background
/// process that inherited the pipes can keep them open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

type OutputBuffer = Arc<Mutex<String>>;

/// Run the command, forwarding each output line to `progress`.
///
/// `timeout` bounds the whole run, including reading output after exit. The
/// child is killed when it elapses or the returned future is dropped.
pub async fn run_login_command(
    command: &LoginCommand,
    timeout: Duration,
    progress: Option<ProgressFn>,
) -> CommandOutcome {
    let deadline = Instant::now() + timeout;
    let mut child = match Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(program = %command.program, error = %e, "Failed to spawn login command");
            return CommandOutcome::SpawnFailed(e.to_string());
        }
    };

    let stdout = OutputBuffer::default();
    let stderr = OutputBuffer::default();
    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(tokio::spawn(forward_lines(
            out,
            "stdout",
            progress.clone(),
            stdout.clone(),
        )));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(tokio::spawn(forward_lines(
            err,
            "stderr",
            progress.clone(),
            stderr.clone(),
        )));
    }

    match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => {
            let drain_deadline = deadline.min(Instant::now() + OUTPUT_DRAIN_GRACE);
            drain(&mut readers, drain_deadline, &command.program).await;
            info!(program = %command.program, code = ?status.code(), "Login command exited");
            CommandOutcome::Exited {
                code: status.code(),
                stdout: take(&stdout),
                stderr: take(&stderr),
            }
        }
        Ok(Err(e)) => {
            warn!(program = %command.program, error = %e, "Failed to wait for login command");
            abort(&readers);
            CommandOutcome::WaitFailed(e.to_string())
        }
        Err(_) => {
            warn!(
                program = %command.program,
                timeout_secs = timeout.as_secs(),
                "Login command timed out, killing process"
            );
            let _ = child.kill().await;
            abort(&readers);
            CommandOutcome::TimedOut
        }
    }
}

async fn forward_lines<R>(
    reader: R,
    stream: &'static str,
    progress: Option<ProgressFn>,
    output: OutputBuffer,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(stream, line = %line, "Login command output");
                if let Some(progress) = &progress {
                    progress(&line);
                }
                if let Ok(mut output) = output.lock() {
                    output.push_str(&line);
                    output.push('\n');
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(stream, error = %e, "Error reading login command output");
                break;
            }
        }
    }
}

/// Wait for the readers to hit EOF, abandoning them at `deadline`
async fn drain(readers: &mut [JoinHandle<()>], deadline: Instant, program: &str) {
    let finished = tokio::time::timeout_at(deadline, async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    })
    .await;

    if finished.is_err() {
        debug!(program, "Login command output still open after exit");
        abort(readers);
    }
}

fn take(output: &OutputBuffer) -> String {
    output
        .lock()
        .map(|mut output| std::mem::take(&mut *output))
        .unwrap_or_default()
}

fn abort(readers: &[JoinHandle<()>]) {
    for reader in readers {
        reader.abort();
    }
}
