//! Subprocess spawning in a dedicated process group.
//!
//! Commands run through `sh -c` with their own process group so a stop
//! can signal the whole tree. Output lines are forwarded to the log.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to run and where.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec<'a> {
  /// Name used in log lines, e.g. the service name.
  pub label: &'a str,
  pub command: &'a str,
  pub dir: &'a Path,
  pub env: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Exit {
  pub status: ExitStatus,
  /// The group was interrupted because a stop was requested.
  pub interrupted: bool,
}

impl Exit {
  pub fn success(&self) -> bool {
    self.status.success()
  }
}

/// Human readable exit description: `exit code 3` or `signal 2`.
pub fn describe(status: &ExitStatus) -> String {
  match (status.code(), status.signal()) {
    (Some(code), _) => format!("exit code {}", code),
    (None, Some(signal)) => format!("signal {}", signal),
    (None, None) => "unknown exit".to_string(),
  }
}

/// Handle to a spawned process group leader.
pub struct GroupChild {
  child: Child,
  pid: Option<u32>,
  label: String,
}

pub fn spawn_group(spec: &CommandSpec<'_>) -> io::Result<GroupChild> {
  let mut cmd = tokio::process::Command::new("sh");
  cmd
    .arg("-c")
    .arg(spec.command)
    .current_dir(spec.dir)
    .envs(spec.env)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .process_group(0);

  let mut child = cmd.spawn()?;
  let pid = child.id();
  debug!(
    event = "process_spawned",
    label = spec.label,
    command = spec.command,
    pid,
    cwd = %spec.dir.display(),
    env_len = spec.env.len()
  );

  if let Some(out) = child.stdout.take() {
    tokio::spawn(forward_lines(spec.label.to_string(), out, false));
  }
  if let Some(err) = child.stderr.take() {
    tokio::spawn(forward_lines(spec.label.to_string(), err, true));
  }

  Ok(GroupChild {
    child,
    pid,
    label: spec.label.to_string(),
  })
}

async fn forward_lines<R: AsyncRead + Unpin>(label: String, reader: R, stderr: bool) {
  let mut lines = BufReader::new(reader).lines();
  while let Ok(Some(line)) = lines.next_line().await {
    if stderr {
      warn!(event = "process_output", label = %label, stream = "stderr", line = %line);
    } else {
      info!(event = "process_output", label = %label, stream = "stdout", line = %line);
    }
  }
}

impl GroupChild {
  pub fn pid(&self) -> Option<u32> {
    self.pid
  }

  /// Send SIGINT to the whole process group. A group that is already gone
  /// is not an error.
  pub fn interrupt(&self) -> io::Result<()> {
    let Some(pid) = self.pid else {
      return Ok(());
    };
    debug!(event = "process_interrupt", label = %self.label, pid);
    match killpg(Pid::from_raw(pid as i32), Signal::SIGINT) {
      Ok(()) | Err(Errno::ESRCH) => Ok(()),
      Err(e) => Err(io::Error::from(e)),
    }
  }

  pub async fn wait(&mut self) -> io::Result<ExitStatus> {
    self.child.wait().await
  }

  /// Wait for exit; if `cancel` fires first, interrupt the group and wait
  /// for it to wind down.
  pub async fn wait_or_interrupt(&mut self, cancel: &CancellationToken) -> io::Result<Exit> {
    tokio::select! {
      status = self.child.wait() => {
        return Ok(Exit { status: status?, interrupted: false });
      }
      _ = cancel.cancelled() => {}
    }
    self.interrupt()?;
    let status = self.child.wait().await?;
    Ok(Exit {
      status,
      interrupted: true,
    })
  }
}
