use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One line of subprocess output, tagged with the pipe it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Why a buffered run ended without a usable `Output`.
///
/// Spawn failures (missing or unrunnable executable) are kept distinct from
/// errors after a successful spawn so callers can classify them differently.
#[derive(Debug)]
pub enum RunError {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    Canceled,
    TimedOut(u64),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Spawn(e) => write!(f, "could not start process: {e}"),
            RunError::Wait(e) => write!(f, "process failed while running: {e}"),
            RunError::Canceled => write!(f, "canceled while process was running"),
            RunError::TimedOut(secs) => write!(f, "process timed out after {secs}s"),
        }
    }
}

impl std::error::Error for RunError {}

const WAIT_POLL_INTERVAL_MS: u64 = 200;

pub fn kill_child_process_tree(child: &mut Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = crate::cmd::command("taskkill")
            .args(["/PID", &pid, "/T", "/F"])
            .status();
    }

    let _ = child.kill();
    let _ = child.wait();
}

/// A spawned subprocess whose stdout/stderr are delivered incrementally as
/// tagged lines over a channel. Reader threads run the pipes to EOF and drop
/// them, so no read handle outlives the process on any exit path.
pub struct StreamingChild {
    child: Child,
    lines: Receiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
    reaped: bool,
}

impl StreamingChild {
    /// Waits up to `timeout` for the next output line. `Disconnected` means
    /// both pipes reached EOF.
    pub fn recv_line_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<OutputLine, RecvTimeoutError> {
        self.lines.recv_timeout(timeout)
    }

    /// Sends a kill signal and reaps the process. Safe to call more than
    /// once and regardless of whether the process already exited.
    pub fn kill(&mut self) {
        kill_child_process_tree(&mut self.child);
        self.reaped = true;
    }

    /// Blocks until the process exits, after draining both reader threads.
    pub fn wait(&mut self) -> std::io::Result<ExitStatus> {
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
        let status = self.child.wait();
        self.reaped = status.is_ok();
        status
    }
}

impl Drop for StreamingChild {
    fn drop(&mut self) {
        if !self.reaped {
            kill_child_process_tree(&mut self.child);
        }
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Spawns `cmd` and streams its output line by line. The spawn error is
/// returned as-is; `ErrorKind::NotFound` there means the executable is
/// missing rather than that it ran and failed.
pub fn spawn_streaming(cmd: &mut Command) -> std::io::Result<StreamingChild> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "stdout pipe missing")
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "stderr pipe missing")
    })?;

    let (tx, rx) = mpsc::channel();
    let tx_err = tx.clone();

    let out_handle = thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            if tx.send(OutputLine::Stdout(line)).is_err() {
                break;
            }
        }
    });
    let err_handle = thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            if tx_err.send(OutputLine::Stderr(line)).is_err() {
                break;
            }
        }
    });

    Ok(StreamingChild {
        child,
        lines: rx,
        readers: vec![out_handle, err_handle],
        reaped: false,
    })
}

/// Runs `cmd` to completion and collects its full output. Suitable for
/// bounded-output invocations such as metadata fetches; long-running
/// downloads go through [`spawn_streaming`] instead.
///
/// `should_cancel` is polled on a fixed interval; when it returns true the
/// process tree is killed and `RunError::Canceled` is returned. A
/// `timeout_secs` of 0 disables the timeout.
pub fn run_buffered(
    cmd: &mut Command,
    timeout_secs: u64,
    should_cancel: impl Fn() -> bool,
) -> std::result::Result<Output, RunError> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(RunError::Spawn)?;

    let mut stdout = child.stdout.take().ok_or_else(|| {
        RunError::Wait(std::io::Error::new(
            std::io::ErrorKind::Other,
            "stdout pipe missing",
        ))
    })?;
    let mut stderr = child.stderr.take().ok_or_else(|| {
        RunError::Wait(std::io::Error::new(
            std::io::ErrorKind::Other,
            "stderr pipe missing",
        ))
    })?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let started = Instant::now();
    let mut abort_reason: Option<RunError> = None;

    loop {
        if abort_reason.is_none() && should_cancel() {
            kill_child_process_tree(&mut child);
            abort_reason = Some(RunError::Canceled);
        }
        if abort_reason.is_none()
            && timeout_secs > 0
            && started.elapsed() >= Duration::from_secs(timeout_secs)
        {
            kill_child_process_tree(&mut child);
            abort_reason = Some(RunError::TimedOut(timeout_secs));
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = stdout_handle.join().unwrap_or_default();
                let stderr = stderr_handle.join().unwrap_or_default();
                if let Some(reason) = abort_reason {
                    return Err(reason);
                }
                return Ok(Output {
                    status,
                    stdout,
                    stderr,
                });
            }
            Ok(None) => {
                thread::sleep(Duration::from_millis(WAIT_POLL_INTERVAL_MS));
            }
            Err(err) => {
                kill_child_process_tree(&mut child);
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(RunError::Wait(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn spawn_failure_is_distinct_from_nonzero_exit() {
        let mut missing = crate::cmd::command("/nonexistent/binary-for-test");
        let err = run_buffered(&mut missing, 5, || false).err().expect("spawn error");
        assert!(matches!(err, RunError::Spawn(_)));

        let mut failing = crate::cmd::command("sh");
        failing.args(["-c", "exit 3"]);
        let output = run_buffered(&mut failing, 5, || false).expect("ran");
        assert_eq!(output.status.code(), Some(3));
    }

    #[cfg(unix)]
    #[test]
    fn streaming_child_delivers_lines_in_emission_order() {
        let mut cmd = crate::cmd::command("sh");
        cmd.args(["-c", "echo one; echo two >&2; echo three"]);
        let mut child = spawn_streaming(&mut cmd).expect("spawn");

        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        loop {
            match child.recv_line_timeout(Duration::from_secs(5)) {
                Ok(OutputLine::Stdout(l)) => stdout_lines.push(l),
                Ok(OutputLine::Stderr(l)) => stderr_lines.push(l),
                Err(_) => break,
            }
        }
        let status = child.wait().expect("wait");
        assert!(status.success());
        assert_eq!(stdout_lines, vec!["one".to_string(), "three".to_string()]);
        assert_eq!(stderr_lines, vec!["two".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn kill_stops_a_long_running_child() {
        let mut cmd = crate::cmd::command("sleep");
        cmd.arg("600");
        let mut child = spawn_streaming(&mut cmd).expect("spawn");
        child.kill();
        let status = child.wait().expect("wait after kill");
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[test]
    fn run_buffered_times_out() {
        let mut cmd = crate::cmd::command("sleep");
        cmd.arg("600");
        let err = run_buffered(&mut cmd, 1, || false).err().expect("timeout");
        assert!(matches!(err, RunError::TimedOut(1)));
    }
}
