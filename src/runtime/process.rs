//! Runtime process lifecycle
//!
//! Spawns an interpreter in its own process group with piped stdio, pumps
//! stdout/stderr into one ordered channel, and delivers signals to the whole
//! group so children started by a block are interrupted or killed with it.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::driver::LaunchSpec;

/// Stderr lines kept for a startup failure message
const STARTUP_STDERR_LINES: usize = 5;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipe {
    Stdout,
    Stderr,
}

/// One event read from the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessLine {
    /// A line without its trailing newline
    Line(Pipe, String),
    /// The pipe reached EOF
    Closed(Pipe),
}

/// A spawned interpreter process
pub struct RuntimeProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: mpsc::Receiver<ProcessLine>,
    pid: Option<u32>,
}

impl RuntimeProcess {
    /// Spawn the process described by `spec` and write its preamble
    pub async fn spawn(spec: &LaunchSpec) -> std::io::Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = stdout {
            tokio::spawn(pump_lines(stdout, Pipe::Stdout, tx.clone()));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(pump_lines(stderr, Pipe::Stderr, tx));
        }

        debug!(program = %spec.program, pid = ?pid, "Runtime process spawned");

        let mut process = Self {
            child,
            stdin,
            lines: rx,
            pid,
        };

        if let Some(preamble) = &spec.preamble {
            process.write(preamble).await?;
        }

        Ok(process)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write text to the process's stdin and flush it
    pub async fn write(&mut self, text: &str) -> std::io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin already closed")
        })?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.flush().await
    }

    /// Next line from either pipe; `None` once both pipes are drained
    pub async fn next_line(&mut self) -> Option<ProcessLine> {
        self.lines.recv().await
    }

    /// Wait until the driver prints `marker` on stdout
    ///
    /// Fails when the process exits first or `timeout` passes. The error
    /// quotes the last stderr lines, which usually say why.
    pub async fn wait_ready(&mut self, marker: &str, timeout: Duration) -> std::io::Result<()> {
        let mut stderr_tail: Vec<String> = Vec::new();
        let lines = &mut self.lines;
        let tail = &mut stderr_tail;
        let ready = tokio::time::timeout(timeout, async move {
            while let Some(line) = lines.recv().await {
                match line {
                    ProcessLine::Line(Pipe::Stdout, line) if line.trim() == marker => return true,
                    ProcessLine::Line(Pipe::Stdout, line) => {
                        debug!(line = %line, "Runtime output before ready marker");
                    }
                    ProcessLine::Line(Pipe::Stderr, line) => {
                        if tail.len() == STARTUP_STDERR_LINES {
                            tail.remove(0);
                        }
                        tail.push(line);
                    }
                    ProcessLine::Closed(_) => {}
                }
            }
            false
        })
        .await;

        let detail = if stderr_tail.is_empty() {
            String::new()
        } else {
            format!(": {}", stderr_tail.join("\n"))
        };
        match ready {
            Ok(true) => Ok(()),
            Ok(false) => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("runtime exited during startup{detail}"),
            )),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("runtime not ready after {} ms{detail}", timeout.as_millis()),
            )),
        }
    }

    /// Whether the process has already exited
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Send SIGINT to the process group
    pub fn interrupt(&self) -> std::io::Result<()> {
        self.signal_group(GroupSignal::Interrupt)
    }

    /// Kill the process group and reap the child
    ///
    /// Safe to call more than once.
    pub async fn kill(&mut self) {
        // Closing stdin lets well-behaved drivers exit on their own
        self.stdin.take();

        if let Err(e) = self.signal_group(GroupSignal::Kill) {
            debug!(pid = ?self.pid, error = %e, "Process group already gone");
        }
        if let Err(e) = self.child.start_kill() {
            debug!(pid = ?self.pid, error = %e, "Process already exited");
        }
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => debug!(pid = ?self.pid, %status, "Runtime process reaped"),
            Ok(Err(e)) => warn!(pid = ?self.pid, error = %e, "Failed to reap runtime process"),
            Err(_) => warn!(pid = ?self.pid, "Runtime process did not exit after kill"),
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: GroupSignal) -> std::io::Result<()> {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pid = self
            .pid
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "process has no pid"))?;
        let signal = match signal {
            GroupSignal::Interrupt => Signal::SIGINT,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        killpg(Pid::from_raw(pid as i32), signal).map_err(std::io::Error::from)
    }

    #[cfg(not(unix))]
    fn signal_group(&self, signal: GroupSignal) -> std::io::Result<()> {
        match signal {
            // No cooperative interrupt without process groups; the caller
            // falls through to a forced kill after the grace period
            GroupSignal::Interrupt => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "interrupt is not supported on this platform",
            )),
            GroupSignal::Kill => Ok(()),
        }
    }
}

impl std::fmt::Debug for RuntimeProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeProcess")
            .field("pid", &self.pid)
            .field("stdin_open", &self.stdin.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Interrupt,
    Kill,
}

/// Forward lines from one pipe until EOF
async fn pump_lines<R>(reader: R, pipe: Pipe, tx: mpsc::Sender<ProcessLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(ProcessLine::Line(pipe, line)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(?pipe, error = %e, "Pipe read failed");
                break;
            }
        }
    }
    let _ = tx.send(ProcessLine::Closed(pipe)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            preamble: None,
        }
    }

    #[tokio::test]
    async fn test_lines_from_both_pipes() {
        let mut process = RuntimeProcess::spawn(&sh("echo out; echo err >&2")).await.unwrap();
        let mut seen = Vec::new();
        while let Some(line) = process.next_line().await {
            seen.push(line);
        }
        assert!(seen.contains(&ProcessLine::Line(Pipe::Stdout, "out".to_string())));
        assert!(seen.contains(&ProcessLine::Line(Pipe::Stderr, "err".to_string())));
        assert!(seen.contains(&ProcessLine::Closed(Pipe::Stdout)));
        assert!(seen.contains(&ProcessLine::Closed(Pipe::Stderr)));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let mut process = RuntimeProcess::spawn(&sh("sleep 30")).await.unwrap();
        process.kill().await;
        assert!(process.has_exited());
        process.kill().await;
        assert!(process.write("late\n").await.is_err());
    }

    #[tokio::test]
    async fn test_wait_ready_sees_marker() {
        let mut process = RuntimeProcess::spawn(&sh("echo banner; echo '##ready##'; sleep 5")).await.unwrap();
        assert!(process.wait_ready("##ready##", Duration::from_secs(5)).await.is_ok());
        process.kill().await;
    }

    #[tokio::test]
    async fn test_wait_ready_fails_when_process_exits() {
        let mut process = RuntimeProcess::spawn(&sh("echo 'no such driver' >&2; exit 1")).await.unwrap();
        let err = process.wait_ready("##ready##", Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        assert!(err.to_string().contains("no such driver"), "{err}");
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let mut process = RuntimeProcess::spawn(&sh("sleep 30")).await.unwrap();
        let err = process.wait_ready("##ready##", Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        process.kill().await;
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let spec = LaunchSpec {
            program: "/nonexistent/interpreter".to_string(),
            args: vec![],
            preamble: None,
        };
        assert!(RuntimeProcess::spawn(&spec).await.is_err());
    }
}
