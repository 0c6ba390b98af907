//! Turning one prompt line into one run of the constrained program.

use std::fmt;
use std::io;
use std::process::ExitStatus;

use pty_manager::ProcessSide;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Clear the screen, then move the cursor home.
pub const CLEAR_SCREEN: &[u8] = b"\x1b[2J\x1b[1;1H";

/// Pseudo-command that clears the terminal instead of running anything.
const CLEAR_COMMAND: &str = "cls";

/// What a single line of input asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Line {
    Clear,
    Blank,
    Invoke(Invocation),
}

/// Arguments for one run of the constrained program, plus the line they came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub line: String,
    pub args: Vec<String>,
}

/// Classify a line read from the terminal. Trailing `\n` / `\r\n` are ignored.
pub fn parse_line(raw: &str) -> Line {
    let line = raw.trim_end_matches(['\n', '\r']);
    if line == CLEAR_COMMAND {
        return Line::Clear;
    }
    let args: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    if args.is_empty() {
        return Line::Blank;
    }
    Line::Invoke(Invocation {
        line: line.to_string(),
        args,
    })
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Succeeded,
    Failed(ExitStatus),
    StartFailed(io::Error),
    WaitFailed(io::Error),
    /// The session ended while the program was still running; it was killed.
    Interrupted,
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchOutcome::Succeeded => f.write_str("succeeded"),
            DispatchOutcome::Failed(status) => write!(f, "failed: {status}"),
            DispatchOutcome::StartFailed(e) => write!(f, "could not start: {e}"),
            DispatchOutcome::WaitFailed(e) => write!(f, "could not wait: {e}"),
            DispatchOutcome::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Runs invocations of one fixed program on a session terminal.
#[derive(Clone, Debug)]
pub struct CommandDispatcher {
    program: String,
}

impl CommandDispatcher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run `invocation` attached to `terminal` and wait for it.
    ///
    /// Failures are reported as one line on `report_to` (the terminal's
    /// output) and never returned as errors; the outcome is for logging.
    pub async fn dispatch<W>(
        &self,
        invocation: &Invocation,
        terminal: &ProcessSide,
        report_to: &mut W,
        cancel: &CancellationToken,
    ) -> DispatchOutcome
    where
        W: AsyncWrite + Unpin,
    {
        info!(program = %self.program, args = ?invocation.args, "dispatching command");

        let mut child = match terminal.spawn_attached(&self.program, &invocation.args) {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %self.program, line = %invocation.line, error = %e, "failed to start command");
                let msg = format!("invalid {} cmd {:?}\r\n", self.program, invocation.line);
                report(report_to, &msg).await;
                return DispatchOutcome::StartFailed(e);
            }
        };

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                debug!(line = %invocation.line, "session ended while command was running");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return DispatchOutcome::Interrupted;
            }
        };

        match status {
            Ok(status) if status.success() => DispatchOutcome::Succeeded,
            Ok(status) => {
                debug!(line = %invocation.line, %status, "command failed");
                report(report_to, &format!("cmd {:?} failed\r\n", invocation.line)).await;
                DispatchOutcome::Failed(status)
            }
            Err(e) => {
                warn!(line = %invocation.line, error = %e, "failed to wait for command");
                report(report_to, &format!("cmd {:?} failed\r\n", invocation.line)).await;
                DispatchOutcome::WaitFailed(e)
            }
        }
    }
}

async fn report<W: AsyncWrite + Unpin>(out: &mut W, msg: &str) {
    let written = async {
        out.write_all(msg.as_bytes()).await?;
        out.flush().await
    };
    if let Err(e) = written.await {
        debug!(error = %e, "could not report command failure to terminal");
    }
}
