//! Per-channel session controller.
//!
//! A session moves through these states:
//!
//! ```text
//! AwaitingChannelAccept -> AwaitingRequests -> AwaitingTerminal -> Piping/Looping -> Closed
//! ```
//!
//! Channel requests are served by a dedicated task, one at a time and in
//! order. The first `pty-req` allocates the terminal and hands it to the main
//! flow through a [`ready`](crate::ready) latch; nothing is read from or
//! written to the terminal before that. Once the terminal exists, two pipe
//! tasks shuttle bytes between the channel and the controlling side while the
//! main flow runs the prompt loop on the process side.
//!
//! Every exit path ends with the terminal pair dropped once and the channel's
//! output side dropped once; the transport closes the channel when the last
//! output sender is gone.

use std::sync::Arc;
use std::time::Duration;

use pty_manager::{
    ProcessSide, PtyController, PtyError, TerminalAllocator, TerminalGeometry, TerminalPair,
};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::{CLEAR_SCREEN, CommandDispatcher, Line, parse_line};
use crate::ready::{self, NotReady, ReadySignal};

/// How long trailing terminal output may take to reach the channel after the
/// prompt loop has ended.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

const PIPE_BUFFER_SIZE: usize = 4096;

/// VEOF of a freshly opened terminal (Ctrl-D).
const END_OF_INPUT: u8 = 0x04;

/// Kind of a channel the client asked to open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Session,
    DirectTcpip,
    X11,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip => "direct-tcpip",
            ChannelKind::X11 => "x11",
        }
    }
}

/// A channel open that was refused.
#[derive(Debug, thiserror::Error)]
#[error("unknown channel type {kind:?}")]
pub struct ChannelRejection {
    pub kind: String,
}

/// Payload of a channel request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Interactive shell. A non-empty payload is a one-shot command.
    Shell { payload: Vec<u8> },
    PtyReq(TerminalGeometry),
    WindowChange(TerminalGeometry),
    Other(String),
}

impl RequestKind {
    pub fn name(&self) -> &str {
        match self {
            RequestKind::Shell { .. } => "shell",
            RequestKind::PtyReq(_) => "pty-req",
            RequestKind::WindowChange(_) => "window-change",
            RequestKind::Other(name) => name,
        }
    }
}

/// A channel request together with the slot its single reply goes into.
#[derive(Debug)]
pub struct ChannelRequest {
    pub kind: RequestKind,
    reply: oneshot::Sender<bool>,
}

impl ChannelRequest {
    pub fn new(kind: RequestKind) -> (Self, oneshot::Receiver<bool>) {
        let (reply, rx) = oneshot::channel();
        (Self { kind, reply }, rx)
    }

    /// Answer the request. A requester that stopped waiting is ignored.
    pub fn answer(self, accepted: bool) {
        let _ = self.reply.send(accepted);
    }
}

/// The channel as seen by a session.
///
/// `input` ends when the client sends EOF; the terminal then gets end of
/// input after everything sent before it. `closed` is cancelled when the
/// client closes the channel. Dropping every `output` sender closes the
/// channel from our side.
pub struct ChannelIo {
    pub requests: mpsc::Receiver<ChannelRequest>,
    pub input: mpsc::UnboundedReceiver<Vec<u8>>,
    pub output: mpsc::Sender<Vec<u8>>,
    pub closed: CancellationToken,
}

/// What the prompt looks like and which program it runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub program: String,
    pub prompt: String,
}

impl SessionSettings {
    /// Settings with the conventional `"<program> > "` prompt.
    pub fn for_program(program: impl Into<String>) -> Self {
        let program = program.into();
        let prompt = format!("{program} > ");
        Self { program, prompt }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::for_program("docker")
    }
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionExit {
    /// The request stream ended before any terminal was allocated.
    NoTerminal,
    AllocationFailed,
    /// The terminal reported end of input (e.g. Ctrl-D on an empty line).
    InputEnded,
    /// The client closed the channel.
    ChannelClosed,
    /// Reading from or writing to the terminal failed.
    TerminalError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub terminal_allocated: bool,
    pub commands: usize,
    pub exit: SessionExit,
}

/// Owns one channel for its whole lifetime.
pub struct SessionController {
    settings: Arc<SessionSettings>,
    allocator: Arc<dyn TerminalAllocator>,
    dispatcher: CommandDispatcher,
}

impl SessionController {
    pub fn new(settings: Arc<SessionSettings>, allocator: Arc<dyn TerminalAllocator>) -> Self {
        let dispatcher = CommandDispatcher::new(settings.program.clone());
        Self {
            settings,
            allocator,
            dispatcher,
        }
    }

    /// Decide whether a channel of `kind` may be opened at all.
    pub fn admit(kind: &ChannelKind) -> Result<(), ChannelRejection> {
        match kind {
            ChannelKind::Session => Ok(()),
            other => Err(ChannelRejection {
                kind: other.as_str().to_string(),
            }),
        }
    }

    /// Run the session to completion.
    pub async fn run(self, io: ChannelIo) -> SessionReport {
        let ChannelIo {
            requests,
            input,
            output,
            closed,
        } = io;

        let cancel = closed.child_token();
        let (signal, waiter) = ready::latch();
        let request_task = tokio::spawn(serve_requests(
            requests,
            signal,
            self.allocator.clone(),
            cancel.clone(),
        ));

        let pair = match waiter.wait().await {
            Ok(pair) => pair,
            Err(NotReady::Failed(e)) => {
                warn!(error = %e, "session ends without a terminal");
                cancel.cancel();
                let _ = request_task.await;
                return SessionReport {
                    terminal_allocated: false,
                    commands: 0,
                    exit: SessionExit::AllocationFailed,
                };
            }
            Err(NotReady::Abandoned) => {
                debug!("request stream ended before a terminal was requested");
                cancel.cancel();
                let _ = request_task.await;
                return SessionReport {
                    terminal_allocated: false,
                    commands: 0,
                    exit: SessionExit::NoTerminal,
                };
            }
        };

        let (controller, process) = pair.into_parts();
        let controller = Arc::new(controller);
        let to_terminal = tokio::spawn(pipe_to_terminal(
            input,
            controller.clone(),
            cancel.clone(),
        ));
        let mut to_channel = tokio::spawn(pipe_to_channel(controller, output));

        let (commands, exit) = self.read_eval(&process, &cancel).await;

        // Releasing the process side lets the outbound pipe drain and then
        // see end of stream. The grace period covers a process side still
        // held open by an in-flight read.
        drop(process);
        cancel.cancel();
        let _ = to_terminal.await;
        if tokio::time::timeout(DRAIN_GRACE, &mut to_channel)
            .await
            .is_err()
        {
            debug!("terminal output did not drain in time");
            to_channel.abort();
            let _ = to_channel.await;
        }
        let _ = request_task.await;

        SessionReport {
            terminal_allocated: true,
            commands,
            exit,
        }
    }

    /// The prompt loop. Returns the number of dispatched commands and why it stopped.
    async fn read_eval(
        &self,
        process: &ProcessSide,
        cancel: &CancellationToken,
    ) -> (usize, SessionExit) {
        let (reader, mut writer) = match (process.reader(), process.writer()) {
            (Ok(reader), Ok(writer)) => (reader, writer),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "could not open the session terminal");
                return (0, SessionExit::TerminalError);
            }
        };
        let mut reader = BufReader::new(reader);
        let mut commands = 0;
        let mut line = Vec::new();

        loop {
            if let Err(e) = write_flushed(&mut writer, self.settings.prompt.as_bytes()).await {
                debug!(error = %e, "failed to write prompt");
                return (commands, SessionExit::TerminalError);
            }

            line.clear();
            let read = tokio::select! {
                _ = cancel.cancelled() => return (commands, SessionExit::ChannelClosed),
                read = reader.read_until(b'\n', &mut line) => read,
            };
            match read {
                Ok(0) => return (commands, SessionExit::InputEnded),
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "terminal read failed");
                    return (commands, SessionExit::TerminalError);
                }
            }

            match parse_line(&String::from_utf8_lossy(&line)) {
                Line::Blank => {}
                Line::Clear => {
                    if let Err(e) = write_flushed(&mut writer, CLEAR_SCREEN).await {
                        debug!(error = %e, "failed to clear terminal");
                        return (commands, SessionExit::TerminalError);
                    }
                }
                Line::Invoke(invocation) => {
                    commands += 1;
                    let outcome = self
                        .dispatcher
                        .dispatch(&invocation, process, &mut writer, cancel)
                        .await;
                    debug!(line = %invocation.line, %outcome, "command finished");
                    if cancel.is_cancelled() {
                        return (commands, SessionExit::ChannelClosed);
                    }
                    if let Err(e) = write_flushed(&mut writer, b"\r\n").await {
                        debug!(error = %e, "failed to write line break");
                        return (commands, SessionExit::TerminalError);
                    }
                }
            }
        }
    }
}

/// Serve channel requests in arrival order, replying to each exactly once.
async fn serve_requests(
    mut requests: mpsc::Receiver<ChannelRequest>,
    signal: ReadySignal<TerminalPair, PtyError>,
    allocator: Arc<dyn TerminalAllocator>,
    cancel: CancellationToken,
) {
    let mut signal = Some(signal);

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        info!(request = request.kind.name(), "got channel request");

        let mut stop = false;
        let accepted = match &request.kind {
            RequestKind::Shell { payload } => {
                if !payload.is_empty() {
                    warn!(len = payload.len(), "rejecting shell request with a command");
                }
                payload.is_empty()
            }
            RequestKind::PtyReq(geometry) => match signal.take() {
                None => {
                    warn!("rejecting duplicate pty-req");
                    false
                }
                Some(pending) => match allocator.allocate(*geometry) {
                    Ok(pair) => {
                        pending.ready(pair);
                        true
                    }
                    Err(e) => {
                        error!(error = %e, "failed to open a pty");
                        pending.fail(e);
                        stop = true;
                        false
                    }
                },
            },
            // Resizing is acknowledged but not applied.
            RequestKind::WindowChange(_) => true,
            RequestKind::Other(name) => {
                debug!(request = %name, "rejecting unsupported request");
                false
            }
        };
        request.answer(accepted);
        if stop {
            break;
        }
    }
}

async fn pipe_to_terminal(
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
    controller: Arc<PtyController>,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = input.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            // Lines already queued in the terminal are still read before
            // the prompt loop sees end of input.
            debug!("channel input ended");
            if let Err(e) = controller.write_all(&[END_OF_INPUT]).await {
                warn!(error = %e, "failed to signal end of input");
                cancel.cancel();
            }
            return;
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            written = controller.write_all(&chunk) => {
                if let Err(e) = written {
                    warn!(error = %e, "failed to write to terminal");
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

async fn pipe_to_channel(controller: Arc<PtyController>, output: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    loop {
        match controller.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if output.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "terminal read failed");
                break;
            }
        }
    }
}

async fn write_flushed<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}
