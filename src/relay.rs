//! Moves bytes between a running program's terminal and its remote peer,
//! and finalizes the session exactly once however it ends.

use crate::config::Limits;
use crate::error::{Ceiling, SessionError};
use crate::protocol::Frame;
use crate::sandbox::{self, Launched, PtyMaster};
use crate::state::SessionRegistry;
use crate::workspace::Workspace;
use nix::unistd::Pid;
use serde::Serialize;
use std::os::unix::process::ExitStatusExt;
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Sleep;
use tracing::{debug, info, warn};

/// Terminal reads are forwarded at this granularity.
const READ_CHUNK: usize = 1024;
/// How long to wait for a killed or finished child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);
/// Pending terminal input per session; more is dropped.
const INPUT_QUEUE: usize = 64;
/// How long a final frame may wait on a peer that is not reading.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// What the peer did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Raw terminal input.
    Input(String),
    Stop,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Preparing,
    Running,
    Completed,
    Killed,
    Failed,
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionReport {
    pub id: String,
    pub state: SessionState,
    pub cause: Option<SessionError>,
    pub exit: Option<ExitStatus>,
    pub output_bytes: usize,
}

impl SessionReport {
    pub fn failed(id: impl Into<String>, cause: SessionError) -> Self {
        Self {
            id: id.into(),
            state: SessionState::Failed,
            cause: Some(cause),
            exit: None,
            output_bytes: 0,
        }
    }
}

/// Why the relay loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Eof,
    Timeout,
    OutputCap,
    Stopped,
    Disconnected,
}

/// Incremental UTF-8 decoding: a character split across two reads is held
/// back until its remaining bytes arrive.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is held back, lossily.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Teardown shared by the normal exit path and `Drop`, guarded so it runs once.
struct Teardown {
    id: String,
    pid: Pid,
    registry: SessionRegistry,
    workspace: Workspace,
    finalized: AtomicBool,
}

impl Teardown {
    /// Claim finalization. Returns `false` if it already happened.
    fn claim(&self) -> bool {
        !self.finalized.swap(true, Ordering::SeqCst)
    }

    /// Forget the session and kill what is left of its process group.
    /// Runs before the child is reaped so no stop can hit a recycled pid.
    fn release_process(&self) {
        self.registry.release(&self.id, self.pid);
        sandbox::kill_group(self.pid);
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if self.claim() {
            warn!(session = %self.id, "Session dropped before finalizing, cleaning up");
            self.release_process();
            self.workspace.teardown();
        }
    }
}

/// One launched session, ready to be driven.
pub struct Relay {
    id: String,
    child: Child,
    master: Arc<PtyMaster>,
    memory_capped: bool,
    limits: Limits,
    teardown: Teardown,
}

impl Relay {
    pub fn new(
        id: impl Into<String>,
        launched: Launched,
        workspace: Workspace,
        registry: SessionRegistry,
        limits: Limits,
    ) -> Self {
        let id = id.into();
        let Launched {
            pid,
            child,
            master,
            memory_capped,
        } = launched;
        Self {
            teardown: Teardown {
                id: id.clone(),
                pid,
                registry,
                workspace,
                finalized: AtomicBool::new(false),
            },
            id,
            child,
            master: Arc::new(master),
            memory_capped,
            limits,
        }
    }

    /// Drive the session until the program ends, a ceiling trips, the peer
    /// stops it or goes away. `done` is the last frame sent, exactly once,
    /// unless the peer disconnected.
    pub async fn run(
        mut self,
        stdin: Option<String>,
        inbound: &mut mpsc::Receiver<ClientEvent>,
        outbound: &mpsc::Sender<Frame>,
    ) -> SessionReport {
        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE);
        let writer = tokio::spawn(forward_input(self.master.clone(), input_rx));
        if let Some(stdin) = stdin.filter(|s| !s.is_empty()) {
            queue_input(&input_tx, stdin.into_bytes(), &self.id);
        }

        // Armed once at launch. Everything the loop waits on races it,
        // including sends to a peer that has stopped reading.
        let backstop = tokio::time::sleep(self.limits.grace());
        tokio::pin!(backstop);

        let limit = self.limits.output_limit;
        let mut decoder = Utf8Stream::default();
        let mut total = 0usize;
        let mut buf = [0u8; READ_CHUNK];

        let end = 'relay: loop {
            let (frames, then) = tokio::select! {
                _ = &mut backstop => {
                    info!(session = %self.id, "Backstop timer fired");
                    break End::Timeout;
                }
                event = inbound.recv() => match on_event(event, &input_tx, &self.id) {
                    Some(end) => break end,
                    None => continue,
                },
                read = self.master.read(&mut buf) => match read {
                    Ok(0) => break End::Eof,
                    Ok(n) => {
                        let allowed = limit.saturating_sub(total);
                        total += n;
                        if n > allowed {
                            let mut text = decoder.push(&buf[..allowed]);
                            text.push_str(&decoder.finish());
                            let mut frames = Vec::with_capacity(2);
                            if !text.is_empty() {
                                frames.push(Frame::output(text));
                            }
                            frames.push(Frame::output(format!(
                                "\r\n[output truncated: limit of {} bytes exceeded]\r\n",
                                limit
                            )));
                            (frames, Some(End::OutputCap))
                        } else {
                            let text = decoder.push(&buf[..n]);
                            let frames = if text.is_empty() { Vec::new() } else { vec![Frame::output(text)] };
                            (frames, None)
                        }
                    }
                    Err(e) => {
                        warn!(session = %self.id, "Terminal read failed: {}", e);
                        break End::Eof;
                    }
                },
            };

            for frame in frames {
                let delivered = deliver(outbound, frame, &mut backstop, inbound, &input_tx, &self.id).await;
                if let Err(end) = delivered {
                    break 'relay end;
                }
            }
            if let Some(end) = then {
                break end;
            }
        };

        drop(input_tx);
        writer.abort();

        if end == End::Eof {
            let rest = decoder.finish();
            if !rest.is_empty() {
                flush(outbound, Frame::output(rest), &self.id).await;
            }
        }

        let exit = self.finalize().await;
        let (state, cause) = classify(end, exit, self.memory_capped);
        info!(
            session = %self.id,
            state = ?state,
            exit = ?exit,
            output_bytes = total,
            "Session finished"
        );

        if end != End::Disconnected {
            flush(outbound, Frame::Done, &self.id).await;
        }

        SessionReport {
            id: self.id,
            state,
            cause,
            exit,
            output_bytes: total.min(limit),
        }
    }

    /// Release and kill this relay's own process, reap it, remove the workspace.
    /// The registry entry is only dropped while it still records our pid.
    async fn finalize(&mut self) -> Option<ExitStatus> {
        if !self.teardown.claim() {
            return None;
        }
        self.teardown.release_process();
        let exit = match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(session = %self.id, "Failed to reap child: {}", e);
                None
            }
            Err(_) => {
                warn!(session = %self.id, "Child not reaped in time");
                None
            }
        };
        let workspace = self.teardown.workspace.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || workspace.teardown()).await {
            warn!(session = %self.id, "Workspace teardown task failed: {}", e);
        }
        exit
    }
}

/// Map a peer event to the end it causes, if any. Input is queued for the writer.
fn on_event(event: Option<ClientEvent>, input: &mpsc::Sender<Vec<u8>>, session: &str) -> Option<End> {
    match event {
        Some(ClientEvent::Input(text)) => {
            queue_input(input, text.into_bytes(), session);
            None
        }
        Some(ClientEvent::Stop) => {
            info!(session = %session, "Stop requested by peer");
            Some(End::Stopped)
        }
        Some(ClientEvent::Disconnected) | None => Some(End::Disconnected),
    }
}

/// Hand input to the writer without waiting. A full queue means the program
/// is not reading its terminal; the input is dropped.
fn queue_input(input: &mpsc::Sender<Vec<u8>>, bytes: Vec<u8>, session: &str) -> bool {
    match input.try_send(bytes) {
        Ok(()) => true,
        Err(TrySendError::Full(bytes)) => {
            warn!(session = %session, dropped = bytes.len(), "Terminal input queue full, dropping input");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(session = %session, "Terminal writer gone, input discarded");
            false
        }
    }
}

/// Send one frame while still honouring the backstop and the peer's events.
async fn deliver(
    outbound: &mpsc::Sender<Frame>,
    frame: Frame,
    backstop: &mut Pin<&mut Sleep>,
    inbound: &mut mpsc::Receiver<ClientEvent>,
    input: &mpsc::Sender<Vec<u8>>,
    session: &str,
) -> Result<(), End> {
    let send = outbound.send(frame);
    tokio::pin!(send);
    loop {
        tokio::select! {
            sent = &mut send => return sent.map_err(|_| End::Disconnected),
            _ = backstop.as_mut() => {
                info!(session = %session, "Backstop timer fired while peer was not reading");
                return Err(End::Timeout);
            }
            event = inbound.recv() => {
                if let Some(end) = on_event(event, input, session) {
                    return Err(end);
                }
            }
        }
    }
}

/// Frames sent once the process is gone. A peer that is not reading gets
/// `FLUSH_TIMEOUT` before they are dropped.
async fn flush(outbound: &mpsc::Sender<Frame>, frame: Frame, session: &str) {
    if let Err(e) = outbound.send_timeout(frame, FLUSH_TIMEOUT).await {
        debug!(session = %session, "Final frame not delivered: {}", e);
    }
}

/// Client input path, scheduled apart from the read loop so a program that
/// never reads its stdin cannot stall output.
async fn forward_input(master: Arc<PtyMaster>, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = input.recv().await {
        if let Err(e) = master.write_all(&bytes).await {
            debug!("Terminal input closed: {}", e);
            break;
        }
    }
}

fn classify(end: End, exit: Option<ExitStatus>, memory_capped: bool) -> (SessionState, Option<SessionError>) {
    match end {
        End::Timeout => (
            SessionState::Killed,
            Some(SessionError::ResourceExceeded(Ceiling::Timeout)),
        ),
        End::OutputCap => (
            SessionState::Killed,
            Some(SessionError::ResourceExceeded(Ceiling::Output)),
        ),
        End::Stopped => (SessionState::Killed, None),
        End::Disconnected => (SessionState::Killed, Some(SessionError::PeerDisconnected)),
        End::Eof => match exit {
            Some(status) if status.success() => (SessionState::Completed, None),
            Some(status) => match status.signal() {
                Some(libc::SIGALRM) | Some(libc::SIGXCPU) => (
                    SessionState::Killed,
                    Some(SessionError::ResourceExceeded(Ceiling::Timeout)),
                ),
                Some(libc::SIGKILL) => (SessionState::Killed, None),
                // Failed allocations under RLIMIT_AS surface as abort or a bad access.
                Some(libc::SIGABRT) | Some(libc::SIGSEGV) | Some(libc::SIGBUS) if memory_capped => (
                    SessionState::Failed,
                    Some(SessionError::ResourceExceeded(Ceiling::Memory)),
                ),
                _ => (SessionState::Failed, None),
            },
            None => (SessionState::Failed, None),
        },
    }
}
