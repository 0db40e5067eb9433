//! A session from its first message to teardown.

use crate::config::EngineConfig;
use crate::error::SessionError;
use crate::limits::ChildLimits;
use crate::protocol::{self, ClientMessage, Frame, InitRequest, StopRequest};
use crate::relay::{ClientEvent, Relay, SessionReport, SessionState};
use crate::sandbox;
use crate::state::{RegistryEntry, SessionRegistry, StopOutcome};
use crate::workspace;
use std::os::fd::AsRawFd;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Handle the first message of a connection: run the submitted code or
/// service a stop request. Returns `None` for stop requests.
pub async fn serve_connection(
    engine: &EngineConfig,
    registry: &SessionRegistry,
    first_message: &str,
    inbound: mpsc::Receiver<ClientEvent>,
    outbound: mpsc::Sender<Frame>,
) -> Option<SessionReport> {
    match protocol::parse_client_message(first_message) {
        Ok(ClientMessage::Init(init)) => {
            let id = init
                .session
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            Some(run_session(engine, registry, id, init, inbound, outbound).await)
        }
        Ok(ClientMessage::Stop(stop)) => {
            handle_stop(registry, &stop, &outbound).await;
            None
        }
        Err(e) => {
            warn!("Rejecting session: {}", e);
            Some(reject("unknown", e, &outbound).await)
        }
    }
}

async fn handle_stop(registry: &SessionRegistry, stop: &StopRequest, outbound: &mpsc::Sender<Frame>) {
    let text = match stop.session.as_deref() {
        Some(id) => match registry.stop(id) {
            StopOutcome::Killed => format!("Stopped session {}.\r\n", id),
            StopOutcome::NotRunning => format!("No running process for session {}.\r\n", id),
        },
        None => "No running process for this connection.\r\n".to_string(),
    };
    let _ = outbound.send(Frame::output(text)).await;
    let _ = outbound.send(Frame::Done).await;
}

async fn reject(id: &str, err: SessionError, outbound: &mpsc::Sender<Frame>) -> SessionReport {
    let _ = outbound.send(Frame::error(&err)).await;
    let _ = outbound.send(Frame::Done).await;
    SessionReport::failed(id, err)
}

/// Prepare, launch and relay one run.
pub async fn run_session(
    engine: &EngineConfig,
    registry: &SessionRegistry,
    id: String,
    init: InitRequest,
    mut inbound: mpsc::Receiver<ClientEvent>,
    outbound: mpsc::Sender<Frame>,
) -> SessionReport {
    if registry.is_live(&id) {
        let err = SessionError::Protocol(format!("session {} is already running", id));
        return reject(&id, err, &outbound).await;
    }

    info!(session = %id, language = %init.language, state = ?SessionState::Preparing, "Session state");
    let prepared = match workspace::prepare(engine, &init.language, &init.code).await {
        Ok(prepared) => prepared,
        Err(e) => {
            info!(session = %id, "Preparation failed: {}", e);
            return reject(&id, e, &outbound).await;
        }
    };

    if !prepared.diagnostics.trim().is_empty() {
        let _ = outbound.send(Frame::output(prepared.diagnostics.clone())).await;
    }

    let limits = ChildLimits::for_run(&engine.limits, prepared.language);
    let launched = match sandbox::launch(&prepared.command, &prepared.workspace, limits) {
        Ok(launched) => launched,
        Err(e) => {
            prepared.workspace.teardown();
            return reject(&id, e, &outbound).await;
        }
    };

    let entry = RegistryEntry {
        pid: launched.pid,
        pty_fd: launched.master.as_raw_fd(),
        workspace: prepared.workspace.path().to_path_buf(),
        language: prepared.language,
        started_at: Instant::now(),
    };
    let registered = registry.register(&id, entry);
    // From here the relay owns cleanup, including on the duplicate path below.
    let relay = Relay::new(
        id.clone(),
        launched,
        prepared.workspace,
        registry.clone(),
        engine.limits.clone(),
    );
    if !registered {
        drop(relay);
        let err = SessionError::Protocol(format!("session {} is already running", id));
        return reject(&id, err, &outbound).await;
    }

    info!(session = %id, state = ?SessionState::Running, "Session state");
    relay.run(init.stdin, &mut inbound, &outbound).await
}
