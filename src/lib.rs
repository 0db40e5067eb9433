//! codebox - run untrusted snippets under a pseudo-terminal and stream their
//! terminal to a remote peer over a websocket.

#[cfg(not(target_os = "linux"))]
compile_error!("codebox only works on Linux.");

pub mod config;
pub mod error;
pub mod format;
pub mod http_server;
pub mod limits;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod sandbox;
pub mod session;
pub mod state;
pub mod workspace;

pub use config::{EngineConfig, Limits, ServerConfig, Toolchain};
pub use error::{Ceiling, SessionError};
pub use relay::{ClientEvent, SessionReport, SessionState};
pub use state::{AppState, SessionRegistry};
