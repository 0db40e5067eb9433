//! codebox - interactive code runner with a websocket API.
//!
//! Usage:
//!   codebox serve [--port 8080] [--token T]      # Start HTTP/websocket server
//!   codebox run --language python main.py         # Run one file on this terminal

use clap::{Parser, Subcommand};
use codebox::protocol::{Frame, InitRequest};
use codebox::{http_server, session, AppState, ClientEvent, EngineConfig, ServerConfig, SessionRegistry, SessionState};
use std::io::Write;
use std::path::PathBuf;
use std::process::exit;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "codebox")]
#[command(about = "Run untrusted code under a PTY with resource limits")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/websocket server
    Serve(ServerConfig),
    /// Run a single source file with this terminal as the peer
    Run {
        /// python, javascript or cpp
        #[arg(long, short)]
        language: String,

        /// Source file to run
        file: PathBuf,

        #[command(flatten)]
        engine: EngineConfig,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(config) => {
            if let Err(e) = http_server::run_server(AppState::new(config)).await {
                error!("Server failed: {}", e);
                exit(1);
            }
        }
        Commands::Run { language, file, engine } => {
            let code = match tokio::fs::read_to_string(&file).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("Error: cannot read {}: {}", file.display(), e);
                    exit(1);
                }
            };
            exit(run_local(engine, language, code).await);
        }
    }
}

/// Relay one session to the local terminal and map its end state to an exit code.
async fn run_local(engine: EngineConfig, language: String, code: String) -> i32 {
    let (in_tx, in_rx) = mpsc::channel::<ClientEvent>(64);
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);

    let stdin_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if in_tx.send(ClientEvent::Input(format!("{}\n", line))).await.is_err() {
                return;
            }
        }
        // EOF on our stdin becomes ^D on the program's terminal; the sender
        // stays alive so the session is not treated as disconnected.
        let _ = in_tx.send(ClientEvent::Input("\x04".to_string())).await;
        std::future::pending::<()>().await;
    });

    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(frame) = out_rx.recv().await {
            match frame {
                Frame::Output { output } => {
                    let _ = stdout.write_all(output.as_bytes());
                    let _ = stdout.flush();
                }
                Frame::Error { message } => eprintln!("{}", message),
                Frame::Done => break,
            }
        }
    });

    let init = InitRequest {
        code,
        language,
        stdin: None,
        session: None,
    };
    let id = uuid::Uuid::new_v4().to_string();
    let report = session::run_session(&engine, &SessionRegistry::new(), id, init, in_rx, out_tx).await;

    let _ = printer.await;
    stdin_task.abort();

    match report.state {
        SessionState::Completed => 0,
        SessionState::Killed => 137,
        _ => 1,
    }
}
