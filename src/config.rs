//! Runtime configuration: resource ceilings, toolchain binaries and server options.

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Default Piston-compatible endpoint used by `POST /run`.
pub const DEFAULT_PISTON_URL: &str = "https://emkc.org/api/v2/piston/execute";

/// Ceilings applied to every sandboxed run.
#[derive(Debug, Clone, Args)]
pub struct Limits {
    /// Wall-clock limit enforced inside the child with `alarm(2)`, in seconds
    #[arg(long = "timeout-secs", default_value_t = 3)]
    pub timeout_secs: u64,

    /// Supervisor backstop measured from launch, in milliseconds
    #[arg(long = "grace-ms", default_value_t = 3500)]
    pub grace_ms: u64,

    /// Address-space ceiling in MiB
    #[arg(long = "memory-mb", default_value_t = 64)]
    pub memory_mb: u64,

    /// Cumulative terminal output budget in bytes
    #[arg(long = "output-limit", default_value_t = 32 * 1024)]
    pub output_limit: usize,

    /// Upper bound on a single compiler invocation, in seconds
    #[arg(long = "compile-timeout-secs", default_value_t = 10)]
    pub compile_timeout_secs: u64,

    /// V8 old-space ceiling for javascript runs, in MiB
    #[arg(long = "js-heap-mb", default_value_t = 64)]
    pub js_heap_mb: u64,
}

impl Limits {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            timeout_secs: 3,
            grace_ms: 3500,
            memory_mb: 64,
            output_limit: 32 * 1024,
            compile_timeout_secs: 10,
            js_heap_mb: 64,
        }
    }
}

/// Interpreter and compiler binaries, resolved through `PATH` when not absolute.
#[derive(Debug, Clone, Args)]
pub struct Toolchain {
    #[arg(long, default_value = "python3")]
    pub python: String,

    #[arg(long, default_value = "node")]
    pub node: String,

    #[arg(long, default_value = "g++")]
    pub cxx: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            node: "node".to_string(),
            cxx: "g++".to_string(),
        }
    }
}

/// Everything a single run needs, shared by the server and the local runner.
#[derive(Debug, Clone, Args)]
pub struct EngineConfig {
    #[command(flatten)]
    pub limits: Limits,

    #[command(flatten)]
    pub toolchain: Toolchain,

    /// Directory under which per-session workspaces are created
    #[arg(long = "workspace-root", env = "CODEBOX_WORKSPACE_ROOT")]
    pub workspace_root: Option<PathBuf>,
}

impl EngineConfig {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            toolchain: Toolchain::default(),
            workspace_root: None,
        }
    }
}

/// Options for `codebox serve`.
#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    /// Port to listen on
    #[arg(long, default_value = "8080")]
    pub port: u16,

    /// Shared secret expected in the `token` query parameter
    #[arg(long, env = "CODEBOX_TOKEN")]
    pub token: Option<String>,

    /// Allowed CORS origin (repeatable); any origin when omitted
    #[arg(long = "allow-origin")]
    pub allow_origins: Vec<String>,

    /// Endpoint of the external one-shot execution service
    #[arg(long = "piston-url", env = "CODEBOX_PISTON_URL", default_value = DEFAULT_PISTON_URL)]
    pub piston_url: String,

    #[command(flatten)]
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            token: None,
            allow_origins: Vec::new(),
            piston_url: DEFAULT_PISTON_URL.to_string(),
            engine: EngineConfig::default(),
        }
    }
}
