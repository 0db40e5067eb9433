//! Per-session scratch directories, source materialisation and compilation.

use crate::config::EngineConfig;
use crate::error::SessionError;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Languages a session can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Cpp,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Cpp => "cpp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::Javascript => "js",
            Language::Cpp => "cpp",
        }
    }

    pub fn source_file_name(&self) -> String {
        format!("main.{}", self.extension())
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self, Language::Cpp)
    }

    /// V8 reserves several GiB of address space at start-up, so node cannot
    /// run under `RLIMIT_AS`; its heap is capped with a flag instead.
    pub fn honours_address_space_limit(&self) -> bool {
        !matches!(self, Language::Javascript)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Language::Python),
            "javascript" => Ok(Language::Javascript),
            "cpp" => Ok(Language::Cpp),
            other => Err(SessionError::UnsupportedLanguage(other.to_string())),
        }
    }
}

/// Resolved argument vector for the sandboxed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommand {
    program: String,
    args: Vec<String>,
}

impl RunCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// An exclusively-owned scratch directory. Removal is idempotent.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create a fresh private directory under `parent`.
    pub fn create(parent: &Path) -> io::Result<Self> {
        let root = parent.join(format!("codebox-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(parent)?;
        // create_dir (not _all) so an existing directory is never reused
        fs::create_dir(&root)?;
        fs::set_permissions(&root, fs::Permissions::from_mode(0o700))?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Write `content` to `name` inside the workspace and return its full path.
    pub fn write_file(&self, name: &str, content: &[u8]) -> io::Result<PathBuf> {
        let full_path = self.root.join(name);
        fs::write(&full_path, content)?;
        fs::set_permissions(&full_path, fs::Permissions::from_mode(0o644))?;
        Ok(full_path)
    }

    pub fn teardown(&self) {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => debug!(workspace = %self.root.display(), "Workspace removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(workspace = %self.root.display(), "Failed to remove workspace: {}", e),
        }
    }
}

/// A workspace ready to launch.
#[derive(Debug)]
pub struct Prepared {
    pub language: Language,
    pub workspace: Workspace,
    pub command: RunCommand,
    /// Compiler output of a successful build (warnings); empty for interpreters.
    pub diagnostics: String,
}

/// Materialise `source` into a new workspace and compile it when the language needs it.
///
/// On any error the workspace is removed before returning.
pub async fn prepare(
    config: &EngineConfig,
    language: &str,
    source: &str,
) -> Result<Prepared, SessionError> {
    let language: Language = language.parse()?;
    let workspace =
        Workspace::create(&config.workspace_root()).map_err(SessionError::WorkspacePrepare)?;

    match prepare_in(config, language, &workspace, source).await {
        Ok((command, diagnostics)) => Ok(Prepared {
            language,
            workspace,
            command,
            diagnostics,
        }),
        Err(e) => {
            workspace.teardown();
            Err(e)
        }
    }
}

async fn prepare_in(
    config: &EngineConfig,
    language: Language,
    workspace: &Workspace,
    source: &str,
) -> Result<(RunCommand, String), SessionError> {
    let source_path = workspace
        .write_file(&language.source_file_name(), source.as_bytes())
        .map_err(SessionError::WorkspacePrepare)?;
    let source_arg = source_path.to_string_lossy().to_string();
    let toolchain = &config.toolchain;

    match language {
        Language::Python => Ok((
            RunCommand::new(&toolchain.python, vec!["-u".to_string(), source_arg]),
            String::new(),
        )),
        Language::Javascript => Ok((
            RunCommand::new(
                &toolchain.node,
                vec![
                    format!("--max-old-space-size={}", config.limits.js_heap_mb),
                    source_arg,
                ],
            ),
            String::new(),
        )),
        Language::Cpp => {
            let binary = workspace.path().join("main");
            let diagnostics = compile_cpp(config, workspace, &source_path, &binary).await?;
            Ok((
                RunCommand::new(binary.to_string_lossy(), Vec::new()),
                diagnostics,
            ))
        }
    }
}

async fn compile_cpp(
    config: &EngineConfig,
    workspace: &Workspace,
    source: &Path,
    binary: &Path,
) -> Result<String, SessionError> {
    let compiler = &config.toolchain.cxx;
    let mut cmd = Command::new(compiler);
    cmd.arg("-std=c++17")
        .arg("-O2")
        .arg("-pipe")
        .arg("-o")
        .arg(binary)
        .arg(source)
        .current_dir(workspace.path())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    info!(compiler = %compiler, source = %source.display(), "Compiling");
    let limit = config.limits.compile_timeout();
    let output = match tokio::time::timeout(limit, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(SessionError::Compile(format!(
                "could not run compiler `{}`: {}",
                compiler, e
            )))
        }
        Err(_) => {
            return Err(SessionError::Compile(format!(
                "compilation timed out after {}s",
                limit.as_secs()
            )))
        }
    };

    let mut diagnostics = String::from_utf8_lossy(&output.stderr).into_owned();
    diagnostics.push_str(&String::from_utf8_lossy(&output.stdout));

    if !output.status.success() {
        info!(status = ?output.status, "Compilation failed");
        return Err(SessionError::Compile(diagnostics));
    }
    Ok(diagnostics)
}
