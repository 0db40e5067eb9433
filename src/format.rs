//! Source formatting through external formatter binaries.

use crate::workspace::{Language, Workspace};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

const FORMAT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct FormatRequest {
    pub code: String,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formatted {
    pub formatted: String,
}

/// Body of a failed format request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatFailure {
    pub error: String,
    pub details: String,
}

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("unsupported language")]
    Unsupported(String),
    #[error("formatter unavailable")]
    Unavailable(String),
    #[error("formatter failed")]
    Failed(String),
}

impl FormatError {
    pub fn details(&self) -> &str {
        match self {
            FormatError::Unsupported(d) | FormatError::Unavailable(d) | FormatError::Failed(d) => d,
        }
    }

    pub fn to_failure(&self) -> FormatFailure {
        FormatFailure {
            error: self.to_string(),
            details: self.details().to_string(),
        }
    }
}

/// An in-place formatter: `program args... <file>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formatter {
    pub program: String,
    pub args: Vec<String>,
}

impl Formatter {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Formatter per language.
#[derive(Debug, Clone)]
pub struct Formatters {
    pub python: Formatter,
    pub javascript: Formatter,
    pub cpp: Formatter,
}

impl Default for Formatters {
    fn default() -> Self {
        Self {
            python: Formatter::new("black", &["-q"]),
            javascript: Formatter::new("prettier", &["--write", "--log-level", "warn"]),
            cpp: Formatter::new("clang-format", &["-i"]),
        }
    }
}

impl Formatters {
    pub fn for_language(&self, language: Language) -> &Formatter {
        match language {
            Language::Python => &self.python,
            Language::Javascript => &self.javascript,
            Language::Cpp => &self.cpp,
        }
    }
}

/// Format `req.code` in a throw-away workspace under `root`.
pub async fn format_source(
    formatters: &Formatters,
    root: &Path,
    req: &FormatRequest,
) -> Result<String, FormatError> {
    let language: Language = req
        .language
        .parse()
        .map_err(|_| FormatError::Unsupported(format!("no formatter for `{}`", req.language)))?;
    let formatter = formatters.for_language(language);

    let workspace = Workspace::create(root)
        .map_err(|e| FormatError::Unavailable(format!("workspace: {}", e)))?;
    let result = run_formatter(formatter, &workspace, language, &req.code).await;
    workspace.teardown();
    result
}

async fn run_formatter(
    formatter: &Formatter,
    workspace: &Workspace,
    language: Language,
    code: &str,
) -> Result<String, FormatError> {
    let file = workspace
        .write_file(&language.source_file_name(), code.as_bytes())
        .map_err(|e| FormatError::Unavailable(format!("write source: {}", e)))?;

    info!(formatter = %formatter.program, language = %language, "Formatting source");
    let mut cmd = Command::new(&formatter.program);
    cmd.args(&formatter.args)
        .arg(&file)
        .current_dir(workspace.path())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(FORMAT_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
            return Err(FormatError::Unavailable(format!("`{}` is not installed", formatter.program)))
        }
        Ok(Err(e)) => return Err(FormatError::Unavailable(e.to_string())),
        Err(_) => return Err(FormatError::Failed("formatter timed out".to_string())),
    };

    if !output.status.success() {
        return Err(FormatError::Failed(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    tokio::fs::read_to_string(&file)
        .await
        .map_err(|e| FormatError::Failed(format!("read formatted source: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_python(formatter: Formatter) -> Formatters {
        Formatters {
            python: formatter,
            ..Formatters::default()
        }
    }

    fn request(language: &str, code: &str) -> FormatRequest {
        FormatRequest {
            code: code.to_string(),
            language: language.to_string(),
        }
    }

    #[tokio::test]
    async fn formatted_file_is_read_back_and_workspace_removed() {
        let root = tempfile::tempdir().unwrap();
        // `sh -c script file`: the file lands in $0
        let fake = Formatter::new("/bin/sh", &["-c", "printf 'x = 1\\n' > \"$0\""]);

        let formatted = format_source(&with_python(fake), root.path(), &request("python", "x=1"))
            .await
            .unwrap();
        assert_eq!(formatted, "x = 1\n");
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let root = tempfile::tempdir().unwrap();
        let fake = Formatter::new("/bin/sh", &["-c", "echo 'cannot parse' >&2; exit 123"]);

        let err = format_source(&with_python(fake), root.path(), &request("python", "def ("))
            .await
            .unwrap_err();
        assert!(matches!(err, FormatError::Failed(_)));
        let failure = err.to_failure();
        assert_eq!(failure.error, "formatter failed");
        assert!(failure.details.contains("cannot parse"));
    }

    #[tokio::test]
    async fn missing_binary_and_unknown_language() {
        let root = tempfile::tempdir().unwrap();
        let missing = Formatter::new("/nonexistent/black", &[]);

        let err = format_source(&with_python(missing), root.path(), &request("python", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FormatError::Unavailable(_)));

        let err = format_source(&Formatters::default(), root.path(), &request("rust", "fn main(){}"))
            .await
            .unwrap_err();
        assert!(matches!(err, FormatError::Unsupported(_)));
    }
}
