//! One-shot execution through an external Piston-compatible service.

use crate::workspace::Language;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub stdin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResponse {
    pub output: String,
    /// Wall time of the round trip, in seconds.
    pub run_time: f64,
}

fn file_name(language: &str) -> String {
    language
        .parse::<Language>()
        .map(|l| l.source_file_name())
        .unwrap_or_else(|_| "main.js".to_string())
}

fn payload(req: &RunRequest) -> Value {
    json!({
        "language": req.language,
        "version": "*",
        "files": [{ "name": file_name(&req.language), "content": req.code }],
        "stdin": req.stdin.clone().unwrap_or_default(),
    })
}

/// Forward `req` to `url`. Failures come back as text in `output`, never as an error.
pub async fn execute(client: &reqwest::Client, url: &str, req: &RunRequest) -> RunResponse {
    let started = Instant::now();
    info!(language = %req.language, "Proxying run request");
    let output = match forward(client, url, req).await {
        Ok(output) => output,
        Err(e) => {
            warn!("Proxy run failed: {}", e);
            format!("Error executing code: {}", e)
        }
    };
    RunResponse {
        output,
        run_time: started.elapsed().as_secs_f64(),
    }
}

async fn forward(client: &reqwest::Client, url: &str, req: &RunRequest) -> Result<String, reqwest::Error> {
    let result: Value = client
        .post(url)
        .json(&payload(req))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(result
        .get("run")
        .and_then(|run| run.get("output"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}
