//! corehost CLI - run one perform against a core.
//!
//! Reads the host configuration from `~/.corehost/config.toml`, one
//! `PerformRequest` as JSON on stdin, and prints the outcome as JSON on
//! stdout:
//!
//! ```text
//! {"ok": <result>}
//! {"error": {"kind": "domain", "value": <error>}}
//! {"error": {"kind": "validation", "code": "...", "message": "..."}}
//! {"error": {"kind": "unexpected", "category": "...", "message": "...", "requires_reload": bool}}
//! ```
//!
//! Logs go to `~/.corehost/logs/corehost.log`, never to stdout.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, stdin};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use corehost_adapters::config::data_dir;
use corehost_adapters::{HostConfig, config_path, native_services};
use corehost_runtime::CoreRuntime;
use corehost_types::{PerformError, PerformRequest};
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::try_new("warn").expect("warn filter is valid"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout carries the result, so no log file means no logs.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    vec![
        // Primary: ~/.corehost/logs/corehost.log
        data_dir().join("logs").join("corehost.log"),
        // Fallback: ./.corehost/logs/corehost.log
        PathBuf::from(".corehost").join("logs").join("corehost.log"),
    ]
}

fn render(outcome: Result<Value, PerformError>) -> Value {
    match outcome {
        Ok(result) => json!({ "ok": result }),
        Err(PerformError::Domain(err)) => json!({
            "error": { "kind": "domain", "value": err.value }
        }),
        Err(PerformError::Validation(err)) => json!({
            "error": { "kind": "validation", "code": err.code, "message": err.message }
        }),
        Err(PerformError::Unexpected(err)) => json!({
            "error": {
                "kind": "unexpected",
                "category": err.kind.to_string(),
                "message": err.message,
                "requires_reload": err.requires_reload(),
            }
        }),
    }
}

async fn run() -> Result<Value> {
    let config = HostConfig::load()?.unwrap_or_default();
    let Some(core_path) = config.core.resolved_path() else {
        let location = config_path().map_or_else(
            || "the host config".to_string(),
            |path| path.display().to_string(),
        );
        bail!("no core configured; set [core] path in {location}");
    };
    let core_path = core_path
        .to_str()
        .context("core path is not valid UTF-8")?
        .to_string();

    let mut input = String::new();
    stdin()
        .read_to_string(&mut input)
        .context("failed to read perform request from stdin")?;
    let request: PerformRequest =
        serde_json::from_str(&input).context("stdin is not a valid perform request")?;

    let runtime = CoreRuntime::new(native_services(&config)?, config.runtime.clone());
    runtime
        .load_core_from(&core_path)
        .await
        .with_context(|| format!("failed to load core from {core_path}"))?;

    let outcome = match runtime.init().await {
        Ok(()) => runtime.perform(request).await,
        Err(err) => Err(err),
    };
    if let Err(err) = runtime.destroy().await {
        tracing::warn!(error = %err, "core teardown failed");
    }
    Ok(render(outcome))
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(output) => {
            println!("{output}");
            if output.get("ok").is_some() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "corehost failed");
            eprintln!("Error: {err:?}");
            ExitCode::from(2)
        }
    }
}
