//! External-process delegates.
//!
//! A `CommandDelegate` runs a configured program, writes the invocation
//! payload to its stdin as JSON, and reads a `DelegateResponse` back from
//! stdout. The invoker owns timeouts; the child is killed if the invocation
//! future is dropped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::core::invocation::InvocationPayload;
use crate::delegate::traits::{Delegate, DelegateClass, DelegateResponse};
use crate::error::{Error, Result};
use crate::clog_debug;

/// One `[[delegates]]` entry in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateConfig {
    pub name: String,
    #[serde(default)]
    pub class: DelegateClass,
    /// Program followed by its arguments, whitespace separated.
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct CommandDelegate {
    name: String,
    class: DelegateClass,
    program: PathBuf,
    args: Vec<String>,
}

impl CommandDelegate {
    /// Resolve the program on `PATH` with `which`.
    pub fn from_config(config: &DelegateConfig) -> Result<Self> {
        let mut parts = config.command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            Error::Validation(format!("delegate {} has an empty command", config.name))
        })?;
        let program = which::which(program).map_err(|_| {
            Error::Validation(format!(
                "delegate {}: program '{}' not found",
                config.name, program
            ))
        })?;
        Ok(Self {
            name: config.name.clone(),
            class: config.class,
            program,
            args: parts.map(str::to_string).collect(),
        })
    }

    /// Use an explicit program path without a `PATH` lookup.
    pub fn with_program(name: &str, class: DelegateClass, program: PathBuf, args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            class,
            program,
            args,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Interpret a finished process. JSON on stdout wins over the exit code so
    /// a delegate can report a structured failure.
    fn parse_output(&self, status: std::process::ExitStatus, stdout: &str, stderr: &str) -> DelegateResponse {
        if let Ok(response) = serde_json::from_str::<DelegateResponse>(stdout.trim()) {
            return response;
        }
        if !status.success() {
            let message = if stderr.trim().is_empty() {
                format!(
                    "{} exited with code {}",
                    self.name,
                    status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return DelegateResponse::failure(message);
        }
        DelegateResponse::failure(format!("{} produced unparseable output", self.name))
    }
}

#[async_trait]
impl Delegate for CommandDelegate {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> DelegateClass {
        self.class
    }

    async fn execute(&self, payload: &InvocationPayload) -> Result<DelegateResponse> {
        clog_debug!(
            "CommandDelegate {} running {} for subtask {}",
            self.name,
            self.program.display(),
            payload.subtask
        );
        let input = serde_json::to_vec(payload)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(self.parse_output(output.status, &stdout, &stderr))
    }
}
