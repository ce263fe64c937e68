use crate::error::{Result, StagehandError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::Command;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs a named callable inside a running service.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn exec(&self, namespace: &str, service: &str, callable: &str) -> Result<ExecOutput>;
}

// ---------------------------------------------------------------------------
// CommandExecutor
// ---------------------------------------------------------------------------

/// Delegates to a local program invoked as
/// `<program> <namespace> <service> <callable>`.
pub struct CommandExecutor {
    program: Option<String>,
}

impl CommandExecutor {
    pub fn new(program: Option<String>) -> Self {
        Self { program }
    }
}

#[async_trait]
impl RemoteExecutor for CommandExecutor {
    async fn exec(&self, namespace: &str, service: &str, callable: &str) -> Result<ExecOutput> {
        let Some(program) = &self.program else {
            return Err(StagehandError::Exec(
                "no remote executor program is configured".to_string(),
            ));
        };

        let output = Command::new(program)
            .args([namespace, service, callable])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| StagehandError::Exec(format!("failed to spawn '{program}': {e}")))?;

        let out = ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !output.status.success() {
            return Err(StagehandError::Exec(format!(
                "'{callable}' on '{service}' exited with {}: {}",
                output.status.code().unwrap_or(-1),
                out.stderr.trim()
            )));
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

/// Replies with canned outputs keyed by service and records every call.
#[derive(Default)]
pub struct ScriptedExecutor {
    replies: BTreeMap<String, std::result::Result<ExecOutput, String>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, service: &str, stdout: &str, stderr: &str) -> Self {
        self.replies.insert(
            service.to_string(),
            Ok(ExecOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        );
        self
    }

    pub fn fail(mut self, service: &str, message: &str) -> Self {
        self.replies
            .insert(service.to_string(), Err(message.to_string()));
        self
    }

    /// `(service, callable)` pairs in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn exec(&self, _namespace: &str, service: &str, callable: &str) -> Result<ExecOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((service.to_string(), callable.to_string()));
        }
        match self.replies.get(service) {
            Some(Ok(out)) => Ok(out.clone()),
            Some(Err(msg)) => Err(StagehandError::Exec(msg.clone())),
            None => Ok(ExecOutput::default()),
        }
    }
}
