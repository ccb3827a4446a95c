//! # Command Gateway
//!
//! Authenticated dispatch of a closed set of remote commands.
//!
//! Authorization and dispatch are separate operations:
//!
//! 1. [`CommandGateway::authorize`] is a pure predicate over the presented
//!    bearer token.
//! 2. [`CommandGateway::grant`] turns a successful check into a [`Grant`], a
//!    value only this module can construct.
//! 3. [`CommandGateway::dispatch`] requires a `&Grant`, so a call site cannot
//!    reach an executor without having passed the check first.
//!
//! Adding a command means adding a [`CommandName`] variant and registering an
//! executor; neither touches the authorization path.
//!
//! Executor failures (spawn errors, timeouts, non-zero exits, panics) are
//! converted into [`CommandOutcome::Error`] here and never escape as faults.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// The shared bearer secret. Never empty; `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a configured secret. Surrounding whitespace is trimmed, matching
    /// how [`bearer_token`] reads the presented token. Empty or
    /// whitespace-only values yield `None`, which leaves the gateway rejecting
    /// every request.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Secret(trimmed.to_string()))
        }
    }

    /// Constant-time comparison against a presented token.
    pub fn matches(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
///
/// The scheme is matched case-insensitively; the token is returned verbatim
/// (surrounding whitespace trimmed). Any other scheme yields `None`.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// The enumerated set of commands the gateway recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    /// Run the organs' validation/test routine.
    RunTests,
}

impl CommandName {
    pub const ALL: &'static [CommandName] = &[CommandName::RunTests];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::RunTests => "run_tests",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `POST /execute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Result of a dispatch, serialized as `{"status": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandOutcome {
    Success { output: String },
    Error { message: String },
    UnknownCommand { command: String },
}

impl CommandOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            CommandOutcome::Success { .. } => "SUCCESS",
            CommandOutcome::Error { .. } => "ERROR",
            CommandOutcome::UnknownCommand { .. } => "UNKNOWN_COMMAND",
        }
    }
}

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

/// What an executor observed from the external action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub output: String,
}

impl ExecOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Failures that prevented an executor from producing an [`ExecOutput`].
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("{0}")]
    Other(String),
}

/// An external action the gateway may trigger.
pub trait CommandExecutor: Send + Sync {
    fn execute<'a>(&'a self, args: &'a [String]) -> BoxFuture<'a, Result<ExecOutput, ExecError>>;
}

/// Runs a local program and captures its combined output.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    base_args: Vec<String>,
    workdir: Option<PathBuf>,
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<String>, base_args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            base_args,
            workdir: None,
            timeout,
        }
    }

    pub fn workdir(mut self, dir: Option<PathBuf>) -> Self {
        self.workdir = dir;
        self
    }

    async fn run(&self, args: &[String]) -> Result<ExecOutput, ExecError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.base_args)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ExecError::Timeout {
                program: self.program.clone(),
                after: self.timeout,
            })?
            .map_err(|e| ExecError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecOutput {
            exit_code: output.status.code(),
            output: text,
        })
    }
}

impl CommandExecutor for ProcessExecutor {
    fn execute<'a>(&'a self, args: &'a [String]) -> BoxFuture<'a, Result<ExecOutput, ExecError>> {
        Box::pin(self.run(args))
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Proof that a request passed [`CommandGateway::authorize`].
#[derive(Debug)]
pub struct Grant {
    _private: (),
}

pub struct CommandGateway {
    secret: Option<Secret>,
    executors: HashMap<CommandName, Arc<dyn CommandExecutor>>,
}

impl CommandGateway {
    /// A gateway with no executors. `secret = None` rejects everything.
    pub fn new(secret: Option<Secret>) -> Self {
        Self {
            secret,
            executors: HashMap::new(),
        }
    }

    pub fn with_executor(mut self, name: CommandName, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executors.insert(name, executor);
        self
    }

    /// True iff a secret is configured and `presented` equals it.
    pub fn authorize(&self, presented: &str) -> bool {
        match &self.secret {
            Some(secret) => secret.matches(presented),
            None => false,
        }
    }

    /// Check the raw `Authorization` header value and mint a [`Grant`].
    pub fn grant(&self, authorization: Option<&str>) -> Option<Grant> {
        let token = bearer_token(authorization).unwrap_or("");
        if self.authorize(token) {
            Some(Grant { _private: () })
        } else {
            None
        }
    }

    /// Run an authorized command and report its outcome.
    pub async fn dispatch(&self, _grant: &Grant, request: &CommandRequest) -> CommandOutcome {
        let Some(name) = CommandName::parse(&request.command) else {
            info!(command = %request.command, "rejected unrecognized command");
            return CommandOutcome::UnknownCommand {
                command: request.command.clone(),
            };
        };

        let Some(executor) = self.executors.get(&name) else {
            warn!(command = %name, "no executor registered");
            return CommandOutcome::Error {
                message: format!("no executor registered for {name}"),
            };
        };

        info!(command = %name, args = request.args.len(), "dispatching command");
        let result = AssertUnwindSafe(executor.execute(&request.args))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(out)) if out.succeeded() => CommandOutcome::Success { output: out.output },
            Ok(Ok(out)) => {
                let status = out
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                warn!(command = %name, exit = %status, "command exited unsuccessfully");
                CommandOutcome::Error {
                    message: format!("{name} exited with status {status}\n{}", out.output),
                }
            }
            Ok(Err(e)) => {
                warn!(command = %name, error = %e, "command failed");
                CommandOutcome::Error {
                    message: e.to_string(),
                }
            }
            Err(_) => {
                warn!(command = %name, "command executor panicked");
                CommandOutcome::Error {
                    message: format!("{name} executor panicked"),
                }
            }
        }
    }
}

impl fmt::Debug for CommandGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandGateway")
            .field("secret", &self.secret)
            .field("commands", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}
