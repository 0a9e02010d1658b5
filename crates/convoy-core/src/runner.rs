//! External command runner
//!
//! Every shell-out in the platform (compose engine, git, dump tools) goes
//! through this contract. The production runner wraps `tokio::process`;
//! tests script outcomes per command.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;

/// Command description
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program to execute
    pub program: String,
    /// Arguments in order
    pub args: Vec<String>,
    /// Working directory; inherited when unset
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Hard deadline for the whole invocation
    pub timeout: Duration,
}

impl CommandSpec {
    /// New spec with the default 30 s timeout
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Override the timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Render as a single display line
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured command output
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code; -1 when terminated by signal
    pub status: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited zero
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Command execution error
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// Program could not be spawned
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program name
        program: String,
        /// OS error text
        message: String,
    },
    /// Deadline elapsed before exit
    #[error("{program} timed out after {timeout:?}")]
    Timeout {
        /// Program name
        program: String,
        /// Configured deadline
        timeout: Duration,
    },
    /// Command exited non-zero
    #[error("{program} exited with status {status}: {stderr}")]
    Failed {
        /// Program name
        program: String,
        /// Exit code
        status: i32,
        /// Trailing stderr
        stderr: String,
    },
}

/// Executes external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, capturing output. Non-zero exit is returned as
    /// `Ok` with the status; callers decide whether that is an error.
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError>;

    /// Run and require a zero exit code
    async fn run_checked(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError> {
        let program = spec.program.clone();
        let output = self.run(spec).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(CommandError::Failed {
                program,
                status: output.status,
                stderr: tail(&output.stderr, 500),
            })
        }
    }
}

fn tail(s: &str, max: usize) -> String {
    let s = s.trim_end();
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

/// Production runner over `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError> {
        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        tracing::debug!(command = %spec.display(), "running external command");

        let child = command.output();
        let output = tokio::time::timeout(spec.timeout, child)
            .await
            .map_err(|_| CommandError::Timeout {
                program: spec.program.clone(),
                timeout: spec.timeout,
            })?
            .map_err(|e| CommandError::Spawn {
                program: spec.program.clone(),
                message: e.to_string(),
            })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Scripted outcome for one expected invocation prefix
#[derive(Debug, Clone)]
struct ScriptEntry {
    prefix: String,
    output: Result<CommandOutput, CommandError>,
}

/// Test runner that matches invocations against scripted prefixes.
///
/// The first entry whose prefix matches `program arg0 arg1 …` answers the
/// call; unmatched invocations succeed with empty output. Every invocation
/// is recorded for assertions.
#[derive(Default)]
pub struct ScriptedRunner {
    script: Mutex<Vec<ScriptEntry>>,
    invocations: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    /// Empty script: every command succeeds with empty output
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a successful outcome
    pub fn on(self, prefix: &str, stdout: &str) -> Self {
        self.script.lock().push(ScriptEntry {
            prefix: prefix.into(),
            output: Ok(CommandOutput {
                status: 0,
                stdout: stdout.into(),
                stderr: String::new(),
            }),
        });
        self
    }

    /// Script a non-zero exit
    pub fn on_fail(self, prefix: &str, status: i32, stderr: &str) -> Self {
        self.script.lock().push(ScriptEntry {
            prefix: prefix.into(),
            output: Ok(CommandOutput {
                status,
                stdout: String::new(),
                stderr: stderr.into(),
            }),
        });
        self
    }

    /// Script a runner-level error
    pub fn on_error(self, prefix: &str, error: CommandError) -> Self {
        self.script.lock().push(ScriptEntry {
            prefix: prefix.into(),
            output: Err(error),
        });
        self
    }

    /// Every invocation seen so far, as display lines
    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().clone()
    }

    /// Whether any invocation started with the prefix
    pub fn saw(&self, prefix: &str) -> bool {
        self.invocations.lock().iter().any(|line| line.starts_with(prefix))
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError> {
        let line = spec.display();
        self.invocations.lock().push(line.clone());
        let script = self.script.lock();
        for entry in script.iter() {
            if line.starts_with(&entry.prefix) {
                return entry.output.clone();
            }
        }
        Ok(CommandOutput {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}
