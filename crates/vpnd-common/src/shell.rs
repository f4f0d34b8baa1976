//! External helper invocation.
//!
//! Every privileged change the daemon makes (routes, firewall rules, DNS,
//! tunnel engines) goes through a helper binary. Commands are always built
//! from an argument vector and never passed through a shell interpreter.
//! Secret values registered with [`ShellCommand::hide`] are replaced with
//! `***` in every log line.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

/// Grace period between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Buffered output lines per spawned process.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Replacement for hidden values in logs.
const REDACTED: &str = "***";

// ============================================================================
// Errors
// ============================================================================

/// Failure modes of a helper invocation.
#[derive(Debug, Error)]
pub enum ShellError {
    /// The helper could not be started at all.
    #[error("failed to start '{program}': {source}")]
    SpawnError {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The helper ran and exited with a non-zero code.
    #[error("'{program}' exited with code {code}: {stderr}")]
    NonZeroExit {
        program: String,
        code: i32,
        stderr: String,
    },

    /// The helper was terminated by a signal or by our timeout.
    #[error("'{program}' was killed")]
    Killed { program: String },

    /// I/O with a running helper failed.
    #[error("I/O error talking to '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ShellError {
    /// Name of the helper the error refers to.
    pub fn program(&self) -> &str {
        match self {
            ShellError::SpawnError { program, .. }
            | ShellError::NonZeroExit { program, .. }
            | ShellError::Killed { program }
            | ShellError::Io { program, .. } => program,
        }
    }

    /// Exit code, when the helper ran to completion.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ShellError::NonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

// ============================================================================
// Command description
// ============================================================================

/// A helper invocation: program, argument vector, environment and optional stdin.
#[derive(Clone, Default)]
pub struct ShellCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    hidden: Vec<String>,
    timeout: Option<Duration>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Command for a configured helper path.
    pub fn tool(path: &Path) -> Self {
        Self::new(path.to_string_lossy())
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Bytes written to the helper's stdin before it is awaited.
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Register a value that must never appear in logs.
    pub fn hide(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.hidden.push(secret);
        }
        self
    }

    /// Kill the helper if it has not exited after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_stdin(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Command line with hidden values masked.
    pub fn redacted(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        redact(&line, &self.hidden)
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(OsString::from));
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

impl fmt::Debug for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Replace every occurrence of each hidden value with `***`.
pub fn redact(text: &str, hidden: &[String]) -> String {
    let mut out = text.to_string();
    for secret in hidden {
        if !secret.is_empty() {
            out = out.replace(secret.as_str(), REDACTED);
        }
    }
    out
}

/// Captured result of a finished helper.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` if the helper was terminated by a signal.
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            code: Some(0),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            code: Some(code),
        }
    }

    /// stderr, or stdout when stderr is empty (netsh reports errors on stdout).
    pub fn error_text(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        }
    }

    /// Convert a non-zero exit into [`ShellError`].
    pub fn into_result(self, program: &str) -> Result<CommandOutput, ShellError> {
        match self.code {
            Some(0) => Ok(self),
            Some(code) => Err(ShellError::NonZeroExit {
                program: program.to_string(),
                code,
                stderr: self.error_text(),
            }),
            None => Err(ShellError::Killed {
                program: program.to_string(),
            }),
        }
    }
}

// ============================================================================
// Long-running processes
// ============================================================================

/// One line produced by a spawned helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => s,
        }
    }
}

enum ProcessControl {
    Child(Child),
    Scripted(Option<oneshot::Receiver<i32>>),
}

/// A spawned helper whose stdout/stderr are streamed line by line.
pub struct ProcessHandle {
    program: String,
    pid: Option<u32>,
    lines: mpsc::Receiver<OutputLine>,
    control: ProcessControl,
    exit: Option<Option<i32>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Next output line, or `None` once both streams have closed.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    /// Move the output stream out, e.g. to a monitoring task.
    ///
    /// Later calls to [`next_line`](Self::next_line) return `None`.
    pub fn take_lines(&mut self) -> mpsc::Receiver<OutputLine> {
        let (_, closed) = mpsc::channel(1);
        std::mem::replace(&mut self.lines, closed)
    }

    /// Wait for the helper to exit. Returns its exit code (`None` when signalled).
    pub async fn wait(&mut self) -> Result<Option<i32>, ShellError> {
        if let Some(code) = self.exit {
            return Ok(code);
        }
        let code = match &mut self.control {
            ProcessControl::Child(child) => {
                let status = child.wait().await.map_err(|source| ShellError::Io {
                    program: self.program.clone(),
                    source,
                })?;
                exit_code(status)
            }
            ProcessControl::Scripted(rx) => match rx.as_mut() {
                // Cleared only once resolved so a cancelled wait can be retried.
                Some(pending) => {
                    let code = pending.await.ok();
                    *rx = None;
                    code
                }
                None => None,
            },
        };
        self.exit = Some(code);
        Ok(code)
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> Option<Option<i32>> {
        if self.exit.is_some() {
            return self.exit;
        }
        let code = match &mut self.control {
            ProcessControl::Child(child) => match child.try_wait() {
                Ok(Some(status)) => Some(exit_code(status)),
                _ => None,
            },
            ProcessControl::Scripted(rx) => match rx.as_mut().map(|r| r.try_recv()) {
                Some(Ok(code)) => Some(Some(code)),
                Some(Err(oneshot::error::TryRecvError::Closed)) => Some(None),
                _ => None,
            },
        };
        if code.is_some() {
            self.exit = code;
        }
        code
    }

    /// SIGTERM, then SIGKILL if still running after `grace`.
    pub async fn kill(&mut self, grace: Duration) -> Result<(), ShellError> {
        if self.exit.is_some() {
            return Ok(());
        }
        match &mut self.control {
            ProcessControl::Child(child) => {
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    // SAFETY: plain syscall on a pid we own.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                    if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                        self.exit = Some(exit_code(status));
                        log::debug!("'{}' stopped after SIGTERM", self.program);
                        return Ok(());
                    }
                }
                #[cfg(not(unix))]
                let _ = grace;
                log::warn!("Killing '{}'", self.program);
                child.kill().await.map_err(|source| ShellError::Io {
                    program: self.program.clone(),
                    source,
                })?;
                self.exit = Some(None);
                Ok(())
            }
            ProcessControl::Scripted(rx) => {
                rx.take();
                self.exit = Some(None);
                Ok(())
            }
        }
    }

    /// Build a handle driven by a test script instead of a real process.
    pub fn scripted(program: impl Into<String>) -> (Self, ScriptedProcess) {
        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        let handle = Self {
            program: program.into(),
            pid: None,
            lines: line_rx,
            control: ProcessControl::Scripted(Some(exit_rx)),
            exit: None,
        };
        (
            handle,
            ScriptedProcess {
                lines: Some(line_tx),
                exit: Some(exit_tx),
            },
        )
    }
}

/// Test-side controller for [`ProcessHandle::scripted`].
pub struct ScriptedProcess {
    lines: Option<mpsc::Sender<OutputLine>>,
    exit: Option<oneshot::Sender<i32>>,
}

impl ScriptedProcess {
    pub async fn stdout(&self, line: &str) {
        if let Some(tx) = &self.lines {
            let _ = tx.send(OutputLine::Stdout(line.to_string())).await;
        }
    }

    pub async fn stderr(&self, line: &str) {
        if let Some(tx) = &self.lines {
            let _ = tx.send(OutputLine::Stderr(line.to_string())).await;
        }
    }

    /// Close the output streams and report `code` as the exit status.
    pub fn exit(&mut self, code: i32) {
        self.lines.take();
        if let Some(tx) = self.exit.take() {
            let _ = tx.send(code);
        }
    }
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal().is_some() {
            return None;
        }
    }
    status.code()
}

// ============================================================================
// Runner abstraction
// ============================================================================

/// Executes helper commands.
///
/// Components take an `Arc<dyn CommandRunner>` so tests can substitute
/// [`ScriptedRunner`] for the real process runner.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output. Non-zero exit is not an error here.
    async fn output(&self, cmd: &ShellCommand) -> Result<CommandOutput, ShellError>;

    /// Start a long-running helper with streamed output.
    async fn spawn(&self, cmd: &ShellCommand) -> Result<ProcessHandle, ShellError>;

    /// Run to completion; a non-zero exit becomes [`ShellError::NonZeroExit`].
    async fn exec(&self, cmd: &ShellCommand) -> Result<CommandOutput, ShellError> {
        let out = self.output(cmd).await?;
        out.into_result(cmd.program())
    }
}

/// Runs helpers as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn shared() -> Arc<dyn CommandRunner> {
        Arc::new(ProcessRunner)
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn output(&self, cmd: &ShellCommand) -> Result<CommandOutput, ShellError> {
        log::info!("Shell exec: {}", cmd.redacted());

        let mut command = cmd.to_command();
        command
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| ShellError::SpawnError {
            program: cmd.program.clone(),
            source,
        })?;

        if let Some(data) = &cmd.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(data)
                    .await
                    .map_err(|source| ShellError::Io {
                        program: cmd.program.clone(),
                        source,
                    })?;
                // Dropping stdin closes the pipe so the helper sees EOF.
            }
        }

        let waited = child.wait_with_output();
        let output = match cmd.timeout {
            Some(limit) => match tokio::time::timeout(limit, waited).await {
                Ok(res) => res,
                Err(_) => {
                    log::warn!("'{}' timed out after {:?}", cmd.program, limit);
                    return Err(ShellError::Killed {
                        program: cmd.program.clone(),
                    });
                }
            },
            None => waited.await,
        }
        .map_err(|source| ShellError::Io {
            program: cmd.program.clone(),
            source,
        })?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: exit_code(output.status),
        };
        if !result.success() {
            log::debug!(
                "'{}' exited with {:?}: {}",
                cmd.program,
                result.code,
                redact(&result.error_text(), &cmd.hidden)
            );
        }
        Ok(result)
    }

    async fn spawn(&self, cmd: &ShellCommand) -> Result<ProcessHandle, ShellError> {
        log::info!("Shell start: {}", cmd.redacted());

        let mut command = cmd.to_command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| ShellError::SpawnError {
            program: cmd.program.clone(),
            source,
        })?;

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                // Drain even with no receiver; a full pipe would stall the helper.
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx.send(OutputLine::Stdout(line)).await;
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                // Drain even with no receiver; a full pipe would stall the helper.
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx.send(OutputLine::Stderr(line)).await;
                }
            });
        }

        Ok(ProcessHandle {
            program: cmd.program.clone(),
            pid: child.id(),
            lines: rx,
            control: ProcessControl::Child(child),
            exit: None,
        })
    }
}

// ============================================================================
// Scripted runner for tests
// ============================================================================

type Matcher = Box<dyn Fn(&ShellCommand) -> bool + Send + Sync>;

struct Rule {
    matcher: Matcher,
    responses: VecDeque<CommandOutput>,
    sticky: CommandOutput,
}

/// Records every command and answers from a response table.
///
/// Unmatched commands succeed with empty output. A rule answers from its
/// queue first and then repeats its last response.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    inner: Arc<Mutex<ScriptedState>>,
}

#[derive(Default)]
struct ScriptedState {
    rules: Vec<Rule>,
    history: Vec<ShellCommand>,
    spawned: VecDeque<ProcessHandle>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Arc<dyn CommandRunner> {
        Arc::new(self.clone())
    }

    /// Answer commands whose program and leading args match.
    pub fn on(&self, program: &str, args_prefix: &[&str], output: CommandOutput) {
        self.on_sequence(program, args_prefix, vec![output]);
    }

    /// Answer successive matching commands with successive outputs.
    pub fn on_sequence(&self, program: &str, args_prefix: &[&str], outputs: Vec<CommandOutput>) {
        let program = program.to_string();
        let prefix: Vec<String> = args_prefix.iter().map(|s| s.to_string()).collect();
        self.on_match(
            move |cmd| {
                cmd.program() == program
                    && cmd.get_args().len() >= prefix.len()
                    && cmd.get_args()[..prefix.len()] == prefix[..]
            },
            outputs,
        );
    }

    /// Answer commands selected by an arbitrary predicate.
    pub fn on_match<F>(&self, matcher: F, outputs: Vec<CommandOutput>)
    where
        F: Fn(&ShellCommand) -> bool + Send + Sync + 'static,
    {
        let sticky = outputs.last().cloned().unwrap_or_default();
        let mut state = self.lock();
        // Newer rules take precedence.
        state.rules.insert(
            0,
            Rule {
                matcher: Box::new(matcher),
                responses: outputs.into(),
                sticky,
            },
        );
    }

    /// Queue a handle returned by the next `spawn`.
    pub fn push_spawn(&self, handle: ProcessHandle) {
        self.lock().spawned.push_back(handle);
    }

    /// Every command seen so far.
    pub fn history(&self) -> Vec<ShellCommand> {
        self.lock().history.clone()
    }

    /// Every command rendered as `program arg arg`.
    pub fn lines(&self) -> Vec<String> {
        self.lock().history.iter().map(|c| c.redacted()).collect()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn output(&self, cmd: &ShellCommand) -> Result<CommandOutput, ShellError> {
        let mut state = self.lock();
        state.history.push(cmd.clone());
        for rule in state.rules.iter_mut() {
            if (rule.matcher)(cmd) {
                return Ok(rule
                    .responses
                    .pop_front()
                    .unwrap_or_else(|| rule.sticky.clone()));
            }
        }
        Ok(CommandOutput::ok(""))
    }

    async fn spawn(&self, cmd: &ShellCommand) -> Result<ProcessHandle, ShellError> {
        let mut state = self.lock();
        state.history.push(cmd.clone());
        state
            .spawned
            .pop_front()
            .ok_or_else(|| ShellError::SpawnError {
                program: cmd.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no scripted process"),
            })
    }
}
