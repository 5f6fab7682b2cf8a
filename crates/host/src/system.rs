//! External command execution.
//!
//! Every package-manager, service-manager, config-checker and certbot call
//! goes through [`CommandRunner`]. Commands run one at a time; while one is
//! in flight the runner emits progress ticks, enforces a timeout, and kills
//! the child on Ctrl-C so the caller can roll back.

use crate::interrupt::Interrupt;
use async_trait::async_trait;
use sitekeeper_common::{Result, SiteError};
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
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
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }

    /// Last `lines` non-blank lines of stderr, or of stdout when stderr is empty.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let kept: Vec<&str> = source
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.trim().is_empty())
            .collect();
        let start = kept.len().saturating_sub(lines);
        kept[start..].join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started { command: String },
    Tick { command: String, elapsed: Duration },
    Finished { command: String, elapsed: Duration, success: bool },
}

pub type ProgressFn = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a command to completion. A non-zero exit is not an error here;
    /// spawn failures, timeouts and interrupts are.
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;

    /// Like [`CommandRunner::run`] but a non-zero exit becomes `ExternalCommandFailed`.
    async fn run_checked(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(cmd).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(SiteError::command_failed(
                cmd.to_string(),
                output.code,
                output.stderr_tail(5),
            ))
        }
    }
}

pub struct SystemRunner {
    timeout: Duration,
    progress: Option<ProgressFn>,
    interrupt: Interrupt,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            progress: None,
            interrupt: Interrupt::new(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress(&event);
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let label = cmd.to_string();
        self.interrupt.check()?;
        debug!(command = %label, "running command");

        let child = Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    SiteError::MissingDependency(format!("{} is not installed", cmd.program))
                }
                _ => SiteError::Io(err),
            })?;

        let started = Instant::now();
        self.emit(ProgressEvent::Started {
            command: label.clone(),
        });

        let output = child.wait_with_output();
        let deadline = sleep(self.timeout);
        let interrupted = self.interrupt.triggered();
        tokio::pin!(output, deadline, interrupted);

        let mut ticker = interval(Duration::from_secs(1));
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut output => {
                    let output = result?;
                    let code = output.status.code().unwrap_or(-1);
                    let elapsed = started.elapsed();
                    self.emit(ProgressEvent::Finished {
                        command: label.clone(),
                        elapsed,
                        success: code == 0,
                    });
                    info!(
                        command = %label,
                        code,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "command finished"
                    );
                    return Ok(CommandOutput {
                        code,
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    });
                }
                _ = ticker.tick() => {
                    self.emit(ProgressEvent::Tick {
                        command: label.clone(),
                        elapsed: started.elapsed(),
                    });
                }
                _ = &mut deadline => {
                    self.emit(ProgressEvent::Finished {
                        command: label.clone(),
                        elapsed: started.elapsed(),
                        success: false,
                    });
                    warn!(command = %label, timeout_secs = self.timeout.as_secs(), "command timed out, killing");
                    return Err(SiteError::command_failed(
                        label,
                        -1,
                        format!("timed out after {} seconds", self.timeout.as_secs()),
                    ));
                }
                _ = &mut interrupted => {
                    self.emit(ProgressEvent::Finished {
                        command: label.clone(),
                        elapsed: started.elapsed(),
                        success: false,
                    });
                    warn!(command = %label, "interrupted, killing command");
                    return Err(SiteError::Interrupted);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_command_spec_display() {
        let cmd = CommandSpec::new("systemctl")
            .arg("reload")
            .arg("nginx")
            .env("LANG", "C");
        assert_eq!(cmd.to_string(), "systemctl reload nginx");
    }

    #[test]
    fn test_stderr_tail_prefers_stderr() {
        let out = CommandOutput {
            code: 1,
            stdout: "ignored".to_string(),
            stderr: "a\n\nb\nc\n".to_string(),
        };
        assert_eq!(out.stderr_tail(2), "b\nc");

        let out = CommandOutput {
            code: 1,
            stdout: "only stdout\n".to_string(),
            stderr: "  \n".to_string(),
        };
        assert_eq!(out.stderr_tail(5), "only stdout");
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner::new(Duration::from_secs(5));
        let out = runner
            .run(&CommandSpec::new("sh").arg("-c").arg("echo out; echo err >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_checked_maps_non_zero_exit() {
        let runner = SystemRunner::new(Duration::from_secs(5));
        let err = runner
            .run_checked(&CommandSpec::new("sh").arg("-c").arg("echo boom >&2; exit 2"))
            .await
            .unwrap_err();
        match err {
            SiteError::ExternalCommandFailed { code, stderr_tail, .. } => {
                assert_eq!(code, 2);
                assert_eq!(stderr_tail, "boom");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_missing_dependency() {
        let runner = SystemRunner::new(Duration::from_secs(5));
        let err = runner
            .run(&CommandSpec::new("definitely-not-a-real-binary-sitekeeper"))
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::MissingDependency(_)));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let runner = SystemRunner::new(Duration::from_secs(1));
        let started = Instant::now();
        let err = runner
            .run(&CommandSpec::new("sleep").arg("10"))
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::ExternalCommandFailed { code: -1, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_interrupt_kills_running_command() {
        let interrupt = Interrupt::new();
        let runner = SystemRunner::new(Duration::from_secs(30)).with_interrupt(interrupt.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            interrupt.trigger();
        });

        let started = Instant::now();
        let err = runner
            .run(&CommandSpec::new("sleep").arg("10"))
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_interrupt_still_applies_after_earlier_commands() {
        let interrupt = Interrupt::new();
        let runner = SystemRunner::new(Duration::from_secs(5)).with_interrupt(interrupt.clone());
        runner.run(&CommandSpec::new("true")).await.unwrap();

        interrupt.trigger();
        let err = runner.run(&CommandSpec::new("true")).await.unwrap_err();
        assert!(matches!(err, SiteError::Interrupted));
    }

    #[tokio::test]
    async fn test_progress_events_bracket_command() {
        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let runner = SystemRunner::new(Duration::from_secs(5)).with_progress(Arc::new(move |e: &ProgressEvent| {
            sink.lock().unwrap().push(e.clone());
        }));
        runner.run(&CommandSpec::new("true")).await.unwrap();

        let events = events.lock().unwrap();
        assert!(matches!(events.first(), Some(ProgressEvent::Started { .. })));
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Finished { success: true, .. })
        ));
    }
}
