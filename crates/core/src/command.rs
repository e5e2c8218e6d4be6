//! External-command processor.
//!
//! Runs one program invocation per job, e.g. a converter binary. Arguments
//! may reference the job through placeholders:
//! - `{input}`: the job identity (usually a path)
//! - `{param:NAME}`: the job parameter `NAME`; a missing parameter fails the job

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Instant;
use tracing::debug;

use crate::config::CommandConfig;
use crate::executor::{BlockingProcessor, Processor, ProcessorError};
use crate::job::Job;

static PARAM_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{param:([A-Za-z0-9_.\-]+)\}").unwrap());

/// Maximum number of stderr bytes kept in failure reports.
const STDERR_TAIL_BYTES: usize = 2048;

/// How to invoke the external program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to run (looked up on `PATH` if not absolute).
    pub program: String,
    /// Argument templates.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// A spec running `program {input}`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec!["{input}".to_string()],
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// Replaces the argument templates.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Expands the argument templates for a job.
    pub fn render_args(&self, job: &Job) -> Result<Vec<String>, ProcessorError> {
        self.args
            .iter()
            .map(|template| render(template, job))
            .collect()
    }
}

impl From<&CommandConfig> for CommandSpec {
    fn from(config: &CommandConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            working_dir: config.working_dir.clone(),
        }
    }
}

fn render(template: &str, job: &Job) -> Result<String, ProcessorError> {
    let mut missing = None;
    let rendered = PARAM_PLACEHOLDER.replace_all(template, |caps: &regex_lite::Captures<'_>| {
        let name = &caps[1];
        match job.param(name) {
            Some(value) => value.to_string(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    if let Some(name) = missing {
        return Err(ProcessorError::invalid_job(format!(
            "missing parameter '{}'",
            name
        )));
    }

    Ok(rendered.replace("{input}", &job.id))
}

/// Result of one program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (always 0 for successful outputs).
    pub exit_code: i32,
    /// Captured standard output, lossily decoded.
    pub stdout: String,
    /// Wall-clock runtime in milliseconds.
    pub duration_ms: u64,
}

/// Processor running a [`CommandSpec`] per job.
///
/// Usable both as an async [`Processor`] (the child is killed when the
/// execution is dropped) and as a [`BlockingProcessor`] (the child runs to
/// completion).
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    spec: CommandSpec,
}

impl CommandProcessor {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    fn std_command(&self, args: &[String]) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.spec.program);
        cmd.args(args)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> ProcessorError {
        ProcessorError::Spawn {
            program: self.spec.program.clone(),
            source: e,
        }
    }

    fn interpret(&self, output: Output, started: Instant) -> Result<CommandOutput, ProcessorError> {
        let duration_ms = started.elapsed().as_millis() as u64;
        if !output.status.success() {
            let stderr = stderr_tail(&output.stderr);
            let reason = match (output.status.code(), stderr.lines().last()) {
                (Some(code), Some(last)) => {
                    format!("{} exited with code {}: {}", self.spec.program, code, last)
                }
                (Some(code), None) => format!("{} exited with code {}", self.spec.program, code),
                (None, _) => format!("{} terminated by signal", self.spec.program),
            };
            return Err(ProcessorError::failed(
                reason,
                (!stderr.is_empty()).then_some(stderr),
            ));
        }

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(0),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            duration_ms,
        })
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

#[async_trait]
impl Processor for CommandProcessor {
    type Output = CommandOutput;

    fn name(&self) -> &str {
        &self.spec.program
    }

    async fn process(&self, job: &Job) -> Result<CommandOutput, ProcessorError> {
        let args = self.spec.render_args(job)?;
        debug!(job_id = %job.id, program = %self.spec.program, ?args, "Running command");

        let started = Instant::now();
        let mut cmd = tokio::process::Command::from(self.std_command(&args));
        let output = cmd
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        self.interpret(output, started)
    }
}

impl BlockingProcessor for CommandProcessor {
    type Output = CommandOutput;

    fn name(&self) -> &str {
        &self.spec.program
    }

    fn process_blocking(&self, job: &Job) -> Result<CommandOutput, ProcessorError> {
        let args = self.spec.render_args(job)?;
        debug!(job_id = %job.id, program = %self.spec.program, ?args, "Running blocking command");

        let started = Instant::now();
        let output = self
            .std_command(&args)
            .output()
            .map_err(|e| self.spawn_error(e))?;

        self.interpret(output, started)
    }
}
