//! Out-of-process image work.
//!
//! The gateway never touches pixels itself. Each route binds to an
//! [`ExternalProcessor`], and the only production implementation,
//! [`CommandProcessor`], runs a program with the input path, output path and
//! route parameters as discrete argv entries. No shell is involved, so a
//! hostile filename or parameter stays one argument.

use std::{
    ffi::OsString,
    fmt,
    path::{Component, Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Captured output beyond this is truncated before it reaches the logs.
const MAX_CAPTURE_BYTES: usize = 16_000;

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited with {}", exit_description(.code))]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("`{program}` did not finish within {after:?}")]
    TimedOut { program: String, after: Duration },

    #[error("failed while waiting on `{program}`")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` reported success but wrote nothing to {}", .output.display())]
    MissingOutput { program: String, output: PathBuf },
}

impl ProcessError {
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ProcessError::Failed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (killed by signal)".to_string(),
    }
}

/// Capability to turn an input file into an output file.
#[async_trait]
pub trait ExternalProcessor: Send + Sync {
    /// Human readable name used in logs and errors.
    fn name(&self) -> String;

    async fn run(
        &self,
        input: &Path,
        output: &Path,
        params: &[String],
    ) -> Result<ProcessOutput, ProcessError>;
}

/// Runs `program [leading args..] <input> <output> [params..]`.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: OsString,
    leading_args: Vec<OsString>,
    timeout: Option<Duration>,
}

impl CommandProcessor {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            timeout: None,
        }
    }

    /// `python <script> ...`
    pub fn python_script(python: impl Into<OsString>, script: impl AsRef<Path>) -> Self {
        Self::new(python).arg(argument(script.as_ref()))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.leading_args.push(arg.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, input: &Path, output: &Path, params: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .arg(argument(input))
            .arg(argument(output))
            .args(params)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl fmt::Display for CommandProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.leading_args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExternalProcessor for CommandProcessor {
    fn name(&self) -> String {
        self.to_string()
    }

    async fn run(
        &self,
        input: &Path,
        output: &Path,
        params: &[String],
    ) -> Result<ProcessOutput, ProcessError> {
        let program = self.name();
        debug!(%program, input = %input.display(), output = %output.display(), ?params, "spawning");

        let child = self
            .command(input, output, params)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            })?;

        // dropping the wait future on expiry drops the child, which kills it
        let waited = child.wait_with_output();
        let result = match self.timeout {
            Some(after) => match tokio::time::timeout(after, waited).await {
                Ok(result) => result,
                Err(_) => return Err(ProcessError::TimedOut { program, after }),
            },
            None => waited.await,
        };
        let raw = result.map_err(|source| ProcessError::Io {
            program: program.clone(),
            source,
        })?;

        let captured = ProcessOutput {
            stdout: truncate_output(&String::from_utf8_lossy(&raw.stdout)),
            stderr: truncate_output(&String::from_utf8_lossy(&raw.stderr)),
        };

        if raw.status.success() {
            Ok(captured)
        } else {
            Err(ProcessError::Failed {
                program,
                code: raw.status.code(),
                stderr: captured.stderr,
            })
        }
    }
}

/// A relative path starting with `-` would be read as an option.
fn argument(path: &Path) -> OsString {
    match path.components().next() {
        Some(Component::Normal(first)) if first.to_string_lossy().starts_with('-') => {
            Path::new(".").join(path).into_os_string()
        }
        _ => path.as_os_str().to_owned(),
    }
}

fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_CAPTURE_BYTES {
        return output.to_string();
    }
    let mut end = MAX_CAPTURE_BYTES;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n[truncated: showing {}/{} bytes]",
        &output[..end],
        end,
        output.len()
    )
}
