//! Code generation collaborators.
//!
//! A generator reads one schema file and writes generated sources into an
//! output directory, or reports why it could not.

use std::path::Path;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::GenerationError;

/// Generator program invoked when none is configured.
pub const DEFAULT_PROGRAM: &str = "prisma-to-code";

const MAX_ERROR_LEN: usize = 4096;

/// `generate(input, output_dir) -> success | error`.
///
/// Implementations must only write below `output_dir`. Errors are final:
/// the job is failed with the message and never retried.
pub trait Generator: Send + Sync {
    fn generate(&self, input: &Path, output_dir: &Path) -> Result<(), GenerationError>;
}

impl<F> Generator for F
where
    F: Fn(&Path, &Path) -> Result<(), GenerationError> + Send + Sync,
{
    fn generate(&self, input: &Path, output_dir: &Path) -> Result<(), GenerationError> {
        self(input, output_dir)
    }
}

/// Runs an external program as `<program> <args..> <input> <output_dir>`.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for CommandGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM, Vec::<String>::new())
    }
}

impl Generator for CommandGenerator {
    fn generate(&self, input: &Path, output_dir: &Path) -> Result<(), GenerationError> {
        debug!(program = %self.program, "Running generator");

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(input)
            .arg(output_dir)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                GenerationError::new(format!(
                    "failed to start generator '{}': {}",
                    self.program, e
                ))
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();

        // No exit code: the process was killed (OOM killer, SIGKILL, segfault)
        // and never got to report anything.
        let Some(code) = output.status.code() else {
            let message = if stderr.is_empty() {
                "generator was terminated by a signal".to_string()
            } else {
                format!("generator was terminated by a signal: {}", truncate(stderr, MAX_ERROR_LEN))
            };
            return Err(GenerationError::crashed(message));
        };

        let message = if stderr.is_empty() {
            format!("generator exited with status {}", code)
        } else {
            truncate(stderr, MAX_ERROR_LEN)
        };
        Err(GenerationError::new(message))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
