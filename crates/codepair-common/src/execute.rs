//! Code execution backends.
//!
//! Execution never fails past this boundary: spawn errors, timeouts and
//! non-zero exits all come back as an [`ExecutionResult`] with `error` set.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use smol_str::SmolStr;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use web_time::Instant;

use crate::config::ClientConfig;
use crate::session::{ExecutionResult, Language};

const NO_OUTPUT: &str = "No output";
const PREVIEW_CHARS: usize = 100;
// Both interpreters read the program from stdin with `-`.
const STDIN_ARGS: &[&str] = &["-"];

/// Runs source text for a language tag.
pub trait ExecutionSandbox: Send + Sync + 'static {
    fn execute(
        &self,
        code: &str,
        language: &Language,
    ) -> impl Future<Output = ExecutionResult> + Send;
}

/// Echoes a preview of the code instead of running it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedSandbox;

impl SimulatedSandbox {
    fn render(code: &str, language: &Language) -> String {
        let preview: String = code.chars().take(PREVIEW_CHARS).collect();
        format!(
            "[Simulated {} Output]\nExecution for {} is simulated.\nCode received:\n{}...",
            language.display_name(),
            language,
            preview
        )
    }
}

impl ExecutionSandbox for SimulatedSandbox {
    async fn execute(&self, code: &str, language: &Language) -> ExecutionResult {
        let started = Instant::now();
        let output = Self::render(code, language);
        ExecutionResult::success(output, elapsed_ms(started))
    }
}

/// Runs supported languages in a local interpreter process.
///
/// Python goes to `python3`, JavaScript to `node`; both read the program from
/// stdin. Other tags fall back to [`SimulatedSandbox`].
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    pub timeout: Duration,
    pub max_code_length: usize,
    pub python: SmolStr,
    pub node: SmolStr,
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_code_length: 10_000,
            python: "python3".into(),
            node: "node".into(),
        }
    }
}

impl ProcessSandbox {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            timeout: config.execution_timeout,
            max_code_length: config.max_code_length,
            ..Self::default()
        }
    }

    fn interpreter(&self, language: &Language) -> Option<(&str, &'static [&'static str])> {
        match language.as_str() {
            "python" => Some((self.python.as_str(), STDIN_ARGS)),
            "javascript" => Some((self.node.as_str(), STDIN_ARGS)),
            _ => None,
        }
    }

    async fn run(&self, program: &str, args: &[&str], code: &str) -> ExecutionResult {
        let started = Instant::now();

        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(program, error = %e, "failed to spawn interpreter");
                return ExecutionResult::failure(
                    "",
                    format!("failed to start {program}: {e}"),
                    elapsed_ms(started),
                );
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(code.as_bytes()).await {
                tracing::debug!(program, error = %e, "failed to write program to stdin");
            }
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return ExecutionResult::failure(
                    "",
                    format!("failed to run {program}: {e}"),
                    elapsed_ms(started),
                );
            }
            Err(_) => {
                return ExecutionResult::failure(
                    "",
                    format!("Execution timed out after {}s", self.timeout.as_secs()),
                    elapsed_ms(started),
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let error = if !output.status.success() {
            Some(if stderr.is_empty() {
                format!("process exited with {}", output.status)
            } else {
                stderr
            })
        } else if !stderr.is_empty() {
            Some(stderr)
        } else {
            None
        };

        ExecutionResult {
            output: if stdout.is_empty() {
                NO_OUTPUT.to_string()
            } else {
                stdout
            },
            error,
            duration_ms: elapsed_ms(started),
        }
    }
}

impl ExecutionSandbox for ProcessSandbox {
    async fn execute(&self, code: &str, language: &Language) -> ExecutionResult {
        let length = code.chars().count();
        if length > self.max_code_length {
            return ExecutionResult::failure(
                "",
                format!(
                    "Code exceeds maximum length of {} characters",
                    self.max_code_length
                ),
                0,
            );
        }

        match self.interpreter(language) {
            Some((program, args)) => {
                tracing::debug!(%language, program, "executing code");
                self.run(program, args, code).await
            }
            None => SimulatedSandbox.execute(code, language).await,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_output() {
        let result = SimulatedSandbox
            .execute("fn main() {}", &Language::new("rust"))
            .await;
        assert!(result.output.starts_with("[Simulated Rust Output]"));
        assert!(result.output.contains("fn main() {}"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_simulated_preview_is_truncated() {
        let code = "a".repeat(500);
        let result = SimulatedSandbox.execute(&code, &Language::new("go")).await;
        assert!(result.output.contains(&"a".repeat(100)));
        assert!(!result.output.contains(&"a".repeat(101)));
    }

    #[tokio::test]
    async fn test_too_long_is_an_error_result() {
        let sandbox = ProcessSandbox {
            max_code_length: 4,
            ..ProcessSandbox::default()
        };
        let result = sandbox.execute("print(1)", &Language::new("python")).await;
        assert!(result.is_error());
        assert!(result.error.unwrap().contains("maximum length of 4"));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_an_error_result() {
        let sandbox = ProcessSandbox {
            python: "codepair-no-such-interpreter".into(),
            ..ProcessSandbox::default()
        };
        let result = sandbox.execute("print(1)", &Language::new("python")).await;
        assert!(result.error.unwrap().starts_with("failed to start"));
    }

    #[tokio::test]
    async fn test_unsupported_language_falls_back() {
        let result = ProcessSandbox::default()
            .execute("SELECT 1;", &Language::new("sql"))
            .await;
        assert!(result.output.starts_with("[Simulated Sql Output]"));
    }
}
