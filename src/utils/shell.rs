// dbshuttle/src/utils/shell.rs
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;
use which::which;

use crate::errors::{ProtectorError, Result};

/// A fully specified external invocation: program, argument vector, extra
/// environment and an optional file piped to stdin.
///
/// Arguments are passed to the OS as-is; nothing is ever interpreted by a shell.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin_file: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    /// Program and arguments for log lines. Environment values are left out.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        if let Some(stdin) = &self.stdin_file {
            line.push_str(&format!(" < {}", stdin.display()));
        }
        line
    }
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_keys)
            .field("stdin_file", &self.stdin_file)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// One-line failure description used in error variants.
    pub fn failure_summary(&self) -> String {
        let status = self
            .code
            .map(|c| format!("exit code {}", c))
            .unwrap_or_else(|| "terminated by signal".to_string());
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            status
        } else {
            format!("{}: {}", status, stderr)
        }
    }
}

/// Runs external tools, blocking the calling task until they exit or the
/// configured timeout expires.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    timeout: Duration,
}

impl SubprocessRunner {
    pub fn new(timeout: Duration) -> Self {
        SubprocessRunner { timeout }
    }

    pub async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!("Running {}", spec.display());

        let stdin = match &spec.stdin_file {
            Some(path) => Stdio::from(std::fs::File::open(path).map_err(|e| {
                ProtectorError::FileNotFound(format!("{}: {}", path.display(), e))
            })?),
            None => Stdio::null(),
        };

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProtectorError::FailedShellCommand(format!(
                    "Failed to execute {}: {}",
                    spec.program, e
                ))
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                ProtectorError::FailedShellCommand(format!(
                    "Failed waiting for {}: {}",
                    spec.program, e
                ))
            })?,
            Err(_) => {
                return Err(ProtectorError::FailedShellCommand(format!(
                    "{} timed out after {} seconds",
                    spec.program,
                    self.timeout.as_secs()
                )));
            }
        };

        Ok(CommandOutput {
            code: output.status.code(),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Verifies once that external processes can be spawned at all and that the
/// required tools are on `PATH`.
pub struct ShellGuard;

impl ShellGuard {
    pub async fn verify(runner: &SubprocessRunner, binaries: &[&str]) -> Result<()> {
        let mut resolved = Vec::with_capacity(binaries.len());
        for binary in binaries {
            let path = find_executable(binary)?;
            resolved.push(path);
        }

        // Spawning the first tool proves process creation is permitted here.
        if let Some(first) = resolved.first() {
            let version = CommandSpec::new(first.to_string_lossy()).arg("--version");
            runner.run(&version).await.map_err(|e| {
                ProtectorError::ShellAccessDenied(format!("Cannot spawn processes: {}", e))
            })?;
        }
        debug!("Shell access verified for {:?}", binaries);
        Ok(())
    }
}

/// Finds an executable in the system PATH.
pub fn find_executable(binary: &str) -> Result<PathBuf> {
    if Path::new(binary).is_absolute() && Path::new(binary).is_file() {
        return Ok(PathBuf::from(binary));
    }
    which(binary).map_err(|_| {
        ProtectorError::ShellAccessDenied(format!(
            "{} executable not found in PATH. Please ensure the database client tools are installed and in your PATH.",
            binary
        ))
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner() -> SubprocessRunner {
        SubprocessRunner::new(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_run_captures_output_and_env() -> anyhow::Result<()> {
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg("echo \"$GREETING\"; echo oops >&2; exit 3")
            .env("GREETING", "hello");
        let output = runner().run(&spec).await?;

        assert!(!output.success);
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.failure_summary(), "exit code 3: oops");
        Ok(())
    }

    #[tokio::test]
    async fn test_arguments_are_not_shell_interpreted() -> anyhow::Result<()> {
        let spec = CommandSpec::new("echo").arg("db; rm -rf /").arg("$HOME");
        let output = runner().run(&spec).await?;
        assert_eq!(output.stdout.trim(), "db; rm -rf / $HOME");
        Ok(())
    }

    #[tokio::test]
    async fn test_stdin_is_read_from_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("in.sql");
        std::fs::write(&input, "select 1;\n")?;

        let output = runner().run(&CommandSpec::new("cat").stdin_from(&input)).await?;
        assert_eq!(output.stdout, "select 1;\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_is_reported_as_failed_shell_command() {
        let runner = SubprocessRunner::new(Duration::from_millis(100));
        let result = runner.run(&CommandSpec::new("sleep").arg("5")).await;
        assert!(matches!(result, Err(ProtectorError::FailedShellCommand(_))));
    }

    #[tokio::test]
    async fn test_guard_rejects_missing_binary() {
        let result = ShellGuard::verify(&runner(), &["definitely-not-a-dump-tool"]).await;
        assert!(matches!(result, Err(ProtectorError::ShellAccessDenied(_))));
    }

    #[test]
    fn test_display_leaves_out_environment() {
        let spec = CommandSpec::new("mysqldump")
            .arg("--host=db")
            .env("MYSQL_PWD", "secret");
        assert_eq!(spec.display(), "mysqldump --host=db");
        assert!(!format!("{:?}", spec).contains("secret"));
    }
}
