//! Blocking subprocess execution for external tools.
//!
//! Provider crates build their command wrappers on top of `ExternalCommand` so
//! stdin handling, output capture, and the optional deadline live in one place.

use crate::error::{AutoUnlockError, AutoUnlockResult};
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Captured result of one invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stderr when present, otherwise stdout, trimmed.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// A resolved external binary with an optional per-call deadline.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    binary: PathBuf,
    timeout: Option<Duration>,
}

impl ExternalCommand {
    /// Calls block until the child exits.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: None,
        }
    }

    /// Calls are killed once `timeout` elapses.
    pub fn with_timeout(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout: Some(timeout),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run with `args`, streaming `input` on stdin when provided.
    pub fn run<S: AsRef<OsStr>>(
        &self,
        args: &[S],
        input: Option<&[u8]>,
    ) -> AutoUnlockResult<CommandOutput> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| {
            AutoUnlockError::Provider(format!(
                "failed to execute {}: {err}",
                self.binary.display()
            ))
        })?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(payload)?;
                stdin.flush().ok();
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait(child, stdout_pipe, stderr_pipe)
    }

    fn wait(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> AutoUnlockResult<CommandOutput> {
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);

        let exit_status = match self.timeout {
            None => child.wait()?,
            Some(timeout) => {
                let start = Instant::now();
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if start.elapsed() > timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(AutoUnlockError::Provider(format!(
                            "{} timed out after {:?}",
                            self.binary.display(),
                            timeout
                        )));
                    }
                    thread::sleep(Duration::from_millis(25));
                }
            }
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| AutoUnlockError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| AutoUnlockError::Provider("stderr reader thread panicked".into()))??;

        Ok(CommandOutput {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<AutoUnlockResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> AutoUnlockResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}
