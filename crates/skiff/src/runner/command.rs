//! Runner for plugins launched as subprocesses.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{Result, SkiffError};

use super::{ChildStream, Runner};

/// A command to launch, kept separate from `tokio::process::Command` so the
/// supervisor can inspect and extend it (environment, hashing the binary)
/// before spawn.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Default)]
struct CommandState {
    pid: Option<u32>,
    exit_status: Option<std::process::ExitStatus>,
    started: bool,
    /// Held open for the child's lifetime. The plugin watches its stdin
    /// for EOF as a host-death signal, so this must only close when the
    /// runner goes away.
    stdin: Option<tokio::process::ChildStdin>,
}

/// Runs a plugin as a child process with piped stdio.
///
/// On Unix the child is moved into its own session so that signals
/// delivered to the host's terminal group do not reach it; only the
/// supervisor decides when the plugin dies.
pub struct CommandRunner {
    spec: CommandSpec,
    state: Mutex<CommandState>,
    child: tokio::sync::Mutex<Option<Child>>,
    stdout: Mutex<Option<ChildStream>>,
    stderr: Mutex<Option<ChildStream>>,
}

impl CommandRunner {
    pub fn new(spec: CommandSpec) -> Self {
        CommandRunner {
            spec,
            state: Mutex::new(CommandState::default()),
            child: tokio::sync::Mutex::new(None),
            stdout: Mutex::new(None),
            stderr: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Runner for CommandRunner {
    async fn start(&self) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if state.started {
                return Err(SkiffError::config("runner already started"));
            }
        }

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        unsafe {
            // New session: the child must not share the host's terminal
            // process group.
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        debug!(path = %self.spec.program.display(), args = ?self.spec.args, "starting plugin");

        let mut child = cmd.spawn().map_err(|e| SkiffError::Spawn {
            message: format!("failed to spawn {}", self.spec.program.display()),
            source: Some(e),
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        *self.stdout.lock().unwrap() = child
            .stdout
            .take()
            .map(|s| Box::new(s) as ChildStream);
        *self.stderr.lock().unwrap() = child
            .stderr
            .take()
            .map(|s| Box::new(s) as ChildStream);

        {
            let mut state = self.state.lock().unwrap();
            state.pid = pid;
            state.started = true;
            state.stdin = stdin;
        }
        *self.child.lock().await = Some(child);

        debug!(path = %self.spec.program.display(), pid, "plugin started");
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let mut child = match self.child.lock().await.take() {
            Some(c) => c,
            None => return Err(SkiffError::config("runner not started or already waited on")),
        };
        let status = child.wait().await?;
        debug!(pid = self.pid(), %status, "plugin exited");
        self.state.lock().unwrap().exit_status = Some(status);
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        let pid = match self.pid() {
            Some(pid) => pid,
            None => return Ok(()),
        };
        super::kill_process(pid)
    }

    fn take_stdout(&self) -> Option<ChildStream> {
        self.stdout.lock().unwrap().take()
    }

    fn take_stderr(&self) -> Option<ChildStream> {
        self.stderr.lock().unwrap().take()
    }

    fn name(&self) -> String {
        self.spec.program.display().to_string()
    }

    fn pid(&self) -> Option<u32> {
        self.state.lock().unwrap().pid
    }

    async fn diagnose(&self) -> String {
        let path = &self.spec.program;
        let mut notes = Vec::new();

        match std::fs::metadata(path) {
            Err(_) => notes.push(format!("the plugin binary was not found at {}", path.display())),
            Ok(meta) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if meta.permissions().mode() & 0o111 == 0 {
                        notes.push(format!("{} is not executable", path.display()));
                    }
                }
                let _ = meta;
                if let Ok(mut file) = std::fs::File::open(path) {
                    use std::io::Read;
                    let mut head = [0u8; 2];
                    if file.read_exact(&mut head).is_ok() && &head == b"#!" {
                        notes.push(
                            "the plugin is a script; ensure its interpreter line is valid"
                                .to_string(),
                        );
                    }
                }
            }
        }

        if let Some(status) = self.state.lock().unwrap().exit_status {
            notes.push(format!("plugin exited with {status}"));
        }

        notes.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_spawn_wait_and_capture() {
        let spec = CommandSpec::new("/bin/sh")
            .arg("-c")
            .arg("echo out; echo err >&2");
        let runner = CommandRunner::new(spec);
        runner.start().await.unwrap();
        assert!(runner.pid().is_some());

        let mut stdout = runner.take_stdout().unwrap();
        let mut stderr = runner.take_stderr().unwrap();
        runner.wait().await.unwrap();

        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "out\n");

        let mut err = String::new();
        stderr.read_to_string(&mut err).await.unwrap();
        assert_eq!(err, "err\n");
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let runner = CommandRunner::new(CommandSpec::new("/nonexistent/plugin-binary"));
        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, SkiffError::Spawn { .. }));

        let diagnosis = runner.diagnose().await;
        assert!(diagnosis.contains("not found"));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let spec = CommandSpec::new("/bin/sh").arg("-c").arg("sleep 30");
        let runner = CommandRunner::new(spec);
        runner.start().await.unwrap();

        runner.kill().await.unwrap();
        runner.wait().await.unwrap();
        // Process is gone; killing again is not an error.
        runner.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_env_passed_to_child() {
        let spec = CommandSpec::new("/bin/sh")
            .arg("-c")
            .arg("printf '%s' \"$PLUGIN_COOKIE_TEST\"")
            .env("PLUGIN_COOKIE_TEST", "hello");
        let runner = CommandRunner::new(spec);
        runner.start().await.unwrap();
        let mut stdout = runner.take_stdout().unwrap();
        runner.wait().await.unwrap();

        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello");
    }
}
