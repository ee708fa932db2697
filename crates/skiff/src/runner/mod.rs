//! Process runners: launch, wait on, signal, and tear down the plugin
//! process, and surface its stdio as streams.
//!
//! Two variants share one interface: `CommandRunner` owns a subprocess it
//! spawned, `AttachedRunner` binds to an already-running process described
//! by a `ReattachConfig`.

mod attached;
mod command;

pub use attached::AttachedRunner;
pub use command::{CommandRunner, CommandSpec};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::Result;
use crate::handshake::Protocol;
use crate::transport::Endpoint;

/// A captured child stdio stream.
pub type ChildStream = Box<dyn AsyncRead + Send + Unpin>;

/// Interface between the supervisor and the plugin process.
///
/// `start` must be called before anything else; `wait` may be called once
/// and blocks until the process exits; `kill` is idempotent with respect to
/// "process already gone". Stdio streams must be taken before `start`
/// returns control to concurrent readers and fully drained to avoid pipe
/// deadlocks.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn start(&self) -> Result<()>;

    /// Block until the process exits. Callable at most once.
    async fn wait(&self) -> Result<()>;

    /// Force the process to stop. Not an error if it is already gone.
    async fn kill(&self) -> Result<()>;

    /// Take the child's stdout stream. `None` once taken, or for attached
    /// processes.
    fn take_stdout(&self) -> Option<ChildStream>;

    /// Take the child's stderr stream.
    fn take_stderr(&self) -> Option<ChildStream>;

    /// Human-readable name for log lines.
    fn name(&self) -> String;

    /// Process id, once started.
    fn pid(&self) -> Option<u32>;

    /// Best-effort explanation of why the plugin might have failed to
    /// start, attached to handshake errors.
    async fn diagnose(&self) -> String;

    /// Translate an address the plugin announced into one the host can
    /// dial. Identity for local subprocesses.
    fn plugin_to_host(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        Ok(endpoint.clone())
    }

    /// Translate a host address into one the plugin can dial.
    fn host_to_plugin(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        Ok(endpoint.clone())
    }
}

/// Persisted coordinates for reconnecting to a running plugin without
/// spawning a new process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReattachConfig {
    pub protocol: Protocol,
    pub endpoint: Endpoint,
    pub pid: u32,
    /// The user protocol version the plugin negotiated when it started.
    pub user_version: u32,
    /// Set when the plugin was served in test mode (in-process serving;
    /// the pid is the test process itself).
    #[serde(default)]
    pub test: bool,
    /// Opt-in: the attaching host owns the process and `kill` may signal
    /// it. Off by default; reattached plugins usually outlive their hosts.
    #[serde(default)]
    pub owned: bool,
}

/// Check whether a process exists. A zero-signal probe on POSIX.
pub(crate) fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        // Conservative fallback; attached runners are Unix-first.
        let _ = pid;
        true
    }
}

/// Send SIGKILL, treating "no such process" as success.
#[cfg(unix)]
pub(crate) fn kill_process(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(crate::error::SkiffError::Other(format!(
            "failed to kill process {pid}: {e}"
        ))),
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_process(_pid: u32) -> Result<()> {
    Ok(())
}
