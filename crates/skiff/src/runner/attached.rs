//! Runner for plugins the host did not spawn.

use async_trait::async_trait;
use tracing::debug;

use crate::config::TimeoutConfig;
use crate::error::{Result, SkiffError};

use super::{ChildStream, ReattachConfig, Runner};

/// Binds to an already-running plugin process described by a
/// `ReattachConfig`.
///
/// The host does not own the process: `wait` degrades to a liveness poll
/// and `kill` is a no-op unless the config marks the process as ours (test
/// mode).
pub struct AttachedRunner {
    config: ReattachConfig,
}

impl AttachedRunner {
    pub fn new(config: ReattachConfig) -> Self {
        AttachedRunner { config }
    }

    pub fn config(&self) -> &ReattachConfig {
        &self.config
    }
}

#[async_trait]
impl Runner for AttachedRunner {
    async fn start(&self) -> Result<()> {
        if !super::process_alive(self.config.pid) {
            return Err(SkiffError::ProcessNotFound {
                pid: self.config.pid,
            });
        }
        debug!(pid = self.config.pid, "attached to running plugin");
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        // Not our child, so no wait(2); poll for liveness instead.
        loop {
            tokio::time::sleep(TimeoutConfig::ATTACH_POLL_INTERVAL).await;
            if !super::process_alive(self.config.pid) {
                debug!(pid = self.config.pid, "attached plugin is gone");
                return Ok(());
            }
        }
    }

    async fn kill(&self) -> Result<()> {
        if !self.config.owned {
            // We don't own the process; leave it running.
            return Ok(());
        }
        super::kill_process(self.config.pid)
    }

    fn take_stdout(&self) -> Option<ChildStream> {
        None
    }

    fn take_stderr(&self) -> Option<ChildStream> {
        None
    }

    fn name(&self) -> String {
        format!("reattached-{}", self.config.pid)
    }

    fn pid(&self) -> Option<u32> {
        Some(self.config.pid)
    }

    async fn diagnose(&self) -> String {
        if super::process_alive(self.config.pid) {
            String::new()
        } else {
            format!("process {} is no longer running", self.config.pid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::Protocol;
    use crate::transport::Endpoint;

    fn config(pid: u32) -> ReattachConfig {
        ReattachConfig {
            protocol: Protocol::RequestResponse,
            endpoint: Endpoint::tcp("127.0.0.1:1"),
            pid,
            user_version: 1,
            test: false,
            owned: false,
        }
    }

    #[tokio::test]
    async fn test_attach_to_self() {
        let runner = AttachedRunner::new(config(std::process::id()));
        runner.start().await.unwrap();
        assert_eq!(runner.pid(), Some(std::process::id()));
        assert!(runner.diagnose().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_attach_to_missing_process() {
        let runner = AttachedRunner::new(config(4_000_000_000 % (i32::MAX as u32)));
        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, SkiffError::ProcessNotFound { .. }));
    }

    #[tokio::test]
    async fn test_kill_is_noop_when_not_owned() {
        let runner = AttachedRunner::new(config(std::process::id()));
        // Must not signal our own test process.
        runner.kill().await.unwrap();
        assert!(super::super::process_alive(std::process::id()));
    }
}
