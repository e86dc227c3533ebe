//! Registry of spawned external processes.
//!
//! Every child started through the registry is tracked by pid until it exits,
//! so shutdown can deliver SIGTERM to whatever is still running instead of
//! signalling a whole process group.

use std::collections::HashSet;
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Shared set of live child pids.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    pids: Arc<Mutex<HashSet<i32>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a command to completion and return its output, whatever the exit status.
    pub async fn output(&self, cmd: &mut Command) -> Result<Output> {
        let description = describe(cmd);
        debug!(command = %description, "Executing");

        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Command {
                program: description.clone(),
                source: e,
            })?;

        // The pid is only deregistered after the child has been reaped. A
        // `terminate_all` in that window signals a pid that may already be
        // reused; the window is a few instructions long and accepted.
        let pid = child.id().map(|p| p as i32);
        self.register(pid);
        let result = child.wait_with_output().await;
        self.deregister(pid);

        result.map_err(|e| Error::Command {
            program: description,
            source: e,
        })
    }

    /// Run a command and return its stdout. A non-zero exit is an error.
    pub async fn run(&self, cmd: &mut Command) -> Result<String> {
        let output = self.output(cmd).await?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: describe(cmd),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Spawn a long-running command with piped stdout.
    pub fn spawn(&self, cmd: &mut Command) -> Result<TrackedChild> {
        let description = describe(cmd);
        debug!(command = %description, "Spawning");

        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Command {
                program: description,
                source: e,
            })?;

        let pid = child.id().map(|p| p as i32);
        self.register(pid);
        Ok(TrackedChild {
            child,
            pid,
            registry: self.clone(),
        })
    }

    /// Send SIGTERM to every tracked process. Returns how many were signalled.
    pub fn terminate_all(&self) -> usize {
        let pids: Vec<i32> = self.lock().drain().collect();
        let mut signalled = 0;
        for pid in pids {
            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => {
                    debug!(pid, "Sent SIGTERM");
                    signalled += 1;
                }
                Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid, error = %e, "Failed to signal child process"),
            }
        }
        signalled
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, pid: Option<i32>) {
        if let Some(pid) = pid {
            self.lock().insert(pid);
        }
    }

    fn deregister(&self, pid: Option<i32>) {
        if let Some(pid) = pid {
            self.lock().remove(&pid);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<i32>> {
        // The set stays consistent even if a holder panicked.
        self.pids.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A child process that stays registered until dropped.
#[derive(Debug)]
pub struct TrackedChild {
    child: Child,
    pid: Option<i32>,
    registry: ProcessRegistry,
}

impl TrackedChild {
    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }
}

impl Drop for TrackedChild {
    fn drop(&mut self) {
        self.registry.deregister(self.pid);
    }
}

/// `program arg1 arg2 ...` for logs and errors.
fn describe(cmd: &Command) -> String {
    let std = cmd.as_std();
    std::iter::once(std.get_program())
        .chain(std.get_args())
        .map(|s| s.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let registry = ProcessRegistry::new();
        let out = registry
            .run(Command::new("sh").args(["-c", "echo hello"]))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_run_reports_failure() {
        let registry = ProcessRegistry::new();
        let err = registry
            .run(Command::new("sh").args(["-c", "echo boom >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { command, stderr } => {
                assert_eq!(command, "sh -c echo boom >&2; exit 3");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_finished_commands_are_not_signalled() {
        let registry = ProcessRegistry::new();
        for _ in 0..3 {
            registry.run(&mut Command::new("true")).await.unwrap();
        }
        registry
            .output(Command::new("sh").args(["-c", "exit 1"]))
            .await
            .unwrap();

        assert!(registry.is_empty());
        assert_eq!(registry.terminate_all(), 0);
    }

    #[tokio::test]
    async fn test_terminate_all_signals_tracked_children() {
        let registry = ProcessRegistry::new();
        let mut tracked = registry
            .spawn(Command::new("sleep").arg("30"))
            .unwrap();
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.terminate_all(), 1);
        let status = tracked.child_mut().wait().await.unwrap();
        assert!(!status.success());

        drop(tracked);
        assert!(registry.is_empty());
    }
}
