//! Process supervision seam
//!
//! Building the mover command line is the caller's business. The node only
//! needs to start something for a transfer, poll it for an exit status and
//! kill it, plus a way to check processes it did not spawn itself (movers
//! that survived a restart of the node daemon).

use crate::{NodeError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Read;
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;
use xfer_sched::{NodeId, QueuedTransfer};

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    Signaled(i32),
}

/// A running mover
pub trait ProcessHandle: Send + Sync + std::fmt::Debug {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check
    fn try_wait(&self) -> std::io::Result<Option<ExitState>>;

    fn kill(&self) -> std::io::Result<()>;

    /// Tail of the error output captured from the process; never blocks
    fn diagnostics(&self) -> String;
}

/// Starts movers
pub trait ProcessExecutor: Send + Sync {
    /// Start the mover for a transfer allowed to run here
    ///
    /// `Ok(None)` means a slot was allocated but the process comes later,
    /// when the client connects.
    fn spawn(
        &self,
        transfer: &QueuedTransfer,
        source_node: Option<&NodeId>,
    ) -> Result<Option<Arc<dyn ProcessHandle>>>;
}

/// Checks and signals processes the node did not spawn itself
pub trait ProcessInspector: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    fn cmdline(&self, pid: u32) -> Option<String>;

    /// Ask the process to terminate
    fn terminate(&self, pid: u32) -> std::io::Result<()>;
}

/// Inspector backed by `kill(pid, 0)` and `/proc/<pid>/cmdline`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcInspector;

impl ProcessInspector for ProcInspector {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: signal 0 performs the existence and permission checks only.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn cmdline(&self, pid: u32) -> Option<String> {
        let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
        let args: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        Some(args.join(" "))
    }

    fn terminate(&self, pid: u32) -> std::io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        // SAFETY: plain signal delivery, no memory is shared with the target.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

/// Bytes of error output kept per mover
pub const DIAGNOSTICS_CAPACITY: usize = 64 * 1024;

/// How long an exited mover may keep its error pipe open before the exit is
/// reported anyway (a grandchild may still hold it)
const STDERR_EOF_GRACE: Duration = Duration::from_secs(2);

/// Drains a child's stderr so it never blocks on a full pipe, keeping the tail
#[derive(Debug)]
struct StderrTail {
    tail: Arc<Mutex<VecDeque<u8>>>,
    reader: JoinHandle<()>,
}

impl StderrTail {
    fn spawn(pid: u32, mut stderr: ChildStderr) -> std::io::Result<Self> {
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(4096)));
        let sink = Arc::clone(&tail);
        let reader = std::thread::Builder::new()
            .name(format!("mover-stderr-{pid}"))
            .spawn(move || {
                let mut buf = [0u8; 8192];
                loop {
                    match stderr.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let mut tail = sink.lock();
                            tail.extend(&buf[..n]);
                            let excess = tail.len().saturating_sub(DIAGNOSTICS_CAPACITY);
                            tail.drain(..excess);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            debug!(pid, error = %e, "Unable to read mover error output");
                            break;
                        }
                    }
                }
            })?;
        Ok(Self { tail, reader })
    }

    fn is_drained(&self) -> bool {
        self.reader.is_finished()
    }

    fn text(&self) -> String {
        let tail = self.tail.lock();
        let (front, back) = tail.as_slices();
        let mut bytes = Vec::with_capacity(tail.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).trim_end().to_string()
    }
}

/// Handle on a child spawned through [`std::process::Command`]
#[derive(Debug)]
pub struct ChildHandle {
    pid: u32,
    child: Mutex<Child>,
    stderr: Option<StderrTail>,
    exited_at: Mutex<Option<Instant>>,
}

impl ChildHandle {
    /// Wrap a child, draining its stderr in the background when it is piped
    pub fn new(mut child: Child) -> std::io::Result<Self> {
        let pid = child.id();
        let stderr = child
            .stderr
            .take()
            .map(|stderr| StderrTail::spawn(pid, stderr))
            .transpose()?;
        Ok(Self {
            pid,
            child: Mutex::new(child),
            stderr,
            exited_at: Mutex::new(None),
        })
    }
}

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    /// Reports the exit once the error output is fully read, or after a
    /// grace period if something else keeps the pipe open
    fn try_wait(&self) -> std::io::Result<Option<ExitState>> {
        use std::os::unix::process::ExitStatusExt;

        let Some(status) = self.child.lock().try_wait()? else {
            return Ok(None);
        };
        if let Some(stderr) = &self.stderr {
            let exited_at = *self.exited_at.lock().get_or_insert_with(Instant::now);
            if !stderr.is_drained() && exited_at.elapsed() < STDERR_EOF_GRACE {
                return Ok(None);
            }
        }
        Ok(Some(match (status.code(), status.signal()) {
            (Some(code), _) => ExitState::Exited(code),
            (None, Some(signal)) => ExitState::Signaled(signal),
            (None, None) => ExitState::Exited(-1),
        }))
    }

    fn kill(&self) -> std::io::Result<()> {
        self.child.lock().kill()
    }

    fn diagnostics(&self) -> String {
        self.stderr.as_ref().map(StderrTail::text).unwrap_or_default()
    }
}

type CommandBuilder = dyn Fn(&QueuedTransfer, Option<&NodeId>) -> Command + Send + Sync;

/// Executor running a command line built by the caller
pub struct CommandExecutor {
    build: Box<CommandBuilder>,
}

impl CommandExecutor {
    pub fn new<F>(build: F) -> Self
    where
        F: Fn(&QueuedTransfer, Option<&NodeId>) -> Command + Send + Sync + 'static,
    {
        Self {
            build: Box::new(build),
        }
    }
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor").finish_non_exhaustive()
    }
}

impl ProcessExecutor for CommandExecutor {
    fn spawn(
        &self,
        transfer: &QueuedTransfer,
        source_node: Option<&NodeId>,
    ) -> Result<Option<Arc<dyn ProcessHandle>>> {
        let mut command = (self.build)(transfer, source_node);
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| NodeError::Spawn(format!("{}: {e}", transfer.id())))?;
        debug!(transfer_id = %transfer.id(), pid = child.id(), "Mover started");
        let handle = ChildHandle::new(child)
            .map_err(|e| NodeError::Spawn(format!("{}: stderr reader: {e}", transfer.id())))?;
        Ok(Some(Arc::new(handle)))
    }
}
