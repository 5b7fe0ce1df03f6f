//! Liveness checks and kill-with-confirmation for service processes.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
        })
    }
}

/// OS seam for inspecting and signalling processes.
pub trait ProcessControl: Send + Sync {
    /// Whether `pid` names a running process. Zombies and stopped processes
    /// are not running.
    fn is_alive(&self, pid: u32) -> Result<bool>;

    /// Deliver `signal`. Signalling a process that no longer exists succeeds.
    fn signal(&self, pid: u32, signal: Signal) -> Result<()>;
}

/// [`ProcessControl`] backed by `kill(2)` and, on Linux, `/proc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessControl;

fn raw_pid(pid: u32) -> io::Result<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{pid} is not a process id"),
        )),
    }
}

#[cfg(target_os = "linux")]
fn running_state(pid: libc::pid_t) -> io::Result<bool> {
    let stat = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    // "<pid> (<comm>) <state> ..."; comm may itself contain parentheses.
    let state = stat
        .rfind(')')
        .and_then(|i| stat[i + 1..].trim_start().chars().next());
    Ok(!matches!(state, Some('Z' | 'X' | 'x' | 'T' | 't')))
}

#[cfg(not(target_os = "linux"))]
fn running_state(_pid: libc::pid_t) -> io::Result<bool> {
    Ok(true)
}

impl ProcessControl for OsProcessControl {
    fn is_alive(&self, pid: u32) -> Result<bool> {
        let raw = raw_pid(pid).map_err(|source| Error::ProcessState { pid, source })?;
        // SAFETY: signal 0 performs only the existence and permission checks.
        if unsafe { libc::kill(raw, 0) } != 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ESRCH) => Ok(false),
                // Exists, owned by someone else.
                Some(libc::EPERM) => Ok(true),
                _ => Err(Error::ProcessState { pid, source: err }),
            };
        }
        running_state(raw).map_err(|source| Error::ProcessState { pid, source })
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        let raw = raw_pid(pid).map_err(|source| Error::Signal {
            pid,
            signal,
            source,
        })?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(raw, signal.as_raw()) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(Error::Signal {
                    pid,
                    signal,
                    source: err,
                });
            }
        }
        Ok(())
    }
}

/// Kills a process and waits until it is confirmed gone.
///
/// Each attempt sends one signal (SIGTERM first, SIGKILL afterwards) and
/// then polls liveness `poll_attempts` times, `poll_interval` apart.
#[derive(Clone)]
pub struct ProcessKiller {
    control: Arc<dyn ProcessControl>,
    pub retries: u32,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
}

impl ProcessKiller {
    pub fn new(control: Arc<dyn ProcessControl>) -> Self {
        Self {
            control,
            retries: 3,
            poll_attempts: 5,
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn os() -> Self {
        Self::new(Arc::new(OsProcessControl))
    }

    pub async fn kill(&self, pid: u32) -> Result<()> {
        if !self.control.is_alive(pid)? {
            debug!(pid, "process already gone");
            return Ok(());
        }

        for attempt in 1..=self.retries {
            let signal = if attempt == 1 {
                Signal::Terminate
            } else {
                Signal::Kill
            };
            debug!(pid, attempt, %signal, "signalling process");
            self.control.signal(pid, signal)?;

            for _ in 0..self.poll_attempts {
                tokio::time::sleep(self.poll_interval).await;
                if !self.control.is_alive(pid)? {
                    info!(pid, attempt, "process terminated");
                    return Ok(());
                }
            }
        }

        error!(pid, attempts = self.retries, "process may be leaking");
        Err(Error::KillFailed {
            pid,
            attempts: self.retries,
        })
    }
}

/// The main process of a running service.
#[derive(Clone)]
pub struct ServiceProcess {
    pid: u32,
    control: Arc<dyn ProcessControl>,
}

impl ServiceProcess {
    pub fn new(pid: u32, control: Arc<dyn ProcessControl>) -> Self {
        Self { pid, control }
    }

    /// Track the PID written in `path` (surrounding whitespace allowed).
    pub async fn from_pid_file(path: &Path, control: Arc<dyn ProcessControl>) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::PidFile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let pid = contents.trim().parse::<u32>().map_err(|e| Error::PidFile {
            path: path.to_path_buf(),
            reason: format!("{:?} is not a PID: {e}", contents.trim()),
        })?;
        Ok(Self::new(pid, control))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_service_stopped(&self) -> Result<bool> {
        Ok(!self.control.is_alive(self.pid)?)
    }
}
