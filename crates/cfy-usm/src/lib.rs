pub mod event;
pub mod lifecycle;
pub mod process;

use std::io;
use std::path::PathBuf;

pub use event::EventResult;
pub use lifecycle::LifecycleEvent;
pub use process::{OsProcessControl, ProcessControl, ProcessKiller, ServiceProcess, Signal};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to send {signal} to process {pid}: {source}")]
    Signal {
        pid: u32,
        signal: Signal,
        #[source]
        source: io::Error,
    },

    #[error("failed to check whether process {pid} is alive: {source}")]
    ProcessState {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("process {pid} is still alive after {attempts} kill attempts")]
    KillFailed { pid: u32, attempts: u32 },

    #[error("bad PID file {}: {reason}", path.display())]
    PidFile { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
