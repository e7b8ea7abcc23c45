use std::io;

use nix::errno::Errno;

use crate::backend::Pid;

pub type Result<T> = std::result::Result<T, Error>;

/// An event arrived out-of-order or at a time the trace protocol does not allow.
///
/// The tracer stops tracking `pid` and leaves the process as it is. The caller should
/// kill or detach it. This can only happen if something outside the tracer interferes
/// with the tracees, if the kernel misbehaves, or if the tracer's model of ptrace
/// semantics is wrong for some scenario.
#[derive(thiserror::Error, Clone, Debug, Eq, PartialEq)]
#[error("bad trace for pid = {pid}: {message}")]
pub struct BadTraceError {
    pub pid: Pid,
    pub message: String,
}

impl BadTraceError {
    pub fn new(pid: Pid, message: impl Into<String>) -> Self {
        let message = message.into();
        Self { pid, message }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    BadTrace(#[from] BadTraceError),

    #[error("Could not attach to tracee = {pid}")]
    Attach {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not resume tracee = {pid}")]
    Resume { pid: Pid, source: nix::Error },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The pid dropped from tracking, if this is a protocol violation.
    pub fn bad_trace_pid(&self) -> Option<Pid> {
        if let Error::BadTrace(err) = self {
            Some(err.pid)
        } else {
            None
        }
    }
}

pub(crate) trait ResultExt<T> {
    /// Treat `ESRCH` as the tracee having vanished, not as a failure.
    fn died_if_esrch(self) -> Result<Option<T>>;
}

impl<T> ResultExt<T> for std::result::Result<T, Errno> {
    fn died_if_esrch(self) -> Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(Errno::ESRCH) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

macro_rules! bad_trace {
    ($pid: expr, $($arg: tt)+) => {
        return Err($crate::error::BadTraceError::new($pid, format!($($arg)+)).into())
    };
}

macro_rules! internal_error {
    ($($arg: tt)+) => {
        return Err($crate::error::Error::Internal(format!($($arg)+)))
    };
}
