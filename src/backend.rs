//! The operating system's trace/wait primitives, as consumed by the tracer.

pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;

use crate::error::Result;
use crate::process::Program;
use crate::syscall::Syscall;

/// A decoded wait status for one tracee.
///
/// Every variant but `Exited` and `Signaled` is observed while the tracee is in a
/// ptrace-stop, and must be followed by a resume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Notification {
    // syscall-stops
    SyscallEntry(Syscall),
    SyscallExit { ret: i64 },

    // ptrace-event-stops
    Fork { new: Pid },
    Exec,

    // signal-delivery-stop
    SignalDelivery { signal: Signal },

    // group-stop
    Group { signal: Signal },

    // Terminated, and reaped from the tracer's point of view.
    Exited { exit_code: i32 },
    Signaled { signal: Signal, core_dumped: bool },
}

impl Notification {
    pub fn is_death(&self) -> bool {
        matches!(self, Notification::Exited { .. } | Notification::Signaled { .. })
    }
}

/// Trace-and-stop control over processes.
///
/// Every method that touches a tracee reports the tracee having vanished (`ESRCH`, or
/// its `/proc` entry being gone) as `Ok(false)` or `Ok(None)`, since its death will be
/// reported by a later wait status.
pub trait Backend: Send + Sync {
    /// Fork and exec a new tracee, stopped before its exec.
    fn spawn(&self, path: &str, argv: &[String]) -> Result<Pid>;

    /// Resume a stopped tracee until its next syscall-stop or other stop, delivering
    /// `signal`.
    fn resume(&self, pid: Pid, signal: Option<Signal>) -> Result<bool>;

    /// Wait for any tracee to change state.
    ///
    /// Returns `None` when `block` is false and nothing is ready, or when there is
    /// nothing left to wait on.
    fn wait(&self, block: bool) -> Result<Option<(Pid, Notification)>>;

    /// Block until `pid` in particular changes state.
    fn wait_for_stop(&self, pid: Pid) -> Result<Notification>;

    /// Read `si_pid` from the `siginfo_t` at `addr` in the tracee's memory.
    fn siginfo_pid(&self, pid: Pid, addr: u64) -> Result<Option<Pid>>;

    /// The program image of a tracee that has just exec'd.
    fn program(&self, pid: Pid) -> Result<Option<Program>>;

    /// Forcibly terminate `pid`.
    fn kill(&self, pid: Pid) -> Result<()>;
}
