//! Linux implementation of the tracer [`Backend`], over `ptrace(2)` and `waitpid(2)`.
//!
//! **Warning:** ptrace requests must be made from the thread that spawned the tracees.
//! Call [`Tracer::start()`](crate::Tracer::start) and [`Tracer::step()`](crate::Tracer::step)
//! from one thread.

use std::fs;
use std::io::{self, ErrorKind};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        signal,
        wait::{self, WaitPidFlag, WaitStatus},
    },
};
use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, Notification, Pid, Signal};
use crate::cmd::Command;
use crate::error::{Error, Result, ResultExt};
use crate::process::Program;
use crate::syscall::Syscall;

pub use nix::sys::ptrace::Options;

/// Options required for tracking the fork tree.
/// These are:
/// - [`PTRACE_O_TRACESYSGOOD`](Options::PTRACE_O_TRACESYSGOOD)
/// - [`PTRACE_O_TRACEEXEC`](Options::PTRACE_O_TRACEEXEC)
/// - [`PTRACE_O_TRACEFORK`](Options::PTRACE_O_TRACEFORK)
/// - [`PTRACE_O_TRACEVFORK`](Options::PTRACE_O_TRACEVFORK)
pub const REQUIRED_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACESYSGOOD)
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACEVFORK);

/// Options that may be toggled on top of [`REQUIRED_OPTIONS`]. Any other option would
/// produce stops the tracer does not interpret.
pub const OPTIONAL_OPTIONS: Options = Options::PTRACE_O_EXITKILL;

const DEFAULT_OPTIONS: Options = REQUIRED_OPTIONS.union(OPTIONAL_OPTIONS);

/// Linux constant defined in `include/uapi/linux/ptrace.h` (since 5.3).
const PTRACE_GET_SYSCALL_INFO: libc::c_int = 0x420e;

const PTRACE_SYSCALL_INFO_ENTRY: u8 = 1;
const PTRACE_SYSCALL_INFO_EXIT: u8 = 2;
const PTRACE_SYSCALL_INFO_SECCOMP: u8 = 3;

/// Offset of `si_pid` in a `SIGCHLD` `siginfo_t`: three `int`s, padded to a word.
const SI_PID_OFFSET: u64 = if cfg!(target_pointer_width = "64") { 16 } else { 12 };

/// `struct ptrace_syscall_info` from `include/uapi/linux/ptrace.h`.
///
/// The trailing union is flattened to words. For entry and seccomp stops it holds
/// `nr, args[6]`. For exit stops, its first word is the signed return value.
#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RawSyscallInfo {
    op: u8,
    pad: [u8; 3],
    arch: u32,
    instruction_pointer: u64,
    stack_pointer: u64,
    data: [u64; 8],
}

/// Trace/wait primitives for traced children of this process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ptracer {
    /// Ptrace options applied to spawned leaders, and inherited by their descendants.
    options: Options,
}

impl Default for Ptracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Ptracer {
    pub fn new() -> Self {
        let options = DEFAULT_OPTIONS;

        Self { options }
    }

    /// Return the ptrace options applied to newly-spawned leaders.
    pub fn traceme_options(&self) -> Options {
        self.options
    }

    /// Set the ptrace options applied to newly-spawned leaders.
    ///
    /// **NOTE:** [`REQUIRED_OPTIONS`] are always set, and anything outside
    /// [`OPTIONAL_OPTIONS`] is ignored.
    pub fn set_traceme_options(&mut self, options: Options) {
        self.options = (options & OPTIONAL_OPTIONS) | REQUIRED_OPTIONS;
    }

    // Decode a `waitpid(2)` status. Returns `None` if the tracee vanished while we were
    // asking the kernel about it, in which case its termination status is still pending.
    fn decode(&self, status: WaitStatus) -> Result<Option<(Pid, Notification)>> {
        let event = match status {
            WaitStatus::Exited(pid, exit_code) => {
                (pid, Notification::Exited { exit_code })
            },
            WaitStatus::Signaled(pid, signal, core_dumped) => {
                (pid, Notification::Signaled { signal, core_dumped })
            },
            WaitStatus::Stopped(pid, signal) => {
                let notification = match is_group_stop(pid, signal)? {
                    Some(true) => Notification::Group { signal },
                    Some(false) => Notification::SignalDelivery { signal },
                    None => return Ok(None),
                };

                (pid, notification)
            },
            WaitStatus::PtraceEvent(pid, _signal, code) => {
                match code {
                    libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => {
                        let evt_data = match ptrace::getevent(pid).died_if_esrch()? {
                            Some(data) => data,
                            None => return Ok(None),
                        };
                        let new = Pid::from_raw(evt_data as u32 as i32);

                        (pid, Notification::Fork { new })
                    },
                    libc::PTRACE_EVENT_EXEC => {
                        (pid, Notification::Exec)
                    },
                    _ => {
                        // Only the events for `REQUIRED_OPTIONS` can be delivered.
                        internal_error!("unexpected ptrace-event-stop code {code} for {pid}")
                    },
                }
            },
            WaitStatus::PtraceSyscall(pid) => {
                match syscall_info(pid)? {
                    Some(notification) => (pid, notification),
                    None => return Ok(None),
                }
            },
            // Assume `!WCONTINUED`.
            WaitStatus::Continued(_) |
            WaitStatus::StillAlive =>
                internal_error!("unreachable `wait()` status"),
        };

        Ok(Some(event))
    }
}

impl Backend for Ptracer {
    fn spawn(&self, path: &str, argv: &[String]) -> Result<Pid> {
        let cmd = Command::new(path, argv)
            .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;

        let pid = cmd.fork_exec()?;

        // Wait for the `SIGSTOP` the child raises after `PTRACE_TRACEME`.
        match wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {},
            Ok(WaitStatus::Exited(_, status)) => {
                // The child reports a failed `PTRACE_TRACEME` via its exit status.
                let source = Errno::from_i32(status);
                return Err(Error::Attach { pid, source });
            },
            Ok(status) => {
                kill_and_reap(pid);
                internal_error!("unexpected initial status for leader {pid}: {status:?}");
            },
            Err(err) => {
                kill_and_reap(pid);
                return Err(err.into());
            },
        }

        if let Err(source) = ptrace::setoptions(pid, self.options) {
            kill_and_reap(pid);
            return Err(Error::Attach { pid, source });
        }

        info!(pid = pid.as_raw(), path, "spawned leader tracee");

        Ok(pid)
    }

    fn resume(&self, pid: Pid, signal: Option<Signal>) -> Result<bool> {
        trace!(pid = pid.as_raw(), ?signal, "resuming tracee");

        match ptrace::syscall(pid, signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(source) => Err(Error::Resume { pid, source }),
        }
    }

    fn wait(&self, block: bool) -> Result<Option<(Pid, Notification)>> {
        let mut flags = WaitPidFlag::__WALL;

        if !block {
            flags |= WaitPidFlag::WNOHANG;
        }

        loop {
            let status = match wait::waitpid(Pid::from_raw(-1), Some(flags)) {
                Ok(WaitStatus::StillAlive) => {
                    // Non-blocking, and no tracee changed state.
                    return Ok(None);
                },
                Ok(status) => status,
                Err(Errno::ECHILD) => {
                    // No more children to wait on.
                    return Ok(None);
                },
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            };

            if let Some(event) = self.decode(status)? {
                return Ok(Some(event));
            }

            warn!(?status, "tracee vanished while decoding stop, skipping");
        }
    }

    fn wait_for_stop(&self, pid: Pid) -> Result<Notification> {
        loop {
            let status = match wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            };

            if let Some((_, notification)) = self.decode(status)? {
                return Ok(notification);
            }
        }
    }

    fn siginfo_pid(&self, pid: Pid, addr: u64) -> Result<Option<Pid>> {
        let mem = match fs::File::open(format!("/proc/{}/mem", pid)) {
            Ok(mem) => mem,
            Err(err) if vanished(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut data = [0u8; mem::size_of::<libc::pid_t>()];

        match mem.read_at(&mut data, addr + SI_PID_OFFSET) {
            Ok(len) if len == data.len() => {},
            // Short read: the address space is gone.
            Ok(_) => return Ok(None),
            Err(err) if vanished(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        Ok(Some(Pid::from_raw(libc::pid_t::from_ne_bytes(data))))
    }

    fn program(&self, pid: Pid) -> Result<Option<Program>> {
        let path = match fs::read_link(format!("/proc/{}/exe", pid)) {
            Ok(path) => path,
            Err(err) if vanished(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let cmdline = match fs::read(format!("/proc/{}/cmdline", pid)) {
            Ok(cmdline) => cmdline,
            Err(err) if vanished(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let argv = cmdline
            .split(|&b| b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| std::ffi::OsStr::from_bytes(arg).to_string_lossy().into_owned())
            .collect();

        Ok(Some(Program::new(path, argv)))
    }

    fn kill(&self, pid: Pid) -> Result<()> {
        debug!(pid = pid.as_raw(), "killing tracee");

        match signal::kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

// Read the current syscall-stop via `PTRACE_GET_SYSCALL_INFO`, which tells us whether
// this is an entry or an exit.
//
// From the manual:
//
//     Syscall-enter-stop and syscall-exit-stop are indistinguishable from
//     each other by the tracer.  The tracer needs to keep track of the
//     sequence of ptrace-stops in order to not misinterpret syscall-enter-
//     stop as syscall-exit-stop or vice versa.
//
// The tracer does keep track, and cross-checks it against the kernel's answer here.
fn syscall_info(pid: Pid) -> Result<Option<Notification>> {
    let mut info = RawSyscallInfo::default();

    let res = unsafe {
        libc::ptrace(
            PTRACE_GET_SYSCALL_INFO as _,
            pid.as_raw(),
            mem::size_of::<RawSyscallInfo>(),
            &mut info as *mut RawSyscallInfo as *mut libc::c_void,
        )
    };

    if Errno::result(res).died_if_esrch()?.is_none() {
        return Ok(None);
    }

    let notification = match info.op {
        PTRACE_SYSCALL_INFO_ENTRY | PTRACE_SYSCALL_INFO_SECCOMP => {
            let mut args = [0; 6];
            args.copy_from_slice(&info.data[1..7]);
            Notification::SyscallEntry(Syscall::new(info.data[0], args))
        },
        PTRACE_SYSCALL_INFO_EXIT => {
            Notification::SyscallExit { ret: info.data[0] as i64 }
        },
        op => {
            internal_error!("syscall-stop for {pid} with syscall info op = {op}")
        },
    };

    Ok(Some(notification))
}

// Check if a wait stop with signal delivery is a group-stop. Returns `None` if the tracee
// vanished before we could tell.
fn is_group_stop(pid: Pid, sig: Signal) -> Result<Option<bool>> {
    use Signal::*;

    match sig {
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => {
            // Possible group-stop. Check `siginfo` to disambiguate.
            //
            // From the manual:
            //
            //     If PTRACE_GETSIGINFO fails with EINVAL, then it is definitely a
            //     group-stop.  (Other failure codes are possible, such as ESRCH
            //     ("no such process") if a SIGKILL killed the tracee.)
            //
            match ptrace::getsiginfo(pid) {
                Err(Errno::EINVAL) => Ok(Some(true)),
                Err(Errno::ESRCH) => Ok(None),
                Err(err) => Err(err.into()),
                Ok(_) => Ok(Some(false)),
            }
        },
        _ => {
            // Only these four signals are stopping signals. If the tracer sees something
            // else, it can't be a group-stop.
            Ok(Some(false))
        },
    }
}

fn vanished(err: &io::Error) -> bool {
    err.kind() == ErrorKind::NotFound || err.raw_os_error() == Some(libc::ESRCH)
}

// Kill `pid` and reap it. Errors are ignored: this only cleans up after a failed spawn.
fn kill_and_reap(pid: Pid) {
    let _ = signal::kill(pid, Signal::SIGKILL);

    while let Ok(status) = wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
        if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
            break;
        }
    }
}
