//! Syscalls whose effect on the fork tree is only known once they return.
//!
//! When a tracee reaches the syscall-entry-stop of a blocking syscall we care about, a
//! [`BlockingCall`] holds the state of that call until its syscall-exit-stop, which may
//! come much later, after unrelated events for other tracees. Calls that do not always
//! block, like `waitpid()` with `WNOHANG`, are handled the same way.

use tracing::{debug, warn};

use crate::backend::{Backend, Pid};
use crate::error::Result;
use crate::syscall::{Syscall, SyscallKind};
use crate::tracee::{Registry, TraceeState};
use crate::tracer::Session;

/// Which children a wait may report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitTarget {
    Any,
    Pid(Pid),

    // Process-group membership is not tracked, so this matches any child.
    Group,
}

impl WaitTarget {
    fn matches(&self, child: Pid) -> bool {
        match self {
            WaitTarget::Any | WaitTarget::Group => true,
            WaitTarget::Pid(pid) => *pid == child,
        }
    }
}

/// `wait()`, `waitpid()`, `wait3()` and `wait4()`, which are all `wait4` to the kernel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WaitCall {
    pub target: WaitTarget,
    pub nohang: bool,

    /// `WUNTRACED` or `WCONTINUED`: may report a live child.
    pub reports_stops: bool,

    /// Children that could satisfy the call, as of syscall-entry.
    pub candidates: Vec<Pid>,
}

/// `waitid()`, which reports the child in a `siginfo_t` instead of its return value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WaitidCall {
    pub target: WaitTarget,
    pub nohang: bool,

    /// `WEXITED` without `WNOWAIT`: a reported dead child is reaped.
    pub reaps: bool,

    /// `WSTOPPED` or `WCONTINUED`: may report a live child.
    pub reports_stops: bool,

    /// Tracee address of the `siginfo_t` result. May be null.
    pub infop: u64,

    pub candidates: Vec<Pid>,
}

/// The closed set of blocking syscalls the tracer follows.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockingCall {
    Wait4(WaitCall),
    Waitid(WaitidCall),
}

impl BlockingCall {
    /// The blocking call for `syscall`, if it is one we follow.
    pub fn for_syscall(syscall: &Syscall) -> Option<Self> {
        let args = &syscall.args;

        match syscall.kind() {
            SyscallKind::Wait4 => {
                let pid = args[0] as i64 as libc::pid_t;
                let options = args[2] as libc::c_int;

                let target = match pid {
                    -1 => WaitTarget::Any,
                    pid if pid > 0 => WaitTarget::Pid(Pid::from_raw(pid)),
                    _ => WaitTarget::Group,
                };

                Some(BlockingCall::Wait4(WaitCall {
                    target,
                    nohang: options & libc::WNOHANG != 0,
                    reports_stops: options & (libc::WUNTRACED | libc::WCONTINUED) != 0,
                    candidates: vec![],
                }))
            },
            SyscallKind::Waitid => {
                let idtype = args[0];
                let id = args[1] as libc::pid_t;
                let infop = args[2];
                let options = args[3] as libc::c_int;

                let target = match idtype {
                    t if t == libc::P_PID as u64 => WaitTarget::Pid(Pid::from_raw(id)),
                    t if t == libc::P_PGID as u64 => WaitTarget::Group,
                    // `P_ALL`, or `P_PIDFD`, whose child we can't resolve without the
                    // tracee's fd table.
                    _ => WaitTarget::Any,
                };

                Some(BlockingCall::Waitid(WaitidCall {
                    target,
                    nohang: options & libc::WNOHANG != 0,
                    reaps: options & libc::WEXITED != 0 && options & libc::WNOWAIT == 0,
                    reports_stops: options & (libc::WSTOPPED | libc::WCONTINUED) != 0,
                    infop,
                    candidates: vec![],
                }))
            },
            _ => None,
        }
    }

    /// Called at syscall-entry-stop, before the kernel can complete the call.
    ///
    /// Returns `false` if the tracee died while preparing, leaving reaping it to the
    /// caller.
    pub(crate) fn prepare<B: Backend>(&mut self, session: &mut Session<'_, B>, pid: Pid) -> Result<bool> {
        let registry = session.registry();

        let (target, candidates) = match self {
            BlockingCall::Wait4(call) => (call.target, &mut call.candidates),
            BlockingCall::Waitid(call) => (call.target, &mut call.candidates),
        };

        *candidates = registry
            .children_of(pid)
            .filter(|child| target.matches(child.pid))
            .map(|child| child.pid)
            .collect();

        if candidates.is_empty() {
            // The kernel will fail the call with `ECHILD`.
            debug!(pid = pid.as_raw(), ?target, "wait with no traced candidates");
        } else {
            debug!(pid = pid.as_raw(), ?target, ?candidates, "preparing wait");
        }

        Ok(true)
    }

    /// Called at the matching syscall-exit-stop, with the syscall's raw return value.
    ///
    /// Returns `false` if the tracee died while finalising, leaving reaping it to the
    /// caller.
    pub(crate) fn finalise<B: Backend>(
        &mut self,
        session: &mut Session<'_, B>,
        pid: Pid,
        ret: i64,
    ) -> Result<bool> {
        match self {
            BlockingCall::Wait4(call) => {
                // Zero for `WNOHANG` with nothing to report, negative for an error.
                if ret > 0 {
                    let child = Pid::from_raw(ret as libc::pid_t);
                    let registry = session.registry_mut();
                    account_for_report(registry, pid, &call.candidates, child, true, call.reports_stops)?;
                }
            },
            BlockingCall::Waitid(call) => {
                if ret != 0 {
                    return Ok(true);
                }

                if call.infop == 0 {
                    warn!(pid = pid.as_raw(), "waitid() with null infop, cannot tell which child it reported");
                    return Ok(true);
                }

                let child = match session.backend().siginfo_pid(pid, call.infop)? {
                    Some(child) => child,
                    None => return Ok(false),
                };

                // `si_pid` is zeroed for `WNOHANG` with nothing to report.
                if child.as_raw() != 0 {
                    let registry = session.registry_mut();
                    account_for_report(registry, pid, &call.candidates, child, call.reaps, call.reports_stops)?;
                }
            },
        }

        Ok(true)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlockingCall::Wait4(_) => "wait4",
            BlockingCall::Waitid(_) => "waitid",
        }
    }
}

// The wait of `caller` reported `child`, which must be one of the `candidates` it was
// entered with. If the child is dead and the wait reaps it, its death is now fully
// processed and its pid may be recycled by the system.
fn account_for_report(
    registry: &mut Registry,
    caller: Pid,
    candidates: &[Pid],
    child: Pid,
    reaps: bool,
    reports_stops: bool,
) -> Result<()> {
    let (parent, state) = match registry.get(child) {
        Some(tracee) => (tracee.parent, tracee.state),
        None => bad_trace!(caller, "wait reported untracked child {child}"),
    };

    if parent != Some(caller) {
        bad_trace!(caller, "wait reported {child}, which is not a traced child of the caller");
    }

    if !candidates.contains(&child) {
        bad_trace!(caller, "wait reported {child}, which could not satisfy it");
    }

    match state {
        TraceeState::Dead => {
            if reaps {
                debug!(pid = caller.as_raw(), child = child.as_raw(), "wait reaped child");
                registry.remove(child);
            }
        },
        _ if reports_stops => {
            debug!(pid = caller.as_raw(), child = child.as_raw(), "wait reported live child");
        },
        state => {
            bad_trace!(caller, "wait reported child {child} in state {state}, without a death");
        },
    }

    Ok(())
}
