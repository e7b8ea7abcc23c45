//! Per-process trace bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, info};

use crate::backend::{Notification, Pid, Signal};
use crate::blocking::BlockingCall;
use crate::process::ProcessHandle;
use crate::syscall::Syscall;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TraceeState {
    // Resumed, or blocked in the kernel. We are waiting to hear from it.
    Running,

    // In a ptrace-stop, waiting for us to resume it.
    Stopped,

    // Terminated. The entry holds the pid until its death is fully processed, i.e. until
    // someone has reaped it.
    Dead,
}

impl fmt::Display for TraceeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraceeState::Running => "RUNNING",
            TraceeState::Stopped => "STOPPED",
            TraceeState::Dead => "DEAD",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for one traced process.
#[derive(Debug)]
pub struct Tracee {
    pub pid: Pid,
    pub state: TraceeState,

    /// Syscall in progress, between its entry-stop and exit-stop.
    pub syscall: Option<Syscall>,

    /// Signal to deliver when next resumed.
    pub signal: Option<Signal>,

    pub process: ProcessHandle,

    /// In-flight blocking syscall. Only ever set while `syscall` is.
    pub blocking: Option<BlockingCall>,

    /// Traced parent, until either dies or the reaper adopts this tracee.
    pub parent: Option<Pid>,

    /// Someone other than the parent has already accounted for reaping this tracee, so
    /// its death is fully processed as soon as we see it.
    pub expect_ended: bool,
}

impl Tracee {
    /// Create a tracee, starting in the stopped state.
    pub fn new(pid: Pid, process: ProcessHandle, parent: Option<Pid>) -> Self {
        Self {
            pid,
            state: TraceeState::Stopped,
            syscall: None,
            signal: None,
            process,
            blocking: None,
            parent,
            expect_ended: false,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state != TraceeState::Dead
    }
}

/// A directly-spawned child: the root of a traced subtree.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Leader {
    /// Has the initial exec succeeded yet?
    pub execed: bool,
}

/// Every tracee we know of, keyed by pid.
///
/// An entry is "active" while the process is running or a zombie. Either way, the pid is
/// not yet available for recycling by the system.
#[derive(Debug, Default)]
pub struct Registry {
    tracees: BTreeMap<Pid, Tracee>,
    leaders: BTreeMap<Pid, Leader>,

    // New children whose attach-stop arrived before their parent's fork event, with their
    // death if that arrived too.
    pending_births: BTreeMap<Pid, Option<Notification>>,

    // Pids dropped after a protocol violation. Their notifications are ignored.
    abandoned: BTreeSet<Pid>,
}

impl Registry {
    pub fn get(&self, pid: Pid) -> Option<&Tracee> {
        self.tracees.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Tracee> {
        self.tracees.get_mut(&pid)
    }

    pub fn insert(&mut self, tracee: Tracee) {
        debug!(pid = tracee.pid.as_raw(), parent = ?tracee.parent, "adding tracee");
        self.tracees.insert(tracee.pid, tracee);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Tracee> {
        info!(pid = pid.as_raw(), "removing tracee");
        self.tracees.remove(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tracee> {
        self.tracees.values()
    }

    pub fn any_live(&self) -> bool {
        self.tracees.values().any(Tracee::is_live)
    }

    pub fn stopped(&self) -> Vec<Pid> {
        self.tracees
            .values()
            .filter(|t| t.state == TraceeState::Stopped)
            .map(|t| t.pid)
            .collect()
    }

    /// Live children of `parent`.
    pub fn children_of(&self, parent: Pid) -> impl Iterator<Item = &Tracee> {
        self.tracees.values().filter(move |t| t.parent == Some(parent))
    }

    /// Reparent every child of `parent` to the reaper, which we don't trace.
    pub fn disown_children(&mut self, parent: Pid) {
        for tracee in self.tracees.values_mut() {
            if tracee.parent == Some(parent) {
                tracee.parent = None;
            }
        }
    }

    pub fn add_leader(&mut self, pid: Pid) {
        self.leaders.insert(pid, Leader::default());
    }

    pub fn leader(&self, pid: Pid) -> Option<Leader> {
        self.leaders.get(&pid).copied()
    }

    pub fn leader_mut(&mut self, pid: Pid) -> Option<&mut Leader> {
        self.leaders.get_mut(&pid)
    }

    pub fn remove_leader(&mut self, pid: Pid) -> Option<Leader> {
        self.leaders.remove(&pid)
    }

    pub fn mark_pending_birth(&mut self, pid: Pid) {
        debug!(pid = pid.as_raw(), "attach-stop seen before fork event");
        self.pending_births.insert(pid, None);
    }

    /// Hold the death of a child whose fork event is still to come, until that event is
    /// handled. Returns `false` if `pid` is not such a child.
    pub fn record_early_death(&mut self, pid: Pid, death: Notification) -> bool {
        match self.pending_births.get_mut(&pid) {
            Some(slot) => {
                debug!(pid = pid.as_raw(), ?death, "new child died before its fork event");
                *slot = Some(death);
                true
            },
            None => false,
        }
    }

    /// Claim the pending birth of `pid`, if any, with the death it already reported.
    pub fn take_pending_birth(&mut self, pid: Pid) -> Option<Option<Notification>> {
        self.pending_births.remove(&pid)
    }

    /// Forget every pending birth, returning how many there were.
    pub fn clear_pending_births(&mut self) -> usize {
        let count = self.pending_births.len();
        self.pending_births.clear();
        count
    }

    /// Stop tracking `pid` altogether.
    pub fn abandon(&mut self, pid: Pid) {
        info!(pid = pid.as_raw(), "abandoning tracee");
        self.tracees.remove(&pid);
        self.leaders.remove(&pid);
        self.pending_births.remove(&pid);
        self.abandoned.insert(pid);
    }

    pub fn is_abandoned(&self, pid: Pid) -> bool {
        self.abandoned.contains(&pid)
    }

    pub fn forget_abandoned(&mut self, pid: Pid) {
        self.abandoned.remove(&pid);
    }
}
