//! Orphan notifications from an external reaper, and the pids the system has recycled.
//!
//! The reaper runs on its own thread of control and reports each orphaned tracee it
//! reaps. Those reports are only interpreted inside [`Tracer::step()`](crate::Tracer::step),
//! so that diagnostics and errors surface on the tracing thread.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, warn};

use crate::backend::Pid;

/// Producer side of the orphan queue. Cheap to clone, and never blocks.
#[derive(Clone, Debug)]
pub struct OrphanQueue {
    tx: Sender<Pid>,
}

impl OrphanQueue {
    pub fn notify(&self, pid: Pid) {
        debug!(pid = pid.as_raw(), "queueing orphan notification");

        // The receiver lives as long as the tracer, which owns this sender too.
        if self.tx.send(pid).is_err() {
            warn!(pid = pid.as_raw(), "orphan notification after tracer shutdown");
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Recycled {
    pid: Pid,

    // Has the stale orphan notification for the old process arrived?
    matched: bool,
}

/// Consumer side of the orphan queue, plus the record of recycled pids.
///
/// A pid is recycled when the reaper reaps a dead tracee and the system hands its pid to
/// a new process before we hear about the reaping. The reaper's notification for the old
/// process then names a pid that belongs to someone else. Each recycling is recorded, and
/// the record is checked first when interpreting an orphan notification, so that a
/// fresh, unrelated process is never mistaken for the orphan.
#[derive(Debug)]
pub struct Reconciler {
    rx: Receiver<Pid>,
    recycled: Vec<Recycled>,
}

impl Reconciler {
    pub fn new() -> (OrphanQueue, Self) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let queue = OrphanQueue { tx };
        let reconciler = Self { rx, recycled: vec![] };

        (queue, reconciler)
    }

    /// Take the next queued orphan, in notification order.
    pub fn next_orphan(&self) -> Option<Pid> {
        match self.rx.try_recv() {
            Ok(pid) => Some(pid),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn record_recycled(&mut self, pid: Pid) {
        warn!(pid = pid.as_raw(), "pid recycled before its reaping was reported");

        self.recycled.push(Recycled { pid, matched: false });
    }

    /// Match an orphan notification for `pid` against the oldest unmatched recycling of
    /// that pid. Returns `true` if the notification is stale.
    pub fn match_recycled(&mut self, pid: Pid) -> bool {
        let recycled = self.recycled
            .iter_mut()
            .find(|r| r.pid == pid && !r.matched);

        if let Some(recycled) = recycled {
            recycled.matched = true;
            true
        } else {
            false
        }
    }

    /// Every recycled pid, in the order the recycling was observed.
    pub fn recycled_pids(&self) -> Vec<Pid> {
        self.recycled.iter().map(|r| r.pid).collect()
    }
}
