//! The tracer façade, and the event dispatcher behind it.
//!
//! **Warning:** a ptracer is a thread, not a process. [`Tracer::start()`] and
//! [`Tracer::step()`] must be called from the same thread. The other public operations
//! may be called from anywhere.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::backend::{Backend, Notification, Pid, Signal};
use crate::blocking::BlockingCall;
use crate::error::{Error, Result};
use crate::orphan::{OrphanQueue, Reconciler};
use crate::process::{Exit, ProcessHandle, Program};
use crate::syscall::Syscall;
use crate::tracee::{Leader, Registry, Tracee, TraceeState};

/// Tracer behaviour that is not a property of the OS backend.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Config {
    suppressed_signals: Vec<Signal>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals that are consumed at their signal-delivery-stop instead of being
    /// redelivered to the tracee.
    pub fn suppressed_signals(&self) -> &[Signal] {
        &self.suppressed_signals
    }

    pub fn suppress_signal(&mut self, signal: Signal) {
        if !self.suppressed_signals.contains(&signal) {
            self.suppressed_signals.push(signal);
        }
    }

    pub fn set_suppressed_signals(&mut self, signals: impl IntoIterator<Item = Signal>) {
        self.suppressed_signals.clear();

        for signal in signals {
            self.suppress_signal(signal);
        }
    }
}

/// Point-in-time copy of one registry entry, for inspection.
#[derive(Clone, Debug)]
pub struct TraceeSnapshot {
    pub pid: Pid,
    pub state: TraceeState,
    pub syscall: Option<Syscall>,
    pub signal: Option<Signal>,

    /// Name of the in-flight blocking call, if any.
    pub blocking: Option<&'static str>,

    /// Set if this tracee was spawned by [`Tracer::start()`].
    pub leader: Option<Leader>,

    pub parent: Option<Pid>,
    pub process: ProcessHandle,
}

impl fmt::Display for TraceeSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>7} {:<7}", self.pid, self.state)?;

        if let Some(parent) = self.parent {
            write!(f, " parent={parent}")?;
        }

        if let Some(leader) = self.leader {
            write!(f, " leader(execed={})", leader.execed)?;
        }

        if let Some(syscall) = self.syscall {
            write!(f, " syscall={}", syscall.number)?;
        }

        if let Some(blocking) = self.blocking {
            write!(f, " blocking={blocking}")?;
        }

        if let Some(signal) = self.signal {
            write!(f, " signal={signal}")?;
        }

        Ok(())
    }
}

// State guarded by the tracer's lock.
#[derive(Debug)]
struct Shared {
    registry: Registry,
    reconciler: Reconciler,
}

// Pids to kill on `nuke()`. Guarded separately from `Shared`, which `step()` holds while
// it blocks in `wait()`.
#[derive(Debug, Default)]
struct KillList {
    requested: AtomicBool,
    pids: Mutex<BTreeSet<Pid>>,
}

impl KillList {
    fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn track(&self, pid: Pid) {
        self.pids.lock().insert(pid);
    }

    fn untrack(&self, pid: Pid) {
        self.pids.lock().remove(&pid);
    }

    fn request<B: Backend>(&self, backend: &B) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            info!("nuking all tracees");
        }

        for &pid in self.pids.lock().iter() {
            if let Err(err) = backend.kill(pid) {
                warn!(pid = pid.as_raw(), %err, "could not kill tracee");
            }
        }
    }
}

/// Tracks the fork tree of spawned programs and their descendants.
///
/// Every operation on the registry happens under one lock. Orphan notifications and
/// termination requests bypass it, so they never wait on a blocked [`step()`](Self::step).
#[derive(Debug)]
pub struct Tracer<B: Backend> {
    backend: B,
    config: Config,
    shared: Mutex<Shared>,
    orphans: OrphanQueue,
    kill_list: KillList,
}

impl<B: Backend + Default> Default for Tracer<B> {
    fn default() -> Self {
        Self::new(B::default())
    }
}

impl<B: Backend> Tracer<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, Config::default())
    }

    pub fn with_config(backend: B, config: Config) -> Self {
        let (orphans, reconciler) = Reconciler::new();
        let shared = Mutex::new(Shared {
            registry: Registry::default(),
            reconciler,
        });

        Self {
            backend,
            config,
            shared,
            orphans,
            kill_list: KillList::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawn `path` with `argv` (including `argv[0]`) as a new traced leader.
    ///
    /// Returns the root of the new subtree. The leader starts stopped, before its exec,
    /// and first runs in the next call to [`step()`](Self::step).
    pub fn start(&self, path: &str, argv: &[String]) -> Result<ProcessHandle> {
        self.session().start(path, argv)
    }

    /// Resume all stopped tracees, then process every notification available after
    /// blocking for at least one.
    ///
    /// Returns `false` once no live tracees remain. On [`Error::BadTrace`], the pid it
    /// names is no longer tracked, but is left as it is: the caller should kill or
    /// detach it. Tracing of other tracees can continue with further calls.
    pub fn step(&self) -> Result<bool> {
        self.session().step()
    }

    /// Report that the reaper has adopted and reaped `pid`. Never blocks.
    ///
    /// Interpreted during the next [`step()`](Self::step).
    pub fn notify_orphan(&self, pid: Pid) {
        self.orphans.notify(pid);
    }

    /// A handle for reporting orphans, for use by the reaper.
    pub fn orphan_queue(&self) -> OrphanQueue {
        self.orphans.clone()
    }

    /// Forcibly terminate every tracee, including any forked from now on.
    ///
    /// The deaths are still observed by [`step()`](Self::step), which should be called
    /// until it returns `false`.
    pub fn nuke(&self) {
        self.kill_list.request(&self.backend);
    }

    pub fn tracees(&self) -> Vec<TraceeSnapshot> {
        self.session().snapshot()
    }

    /// Pids the system recycled before their old tracee was fully accounted for, in the
    /// order observed.
    pub fn recycled_pids(&self) -> Vec<Pid> {
        self.session().shared.reconciler.recycled_pids()
    }

    /// Write the registry to stderr, one tracee per line.
    pub fn print_list(&self) {
        let tracees = self.tracees();

        eprintln!("{} tracee(s):", tracees.len());

        for tracee in tracees {
            eprintln!("{tracee}");
        }
    }

    fn session(&self) -> Session<'_, B> {
        Session {
            shared: self.shared.lock(),
            backend: &self.backend,
            config: &self.config,
            kill_list: &self.kill_list,
        }
    }
}

/// Access to tracer state while its lock is held.
///
/// Only obtainable from a [`Tracer`] operation, so every internal helper that takes one
/// is known to run under the lock.
pub(crate) struct Session<'a, B: Backend> {
    shared: MutexGuard<'a, Shared>,
    backend: &'a B,
    config: &'a Config,
    kill_list: &'a KillList,
}

impl<'a, B: Backend> Session<'a, B> {
    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut Registry {
        &mut self.shared.registry
    }

    pub(crate) fn backend(&self) -> &'a B {
        self.backend
    }

    fn tracee(&self, pid: Pid) -> Result<&Tracee> {
        match self.shared.registry.get(pid) {
            Some(tracee) => Ok(tracee),
            None => internal_error!("no tracee for pid = {pid}"),
        }
    }

    fn tracee_mut(&mut self, pid: Pid) -> Result<&mut Tracee> {
        match self.shared.registry.get_mut(pid) {
            Some(tracee) => Ok(tracee),
            None => internal_error!("no tracee for pid = {pid}"),
        }
    }

    fn start(&mut self, path: &str, argv: &[String]) -> Result<ProcessHandle> {
        let pid = self.backend.spawn(path, argv)?;

        // Nothing is registered until the leader exists and is stopped.
        self.claim_pid(pid)?;

        let process = ProcessHandle::root(pid, Program::new(path, argv.to_vec()));

        let registry = self.registry_mut();
        registry.add_leader(pid);
        registry.insert(Tracee::new(pid, process.clone(), None));

        self.adopt(pid)?;

        info!(pid = pid.as_raw(), path, "started leader");

        Ok(process)
    }

    fn step(&mut self) -> Result<bool> {
        for pid in self.registry().stopped() {
            self.resume(pid)?;
        }

        if !self.registry().any_live() {
            self.drain_orphans()?;
            self.drop_pending_births();
            return Ok(false);
        }

        let (pid, notification) = match self.backend.wait(true)? {
            Some(event) => event,
            None => {
                let count = self.registry().iter().count();
                internal_error!("no children to wait on, with {count} tracee(s) registered")
            },
        };

        self.dispatch_checked(pid, notification)?;

        while let Some((pid, notification)) = self.backend.wait(false)? {
            self.dispatch_checked(pid, notification)?;
        }

        self.drain_orphans()?;

        let live = self.registry().any_live();

        if !live {
            self.drop_pending_births();
        }

        Ok(live)
    }

    // With nothing left alive, no fork event can arrive for a pending birth.
    fn drop_pending_births(&mut self) {
        let dropped = self.registry_mut().clear_pending_births();

        if dropped > 0 {
            debug!(dropped, "dropping births with no fork event");
        }
    }

    fn snapshot(&self) -> Vec<TraceeSnapshot> {
        let registry = self.registry();

        registry
            .iter()
            .map(|tracee| TraceeSnapshot {
                pid: tracee.pid,
                state: tracee.state,
                syscall: tracee.syscall,
                signal: tracee.signal,
                blocking: tracee.blocking.as_ref().map(BlockingCall::name),
                leader: registry.leader(tracee.pid),
                parent: tracee.parent,
                process: tracee.process.clone(),
            })
            .collect()
    }

    // Make `pid` available for a new tracee. A dead entry still holding it means the
    // system recycled the pid before we heard that the old process was reaped.
    fn claim_pid(&mut self, pid: Pid) -> Result<()> {
        let state = match self.registry().get(pid) {
            Some(tracee) => tracee.state,
            None => return Ok(()),
        };

        if state != TraceeState::Dead {
            internal_error!("new process {pid} collides with a tracee in state {state}");
        }

        self.shared.reconciler.record_recycled(pid);
        self.registry_mut().remove(pid);

        Ok(())
    }

    // Start tracking a new tracee for termination.
    fn adopt(&mut self, pid: Pid) -> Result<()> {
        self.kill_list.track(pid);

        if self.kill_list.requested() {
            self.backend.kill(pid)?;
        }

        Ok(())
    }

    fn resume(&mut self, pid: Pid) -> Result<()> {
        let backend = self.backend;
        let tracee = self.tracee_mut(pid)?;

        if tracee.state != TraceeState::Stopped {
            internal_error!("cannot resume {pid} in state {}", tracee.state);
        }

        let signal = tracee.signal.take();
        tracee.state = TraceeState::Running;

        if !backend.resume(pid, signal)? {
            // Killed while stopped. Its death is still to come.
            debug!(pid = pid.as_raw(), "tracee vanished before resume");
        }

        Ok(())
    }

    // Dispatch, and stop tracking whichever pid a protocol violation is about.
    fn dispatch_checked(&mut self, pid: Pid, notification: Notification) -> Result<()> {
        match self.dispatch(pid, notification) {
            Err(Error::BadTrace(err)) => {
                error!(pid = err.pid.as_raw(), %err, "bad trace");

                self.registry_mut().abandon(err.pid);
                self.kill_list.untrack(err.pid);

                Err(err.into())
            },
            res => res,
        }
    }

    fn dispatch(&mut self, pid: Pid, notification: Notification) -> Result<()> {
        trace!(pid = pid.as_raw(), ?notification, "dispatching");

        // Held until the fork event for this child is handled.
        if notification.is_death() && self.registry_mut().record_early_death(pid, notification) {
            return Ok(());
        }

        let state = match self.registry().get(pid) {
            Some(tracee) => tracee.state,
            None => return self.dispatch_untracked(pid, notification),
        };

        match state {
            TraceeState::Running => {},
            // Killed while stopped, e.g. before its first resume.
            TraceeState::Stopped if notification.is_death() => {},
            TraceeState::Dead if is_attach_stop(&notification) => {
                // A recycled pid, stopping before the fork that created it is reported.
                self.registry_mut().mark_pending_birth(pid);
                return Ok(());
            },
            state => {
                bad_trace!(pid, "{notification:?} for tracee in state {state}");
            },
        }

        self.tracee_mut(pid)?.state = TraceeState::Stopped;

        match notification {
            Notification::SyscallEntry(syscall) => self.handle_syscall_entry(pid, syscall),
            Notification::SyscallExit { ret } => self.handle_syscall_exit(pid, ret),
            Notification::Fork { new } => self.handle_fork(pid, new),
            Notification::Exec => self.handle_exec(pid),
            Notification::SignalDelivery { signal } => self.handle_signal(pid, signal),
            Notification::Group { signal } => {
                debug!(pid = pid.as_raw(), %signal, "group-stop");
                self.resume(pid)
            },
            Notification::Exited { exit_code } => {
                self.handle_death(pid, Exit::Code(exit_code))
            },
            Notification::Signaled { signal, core_dumped } => {
                self.handle_death(pid, Exit::Signal { signal, core_dumped })
            },
        }
    }

    fn dispatch_untracked(&mut self, pid: Pid, notification: Notification) -> Result<()> {
        let registry = self.registry_mut();

        if registry.is_abandoned(pid) {
            debug!(pid = pid.as_raw(), ?notification, "ignoring abandoned pid");

            if notification.is_death() {
                registry.forget_abandoned(pid);
            }

            return Ok(());
        }

        if is_attach_stop(&notification) {
            registry.mark_pending_birth(pid);
            return Ok(());
        }

        bad_trace!(pid, "{notification:?} for untracked pid");
    }

    fn handle_syscall_entry(&mut self, pid: Pid, syscall: Syscall) -> Result<()> {
        let tracee = self.tracee(pid)?;

        if let Some(current) = tracee.syscall {
            bad_trace!(pid, "entry to syscall {} while in syscall {}", syscall.number, current.number);
        }

        if let Some(call) = &tracee.blocking {
            bad_trace!(pid, "entry to syscall {} with {} still in flight", syscall.number, call.name());
        }

        let mut blocking = BlockingCall::for_syscall(&syscall);

        if let Some(call) = &mut blocking {
            if !call.prepare(self, pid)? {
                self.tracee_mut(pid)?.state = TraceeState::Running;
                return Ok(());
            }
        }

        let tracee = self.tracee_mut(pid)?;
        tracee.syscall = Some(syscall);
        tracee.blocking = blocking;

        self.resume(pid)
    }

    fn handle_syscall_exit(&mut self, pid: Pid, ret: i64) -> Result<()> {
        let tracee = self.tracee_mut(pid)?;

        let syscall = match tracee.syscall.take() {
            Some(syscall) => syscall,
            None => bad_trace!(pid, "syscall exit (ret = {ret}) without a matching entry"),
        };
        let blocking = tracee.blocking.take();
        let process = tracee.process.clone();

        if let Some(mut call) = blocking {
            if !call.finalise(self, pid, ret)? {
                self.tracee_mut(pid)?.state = TraceeState::Running;
                return Ok(());
            }
        } else if ret < 0 {
            let errno = Errno::from_i32(-ret as i32);

            if syscall.is_forklike() {
                info!(pid = pid.as_raw(), %errno, "fork failed");
                process.record_failed_fork(errno);
            } else if syscall.is_exec() {
                debug!(pid = pid.as_raw(), %errno, "exec failed");
            }
        }

        self.resume(pid)
    }

    fn handle_fork(&mut self, pid: Pid, child: Pid) -> Result<()> {
        let parent_process = self.tracee(pid)?.process.clone();

        if let Some(state) = self.registry().get(child).map(|t| t.state) {
            if state != TraceeState::Dead {
                bad_trace!(pid, "fork of child {child}, which is already tracked in state {state}");
            }
        }

        self.claim_pid(child)?;

        // The new child is traced from birth, and first reports a `SIGSTOP`.
        let early_death = match self.registry_mut().take_pending_birth(child) {
            Some(death) => death,
            None => match self.backend.wait_for_stop(child)? {
                first if is_attach_stop(&first) => None,
                first if first.is_death() => Some(first),
                first => bad_trace!(child, "new child reported {first:?} before its attach-stop"),
            },
        };

        info!(pid = pid.as_raw(), child = child.as_raw(), "fork");

        let process = parent_process.add_child(child);
        self.registry_mut().insert(Tracee::new(child, process, Some(pid)));
        self.adopt(child)?;

        if let Some(death) = early_death {
            self.tracee_mut(child)?.state = TraceeState::Running;
            self.dispatch(child, death)?;
        }

        self.resume(pid)
    }

    fn handle_exec(&mut self, pid: Pid) -> Result<()> {
        let program = match self.backend.program(pid)? {
            Some(program) => program,
            None => {
                self.tracee_mut(pid)?.state = TraceeState::Running;
                return Ok(());
            },
        };

        info!(pid = pid.as_raw(), path = %program.path.display(), "exec");

        self.tracee(pid)?.process.exec(program);

        if let Some(leader) = self.registry_mut().leader_mut(pid) {
            leader.execed = true;
        }

        self.resume(pid)
    }

    fn handle_signal(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        let suppress = self.config.suppressed_signals().contains(&signal);
        let tracee = self.tracee_mut(pid)?;

        if suppress {
            debug!(pid = pid.as_raw(), %signal, "suppressing signal");
        } else {
            debug!(pid = pid.as_raw(), %signal, "signal-delivery-stop");
            tracee.signal = Some(signal);
        }

        self.resume(pid)
    }

    fn handle_death(&mut self, pid: Pid, exit: Exit) -> Result<()> {
        let tracee = self.tracee_mut(pid)?;

        tracee.state = TraceeState::Dead;
        tracee.syscall = None;
        tracee.signal = None;

        if let Some(call) = tracee.blocking.take() {
            debug!(pid = pid.as_raw(), call = call.name(), "died in blocking call");
        }

        let expect_ended = tracee.expect_ended;
        let process = tracee.process.clone();
        process.set_exit(exit);

        info!(pid = pid.as_raw(), ?exit, "tracee died");

        self.kill_list.untrack(pid);

        let registry = self.registry_mut();
        registry.disown_children(pid);

        if let Some(leader) = registry.remove_leader(pid) {
            // We are the leader's real parent, and have just reaped it.
            if !leader.execed {
                error!(pid = pid.as_raw(), ?exit, "leader died before its exec");
                process.record_failed_exec();
            }

            registry.remove(pid);
        } else if expect_ended {
            registry.remove(pid);
        } else {
            debug!(pid = pid.as_raw(), "waiting for tracee to be reaped");
        }

        Ok(())
    }

    fn drain_orphans(&mut self) -> Result<()> {
        while let Some(pid) = self.shared.reconciler.next_orphan() {
            if let Err(err) = self.reconcile_orphan(pid) {
                if let Error::BadTrace(err) = &err {
                    self.registry_mut().abandon(err.pid);
                    self.kill_list.untrack(err.pid);
                }

                return Err(err);
            }
        }

        Ok(())
    }

    fn reconcile_orphan(&mut self, pid: Pid) -> Result<()> {
        if self.shared.reconciler.match_recycled(pid) {
            warn!(pid = pid.as_raw(), "discarding orphan notification for recycled pid");
            return Ok(());
        }

        let tracee = match self.registry_mut().get_mut(pid) {
            Some(tracee) => tracee,
            None => bad_trace!(pid, "orphan notification for untracked pid"),
        };

        debug!(pid = pid.as_raw(), state = %tracee.state, "orphaned");

        tracee.process.mark_orphaned();
        tracee.parent = None;

        if tracee.state == TraceeState::Dead {
            self.registry_mut().remove(pid);
        } else {
            tracee.expect_ended = true;
        }

        Ok(())
    }
}

// The first stop of a tracee created by a traced fork.
fn is_attach_stop(notification: &Notification) -> bool {
    matches!(
        notification,
        Notification::SignalDelivery { signal: Signal::SIGSTOP } |
        Notification::Group { signal: Signal::SIGSTOP }
    )
}
