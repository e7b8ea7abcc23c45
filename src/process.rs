//! The fork-tree node of a traced process.
//!
//! The tracer attaches to and updates these nodes, but never owns their lifetime: a
//! [`ProcessHandle`] is a shared reference, and the tree is kept alive by whoever holds
//! the root returned from [`Tracer::start()`](crate::Tracer::start). Readers (a tree
//! renderer, a CLI) may lock a node concurrently with ongoing tracing.

use std::path::PathBuf;
use std::sync::Arc;

use nix::errno::Errno;
use parking_lot::{Mutex, MutexGuard};

use crate::backend::{Pid, Signal};

/// A program image: the executable and its argument vector (including `argv[0]`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Program {
    pub path: PathBuf,
    pub argv: Vec<String>,
}

impl Program {
    pub fn new(path: impl Into<PathBuf>, argv: Vec<String>) -> Self {
        let path = path.into();
        Self { path, argv }
    }
}

/// How a process ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Exit {
    Code(i32),
    Signal { signal: Signal, core_dumped: bool },
}

#[derive(Debug)]
pub struct Process {
    pid: Pid,
    program: Program,
    execs: usize,
    children: Vec<ProcessHandle>,
    failed_forks: Vec<Errno>,
    failed_exec: bool,
    orphaned: bool,
    exit: Option<Exit>,
}

impl Process {
    fn new(pid: Pid, program: Program) -> Self {
        Self {
            pid,
            program,
            execs: 0,
            children: vec![],
            failed_forks: vec![],
            failed_exec: false,
            orphaned: false,
            exit: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The current program image. A fresh child inherits its parent's.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Number of successful execs observed.
    pub fn execs(&self) -> usize {
        self.execs
    }

    pub fn children(&self) -> &[ProcessHandle] {
        &self.children
    }

    pub fn failed_forks(&self) -> &[Errno] {
        &self.failed_forks
    }

    /// Did this (leader) process die before its first exec completed?
    pub fn failed_exec(&self) -> bool {
        self.failed_exec
    }

    /// Was this subtree detached from its parent, to be reaped by someone else?
    pub fn orphaned(&self) -> bool {
        self.orphaned
    }

    pub fn exit(&self) -> Option<Exit> {
        self.exit
    }
}

#[derive(Clone, Debug)]
pub struct ProcessHandle(Arc<Mutex<Process>>);

impl ProcessHandle {
    /// Create the root of a new traced subtree.
    pub fn root(pid: Pid, program: Program) -> Self {
        Self(Arc::new(Mutex::new(Process::new(pid, program))))
    }

    /// Attach a new child node, which starts out running its parent's image.
    pub fn add_child(&self, pid: Pid) -> ProcessHandle {
        let mut parent = self.0.lock();
        let child = ProcessHandle::root(pid, parent.program.clone());
        parent.children.push(child.clone());
        child
    }

    pub fn exec(&self, program: Program) {
        let mut process = self.0.lock();
        process.program = program;
        process.execs += 1;
    }

    pub fn mark_orphaned(&self) {
        self.0.lock().orphaned = true;
    }

    pub fn record_failed_fork(&self, errno: Errno) {
        self.0.lock().failed_forks.push(errno);
    }

    pub fn record_failed_exec(&self) {
        self.0.lock().failed_exec = true;
    }

    pub fn set_exit(&self, exit: Exit) {
        self.0.lock().exit = Some(exit);
    }

    pub fn lock(&self) -> MutexGuard<'_, Process> {
        self.0.lock()
    }

    /// Do both handles refer to the same node?
    pub fn same_node(&self, other: &ProcessHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
