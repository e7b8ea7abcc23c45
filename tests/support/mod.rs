use std::collections::{HashMap, VecDeque};

use forktrace::{Backend, Error, Notification, Pid, Program, Result, Signal, Syscall};
use nix::errno::Errno;
use parking_lot::Mutex;

#[allow(unused)]
macro_rules! pid {
    ($raw: expr) => {
        forktrace::Pid::from_raw($raw)
    };
}

/// Construct a `(pid, notification)` wait result with a readable, test-friendly syntax.
#[allow(unused)]
macro_rules! event {
    ($raw_pid: expr, $notification: expr) => {{
        #[allow(unused_imports)]
        use forktrace::Notification::*;
        #[allow(unused_imports)]
        use forktrace::Signal::*;

        (forktrace::Pid::from_raw($raw_pid), $notification)
    }};
}

#[allow(unused)]
pub fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

#[allow(unused)]
pub fn entry(number: libc::c_long, args: [u64; 6]) -> Notification {
    Notification::SyscallEntry(Syscall::new(number as u64, args))
}

#[allow(unused)]
pub fn exit(ret: i64) -> Notification {
    Notification::SyscallExit { ret }
}

/// Syscall-entry of a libc `fork()`.
#[allow(unused)]
pub fn fork_entry() -> Notification {
    entry(libc::SYS_clone, [libc::SIGCHLD as u64, 0, 0, 0, 0, 0])
}

/// Syscall-entry of `waitpid(pid, NULL, options)`.
#[allow(unused)]
pub fn wait4_entry(pid: i32, options: libc::c_int) -> Notification {
    entry(libc::SYS_wait4, [pid as i64 as u64, 0, options as u64, 0, 0, 0])
}

/// Syscall-entry of `waitid(P_ALL, 0, infop, options)`.
#[allow(unused)]
pub fn waitid_entry(infop: u64, options: libc::c_int) -> Notification {
    entry(libc::SYS_waitid, [libc::P_ALL as u64, 0, infop, options as u64, 0, 0])
}

/// The notifications of a successful `execve()`.
#[allow(unused)]
pub fn exec(pid: i32) -> Vec<(Pid, Notification)> {
    vec![
        event!(pid, entry(libc::SYS_execve, [0; 6])),
        event!(pid, Exec),
        event!(pid, exit(0)),
    ]
}

#[derive(Debug, Default)]
struct Script {
    spawns: VecDeque<std::result::Result<Pid, Errno>>,

    // Notifications for each call to `step()`. The first of each batch is returned by a
    // blocking wait, the rest by non-blocking waits.
    batches: VecDeque<VecDeque<(Pid, Notification)>>,
    current: VecDeque<(Pid, Notification)>,

    first_stops: HashMap<Pid, Notification>,
    programs: HashMap<Pid, Program>,
    siginfo: HashMap<(Pid, u64), Pid>,

    resumes: Vec<(Pid, Option<Signal>)>,
    kills: Vec<Pid>,
}

/// A [`Backend`] that replays scripted notifications and records what the tracer asks of
/// it.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
}

#[allow(unused)]
impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawns(&self, raw_pid: i32) {
        self.script.lock().spawns.push_back(Ok(pid!(raw_pid)));
    }

    pub fn fails_spawn(&self, errno: Errno) {
        self.script.lock().spawns.push_back(Err(errno));
    }

    /// Queue the notifications seen by one call to `step()`.
    pub fn batch(&self, events: impl IntoIterator<Item = (Pid, Notification)>) {
        let batch = events.into_iter().collect();
        self.script.lock().batches.push_back(batch);
    }

    /// Override the first stop of a new child, which is otherwise its attach-stop.
    pub fn first_stop(&self, raw_pid: i32, notification: Notification) {
        self.script.lock().first_stops.insert(pid!(raw_pid), notification);
    }

    /// Script the image a tracee runs after an exec.
    pub fn image(&self, raw_pid: i32, path: &str, args: &[&str]) {
        let program = Program::new(path, argv(args));
        self.script.lock().programs.insert(pid!(raw_pid), program);
    }

    pub fn siginfo(&self, raw_pid: i32, addr: u64, raw_child: i32) {
        self.script.lock().siginfo.insert((pid!(raw_pid), addr), pid!(raw_child));
    }

    pub fn resumes(&self) -> Vec<(Pid, Option<Signal>)> {
        self.script.lock().resumes.clone()
    }

    pub fn resumes_of(&self, raw_pid: i32) -> Vec<Option<Signal>> {
        self.resumes()
            .into_iter()
            .filter(|(pid, _)| *pid == pid!(raw_pid))
            .map(|(_, signal)| signal)
            .collect()
    }

    pub fn kills(&self) -> Vec<Pid> {
        self.script.lock().kills.clone()
    }
}

impl Backend for ScriptedBackend {
    fn spawn(&self, _path: &str, _argv: &[String]) -> Result<Pid> {
        match self.script.lock().spawns.pop_front() {
            Some(Ok(pid)) => Ok(pid),
            Some(Err(errno)) => Err(Error::OS(errno)),
            None => Err(Error::Internal("no spawn scripted".into())),
        }
    }

    fn resume(&self, pid: Pid, signal: Option<Signal>) -> Result<bool> {
        self.script.lock().resumes.push((pid, signal));
        Ok(true)
    }

    fn wait(&self, block: bool) -> Result<Option<(Pid, Notification)>> {
        let mut script = self.script.lock();

        if block && script.current.is_empty() {
            script.current = script.batches.pop_front().unwrap_or_default();
        }

        Ok(script.current.pop_front())
    }

    fn wait_for_stop(&self, pid: Pid) -> Result<Notification> {
        let first = self.script.lock()
            .first_stops
            .remove(&pid)
            .unwrap_or(Notification::SignalDelivery { signal: Signal::SIGSTOP });

        Ok(first)
    }

    fn siginfo_pid(&self, pid: Pid, addr: u64) -> Result<Option<Pid>> {
        Ok(self.script.lock().siginfo.get(&(pid, addr)).copied())
    }

    fn program(&self, pid: Pid) -> Result<Option<Program>> {
        Ok(self.script.lock().programs.get(&pid).cloned())
    }

    fn kill(&self, pid: Pid) -> Result<()> {
        self.script.lock().kills.push(pid);
        Ok(())
    }
}
