use std::ffi::{CString, NulError};

use nix::{
    errno::Errno,
    sys::{ptrace, signal::{raise, Signal}},
    unistd::{fork, ForkResult, Pid},
};

use crate::error::Result;


/// Exit status of a leader whose `execvp()` failed, as with shells.
pub const EXEC_FAILED_STATUS: i32 = 127;

/// Program to spawn as a new leader tracee.
#[derive(Clone, Debug)]
pub struct Command {
    /// Program to exec. Searched for in `PATH` if it contains no slash.
    path: CString,

    /// Argument vector to pass to `execvp()`, including `argv[0]`.
    argv: Vec<CString>,
}

impl Command {
    pub fn new(path: &str, argv: &[String]) -> std::result::Result<Self, NulError> {
        // Ensure we own NUL-terminated strings for the foreign exec call.
        //
        // We're heap-allocating, so always do this before forking.
        let path = CString::new(path)?;
        let argv = argv
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self { path, argv })
    }

    /// Fork and exec a child process determined by `self.path` and `self.argv`.
    ///
    /// The child sets itself as a tracee of the parent, then raises `SIGSTOP` so the
    /// parent can set trace options and observe the exec itself without a race. If
    /// `PTRACE_TRACEME` fails, the child exits with the errno as its status. If the exec
    /// fails, it exits with [`EXEC_FAILED_STATUS`].
    pub fn fork_exec(&self) -> Result<Pid> {
        // Heap-allocates, must occur pre-fork.
        let argv = self.argv();

        // SAFETY: the child only makes async-signal-safe calls before exec or exit.
        match unsafe { fork() }? {
            ForkResult::Child => {
                // Never unwind or allocate in the child: report failures via `_exit()`.
                if let Err(errno) = ptrace::traceme() {
                    unsafe { libc::_exit(errno as i32) };
                }

                if raise(Signal::SIGSTOP).is_err() {
                    unsafe { libc::_exit(Errno::last() as i32) };
                }

                // Use unsafe `libc::execvp`, because the `nix` wrapper heap-allocates a
                // `Vec` internally, which is not async-signal-safe.
                unsafe {
                    libc::execvp(self.path.as_ptr(), argv.as_ptr());
                    libc::_exit(EXEC_FAILED_STATUS);
                }
            },
            ForkResult::Parent { child } => {
                Ok(child)
            },
        }
    }

    // Construct NUL-terminated arguments for `execvp`. We heap-allocate to return a `Vec`,
    // and so must do this before calling `fork()`.
    fn argv(&self) -> Vec<*const libc::c_char> {
        let mut argv: Vec<_> = self.argv
            .iter()
            .map(|s| s.as_ptr())
            .collect();
        argv.push(std::ptr::null());
        argv
    }
}
