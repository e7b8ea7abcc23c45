//! Raw syscall invocations, and the small set of syscalls the tracer cares about.

/// A syscall as seen at syscall-entry-stop.
///
/// Argument decoding is left to the handlers that need it. No Linux syscall takes more
/// than six arguments, each of which fits in a word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Syscall {
    pub number: u64,
    pub args: [u64; 6],
}

/// Syscalls with fork-tree or blocking semantics. Everything else is `Other`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyscallKind {
    Wait4,
    Waitid,
    Fork,
    Vfork,
    Clone,
    Clone3,
    Execve,
    Execveat,
    Other,
}

impl Syscall {
    pub fn new(number: u64, args: [u64; 6]) -> Self {
        Self { number, args }
    }

    pub fn kind(&self) -> SyscallKind {
        let number = self.number as libc::c_long;

        match number {
            libc::SYS_wait4 => SyscallKind::Wait4,
            libc::SYS_waitid => SyscallKind::Waitid,
            #[cfg(target_arch = "x86_64")]
            libc::SYS_fork => SyscallKind::Fork,
            #[cfg(target_arch = "x86_64")]
            libc::SYS_vfork => SyscallKind::Vfork,
            libc::SYS_clone => SyscallKind::Clone,
            libc::SYS_clone3 => SyscallKind::Clone3,
            libc::SYS_execve => SyscallKind::Execve,
            libc::SYS_execveat => SyscallKind::Execveat,
            _ => SyscallKind::Other,
        }
    }

    /// Does this call create a new process (as opposed to a thread, or nothing)?
    ///
    /// A `clone` is fork-like when its exit signal, the low byte of its flags, is
    /// `SIGCHLD`. This is how libc implements `fork()`. The flags of `clone3` live in
    /// tracee memory, so it is assumed fork-like.
    pub fn is_forklike(&self) -> bool {
        match self.kind() {
            SyscallKind::Fork | SyscallKind::Vfork | SyscallKind::Clone3 => true,
            SyscallKind::Clone => (self.args[0] & 0xff) == libc::SIGCHLD as u64,
            _ => false,
        }
    }

    pub fn is_exec(&self) -> bool {
        matches!(self.kind(), SyscallKind::Execve | SyscallKind::Execveat)
    }
}
