#[macro_use]
pub mod error;

pub mod backend;
pub mod blocking;
pub mod cmd;
pub mod orphan;
pub mod process;
pub mod ptracer;
pub mod syscall;
pub mod tracee;
pub mod tracer;

pub use backend::{Backend, Notification, Pid, Signal};
pub use error::{BadTraceError, Error, Result};
pub use orphan::OrphanQueue;
pub use process::{Exit, Process, ProcessHandle, Program};
pub use ptracer::Ptracer;
pub use syscall::{Syscall, SyscallKind};
pub use tracee::{Leader, TraceeState};
pub use tracer::{Config, Tracer, TraceeSnapshot};
