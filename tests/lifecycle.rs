use anyhow::Result;
use forktrace::{Exit, Tracer, TraceeState};
use nix::errno::Errno;
use ntest::timeout;
use pretty_assertions::assert_eq;

#[macro_use]
mod support;
use support::*;

#[test]
#[timeout(1000)]
fn test_exec_then_exit_in_one_step() -> Result<()> {
    let tracer = Tracer::new(ScriptedBackend::new());
    let backend = tracer.backend();

    backend.spawns(100);
    backend.image(100, "/usr/bin/true", &["true"]);

    let mut events = exec(100);
    events.push(event!(100, entry(libc::SYS_exit_group, [0; 6])));
    events.push(event!(100, Exited { exit_code: 0 }));
    backend.batch(events);

    let root = tracer.start("/bin/true", &argv(&["true"]))?;
    assert_eq!(tracer.tracees().len(), 1);

    assert!(!tracer.step()?);
    assert!(tracer.tracees().is_empty());

    let root = root.lock();
    assert_eq!(root.execs(), 1);
    assert_eq!(root.program().argv, argv(&["true"]));
    assert_eq!(root.exit(), Some(Exit::Code(0)));
    assert!(!root.failed_exec());

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_leader_is_stopped_until_first_step() -> Result<()> {
    let tracer = Tracer::new(ScriptedBackend::new());
    tracer.backend().spawns(100);

    tracer.start("/bin/true", &argv(&["true"]))?;

    let tracees = tracer.tracees();
    assert_eq!(tracees.len(), 1);
    assert_eq!(tracees[0].state, TraceeState::Stopped);
    assert_eq!(tracees[0].parent, None);
    assert_eq!(tracees[0].leader.map(|l| l.execed), Some(false));
    assert!(tracer.backend().resumes().is_empty());

    tracer.print_list();

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_fork_exec_exit_tree() -> Result<()> {
    let tracer = Tracer::new(ScriptedBackend::new());
    let backend = tracer.backend();

    backend.spawns(100);
    backend.image(100, "/bin/sh", &["sh", "-c", "true; true"]);
    backend.image(101, "/usr/bin/true", &["true"]);

    // Leader execs, then forks.
    let mut events = exec(100);
    events.extend([
        event!(100, fork_entry()),
        event!(100, Fork { new: pid!(101) }),
        event!(100, exit(101)),
    ]);
    backend.batch(events);

    // Child execs and exits, remaining a zombie.
    let mut events = exec(101);
    events.push(event!(101, Exited { exit_code: 0 }));
    backend.batch(events);

    // Leader reaps the child, then exits.
    backend.batch([
        event!(100, wait4_entry(-1, 0)),
        event!(100, exit(101)),
        event!(100, Exited { exit_code: 0 }),
    ]);

    let root = tracer.start("/bin/sh", &argv(&["sh", "-c", "true; true"]))?;

    assert!(tracer.step()?);
    let child = tracer
        .tracees()
        .into_iter()
        .find(|t| t.pid == pid!(101))
        .expect("child is tracked");
    assert_eq!(child.state, TraceeState::Stopped);
    assert_eq!(child.parent, Some(pid!(100)));

    assert!(tracer.step()?);
    let states: Vec<_> = tracer.tracees().into_iter().map(|t| (t.pid, t.state)).collect();
    assert_eq!(states, vec![
        (pid!(100), TraceeState::Running),
        (pid!(101), TraceeState::Dead),
    ]);

    assert!(!tracer.step()?);
    assert!(tracer.tracees().is_empty());

    let root = root.lock();
    assert_eq!(root.execs(), 1);
    assert_eq!(root.exit(), Some(Exit::Code(0)));
    assert_eq!(root.children().len(), 1);

    let child = root.children()[0].lock();
    assert_eq!(child.pid(), pid!(101));
    assert_eq!(child.execs(), 1);
    assert_eq!(child.program().argv, argv(&["true"]));
    assert_eq!(child.exit(), Some(Exit::Code(0)));

    // The child first ran in the second step.
    assert_eq!(backend.resumes_of(101).len(), 4);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_leader_dies_before_exec() -> Result<()> {
    let tracer = Tracer::new(ScriptedBackend::new());
    let backend = tracer.backend();

    backend.spawns(100);
    backend.batch([
        event!(100, entry(libc::SYS_execve, [0; 6])),
        event!(100, exit(-(libc::ENOENT as i64))),
        event!(100, entry(libc::SYS_exit_group, [127, 0, 0, 0, 0, 0])),
        event!(100, Exited { exit_code: 127 }),
    ]);

    let root = tracer.start("/no/such/program", &argv(&["nope"]))?;

    assert!(!tracer.step()?);
    assert!(tracer.tracees().is_empty());

    let root = root.lock();
    assert!(root.failed_exec());
    assert_eq!(root.execs(), 0);
    assert_eq!(root.exit(), Some(Exit::Code(127)));

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_failed_spawn_registers_nothing() -> Result<()> {
    let tracer = Tracer::new(ScriptedBackend::new());
    tracer.backend().fails_spawn(Errno::EAGAIN);

    let res = tracer.start("/bin/true", &argv(&["true"]));

    assert!(res.is_err());
    assert!(tracer.tracees().is_empty());
    assert!(!tracer.step()?);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_failed_fork_is_recorded() -> Result<()> {
    let tracer = Tracer::new(ScriptedBackend::new());
    let backend = tracer.backend();

    backend.spawns(100);
    backend.batch([
        event!(100, fork_entry()),
        event!(100, exit(-(libc::EAGAIN as i64))),
    ]);

    let root = tracer.start("/bin/sh", &argv(&["sh"]))?;

    assert!(tracer.step()?);
    assert_eq!(tracer.tracees().len(), 1);

    let root = root.lock();
    assert_eq!(root.failed_forks(), &[Errno::EAGAIN]);
    assert!(root.children().is_empty());

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_attach_stop_before_fork_event() -> Result<()> {
    let tracer = Tracer::new(ScriptedBackend::new());
    let backend = tracer.backend();

    backend.spawns(100);

    // A dead first stop would fail the test if the tracer waited for one.
    backend.first_stop(101, forktrace::Notification::Exited { exit_code: 1 });

    backend.batch([
        event!(100, fork_entry()),
        event!(101, SignalDelivery { signal: SIGSTOP }),
        event!(100, Fork { new: pid!(101) }),
        event!(100, exit(101)),
    ]);

    tracer.start("/bin/sh", &argv(&["sh"]))?;

    assert!(tracer.step()?);

    let child = tracer
        .tracees()
        .into_iter()
        .find(|t| t.pid == pid!(101))
        .expect("child is tracked");
    assert_eq!(child.state, TraceeState::Stopped);
    assert_eq!(child.parent, Some(pid!(100)));
    assert!(child.process.lock().exit().is_none());

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_child_dies_before_attach_stop() -> Result<()> {
    let tracer = Tracer::new(ScriptedBackend::new());
    let backend = tracer.backend();

    backend.spawns(100);
    backend.first_stop(101, forktrace::Notification::Signaled {
        signal: forktrace::Signal::SIGKILL,
        core_dumped: false,
    });
    backend.batch([
        event!(100, fork_entry()),
        event!(100, Fork { new: pid!(101) }),
        event!(100, exit(101)),
    ]);

    let root = tracer.start("/bin/sh", &argv(&["sh"]))?;

    assert!(tracer.step()?);

    let child = tracer
        .tracees()
        .into_iter()
        .find(|t| t.pid == pid!(101))
        .expect("zombie child is tracked");
    assert_eq!(child.state, TraceeState::Dead);

    let root = root.lock();
    let child = root.children()[0].lock();
    assert_eq!(child.exit(), Some(Exit::Signal {
        signal: forktrace::Signal::SIGKILL,
        core_dumped: false,
    }));

    // Never resumed.
    assert!(backend.resumes_of(101).is_empty());

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_child_dies_before_fork_event() -> Result<()> {
    let tracer = Tracer::new(ScriptedBackend::new());
    let backend = tracer.backend();

    backend.spawns(100);

    // A live first stop would fail the test if the tracer waited for one.
    backend.first_stop(101, forktrace::Notification::SignalDelivery {
        signal: forktrace::Signal::SIGSTOP,
    });

    backend.batch([
        event!(100, fork_entry()),
        event!(101, SignalDelivery { signal: SIGSTOP }),
        event!(101, Signaled { signal: SIGKILL, core_dumped: false }),
        event!(100, Fork { new: pid!(101) }),
        event!(100, exit(101)),
    ]);

    let root = tracer.start("/bin/sh", &argv(&["sh"]))?;

    assert!(tracer.step()?);

    let child = tracer
        .tracees()
        .into_iter()
        .find(|t| t.pid == pid!(101))
        .expect("zombie child is tracked");
    assert_eq!(child.state, TraceeState::Dead);
    assert_eq!(child.parent, Some(pid!(100)));
    assert!(backend.resumes_of(101).is_empty());

    let root = root.lock();
    assert_eq!(root.children()[0].lock().exit(), Some(Exit::Signal {
        signal: forktrace::Signal::SIGKILL,
        core_dumped: false,
    }));

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_birth_without_fork_event_is_dropped() -> Result<()> {
    let tracer = Tracer::new(ScriptedBackend::new());
    let backend = tracer.backend();

    // The leader is killed between creating its child and reporting the fork.
    backend.spawns(100);
    backend.batch([
        event!(100, fork_entry()),
        event!(101, SignalDelivery { signal: SIGSTOP }),
        event!(100, Signaled { signal: SIGKILL, core_dumped: false }),
    ]);

    tracer.start("/bin/sh", &argv(&["sh"]))?;
    assert!(!tracer.step()?);

    // A later child given the same pid is waited on for its own first stop.
    backend.spawns(200);
    backend.first_stop(101, forktrace::Notification::Exited { exit_code: 1 });
    backend.batch([
        event!(200, fork_entry()),
        event!(200, Fork { new: pid!(101) }),
        event!(200, exit(101)),
    ]);

    tracer.start("/bin/sh", &argv(&["sh"]))?;
    assert!(tracer.step()?);

    let child = tracer
        .tracees()
        .into_iter()
        .find(|t| t.pid == pid!(101))
        .expect("zombie child is tracked");
    assert_eq!(child.state, TraceeState::Dead);
    assert_eq!(child.parent, Some(pid!(200)));

    Ok(())
}
