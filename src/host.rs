//! The host-side API: `init`, `attach`, `fatal`, and process teardown, per
//! §4.2/§4.4/§4.7.
//!
//! `init()` forks rather than forking-and-execing: the child keeps
//! running this binary's code (see [`crate::monitor::run`]) instead of
//! being replaced by a separately invoked receiver program. That is the
//! one deliberate departure from the teacher's collector/receiver split,
//! and it is what lets `Config`'s callback trait objects and the
//! attribute store stay live, ordinary Rust values across the fork
//! instead of needing a serialization format to cross an execve
//! boundary.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::sync::OnceLock;

use nix::unistd::ForkResult;

use crate::config::Config;
use crate::control_pipe::{create_pair, HostControlPipe};
use crate::error::Error;
use crate::handle::ThreadHandle;
use crate::monitor;
use crate::ordering_gate::OrderingGate;
use crate::protocol::FatalRecord;

static BCD: OnceLock<Bcd> = OnceLock::new();

/// The frozen, process-wide handle to a running monitor.
pub struct Bcd {
    config: Config,
    control: HostControlPipe,
    gate: OrderingGate,
    monitor_pid: nix::unistd::Pid,
    listen_path: std::path::PathBuf,
}

/// Forks the monitor, completes the handshake, and installs the global
/// handle. Returns `AlreadyInitialized` if called twice in one process.
pub fn init(config: Config) -> Result<(), Error> {
    if BCD.get().is_some() {
        return Err(Error::AlreadyInitialized);
    }

    let (host_pipe, monitor_pipe) = create_pair()?;
    let listen_path = listen_socket_path();
    // The path is keyed on this process's own pid, and no other live
    // process can share that pid, so any file already there is a stale
    // leftover from a prior process that reused it; safe to clear before
    // binding (§5: "collision is a fatal init error; the monitor unlinks
    // stale paths with the same pid only if the owning process is no
    // longer alive" — true unconditionally here since we *are* that pid).
    let _ = std::fs::remove_file(&listen_path);
    let listener = std::os::unix::net::UnixListener::bind(&listen_path)
        .map_err(Error::SocketFailed)?;
    std::fs::set_permissions(&listen_path, std::fs::Permissions::from_mode(0o600))
        .map_err(Error::SocketFailed)?;

    // SAFETY: the child immediately restricts itself to the
    // async-signal-safe and fork-safe operations performed inside
    // `monitor::run` before doing anything else; no other thread's locks
    // are touched before that point.
    match unsafe { nix::unistd::fork() }.map_err(Error::ForkFailed)? {
        ForkResult::Child => {
            drop(host_pipe);
            monitor::run(config, monitor_pipe, listener, listen_path);
        }
        ForkResult::Parent { child } => {
            drop(listener);
            host_pipe.read_handshake()?;
            let bcd = Bcd {
                config,
                control: host_pipe,
                gate: OrderingGate::new(),
                monitor_pid: child,
                listen_path,
            };
            BCD.set(bcd).ok().expect("init called exactly once");
            Ok(())
        }
    }
}

fn listen_socket_path() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("bcd.{}", std::process::id()))
}

fn global() -> Result<&'static Bcd, Error> {
    BCD.get().ok_or(Error::NotInitialized)
}

/// Opens this thread's attribute/emit channel to the monitor.
pub fn attach() -> Result<ThreadHandle, Error> {
    let bcd = global()?;
    let _guard = bcd.gate.lock();
    let stream = UnixStream::connect(&bcd.listen_path).map_err(Error::SocketFailed)?;
    Ok(ThreadHandle::new(stream, bcd.config.callbacks.clone()))
}

/// The signal-safe fatal path. Writes a fixed-size record on the control
/// pipe and blocks for the monitor's acknowledgement, without allocating
/// or taking any lock the monitor's own signal handling could contend on
/// indefinitely.
///
/// A second `fatal()` call on a thread that has already completed one is
/// a no-op, per §4.4.
pub fn fatal(message: &str) {
    let bcd = match BCD.get() {
        Some(bcd) => bcd,
        None => return,
    };
    if bcd.gate.fatal_already_done() {
        return;
    }
    // §4.4: acquiring the gate itself is an unbounded block, not subject
    // to `request_timeout` (that timeout belongs to the tracer
    // invocation the monitor runs afterward, per §5). `spin_lock` rather
    // than `lock` because this runs from a signal handler, where parking
    // on the mutex's blocking queue is not async-signal-safe; `None`
    // means busy-poll with no deadline instead of giving up early.
    let Some(guard) = bcd.gate.spin_lock(None) else {
        return;
    };
    let record = FatalRecord::new(message);
    if bcd.control.write_fatal_record(&record).is_ok() {
        let _ = bcd.control.read_fatal_ack();
    }
    bcd.gate.mark_fatal_done();
    drop(guard);
}

/// Tears down the monitor: signals it to exit and reaps it. Intended for
/// graceful process shutdown, not the fatal path (the monitor exits on
/// its own once the host's end of the control pipe closes, so this is a
/// courtesy for tests and long-lived hosts that want a clean join).
pub fn teardown() -> Result<(), Error> {
    let bcd = global()?;
    let _guard = bcd.gate.lock();
    let _ = nix::sys::signal::kill(bcd.monitor_pid, nix::sys::signal::Signal::SIGTERM);
    let _ = nix::sys::wait::waitpid(bcd.monitor_pid, None);
    let _ = std::fs::remove_file(&bcd.listen_path);
    Ok(())
}

/// Hygiene hook for a host that forks independently of `init()`. The
/// monitor is not duplicated by an ordinary host-side `fork(2)` (the
/// kernel only clones the calling process), so the forked child inherits
/// a control pipe and listen socket it must not use: this invalidates
/// the fatal-write fd so a stray `fatal()` call in the child fails fast
/// on a closed descriptor instead of writing into the parent's pipe.
///
/// This does not, and cannot, restore `bcd` functionality to the child.
/// `BCD` is a `OnceLock` copied as already-`Some` across `fork()`, and
/// `OnceLock` has no safe "unset" operation, so a subsequent `init()`
/// call in the child always fails with `AlreadyInitialized` rather than
/// attaching a fresh monitor of its own. A process that forks and wants
/// `bcd` in the child needs to `exec` a fresh binary image there (which
/// starts with an empty `OnceLock`) rather than calling `init()` again
/// in place.
pub fn on_fork_child() {
    if let Some(bcd) = BCD.get() {
        let raw = bcd.control.fatal_write_fd();
        // Closing the inherited fd makes any subsequent write fail fast
        // with EBADF instead of silently corroding the parent's pipe.
        unsafe {
            libc::close(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_before_init_reports_not_initialized() {
        // This test intentionally does not call `init()`; it only checks
        // the error path, since a real `init()` is process-global and
        // cannot be safely repeated across tests in one binary.
        if BCD.get().is_none() {
            assert_eq!(attach().unwrap_err().kind(), crate::error::ErrorKind::NotInitialized);
        }
    }

    #[test]
    fn listen_socket_path_is_stable_per_process() {
        assert_eq!(listen_socket_path(), listen_socket_path());
    }
}
