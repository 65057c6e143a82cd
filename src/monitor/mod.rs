//! The monitor process: the forked child that owns the listen socket,
//! the per-thread sessions, and the tracer invocation queue.
//!
//! ```text
//!   host process                         monitor process
//!   ------------                         ----------------
//!   init() forks -------------------->   run()
//!                                           binds nothing (inherits
//!                                           the listener bound by the
//!                                           host before fork)
//!                                           writes Handshake::ok() on
//!                                           the ack pipe
//!   read_handshake() <-----------------
//!   attach() connects  -------------->   event_loop accepts, creates
//!                                         a Session
//!   kv_set/emit -----------------------> Session updates its
//!                                         AttributeMap / Invoker
//!                                         admits a TraceRequest
//!   fatal() writes FatalRecord -------->  event_loop drains the
//!                                         in-flight session request
//!                                         first, then dispatches the
//!                                         tracer against the fatal
//!                                         message and the triggering
//!                                         thread's last snapshot
//!                      <---------------- FatalAck
//! ```
//!
//! The event loop is single-threaded and cooperative: it is the one
//! place responsible for the ordering property in §4.8 ("fatal blocks
//! until any in-flight emit has been admitted") by construction, since it
//! never starts servicing the control pipe mid-way through a session
//! request.

mod event_loop;
mod invoker;
mod session;

use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

use crate::config::Config;
use crate::control_pipe::MonitorControlPipe;
use crate::protocol::Handshake;

/// Entry point for the forked monitor child. Never returns: the event
/// loop runs until the control pipe's fatal half closes (the host
/// exited) or a `teardown()` SIGTERM arrives.
pub fn run(
    config: Config,
    control: MonitorControlPipe,
    listener: UnixListener,
    listen_path: PathBuf,
) -> ! {
    close_inherited_fds(&[
        control.fatal_read_fd(),
        control.ack_write_fd(),
        listener.as_raw_fd(),
    ]);
    apply_process_settings(&config);

    if let Err(err) = listener.set_nonblocking(true) {
        let _ = control.write_handshake(&Handshake::err(&crate::error::Error::SocketFailed(err)));
        std::process::exit(1);
    }

    if let Err(err) = control.write_handshake(&Handshake::ok()) {
        tracing::error!(error = %err, "failed to write monitor handshake");
        std::process::exit(1);
    }

    event_loop::run(config, control, listener, listen_path);
    std::process::exit(0);
}

/// Closes every file descriptor inherited across `fork()` except stdio
/// and the handful in `keep` (the control pipe halves and the listen
/// socket), per §5's "all non-essential descriptors are closed in the
/// monitor child before the listen socket is created" requirement. Best
/// effort: a host that has `/proc` unavailable (e.g. a restrictive
/// container) just keeps whatever it inherited.
fn close_inherited_fds(keep: &[RawFd]) {
    let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
        return;
    };
    // Collect fd numbers before closing any of them: the directory
    // listing is itself backed by an open fd, and closing entries while
    // still iterating over it is undefined behavior.
    let fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_string_lossy().parse::<RawFd>().ok())
        .collect();
    for fd in fds {
        if fd <= 2 || keep.contains(&fd) {
            continue;
        }
        unsafe {
            libc::close(fd);
        }
    }
}

/// Applies the credentials, umask, chdir and OOM-score settings from
/// config to the monitor process itself, before it starts accepting
/// connections. The tracer it later spawns inherits these unless the
/// request overrides them explicitly.
fn apply_process_settings(config: &Config) {
    use nix::unistd::{Gid, Uid};

    if let Some(mask) = config.umask {
        nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(mask));
    }
    if let Some(dir) = &config.chdir {
        if let Err(err) = std::env::set_current_dir(dir) {
            tracing::warn!(error = %err, dir = %dir.display(), "monitor chdir failed");
        }
    }
    if let Some(gid) = config.credentials.gid {
        if let Err(err) = nix::unistd::setgid(Gid::from_raw(gid)) {
            tracing::warn!(error = %err, "monitor setgid failed");
        }
    }
    if let Some(uid) = config.credentials.uid {
        if let Err(err) = nix::unistd::setuid(Uid::from_raw(uid)) {
            tracing::warn!(error = %err, "monitor setuid failed");
        }
    }
    if let Some(adjustment) = config.oom_score_adjustment {
        let path = format!("/proc/{}/oom_score_adj", std::process::id());
        if let Err(err) = std::fs::write(&path, adjustment.to_string()) {
            tracing::warn!(error = %err, "failed to set oom_score_adj");
        }
    }
}

pub(crate) use invoker::{Invoker, TraceRequest, TracerOutcome};
pub(crate) use session::{AttributeMap, Session};
