//! The monitor's single-threaded, cooperative event loop, per §4.6.
//!
//! One iteration: poll the control pipe, the listener, and every
//! attached session's socket; accept new connections; fully service at
//! most one request per attached session; advance the tracer state
//! machine by one step; then check the control pipe for a fatal record.
//! Checking fatal last, after every session's pending request has been
//! drained for this tick, is what gives the ordering guarantee in
//! §4.8: a fatal marker is never serviced mid-way through an in-flight
//! emit's admission.

use std::collections::HashMap;
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::control_pipe::MonitorControlPipe;
use crate::error::{Error, ErrorKind};
use crate::protocol::{read_request, write_reply, FatalAck, Reply, Request};

use super::invoker::{Invoker, TraceRequest, TracerOutcome};
use super::session::Session;

/// How long a single `poll(2)` call waits with no activity before
/// returning anyway, so the invoker's timeout/spawn bookkeeping keeps
/// advancing even during an idle period.
const POLL_TICK: Duration = Duration::from_millis(25);

pub fn run(config: Config, control: MonitorControlPipe, listener: UnixListener, listen_path: PathBuf) {
    let mut invoker = Invoker::new(&config);
    let mut sessions: HashMap<RawFd, Session> = HashMap::new();
    let host_pid = std::os::unix::process::parent_id() as i32;
    let mut next_thread_label = 0u64;

    loop {
        let mut pollfds = Vec::with_capacity(sessions.len() + 2);
        pollfds.push(libc::pollfd {
            fd: control.fatal_read_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        pollfds.push(libc::pollfd {
            fd: listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for fd in sessions.keys() {
            pollfds.push(libc::pollfd {
                fd: *fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }

        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                POLL_TICK.as_millis() as libc::c_int,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %err, "monitor poll failed");
            break;
        }

        // Control pipe: EOF or POLLHUP means the host exited.
        if pollfds[0].revents & (libc::POLLHUP | libc::POLLERR) != 0
            && pollfds[0].revents & libc::POLLIN == 0
        {
            break;
        }
        if pollfds[0].revents & libc::POLLIN != 0 {
            if let Ok(record) = control.read_fatal_record() {
                let thread_ids: Vec<String> =
                    sessions.values().map(|s| s.thread_label.clone()).collect();
                let request = TraceRequest::new(
                    "fatal".to_string(),
                    thread_ids,
                    record.message.into_string(),
                    Vec::new(),
                    host_pid,
                    true,
                );
                let ack_status = match invoker.admit(request) {
                    Ok(()) => drive_fatal_to_completion(&config, &mut invoker),
                    Err(err) => {
                        report_monitor_error(&config, &err);
                        err.kind()
                    }
                };
                let _ = control.write_fatal_ack(&FatalAck { status: ack_status });
            }
            // Either a real fatal record or a closed pipe (read failure):
            // per §4.6 item 1, the monitor dispatches the fatal
            // invocation, writes the acknowledgement, and exits cleanly;
            // there is nothing left for this process to do afterward.
            break;
        }

        if pollfds[1].revents & libc::POLLIN != 0 {
            while let Ok((stream, _addr)) = listener.accept() {
                let fd = stream.as_raw_fd();
                next_thread_label += 1;
                let label = format!("thread-{next_thread_label}");
                sessions.insert(fd, Session::new(stream, label));
            }
        }

        let mut to_remove = Vec::new();
        for pollfd in &pollfds[2..] {
            if pollfd.revents & libc::POLLIN == 0 && pollfd.revents & (libc::POLLHUP | libc::POLLERR) == 0 {
                continue;
            }
            let fd = pollfd.fd;
            // Snapshot every currently attached thread's label so `%t`
            // can list the full set per §4.7, not just the session that
            // happens to be handling this particular request.
            let thread_ids: Vec<String> =
                sessions.values().map(|s| s.thread_label.clone()).collect();
            let Some(session) = sessions.get_mut(&fd) else {
                continue;
            };
            match service_session(session, &thread_ids, &mut invoker, &config, host_pid) {
                ServiceOutcome::Continue => {}
                ServiceOutcome::Close => to_remove.push(fd),
            }
        }
        for fd in to_remove {
            sessions.remove(&fd);
        }

        while let Some(outcome) = invoker.poll() {
            handle_outcome(&config, outcome);
            if !invoker.is_busy() && invoker.queue_depth() == 0 {
                break;
            }
        }
    }

    invoker.shutdown();
    let _ = std::fs::remove_file(&listen_path);
}

/// Blocks the event loop, polling the invoker in a tight loop, until the
/// fatal request just admitted reaches a terminal state. Per §4.4/§4.6
/// item 1, the monitor "dispatch[es] a fatal TraceRequest synchronously
/// (waiting for the invoker to finish)" before acknowledging, so this
/// does not return until a `TracerOutcome` carrying the fatal request
/// itself comes back — any other outcome drained along the way (an
/// emit that was already running, or queued ahead of the fatal one) is
/// handled exactly the way an ordinary tick would handle it.
fn drive_fatal_to_completion(config: &Config, invoker: &mut Invoker) -> ErrorKind {
    loop {
        match invoker.poll() {
            Some(outcome) => {
                let is_fatal = outcome_is_fatal(&outcome);
                let status = outcome_status(&outcome);
                handle_outcome(config, outcome);
                if is_fatal {
                    return status;
                }
            }
            None => std::thread::sleep(POLL_TICK),
        }
    }
}

fn outcome_is_fatal(outcome: &TracerOutcome) -> bool {
    match outcome {
        TracerOutcome::Completed { request, .. } => request.is_fatal,
        TracerOutcome::TimedOut { request } => request.is_fatal,
        TracerOutcome::SpawnFailed { request, .. } => request.is_fatal,
    }
}

fn outcome_status(outcome: &TracerOutcome) -> ErrorKind {
    match outcome {
        TracerOutcome::Completed { exit_code, .. } => {
            if *exit_code == Some(0) {
                ErrorKind::Ok
            } else {
                ErrorKind::TracerNonzeroExit
            }
        }
        TracerOutcome::TimedOut { .. } => ErrorKind::TimedOut,
        TracerOutcome::SpawnFailed { .. } => ErrorKind::SpawnFailed,
    }
}

enum ServiceOutcome {
    Continue,
    Close,
}

fn service_session(
    session: &mut Session,
    thread_ids: &[String],
    invoker: &mut Invoker,
    config: &Config,
    host_pid: i32,
) -> ServiceOutcome {
    let request = match read_request(&mut session.stream) {
        Ok(request) => request,
        Err(_) => return ServiceOutcome::Close,
    };

    // `Stats` answers with a fixed-width `StatsReply`, not the ordinary
    // status+message `Reply` every other op uses, so it is handled before
    // falling into the common reply path below.
    if matches!(request, Request::Stats) {
        let stats = crate::protocol::StatsReply {
            queue_depth: invoker.queue_depth() as u32,
            total_invocations: invoker.total_invocations(),
            tracer_running: invoker.is_busy(),
        };
        return if stats.write(&mut session.stream).is_ok() {
            ServiceOutcome::Continue
        } else {
            ServiceOutcome::Close
        };
    }

    let reply = match request {
        Request::KvSet { key, value } => {
            session.attributes.set(key.as_str(), value.as_str());
            Reply::ok()
        }
        Request::KvDelete { key } => {
            session.attributes.delete(key.as_str());
            Reply::ok()
        }
        Request::Emit { message } => {
            let trace_request = TraceRequest::new(
                session.thread_label.clone(),
                thread_ids.to_vec(),
                message.into_string(),
                session.attributes.snapshot(),
                config.target_pid_override.unwrap_or(host_pid),
                false,
            );
            match invoker.admit(trace_request) {
                Ok(()) => Reply::ok(),
                Err(err) => Reply::err(&err),
            }
        }
        Request::Detach => {
            session.detached = true;
            Reply::ok()
        }
        Request::Stats => unreachable!("handled above"),
    };

    if write_reply(&mut session.stream, &reply).is_err() {
        return ServiceOutcome::Close;
    }

    // Drain a trailing zero-byte read so a client that closes its socket
    // right after `detach()` doesn't leave a lingering POLLHUP session.
    if session.detached {
        let mut probe = [0u8; 1];
        let _ = session.stream.read(&mut probe);
        return ServiceOutcome::Close;
    }
    ServiceOutcome::Continue
}

fn handle_outcome(config: &Config, outcome: TracerOutcome) {
    match outcome {
        TracerOutcome::Completed { exit_code, .. } => {
            if exit_code != Some(0) {
                let exit_code = exit_code.unwrap_or(-1);
                report_monitor_error(config, &Error::TracerNonzeroExit(exit_code));
            }
        }
        TracerOutcome::TimedOut { .. } => {
            report_monitor_error(config, &Error::TimedOut);
        }
        TracerOutcome::SpawnFailed { reason, .. } => {
            report_monitor_error(config, &Error::SpawnFailed(reason));
        }
    }
}

fn report_monitor_error(config: &Config, err: &Error) {
    tracing::warn!(error = %err, "monitor error");
    if let Some(callback) = &config.callbacks.monitor_error {
        callback.on_monitor_error(err);
    }
}
