//! Tracer invocation: turning an admitted emit/fatal into a spawned
//! external process, per §4.5/§4.6.
//!
//! The state machine is `Admitted -> BuildingArgs -> Spawned -> Waiting
//! -> {Completed, TimedOut, SpawnFailed}`. Only one tracer runs at a
//! time; further admissions queue up to `queue_bound` deep and are
//! rejected with `QueueFull` beyond that, per §4.5's admission-control
//! requirement.
//!
//! Argument templates use the same five tokens as the spec's wire
//! format: `%p` (target pid), `%t` (every currently attached thread's
//! id, joined with `Separators::thread`), `%k` (attribute pairs, joined
//! per `Separators`), `%o` (the resolved output file path), `%m` (the
//! triggering message). Unrecognized `%`-sequences pass through
//! unchanged, matching a conservative printf-style templating approach.

use std::collections::VecDeque;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::{Config, Separators};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceRequestState {
    Admitted,
    BuildingArgs,
    Spawned,
    Waiting,
    Completed,
    TimedOut,
    SpawnFailed,
}

/// One admitted tracer invocation and the context it was admitted with.
#[derive(Debug, Clone)]
pub struct TraceRequest {
    pub thread_label: String,
    /// Every thread currently attached to the monitor at admission time,
    /// for `%t` substitution (§4.7: "space-separated list of thread ids
    /// with the configured thread separator"). Includes `thread_label`.
    pub thread_ids: Vec<String>,
    pub message: String,
    pub attributes: Vec<(String, String)>,
    pub target_pid: i32,
    pub is_fatal: bool,
    pub state: TraceRequestState,
}

impl TraceRequest {
    pub fn new(
        thread_label: String,
        thread_ids: Vec<String>,
        message: String,
        attributes: Vec<(String, String)>,
        target_pid: i32,
        is_fatal: bool,
    ) -> TraceRequest {
        TraceRequest {
            thread_label,
            thread_ids,
            message,
            attributes,
            target_pid,
            is_fatal,
            state: TraceRequestState::Admitted,
        }
    }
}

#[derive(Debug)]
pub enum TracerOutcome {
    Completed { request: TraceRequest, exit_code: Option<i32> },
    TimedOut { request: TraceRequest },
    SpawnFailed { request: TraceRequest, reason: String },
}

struct Running {
    request: TraceRequest,
    child: Child,
    started_at: Instant,
    sent_term: bool,
}

/// Owns the admission queue and the single in-flight tracer child, if
/// any. Polled once per event loop iteration.
pub struct Invoker {
    tracer_path: std::path::PathBuf,
    tracer_args: Vec<String>,
    separators: Separators,
    output_file_pattern: String,
    request_timeout: Option<Duration>,
    credentials: crate::config::Credentials,
    queue_bound: usize,
    queue: VecDeque<TraceRequest>,
    running: Option<Running>,
    sequence: u64,
    total_invocations: u64,
}

impl Invoker {
    pub fn new(config: &Config) -> Invoker {
        Invoker {
            tracer_path: config.tracer_path.clone(),
            tracer_args: config.tracer_args.clone(),
            separators: config.separators,
            output_file_pattern: config.output_file_pattern.clone(),
            request_timeout: config.request_timeout,
            credentials: config.credentials.clone(),
            queue_bound: config.queue_bound,
            queue: VecDeque::new(),
            running: None,
            sequence: 0,
            total_invocations: 0,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn is_busy(&self) -> bool {
        self.running.is_some()
    }

    /// Lifetime count of tracer children this invoker has successfully
    /// spawned. Backs the `Monitor::stats()` diagnostic accessor (§10.5).
    pub fn total_invocations(&self) -> u64 {
        self.total_invocations
    }

    /// Admits a request onto the queue. Rejects with `QueueFull` once the
    /// queue is at `queue_bound`, independent of whether a tracer is
    /// currently running.
    pub fn admit(&mut self, request: TraceRequest) -> Result<(), Error> {
        if self.queue.len() >= self.queue_bound {
            return Err(Error::QueueFull);
        }
        self.queue.push_back(request);
        Ok(())
    }

    /// Advances the state machine by one step: if nothing is running,
    /// pops the next queued request and spawns it; if something is
    /// running, checks whether it has finished or timed out. Called once
    /// per event loop tick.
    pub fn poll(&mut self) -> Option<TracerOutcome> {
        if self.running.is_none() {
            if let Some(mut request) = self.queue.pop_front() {
                request.state = TraceRequestState::BuildingArgs;
                match self.spawn(&request) {
                    Ok(child) => {
                        request.state = TraceRequestState::Spawned;
                        self.total_invocations += 1;
                        self.running = Some(Running {
                            request,
                            child,
                            started_at: Instant::now(),
                            sent_term: false,
                        });
                    }
                    Err(reason) => {
                        request.state = TraceRequestState::SpawnFailed;
                        return Some(TracerOutcome::SpawnFailed { request, reason });
                    }
                }
            }
            return None;
        }

        let timed_out = self.timeout_elapsed();
        let running = self.running.as_mut().unwrap();
        running.request.state = TraceRequestState::Waiting;

        match running.child.try_wait() {
            Ok(Some(status)) => {
                let Running { mut request, .. } = self.running.take().unwrap();
                request.state = TraceRequestState::Completed;
                Some(TracerOutcome::Completed {
                    request,
                    exit_code: status.code(),
                })
            }
            Ok(None) => {
                if timed_out {
                    self.escalate_timeout();
                    if self.running.is_none() {
                        return None;
                    }
                    let running = self.running.as_ref().unwrap();
                    if running.sent_term && running.started_at.elapsed()
                        > self.request_timeout.unwrap_or_default() + Duration::from_millis(500)
                    {
                        let Running { mut request, .. } = self.running.take().unwrap();
                        request.state = TraceRequestState::TimedOut;
                        return Some(TracerOutcome::TimedOut { request });
                    }
                }
                None
            }
            Err(_) => {
                let Running { mut request, .. } = self.running.take().unwrap();
                request.state = TraceRequestState::TimedOut;
                Some(TracerOutcome::TimedOut { request })
            }
        }
    }

    fn timeout_elapsed(&self) -> bool {
        match (&self.running, self.request_timeout) {
            (Some(running), Some(timeout)) => running.started_at.elapsed() > timeout,
            _ => false,
        }
    }

    /// Sends SIGTERM on the first timeout tick, then SIGKILL on a later
    /// one if the tracer has not exited. Two steps so a tracer that
    /// traps SIGTERM for cleanup gets a brief window before being
    /// killed outright.
    fn escalate_timeout(&mut self) {
        let running = self.running.as_mut().unwrap();
        let pid = Pid::from_raw(running.child.id() as i32);
        if !running.sent_term {
            let _ = kill(pid, Signal::SIGTERM);
            running.sent_term = true;
        } else {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = running.child.wait();
        }
    }

    fn spawn(&mut self, request: &TraceRequest) -> Result<Child, String> {
        self.sequence += 1;
        let output_file = resolve_output_file(&self.output_file_pattern, request, self.sequence);
        let args = substitute_args(&self.tracer_args, &self.separators, request, &output_file);
        let mut command = Command::new(&self.tracer_path);
        command.args(&args);
        command.stdin(Stdio::null());
        // By default both streams go to the same resolved output file,
        // per §4.7; a tracer that wants to tell stdout from stderr apart
        // can still do so via its own argv (e.g. a `%o.err` pattern).
        match open_output_file(&output_file) {
            Ok((stdout_file, stderr_file)) => {
                command.stdout(Stdio::from(stdout_file));
                command.stderr(Stdio::from(stderr_file));
            }
            Err(err) => {
                tracing::warn!(error = %err, path = %output_file, "failed to open tracer output file, falling back to /dev/null");
                command.stdout(Stdio::null());
                command.stderr(Stdio::null());
            }
        }
        if let Some(uid) = self.credentials.uid {
            command.uid(uid);
        }
        if let Some(gid) = self.credentials.gid {
            command.gid(gid);
        }
        command.spawn().map_err(|e| e.to_string())
    }

    /// Kills and reaps any in-flight tracer. Used when the monitor itself
    /// is tearing down.
    pub fn shutdown(&mut self) {
        if let Some(mut running) = self.running.take() {
            let pid = Pid::from_raw(running.child.id() as i32);
            let _ = kill(pid, Signal::SIGKILL);
            let _ = running.child.wait();
        }
        self.queue.clear();
    }
}

/// Resolves the output-file-pattern into a concrete path. Per §4.7 the
/// pattern may reference `%p` (target pid), `%u` (unix timestamp at
/// resolution time), and `%n` (a per-monitor invocation sequence number),
/// independent of the `%o` token substituted into the tracer's own argv.
fn resolve_output_file(pattern: &str, request: &TraceRequest, sequence: u64) -> String {
    let unix_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    pattern
        .replace("%p", &request.target_pid.to_string())
        .replace("%u", &unix_time.to_string())
        .replace("%n", &sequence.to_string())
}

/// Opens the resolved output file twice (once per stream) so stdout and
/// stderr each get their own, independently-positioned file descriptor
/// sharing the same underlying path.
fn open_output_file(path: &str) -> std::io::Result<(std::fs::File, std::fs::File)> {
    let open = || {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
    };
    Ok((open()?, open()?))
}

fn substitute_args(
    template: &[String],
    separators: &Separators,
    request: &TraceRequest,
    output_file: &str,
) -> Vec<String> {
    let joined_kv: String = request
        .attributes
        .iter()
        .map(|(k, v)| format!("{k}{}{v}", separators.kv))
        .collect::<Vec<_>>()
        .join(&separators.pair.to_string());
    let joined_threads = request.thread_ids.join(&separators.thread.to_string());

    template
        .iter()
        .map(|arg| substitute_token(arg, request, &joined_kv, &joined_threads))
        .map(|arg| arg.replace("%o", output_file))
        .collect()
}

fn substitute_token(
    template: &str,
    request: &TraceRequest,
    joined_kv: &str,
    joined_threads: &str,
) -> String {
    template
        .replace("%p", &request.target_pid.to_string())
        .replace("%t", joined_threads)
        .replace("%k", joined_kv)
        .replace("%m", &shell_quote(&request.message))
}

/// Single-quotes `value` for safe inclusion as one argv token in a
/// shell-interpreted tracer command line, per §4.7's "shell-quoted"
/// requirement for `%m`. Embedded single quotes are closed, escaped, and
/// reopened (`'\''`), the standard POSIX idiom.
fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn base_config() -> Config {
        Config::init()
            .tracer_path("/bin/true")
            .tracer_args(vec!["%p".to_string(), "%t".to_string(), "%k".to_string()])
            .build()
            .unwrap()
    }

    #[test]
    fn admit_rejects_beyond_queue_bound() {
        let mut config = base_config();
        config.queue_bound = 1;
        let mut invoker = Invoker::new(&config);
        invoker
            .admit(TraceRequest::new("t1".into(), vec!["t1".into()], "m".into(), vec![], 1, false))
            .unwrap();
        let err = invoker
            .admit(TraceRequest::new("t2".into(), vec!["t2".into()], "m".into(), vec![], 1, false))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::QueueFull);
    }

    #[test]
    fn substitute_args_fills_every_token() {
        let request = TraceRequest::new(
            "worker-3".into(),
            vec!["worker-2".into(), "worker-3".into()],
            "boom".into(),
            vec![("service".into(), "api".into())],
            4242,
            false,
        );
        let separators = Separators::default();
        let args = substitute_args(
            &["%p".to_string(), "%t".to_string(), "%k".to_string(), "%m".to_string()],
            &separators,
            &request,
            "%o",
        );
        assert_eq!(args[0], "4242");
        assert_eq!(args[1], "worker-2,worker-3");
        assert_eq!(args[2], "service:api");
        assert_eq!(args[3], "'boom'");
    }

    #[test]
    fn shell_quote_escapes_embedded_single_quotes() {
        assert_eq!(shell_quote("boom"), "'boom'");
        assert_eq!(shell_quote("it's broken"), "'it'\\''s broken'");
    }

    #[test]
    fn poll_spawns_queued_request_and_reports_completion() {
        let config = base_config();
        let mut invoker = Invoker::new(&config);
        invoker
            .admit(TraceRequest::new("t1".into(), vec!["t1".into()], "m".into(), vec![], 1, false))
            .unwrap();
        assert!(invoker.poll().is_none());
        assert!(invoker.is_busy());

        // Poll until the spawned /bin/true exits.
        let mut outcome = None;
        for _ in 0..200 {
            if let Some(o) = invoker.poll() {
                outcome = Some(o);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        match outcome {
            Some(TracerOutcome::Completed { exit_code, .. }) => assert_eq!(exit_code, Some(0)),
            other => panic!("expected completion, got {other:?}"),
        }
    }
}
