//! The configuration record described in §3/§4.1 of the design: immutable
//! once `init()` succeeds, and owned by the monitor across the fork
//! boundary.
//!
//! Because `init()` only forks (it never execve's the monitor into a
//! separate binary image — see [`crate::host::init`]), the monitor's copy
//! of `Config` is a plain copy-on-write duplicate of the host's. Unlike a
//! collector that hands configuration to an execve'd receiver, there is no
//! need to serialize callbacks to cross the boundary: trait objects and
//! their vtables stay valid in the child because it is still running the
//! same binary image.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

/// Default queue depth for admitted, not-yet-spawned trace requests.
pub const DEFAULT_QUEUE_BOUND: usize = 256;

/// Invoked in the monitor process when a request cannot be serviced or the
/// tracer itself fails (non-zero exit, spawn failure, timeout).
pub trait MonitorErrorCallback: Send + Sync {
    fn on_monitor_error(&self, err: &Error);
}

/// Invoked in the host process when a channel operation fails (a non-OK
/// reply, or the channel breaking outright).
pub trait RequestErrorCallback: Send + Sync {
    fn on_request_error(&self, err: &Error);
}

/// The capability record bundling both callback slots. Kept as a record of
/// interface objects, not free function pointers, so callers can carry
/// arbitrary context without resorting to global state.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub monitor_error: Option<Arc<dyn MonitorErrorCallback>>,
    pub request_error: Option<Arc<dyn RequestErrorCallback>>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("monitor_error", &self.monitor_error.is_some())
            .field("request_error", &self.request_error.is_some())
            .finish()
    }
}

/// The single-character delimiters used when formatting `%t` (thread ids)
/// and `%k` (attribute pairs) in the tracer argument template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Separators {
    /// Joins successive `key=value` pairs in `%k`.
    pub pair: char,
    /// Joins a key to its value within one pair in `%k`.
    pub kv: char,
    /// Joins thread ids in `%t`.
    pub thread: char,
}

impl Default for Separators {
    fn default() -> Self {
        Separators {
            pair: ' ',
            kv: ':',
            thread: ',',
        }
    }
}

/// Credentials the monitor applies to itself (and the tracer it spawns)
/// after forking off the host.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub supplementary_groups: Option<Vec<u32>>,
}

/// `/proc/<pid>/oom_score_adj` value applied to the monitor (and
/// inherited by the tracer) so the kernel OOM killer prefers to kill the
/// monitor over the host, or vice versa, per deployment policy.
pub type OomScoreAdjustment = i32;

/// Immutable, validated configuration. Build one with [`Config::init`].
#[derive(Clone)]
pub struct Config {
    pub tracer_path: PathBuf,
    pub tracer_args: Vec<String>,
    pub target_pid_override: Option<i32>,
    pub credentials: Credentials,
    pub oom_score_adjustment: Option<OomScoreAdjustment>,
    pub separators: Separators,
    pub output_file_pattern: String,
    pub handshake_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub queue_bound: usize,
    pub suspend_other_threads: bool,
    pub chdir: Option<PathBuf>,
    pub umask: Option<u32>,
    pub callbacks: Callbacks,
}

/// Chainable builder mirroring `config_init`'s role of "populate
/// defaults, then let the caller override before freezing".
#[derive(Clone)]
pub struct ConfigBuilder {
    tracer_path: Option<PathBuf>,
    tracer_args: Vec<String>,
    target_pid_override: Option<i32>,
    credentials: Credentials,
    oom_score_adjustment: Option<OomScoreAdjustment>,
    separators: Separators,
    output_file_pattern: String,
    handshake_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    queue_bound: usize,
    suspend_other_threads: bool,
    chdir: Option<PathBuf>,
    umask: Option<u32>,
    callbacks: Callbacks,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        ConfigBuilder {
            tracer_path: None,
            tracer_args: Vec::new(),
            target_pid_override: None,
            credentials: Credentials::default(),
            oom_score_adjustment: None,
            separators: Separators::default(),
            output_file_pattern: default_output_file_pattern(),
            handshake_timeout: None,
            request_timeout: None,
            queue_bound: DEFAULT_QUEUE_BOUND,
            suspend_other_threads: false,
            chdir: None,
            umask: None,
            callbacks: Callbacks::default(),
        }
    }
}

impl Config {
    /// Returns a builder populated with the documented defaults: no tracer
    /// path (init fails until one is set), separators `(" ", ":", ",")`,
    /// unbounded timeouts, `suspend_other_threads` false, no callbacks.
    pub fn init() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

impl ConfigBuilder {
    pub fn tracer_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tracer_path = Some(path.into());
        self
    }

    pub fn tracer_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.tracer_args = args.into_iter().collect();
        self
    }

    pub fn target_pid_override(mut self, pid: i32) -> Self {
        self.target_pid_override = Some(pid);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn oom_score_adjustment(mut self, adjustment: OomScoreAdjustment) -> Self {
        self.oom_score_adjustment = Some(adjustment);
        self
    }

    pub fn separators(mut self, separators: Separators) -> Self {
        self.separators = separators;
        self
    }

    pub fn output_file_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.output_file_pattern = pattern.into();
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn queue_bound(mut self, bound: usize) -> Self {
        self.queue_bound = bound;
        self
    }

    pub fn suspend_other_threads(mut self, suspend: bool) -> Self {
        self.suspend_other_threads = suspend;
        self
    }

    pub fn chdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.chdir = Some(dir.into());
        self
    }

    pub fn umask(mut self, umask: u32) -> Self {
        self.umask = Some(umask);
        self
    }

    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Validates and freezes the configuration. This is the `config_init`
    /// defaults-population plus the §4.1 validation rules rolled into one
    /// call, since the idiomatic Rust rendition has no separate
    /// "initialize a mutable struct in place" step.
    pub fn build(self) -> Result<Config, Error> {
        let tracer_path = self
            .tracer_path
            .ok_or_else(|| Error::InvalidConfig("tracer path is not set".to_string()))?;
        if tracer_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("tracer path is empty".to_string()));
        }
        if !is_executable(&tracer_path) {
            return Err(Error::InvalidConfig(format!(
                "tracer path {:?} does not resolve to an executable",
                tracer_path
            )));
        }
        let Separators { pair, kv, thread } = self.separators;
        if pair == '\0' || kv == '\0' || thread == '\0' {
            return Err(Error::InvalidConfig(
                "separators must be non-empty single characters".to_string(),
            ));
        }
        if self.queue_bound == 0 {
            return Err(Error::InvalidConfig(
                "queue bound must be greater than zero".to_string(),
            ));
        }

        Ok(Config {
            tracer_path,
            tracer_args: self.tracer_args,
            target_pid_override: self.target_pid_override,
            credentials: self.credentials,
            oom_score_adjustment: self.oom_score_adjustment,
            separators: self.separators,
            output_file_pattern: self.output_file_pattern,
            handshake_timeout: self.handshake_timeout,
            request_timeout: self.request_timeout,
            queue_bound: self.queue_bound,
            suspend_other_threads: self.suspend_other_threads,
            chdir: self.chdir,
            umask: self.umask,
            callbacks: self.callbacks,
        })
    }
}

/// The built-in default output-file-pattern: one file per target process
/// per tracer invocation sequence number, under the system temp
/// directory. Callers that want timestamped names can override with a
/// pattern that also includes `%u`.
fn default_output_file_pattern() -> String {
    format!("{}/bcd.%p.%n", std::env::temp_dir().display())
}

/// Resolves `path` the way a shell would: absolute/relative paths are
/// checked directly, bare names are looked up on `$PATH`.
fn is_executable(path: &std::path::Path) -> bool {
    #[cfg(unix)]
    fn is_exec_file(path: &std::path::Path) -> bool {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    if path.components().count() > 1 || path.is_absolute() {
        return is_exec_file(path);
    }
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            if is_exec_file(&dir.join(path)) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_fails_without_tracer_path() {
        let err = Config::init().build().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidConfig);
    }

    #[test]
    fn build_fails_for_nonexistent_tracer() {
        let err = Config::init()
            .tracer_path("/no/such/tracer-binary-ever")
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidConfig);
    }

    #[test]
    fn build_succeeds_for_bin_true() {
        let cfg = Config::init().tracer_path("/bin/true").build().unwrap();
        assert_eq!(cfg.separators, Separators::default());
        assert_eq!(cfg.queue_bound, DEFAULT_QUEUE_BOUND);
    }

    #[test]
    fn build_rejects_zero_queue_bound() {
        let err = Config::init()
            .tracer_path("/bin/true")
            .queue_bound(0)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidConfig);
    }
}
