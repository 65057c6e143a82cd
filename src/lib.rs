//! Out-of-process crash and error reporting monitor.
//!
//! `init()` forks a monitor that owns a signal-safe fatal path, a
//! per-thread attribute/emit channel, and an external tracer invocation
//! queue. See each module's doc comment for the corresponding piece of
//! the design: [`protocol`] for the wire formats, [`control_pipe`] for
//! the init/fatal transport, [`handle`] for the per-thread channel, and
//! [`monitor`] for the forked child's event loop.

pub mod bounded;
pub mod config;
pub mod control_pipe;
pub mod error;
mod handle;
mod host;
mod monitor;
pub mod ordering_gate;
pub mod protocol;

pub use config::{Callbacks, Config, ConfigBuilder, Credentials, MonitorErrorCallback, Separators};
pub use error::{Error, ErrorKind};
pub use handle::ThreadHandle;
pub use host::{attach, fatal, init, on_fork_child, teardown};

pub use config::RequestErrorCallback;
pub use protocol::StatsReply;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_before_init_is_a_silent_no_op() {
        // `fatal()` must never panic even if called before `init()`
        // (e.g. a crash during startup); it simply has nothing to report
        // to.
        fatal("unreachable startup failure");
    }
}
