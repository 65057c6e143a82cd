//! Per-thread attribute/emit channel, per §4.3.
//!
//! Each thread that calls `attach()` gets its own connected stream socket
//! to the monitor's listener. Every subsequent call on that handle is a
//! synchronous send-request/await-reply round trip: the calling thread
//! blocks until the monitor has processed the operation, so a `kv_set`
//! that returns `Ok` is guaranteed visible to any tracer invocation the
//! monitor admits afterward.

use std::os::unix::net::UnixStream;

use crate::bounded::{BoundedString, MAX_KEY_LEN, MAX_MESSAGE_LEN, MAX_VALUE_LEN};
use crate::config::Callbacks;
use crate::error::Error;
use crate::protocol::{read_reply, write_request, Request, StatsReply};

/// A thread's live connection to the monitor. Not `Sync`: the protocol is
/// strictly single-writer/single-reader per channel, so sharing one
/// handle across threads would interleave unrelated requests on the wire.
pub struct ThreadHandle {
    stream: UnixStream,
    callbacks: Callbacks,
    detached: bool,
}

impl ThreadHandle {
    pub(crate) fn new(stream: UnixStream, callbacks: Callbacks) -> ThreadHandle {
        ThreadHandle {
            stream,
            callbacks,
            detached: false,
        }
    }

    /// Sets or overwrites an attribute key visible to future tracer
    /// invocations on this thread.
    pub fn kv_set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        let key = BoundedString::<MAX_KEY_LEN>::new(key)?;
        let value = BoundedString::<MAX_VALUE_LEN>::new(value)?;
        self.call(Request::KvSet { key, value })
    }

    /// Removes a previously set attribute key. Removing an absent key is
    /// not an error per §4.3's edge cases.
    pub fn kv_delete(&mut self, key: &str) -> Result<(), Error> {
        let key = BoundedString::<MAX_KEY_LEN>::new(key)?;
        self.call(Request::KvDelete { key })
    }

    /// Emits a non-fatal grouping message, admitting a tracer invocation
    /// against this thread's current attribute snapshot. Blocks until the
    /// monitor has finished dispatching (or rejecting) that invocation.
    pub fn emit(&mut self, message: &str) -> Result<(), Error> {
        let message = BoundedString::<MAX_MESSAGE_LEN>::new(message)?;
        self.call(Request::Emit { message })
    }

    /// Reads a snapshot of the monitor's invoker state: queue depth,
    /// lifetime tracer invocation count, and whether a tracer is
    /// currently running. Supplemental diagnostic accessor (§10.5), not
    /// part of the core request/reply status protocol.
    pub fn stats(&mut self) -> Result<StatsReply, Error> {
        if self.detached {
            return Err(Error::ChannelClosed);
        }
        let result = write_request(&mut self.stream, &Request::Stats)
            .map_err(|_| Error::ChannelClosed)
            .and_then(|()| StatsReply::read(&mut self.stream).map_err(|_| Error::ChannelClosed));
        if let Err(err) = &result {
            if let Some(callback) = &self.callbacks.request_error {
                callback.on_request_error(err);
            }
        }
        result
    }

    /// Detaches this thread's channel. The handle is unusable afterward;
    /// a second `detach()` (or any other call) returns `ChannelClosed`.
    pub fn detach(mut self) -> Result<(), Error> {
        let result = self.call(Request::Detach);
        self.detached = true;
        result
    }

    fn call(&mut self, request: Request) -> Result<(), Error> {
        if self.detached {
            return Err(Error::ChannelClosed);
        }
        let result = write_request(&mut self.stream, &request)
            .map_err(|_| Error::ChannelClosed)
            .and_then(|()| read_reply(&mut self.stream))
            .and_then(|reply| reply.into_result());
        if let Err(err) = &result {
            if let Some(callback) = &self.callbacks.request_error {
                callback.on_request_error(err);
            }
        }
        result
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        // Best-effort: a thread that exits without calling `detach()`
        // explicitly still releases the monitor-side session when its
        // socket closes, so this is a courtesy, not a correctness
        // requirement.
        if !self.detached {
            let _ = write_request(&mut self.stream, &Request::Detach);
        }
    }
}
