//! The control pipe pair used for the one-time init handshake and for the
//! fatal path, per §4.2/§4.4/§4.6.
//!
//! Two pipes, not one: `fatal_pipe` carries the fixed-size fatal record
//! from host to monitor, and `ack_pipe` carries both the monitor's
//! one-shot handshake reply and every subsequent fatal acknowledgement
//! back to the host. Splitting them this way means the monitor's read
//! side for `fatal_pipe` never has to distinguish a handshake from a
//! fatal record, and the host's read side for `ack_pipe` never has to
//! distinguish a handshake reply from a fatal ack beyond the one time it
//! reads each in a single well-defined order. See DESIGN.md for why
//! spec.md's singular "the control pipe" was resolved this way.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::unistd::pipe;

use crate::error::Error;
use crate::protocol::{FatalAck, FatalRecord, Handshake, FATAL_RECORD_LEN};

/// The host's end of the control pipe pair: write fatal records, read
/// back the handshake and fatal acknowledgements.
pub struct HostControlPipe {
    fatal_write: OwnedFd,
    ack_read: OwnedFd,
}

/// The monitor's end: read fatal records, write the handshake and fatal
/// acknowledgements.
pub struct MonitorControlPipe {
    fatal_read: OwnedFd,
    ack_write: OwnedFd,
}

/// Creates both pipes before forking, so each side can be handed its half
/// and the unused halves closed in the child/parent respectively.
pub fn create_pair() -> Result<(HostControlPipe, MonitorControlPipe), Error> {
    let (fatal_read, fatal_write) = pipe().map_err(Error::ForkFailed)?;
    let (ack_read, ack_write) = pipe().map_err(Error::ForkFailed)?;
    Ok((
        HostControlPipe {
            fatal_write,
            ack_read,
        },
        MonitorControlPipe {
            fatal_read,
            ack_write,
        },
    ))
}

impl HostControlPipe {
    pub fn fatal_write_fd(&self) -> RawFd {
        self.fatal_write.as_raw_fd()
    }

    pub fn ack_read_fd(&self) -> RawFd {
        self.ack_read.as_raw_fd()
    }

    /// Reads the one-shot handshake the monitor writes after binding its
    /// listen socket. Not on the signal path: ordinary buffered I/O is
    /// fine here.
    pub fn read_handshake(&self) -> Result<(), Error> {
        let mut file = as_file(&self.ack_read);
        let handshake = Handshake::read(&mut file)?;
        handshake.into_result()
    }

    /// Writes the fixed-size fatal record with a single `write(2)` call.
    /// Async-signal-safe: no allocation, one syscall, and the record is
    /// sized to fit the platform's atomic pipe-write guarantee (`PIPE_BUF`
    /// is at least 512 bytes on every supported target).
    pub fn write_fatal_record(&self, record: &FatalRecord) -> io::Result<()> {
        let buf = record.encode();
        write_all_atomic(self.fatal_write.as_raw_fd(), &buf)
    }

    /// Blocks for the monitor's fatal acknowledgement with a single
    /// `read(2)` call.
    pub fn read_fatal_ack(&self) -> io::Result<FatalAck> {
        let mut byte = [0u8; 1];
        read_all_atomic(self.ack_read.as_raw_fd(), &mut byte)?;
        Ok(FatalAck {
            status: crate::error::ErrorKind::from_wire(byte[0]),
        })
    }
}

impl MonitorControlPipe {
    pub fn fatal_read_fd(&self) -> RawFd {
        self.fatal_read.as_raw_fd()
    }

    pub fn ack_write_fd(&self) -> RawFd {
        self.ack_write.as_raw_fd()
    }

    pub fn write_handshake(&self, handshake: &Handshake) -> io::Result<()> {
        let mut file = as_file(&self.ack_write);
        handshake.write(&mut file)
    }

    /// Reads one fixed-size fatal record off the pipe. Called from the
    /// monitor's ordinary event loop, not a signal handler, so a plain
    /// `read_exact` is fine on this side.
    pub fn read_fatal_record(&self) -> io::Result<FatalRecord> {
        let mut buf = [0u8; FATAL_RECORD_LEN];
        let mut file = as_file(&self.fatal_read);
        std::io::Read::read_exact(&mut file, &mut buf)?;
        FatalRecord::decode(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn write_fatal_ack(&self, ack: &FatalAck) -> io::Result<()> {
        let mut file = as_file(&self.ack_write);
        ack.write(&mut file)
    }
}

// Borrows a raw fd as a `std::fs::File` for the duration of one buffered
// call without taking ownership (and thus without closing it on drop).
fn as_file(fd: &OwnedFd) -> std::mem::ManuallyDrop<std::fs::File> {
    std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd.as_raw_fd()) })
}

fn write_all_atomic(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "fatal record write was not atomic",
            ));
        }
        return Ok(());
    }
}

fn read_all_atomic(fd: RawFd, buf: &mut [u8]) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read on control pipe",
            ));
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn fatal_record_roundtrips_through_real_pipe() {
        let (host, monitor) = create_pair().unwrap();
        let record = FatalRecord::new("assertion failed");
        host.write_fatal_record(&record).unwrap();
        let decoded = monitor.read_fatal_record().unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn handshake_roundtrips_through_real_pipe() {
        let (host, monitor) = create_pair().unwrap();
        monitor.write_handshake(&Handshake::ok()).unwrap();
        host.read_handshake().unwrap();
    }

    #[test]
    fn fatal_ack_roundtrips_through_real_pipe() {
        let (host, monitor) = create_pair().unwrap();
        monitor
            .write_fatal_ack(&FatalAck {
                status: ErrorKind::Ok,
            })
            .unwrap();
        let ack = host.read_fatal_ack().unwrap();
        assert_eq!(ack.status, ErrorKind::Ok);
    }
}
