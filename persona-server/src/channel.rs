//! Wake-channel transport.
//!
//! Each initialised thread owns a wake channel: the outbound transport
//! the wait engine writes [`WakeUpReply`] records to. The transport is a
//! trait so hosts can substitute any per-thread wake primitive; the
//! default implementation writes to one end of a Unix stream pair.

use std::cell::RefCell;
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use persona_protocol::WakeUpReply;

/// Outbound wake transport of one thread.
pub trait WakeChannel {
    /// Write one wake-up record.
    ///
    /// A short write is an error: the record is the framing unit and a
    /// partial record would desynchronise the client.
    fn send(&self, reply: &WakeUpReply) -> io::Result<()>;
}

/// Wake channel over a Unix stream.
pub struct StreamWakeChannel {
    stream: RefCell<UnixStream>,
}

impl StreamWakeChannel {
    /// Wrap a connected stream.
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        Self { stream: RefCell::new(stream) }
    }

    /// Adopt a descriptor received from the client.
    #[must_use]
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self::new(UnixStream::from(fd))
    }

    /// Create a connected channel pair: the server-side channel and the
    /// client-side stream wake records can be read from.
    pub fn pair() -> io::Result<(Self, UnixStream)> {
        let (server, client) = UnixStream::pair()?;
        Ok((Self::new(server), client))
    }
}

impl WakeChannel for StreamWakeChannel {
    fn send(&self, reply: &WakeUpReply) -> io::Result<()> {
        let buf = reply.to_bytes();
        let written = self.stream.borrow_mut().write(&buf)?;
        if written != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("partial wakeup write {written}"),
            ));
        }
        Ok(())
    }
}
