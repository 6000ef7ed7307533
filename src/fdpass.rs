//! Passing socket descriptors between processes.
//!
//! This is the foundation of the handoff dispatch model: the master accepts
//! a client connection and moves the open descriptor to a worker over the
//! worker’s control channel. Transfer uses a single-byte message with the
//! descriptor attached as `SCM_RIGHTS` ancillary data, so the underlying
//! socket and its buffered data are never copied.
//!
//! After a successful transfer both processes hold independent descriptor
//! table entries for the same socket. The sender is expected to close its
//! copy once ownership is handed off.

use std::fmt;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg
};

/// The payload byte accompanying a transferred descriptor.
const TRANSFER_BYTE: [u8; 1] = [b'F'];


//------------ send_fd -------------------------------------------------------

/// Sends an open descriptor over a control channel.
///
/// The channel must be a connected Unix stream socket whose peer reads
/// with [`recv_fd`]. Interrupted calls are retried.
pub fn send_fd(
    channel: &impl AsRawFd, fd: RawFd
) -> Result<(), Errno> {
    let iov = [IoSlice::new(&TRANSFER_BYTE)];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    loop {
        match sendmsg::<UnixAddr>(
            channel.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None
        ) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
}


//------------ recv_fd -------------------------------------------------------

/// Receives a descriptor from a control channel.
///
/// Blocks until the peer sends a descriptor via [`send_fd`]. A peer that
/// has closed the channel produces [`RecvFdError::Disconnected`] which
/// means there is no more work coming; all other failures are
/// [`RecvFdError::Transport`].
pub fn recv_fd(channel: &impl AsRawFd) -> Result<OwnedFd, RecvFdError> {
    let mut buf = [0u8; 1];
    let mut cmsg_buffer = cmsg_space!([RawFd; 1]);
    loop {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = match recvmsg::<UnixAddr>(
            channel.as_raw_fd(), &mut iov,
            Some(&mut cmsg_buffer), MsgFlags::empty()
        ) {
            Ok(msg) => msg,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECONNRESET) => {
                return Err(RecvFdError::Disconnected)
            }
            Err(err) => return Err(RecvFdError::Transport(err)),
        };
        if msg.bytes == 0 {
            return Err(RecvFdError::Disconnected)
        }
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(fd) = fds.first() {
                    return Ok(unsafe { OwnedFd::from_raw_fd(*fd) })
                }
            }
        }
        return Err(RecvFdError::NoDescriptor)
    }
}


//------------ RecvFdError ---------------------------------------------------

/// Receiving a descriptor has failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecvFdError {
    /// The peer has closed the channel. No more work is coming.
    Disconnected,

    /// A message arrived without an attached descriptor.
    NoDescriptor,

    /// Some other transport failure.
    Transport(Errno),
}

impl fmt::Display for RecvFdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RecvFdError::Disconnected => {
                f.write_str("control channel closed by peer")
            }
            RecvFdError::NoDescriptor => {
                f.write_str("control message without descriptor")
            }
            RecvFdError::Transport(err) => {
                write!(f, "control channel error: {}", err)
            }
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn descriptor_survives_transfer() {
        let (master, worker) = UnixStream::pair().unwrap();
        let (mut local, remote) = UnixStream::pair().unwrap();

        send_fd(&master, remote.as_raw_fd()).unwrap();
        let received = recv_fd(&worker).unwrap();
        drop(remote);

        // Writing into the received descriptor must come out of the
        // socket it was duplicated from.
        let mut received = UnixStream::from(received);
        received.write_all(b"brew").unwrap();
        drop(received);
        let mut buf = Vec::new();
        local.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"brew");
    }

    #[test]
    fn closed_channel_reports_disconnect() {
        let (master, worker) = UnixStream::pair().unwrap();
        drop(master);
        assert_eq!(
            recv_fd(&worker).map(|_| ()), Err(RecvFdError::Disconnected)
        );
    }

    #[test]
    fn several_descriptors_in_sequence() {
        let (master, worker) = UnixStream::pair().unwrap();
        for payload in [&b"first"[..], b"second"] {
            let (mut local, remote) = UnixStream::pair().unwrap();
            send_fd(&master, remote.as_raw_fd()).unwrap();
            drop(remote);
            let mut received = UnixStream::from(recv_fd(&worker).unwrap());
            received.write_all(payload).unwrap();
            drop(received);
            let mut buf = Vec::new();
            local.read_to_end(&mut buf).unwrap();
            assert_eq!(buf, payload);
        }
    }
}
