//! Passing arena file descriptors between processes.
//!
//! Arena fds travel out-of-band as `SCM_RIGHTS` ancillary messages on the
//! IPC socket, one fd per message with a single marker byte as the
//! mandatory data payload. The reply JSON only carries the integer value
//! of the server-side fd so both ends can cross-check what arrived.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, OwnedFd};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut};

/// Marker byte sent alongside the fd; `SCM_RIGHTS` requires at least one
/// byte of ordinary data.
const FD_MARKER: u8 = b'f';

/// Send a single file descriptor over a Unix socket.
pub fn send_fd<S: AsFd, Fd: AsFd>(socket: &S, fd: Fd) -> Result<()> {
    let borrowed = [fd.as_fd()];
    let mut ancillary_space = [0u8; 64];
    let mut ancillary = SendAncillaryBuffer::new(&mut ancillary_space);
    if !ancillary.push(SendAncillaryMessage::ScmRights(&borrowed)) {
        return Err(Error::Invalid(
            "failed to stage fd into the ancillary buffer".into(),
        ));
    }

    let data = [FD_MARKER];
    let iov = [IoSlice::new(&data)];
    sendmsg(socket, &iov, &mut ancillary, SendFlags::empty())?;
    Ok(())
}

/// Receive a single file descriptor from a Unix socket.
///
/// Blocks until the peer's ancillary message arrives. Fails with
/// [`Error::ConnectionError`] if the message carries no descriptor.
pub fn recv_fd<S: AsFd>(socket: &S) -> Result<OwnedFd> {
    let mut data = [0u8; 1];
    let mut ancillary_space = [0u8; 64];
    let mut ancillary = RecvAncillaryBuffer::new(&mut ancillary_space);

    let mut iov = [IoSliceMut::new(&mut data)];
    recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::empty())?;

    for msg in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = msg {
            if let Some(fd) = rights.into_iter().next() {
                return Ok(fd);
            }
        }
    }
    Err(Error::ConnectionError(
        "expected a file descriptor in the ancillary message, got none".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fs::MemfdFlags;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_fd_roundtrip_preserves_file() {
        let (left, right) = UnixStream::pair().unwrap();

        let fd = rustix::fs::memfd_create("fdpass-test", MemfdFlags::CLOEXEC).unwrap();
        let mut file = std::fs::File::from(fd);
        file.write_all(b"shared bytes").unwrap();

        send_fd(&left, &file).unwrap();
        let received = recv_fd(&right).unwrap();

        let mut reopened = std::fs::File::from(received);
        reopened.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        reopened.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "shared bytes");
    }

    #[test]
    fn test_recv_without_fd_fails() {
        let (mut left, right) = UnixStream::pair().unwrap();
        left.write_all(&[0u8]).unwrap();
        let result = recv_fd(&right);
        assert!(result.is_err());
    }
}
