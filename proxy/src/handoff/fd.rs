//! Passing listener descriptors over the control socket with `SCM_RIGHTS`.

use super::HandoffError;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Upper bound on descriptors accepted in one message.
pub const MAX_FDS: usize = 8;

const MARKER: u8 = b'F';

/// Sends `fds` attached to a one-byte marker.
pub async fn send_fds(stream: &UnixStream, fds: &[RawFd]) -> Result<(), HandoffError> {
    if fds.len() > MAX_FDS {
        return Err(HandoffError::TooManyDescriptors(fds.len()));
    }
    let marker = [MARKER];

    loop {
        stream.writable().await?;
        let sent = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&marker)];
            let cmsgs = [ControlMessage::ScmRights(fds)];
            sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                .map_err(io::Error::from)
        });
        match sent {
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Receives the marker byte sent by `send_fds` and takes ownership of the
/// descriptors attached to it. They are close-on-exec.
pub async fn recv_fds(stream: &UnixStream) -> Result<Vec<OwnedFd>, HandoffError> {
    loop {
        stream.readable().await?;
        let received = stream.try_io(Interest::READABLE, || {
            let mut marker = [0u8; 1];
            let mut iov = [IoSliceMut::new(&mut marker)];
            let mut space = nix::cmsg_space!([RawFd; MAX_FDS]);
            let msg = recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut space),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )
            .map_err(io::Error::from)?;
            if msg.bytes == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }

            let mut fds = Vec::new();
            for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                if let ControlMessageOwned::ScmRights(raw) = cmsg {
                    // SAFETY: the kernel installed these descriptors in our table
                    // while receiving this message; nothing else refers to them.
                    fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                }
            }
            Ok(fds)
        });
        match received {
            Ok(fds) => return Ok(fds),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(HandoffError::Closed);
            }
            Err(err) => return Err(err.into()),
        }
    }
}
