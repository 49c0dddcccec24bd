// crates/libcorral/src/fdpass.rs

use anyhow::{Result, anyhow, bail};
use nix::cmsg_space;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

// The payload byte is opaque; SCM_RIGHTS refuses to ride an empty message.
const DUMMY: [u8; 1] = [b'F'];

/// Hand `fd` to the peer of a stream unix socket. Ownership of the
/// descriptor conceptually transfers with the message; the local copy is
/// untouched and remains the caller's to close.
pub fn send_fd(sock: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<()> {
    let fds = [fd.as_raw_fd()];
    let iov = [IoSlice::new(&DUMMY)];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let sent = sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;
    if sent != DUMMY.len() {
        bail!("send_fd: short send ({sent} bytes)");
    }
    Ok(())
}

/// Receive one file descriptor from the peer. Anything other than a single
/// well-formed `SCM_RIGHTS` message carrying exactly one descriptor is a
/// protocol violation.
pub fn recv_fd(sock: BorrowedFd<'_>) -> Result<OwnedFd> {
    let mut byte = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut byte)];
    let mut space = cmsg_space!(RawFd);
    let msg = recvmsg::<()>(
        sock.as_raw_fd(),
        &mut iov,
        Some(&mut space),
        MsgFlags::empty(),
    )?;
    if msg.bytes == 0 {
        bail!("recv_fd: peer closed the socket");
    }
    let mut cmsgs = msg.cmsgs()?;
    let fd = match cmsgs.next() {
        Some(ControlMessageOwned::ScmRights(fds)) if fds.len() == 1 => fds[0],
        Some(ControlMessageOwned::ScmRights(fds)) => {
            bail!("recv_fd: expected one descriptor, got {}", fds.len())
        }
        Some(other) => return Err(anyhow!("recv_fd: unexpected control message {other:?}")),
        None => bail!("recv_fd: message carried no descriptor"),
    };
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
