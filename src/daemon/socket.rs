//! The abstract UNIX socket the daemon listens on (§6) and the `SCM_RIGHTS` helpers used to pass
//! FDs across it, grounded on `ProcessPipe::InitializeServerSocket`'s abstract-namespace binding
//! and the `SendFDSuccessPacket`/FD-returning request handlers in `ProcessPipe::HandleSocketData`.

use crate::error::Error;
use nix::sys::socket::{
    accept, bind, listen, socket, AddressFamily, Backlog, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag,
    SockType, UnixAddr,
};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Socket name in the abstract namespace (no leading NUL byte — `UnixAddr::new_abstract` adds
/// it), keyed by UID so each user gets their own daemon instance (§6: `"{uid}.FEXServer.Socket"`).
pub fn abstract_socket_name(uid: u32) -> String {
    format!("{uid}.dbtx.Socket")
}

/// Binds and listens on the abstract socket named after the calling process's UID.
pub fn listen_abstract() -> Result<OwnedFd, Error> {
    let name = abstract_socket_name(nix::unistd::getuid().as_raw());
    let addr = UnixAddr::new_abstract(name.as_bytes())?;

    let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;
    bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, Backlog::new(16).unwrap_or(Backlog::MAXCONN))?;
    Ok(fd)
}

/// Connects to whatever daemon is currently listening on this user's abstract socket, for use by
/// a client (e.g. `dbtx-server --kill`) rather than the daemon itself.
pub fn connect_abstract() -> Result<UnixStream, Error> {
    let name = abstract_socket_name(nix::unistd::getuid().as_raw());
    let addr = UnixAddr::new_abstract(name.as_bytes())?;

    let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;
    nix::sys::socket::connect(fd.as_raw_fd(), &addr)?;
    // SAFETY: `fd` is a freshly owned, connected descriptor.
    Ok(unsafe { UnixStream::from_raw_fd(fd.into_raw_fd()) })
}

/// Blocks until a client connects, returning a plain [`UnixStream`] so request/response framing
/// can use ordinary `Read`/`Write` while FD passing goes through [`send_fd`]/[`recv_fd`] directly.
pub fn accept_one(listener: &OwnedFd) -> Result<UnixStream, Error> {
    let client_fd = accept(listener.as_raw_fd())?;
    // SAFETY: `accept` returns a freshly owned, open file descriptor.
    Ok(unsafe { UnixStream::from_raw_fd(client_fd) })
}

/// Sends `header` as the ordinary payload and `fd` as ancillary `SCM_RIGHTS` data in the same
/// message, matching `SendFDSuccessPacket`.
pub fn send_fd(stream: &UnixStream, header: &[u8], fd: RawFd) -> Result<(), Error> {
    let iov = [IoSlice::new(header)];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    nix::sys::socket::sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;
    Ok(())
}

/// Receives a message that may carry one `SCM_RIGHTS` FD alongside its ordinary payload. Returns
/// the number of payload bytes read into `buf` and the FD, if one was attached.
pub fn recv_with_fd(stream: &UnixStream, buf: &mut [u8]) -> Result<(usize, Option<RawFd>), Error> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let msg = nix::sys::socket::recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )?;

    let fd = msg.cmsgs().find_map(|cmsg| match cmsg {
        ControlMessageOwned::ScmRights(fds) => fds.first().copied(),
        _ => None,
    });

    Ok((msg.bytes, fd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abstract_socket_name_is_keyed_by_uid() {
        assert_eq!(abstract_socket_name(1000), "1000.dbtx.Socket");
    }

    #[test]
    fn fd_round_trips_through_a_connected_pair() {
        let (a, b) = UnixStream::pair().unwrap();
        let payload = [0xAAu8];
        let devnull = std::fs::File::open("/dev/null").unwrap();

        send_fd(&a, &payload, devnull.as_raw_fd()).unwrap();

        let mut buf = [0u8; 16];
        let (n, fd) = recv_with_fd(&b, &mut buf).unwrap();
        assert_eq!(&buf[..n], &payload);
        assert!(fd.is_some());
        // SAFETY: `fd` is a freshly received, owned descriptor we are responsible for closing.
        unsafe {
            nix::unistd::close(fd.unwrap()).unwrap();
        }
    }
}
