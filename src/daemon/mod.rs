//! The out-of-process service daemon (§4.H, §6): a singleton-per-user background process that
//! hands out a log FD, the rootfs mount path, and a pidfd to `dbtx`-translated guests over an
//! abstract UNIX socket, and can write an ELF core file on request. Grounded on
//! `Source/Tools/FEXServer/{Main,ProcessPipe}.cpp` — this module holds everything that is
//! unit-testable; [`crate::bin`]'s `dbtx-server` binary is the thin process entry point that owns
//! argv parsing and installs the `tracing-subscriber` layer, following the lib+bin split the
//! retrieval pack's daemon-shaped crates (`sisctl`) use.

pub mod coredump;
pub mod lock;
pub mod protocol;
pub mod socket;

use crate::error::Error;
use protocol::PacketType;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

/// Exit codes the `dbtx-server` binary surfaces (§6): `0` normal shutdown, `126` another instance
/// already owns the lock and `--wait` was not requested, `127` the listening socket could not be
/// created.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const ALREADY_RUNNING: i32 = 126;
    pub const SOCKET_SETUP_FAILED: i32 = 127;
}

/// Runtime knobs the `dbtx-server` binary derives from its CLI flags.
pub struct DaemonConfig {
    pub rootfs_path: PathBuf,
    /// `None` keeps accepting connections until a `Kill` request arrives or the process receives
    /// a termination signal; `Some(n)` shuts down after `n` seconds of no new connections,
    /// matching `--persistent=N` (§6, `ProcessPipe::RequestTimeout`).
    pub persistent_timeout: Option<Duration>,
}

/// A live daemon instance: holds the lock (released on drop) and the listening socket.
pub struct Daemon {
    _lock: lock::ServerLock,
    listener: OwnedFd,
    config: DaemonConfig,
}

impl Daemon {
    /// Attempts to become the daemon for the current user. Returns `Ok(None)` if another instance
    /// already owns the lock.
    pub fn try_start(config: DaemonConfig) -> Result<Option<Self>, Error> {
        let lock_path = lock::default_lock_path();
        let Some(server_lock) = lock::ServerLock::acquire(&lock_path)? else {
            return Ok(None);
        };
        let listener = socket::listen_abstract()?;
        Ok(Some(Self { _lock: server_lock, listener, config }))
    }

    /// Runs the accept loop until a [`PacketType::Kill`] request arrives or, when
    /// [`DaemonConfig::persistent_timeout`] is set, no new connection arrives within that window.
    pub fn run(&self) -> Result<(), Error> {
        loop {
            if !self.wait_for_connection()? {
                tracing::info!("dbtx-server idle timeout elapsed, shutting down");
                return Ok(());
            }

            let stream = socket::accept_one(&self.listener)?;
            match self.handle_connection(&stream) {
                Ok(Shutdown::Continue) => {}
                Ok(Shutdown::Stop) => return Ok(()),
                Err(err) => tracing::warn!(?err, "error handling dbtx-server client"),
            }
        }
    }

    /// Polls the listening socket for readiness, honoring the persistent timeout. Returns `false`
    /// on timeout (caller should shut down), `true` once a connection is ready to accept.
    fn wait_for_connection(&self) -> Result<bool, Error> {
        let Some(timeout) = self.config.persistent_timeout else {
            return Ok(true);
        };
        let mut fds = [libc::pollfd { fd: self.listener.as_raw_fd(), events: libc::POLLIN, revents: 0 }];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        // SAFETY: `fds` points at one initialized `pollfd` for the duration of the call.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(ret > 0)
    }

    fn handle_connection(&self, stream: &UnixStream) -> Result<Shutdown, Error> {
        let mut buf = [0u8; 1500];
        let n = stream.try_clone().and_then(|mut s| s.read(&mut buf))?;
        if n == 0 {
            return Ok(Shutdown::Continue);
        }

        let Some(kind) = protocol::decode_request(&buf[..n]) else {
            tracing::warn!("dropped malformed dbtx-server request");
            return Ok(Shutdown::Continue);
        };

        match kind {
            PacketType::Kill => {
                tracing::info!("dbtx-server received kill request");
                return Ok(Shutdown::Stop);
            }
            PacketType::GetLogFd => {
                let (read_fd, write_fd) = make_pipe()?;
                socket::send_fd(stream, &protocol::encode_response_header(PacketType::Success), write_fd.as_raw_fd())?;
                drop(read_fd);
            }
            PacketType::GetRootfsPath => {
                let path = self.config.rootfs_path.to_string_lossy().into_owned();
                let mut s = stream.try_clone()?;
                s.write_all(&protocol::encode_rootfs_response(&path))?;
            }
            PacketType::GetPidFd => {
                let pidfd = open_pidfd(std::process::id() as i32);
                match pidfd {
                    Some(fd) => {
                        socket::send_fd(stream, &protocol::encode_response_header(PacketType::Success), fd.as_raw_fd())?;
                    }
                    None => {
                        let mut s = stream.try_clone()?;
                        s.write_all(&protocol::encode_response_header(PacketType::Error))?;
                    }
                }
            }
            PacketType::Success | PacketType::Error => {
                tracing::warn!("dbtx-server received a result-only packet as a request");
            }
        }
        Ok(Shutdown::Continue)
    }
}

enum Shutdown {
    Continue,
    Stop,
}

fn make_pipe() -> Result<(OwnedFd, OwnedFd), Error> {
    let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
    // SAFETY: `pipe2` returns two freshly opened, owned file descriptors.
    Ok(unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) })
}

/// `pidfd_open(2)` for the given PID, falling back to `None` on kernels too old to support it
/// (§6: the original falls back to a pipe whose closure on exit stands in for the pidfd; this
/// crate surfaces that fallback as `None` to the caller rather than fabricating one here).
fn open_pidfd(pid: i32) -> Option<OwnedFd> {
    // SAFETY: `pidfd_open` is a plain syscall with no pointer arguments beyond what libc marshals.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if fd < 0 {
        return None;
    }
    use std::os::fd::FromRawFd;
    // SAFETY: a non-negative return from `pidfd_open` is a freshly owned descriptor.
    Some(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_pipe_returns_two_distinct_fds() {
        let (read, write) = make_pipe().unwrap();
        assert_ne!(read.as_raw_fd(), write.as_raw_fd());
    }
}
