//! Descriptor hygiene around worker process creation.
//!
//! The parent quiesces channel registration with a [`ForkGuard`] while a
//! worker is being created. The guard hands out a [`ChildFdPlan`] that runs
//! in the forked child before `exec`: it closes the listening socket and keeps
//! the client's socket open across `exec`. Every other descriptor the proxy
//! opens is close-on-exec, so the child ends up holding only its own client.

use std::io;
use std::os::fd::RawFd;

use tokio::sync::OwnedRwLockWriteGuard;

use super::Channel;

/// Held by the parent for the duration of a worker spawn.
///
/// While it is alive the accept loop cannot add or drop channels.
pub struct ForkGuard {
    _gate: OwnedRwLockWriteGuard<()>,
    listener_fd: Option<RawFd>,
}

impl ForkGuard {
    pub(super) fn new(gate: OwnedRwLockWriteGuard<()>, listener_fd: Option<RawFd>) -> Self {
        Self {
            _gate: gate,
            listener_fd,
        }
    }

    /// Builds the descriptor plan for a child that will own `channel`.
    pub fn child_plan(&self, channel: &Channel) -> ChildFdPlan {
        ChildFdPlan {
            listener_fd: self.listener_fd,
            channel_fd: channel.raw_fd(),
        }
    }

    /// Re-opens channel registration in the parent.
    pub fn after_fork(self) {}
}

/// Descriptor changes applied in a freshly forked child.
///
/// Only async-signal-safe calls are made here: the child of a multi-threaded
/// parent may not allocate or take locks before `exec`.
#[derive(Debug, Clone, Copy)]
pub struct ChildFdPlan {
    listener_fd: Option<RawFd>,
    channel_fd: RawFd,
}

impl ChildFdPlan {
    /// Descriptor number the worker will find its client on.
    pub fn channel_fd(&self) -> RawFd {
        self.channel_fd
    }

    pub fn apply(&self) -> io::Result<()> {
        self.close_listening_socket();
        self.retain_channel()
    }

    /// Closes the inherited listening socket. Child only.
    pub fn close_listening_socket(&self) {
        if let Some(fd) = self.listener_fd {
            // SAFETY: plain close(2) on a descriptor the child inherited.
            unsafe {
                libc::close(fd);
            }
        }
    }

    /// Clears close-on-exec on the client socket. Child only.
    pub fn retain_channel(&self) -> io::Result<()> {
        // SAFETY: fcntl(2) on an inherited descriptor; no memory is touched.
        let flags = unsafe { libc::fcntl(self.channel_fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::fcntl(self.channel_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
