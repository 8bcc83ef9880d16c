//! File descriptor redirection for the worker's channel.
//!
//! The worker talks to its supervisor over fds 0 and 1. Anything else in the
//! process that writes to stdout (a stray `println!`, a child process that
//! inherits fd 1) would corrupt the framing. Early in startup the channel is
//! moved to duplicated fds and fd 1 is pointed at stderr, so late writers end
//! up in the log stream instead.
//!
//! ## Safety contracts
//!
//! 1. Called once, early in the worker, before host code runs.
//! 2. Standard fds (0, 1, 2) are open at process startup.
//! 3. fd 1 is re-targeted with `dup2` and never closed (`forget`).

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

/// The worker's ends of the channel.
pub struct ChannelIo {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

#[cfg(unix)]
pub fn take_channel_fds() -> io::Result<ChannelIo> {
    use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};

    use nix::unistd::{dup, dup2};
    use tokio::net::unix::pipe;

    let channel_in = dup(io::stdin().as_fd())
        .map_err(|e| io::Error::other(format!("dup(0) failed: {e}")))?;
    let channel_out = dup(io::stdout().as_fd())
        .map_err(|e| io::Error::other(format!("dup(1) failed: {e}")))?;

    // Safety: fd 2 is open for the lifetime of the process.
    let stderr = unsafe { BorrowedFd::borrow_raw(2) };
    // Safety: fd 1 is open; ownership is never released (see forget below).
    let mut fd1 = unsafe { OwnedFd::from_raw_fd(1) };
    dup2(stderr, &mut fd1).map_err(|e| io::Error::other(format!("dup2(stdout) failed: {e}")))?;
    std::mem::forget(fd1);

    tracing::debug!("Moved channel off fd 0/1; fd 1 now writes to stderr");

    let reader = pipe::Receiver::from_owned_fd(channel_in)?;
    let writer = pipe::Sender::from_owned_fd(channel_out)?;
    Ok(ChannelIo {
        reader: Box::new(reader),
        writer: Box::new(writer),
    })
}

#[cfg(not(unix))]
pub fn take_channel_fds() -> io::Result<ChannelIo> {
    // No redirection: stray stdout writes will corrupt the channel.
    Ok(ChannelIo {
        reader: Box::new(tokio::io::stdin()),
        writer: Box::new(tokio::io::stdout()),
    })
}
