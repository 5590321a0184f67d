//! Descriptor Handoff Channel
//!
//! The relay is a separate process started after the interface exists, so
//! it cannot inherit the interface descriptor. Once launched it listens on a
//! filesystem Unix socket inside the session's working directory; we connect
//! as a client and pass the descriptor as `SCM_RIGHTS` ancillary data on a
//! single-byte write.
//!
//! # Retry schedule
//!
//! The relay's listener is usually not ready on the first attempt. Before
//! attempt `n` (0-based) we sleep `base_delay * 2^n`, so the default policy
//! (100ms, 6 attempts) waits 100, 200, 400, 800, 1600, 3200 ms in total
//! before giving up with [`HandoffError::Unreachable`].

use crate::cancel::CancelToken;
use crossbeam_channel::{Receiver, bounded};
use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};
use std::io::{self, IoSlice};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Payload byte carrying the descriptor; its value is irrelevant
pub const HANDOFF_BYTE: u8 = b' ';

/// Exponential backoff for handoff attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first attempt; doubles every attempt
    pub base_delay: Duration,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_attempts: 6,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
    }

    /// Sum of all delays when every attempt fails
    pub fn total_delay(&self) -> Duration {
        (0..self.max_attempts).map(|n| self.delay_for(n)).sum()
    }
}

/// OS primitive that moves one descriptor to a listening peer.
///
/// Kept behind a trait so the retry logic can be tested without a relay.
pub trait DescriptorSender: Send + Sync {
    /// Connect to `socket_path` and transfer `fd`; one attempt, no retries.
    fn send_descriptor(&self, socket_path: &Path, fd: BorrowedFd<'_>) -> io::Result<()>;
}

/// Sends descriptors over filesystem-namespace Unix sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixDescriptorSender;

impl DescriptorSender for UnixDescriptorSender {
    fn send_descriptor(&self, socket_path: &Path, fd: BorrowedFd<'_>) -> io::Result<()> {
        let stream = UnixStream::connect(socket_path)?;
        debug!("connected to relay socket {}", socket_path.display());

        let payload = [HANDOFF_BYTE];
        let iov = [IoSlice::new(&payload)];
        let fds = [fd.as_raw_fd()];
        let cmsgs = [ControlMessage::ScmRights(&fds)];

        let sent = sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
            .map_err(io::Error::from)?;
        if sent != payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "descriptor payload not written",
            ));
        }

        stream.shutdown(Shutdown::Write)?;
        Ok(())
    }
}

/// Handoff errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandoffError {
    #[error("relay socket {} unreachable after {attempts} attempts: {last_error}", path.display())]
    Unreachable {
        path: PathBuf,
        attempts: u32,
        last_error: String,
    },

    #[error("handoff cancelled")]
    Cancelled,

    #[error("handoff thread failed: {0}")]
    Thread(String),
}

/// Retrying descriptor handoff to the relay.
#[derive(Clone)]
pub struct HandoffChannel {
    sender: Arc<dyn DescriptorSender>,
    policy: BackoffPolicy,
}

impl HandoffChannel {
    pub fn new(sender: Arc<dyn DescriptorSender>, policy: BackoffPolicy) -> Self {
        Self { sender, policy }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Hand `fd` to the relay listening on `socket_path`, retrying with backoff.
    ///
    /// Blocks the calling thread for up to [`BackoffPolicy::total_delay`].
    /// Returns the number of attempts used.
    pub fn handoff(
        &self,
        fd: BorrowedFd<'_>,
        socket_path: &Path,
        cancel: &CancelToken,
    ) -> Result<u32, HandoffError> {
        let mut last_error = String::from("no attempt made");

        for attempt in 0..self.policy.max_attempts {
            if !cancel.sleep(self.policy.delay_for(attempt)) {
                debug!("handoff cancelled before attempt {}", attempt + 1);
                return Err(HandoffError::Cancelled);
            }

            match self.sender.send_descriptor(socket_path, fd) {
                Ok(()) => {
                    info!(
                        attempts = attempt + 1,
                        "interface descriptor handed to relay via {}",
                        socket_path.display()
                    );
                    return Ok(attempt + 1);
                }
                Err(e) => {
                    debug!(attempt = attempt + 1, "handoff attempt failed: {}", e);
                    last_error = e.to_string();
                }
            }
        }

        warn!(
            "relay socket {} never accepted the descriptor ({})",
            socket_path.display(),
            last_error
        );
        Err(HandoffError::Unreachable {
            path: socket_path.to_path_buf(),
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    /// Run [`handoff`](Self::handoff) on a dedicated thread.
    ///
    /// The thread owns its own duplicate of the descriptor; the result
    /// arrives on the returned channel.
    pub fn spawn(
        &self,
        fd: OwnedFd,
        socket_path: PathBuf,
        cancel: CancelToken,
    ) -> io::Result<Receiver<Result<u32, HandoffError>>> {
        let (tx, rx) = bounded(1);
        let channel = self.clone();

        thread::Builder::new()
            .name("relay-handoff".to_string())
            .spawn(move || {
                let result = channel.handoff(fd.as_fd(), &socket_path, &cancel);
                let _ = tx.send(result);
            })?;

        Ok(rx)
    }
}
