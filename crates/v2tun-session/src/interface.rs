//! Privileged interface boundary
//!
//! The session asks an [`InterfaceProvider`] to turn a [`RoutePlan`] into a
//! live virtual interface. The returned [`TunInterface`] owns the kernel
//! descriptor; dropping it tears the interface down.

use crate::route::RoutePlan;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use tracing::debug;

/// Interface errors
#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
    /// The host withheld tunnel privilege
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Interface unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Grants virtual interfaces and exempts sockets from them.
pub trait InterfaceProvider: Send + Sync {
    /// Create and configure an interface for `plan`.
    fn establish(&self, plan: &RoutePlan) -> Result<TunInterface, InterfaceError>;

    /// Keep the socket behind `fd` out of the tunnel.
    fn protect(&self, fd: BorrowedFd<'_>) -> Result<(), InterfaceError>;

    /// Firewall mark the engine's own sockets need to skip the tunnel.
    ///
    /// `None` when the provider keeps engine traffic out by other means.
    fn socket_mark(&self) -> Option<u32> {
        None
    }
}

type Teardown = Box<dyn FnOnce() + Send>;

/// An established virtual interface.
pub struct TunInterface {
    name: String,
    fd: OwnedFd,
    teardown: Option<Teardown>,
}

impl TunInterface {
    pub fn new(name: impl Into<String>, fd: OwnedFd) -> Self {
        Self {
            name: name.into(),
            fd,
            teardown: None,
        }
    }

    /// Run `teardown` when the interface is closed, before the descriptor.
    pub fn with_teardown<F>(mut self, teardown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.teardown = Some(Box::new(teardown));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the interface.
    pub fn close(self) {
        drop(self);
    }
}

impl AsFd for TunInterface {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for TunInterface {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl fmt::Debug for TunInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunInterface")
            .field("name", &self.name)
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

impl Drop for TunInterface {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
        debug!(name = %self.name, "interface closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_close_runs_teardown() {
        let torn_down = Arc::new(AtomicBool::new(false));
        let flag = torn_down.clone();
        let fd: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();

        let interface = TunInterface::new("tun-test", fd).with_teardown(move || {
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(interface.name(), "tun-test");
        assert!(interface.as_raw_fd() >= 0);

        interface.close();
        assert!(torn_down.load(Ordering::SeqCst));
    }
}
