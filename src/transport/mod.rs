//! Transport module - the Unix domain socket to the store.
//!
//! Provides:
//! - connect with bounded retry/backoff
//! - length-prefixed send/receive
//! - descriptor receipt over `SCM_RIGHTS`

mod socket;

use std::future::Future;
use std::os::fd::OwnedFd;
use std::pin::Pin;

use crate::error::Result;

pub use socket::{
    IpcStream, RetryPolicy, DEFAULT_CONNECT_ATTEMPTS, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF,
};

/// Boxed future returned by transport capabilities.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Something that can hand over an open descriptor received out of band.
///
/// Implemented by [`IpcStream`]; the mapping table only needs this capability.
pub trait DescriptorSource: Send {
    /// Receive one descriptor; the caller owns it afterwards.
    fn recv_fd(&mut self) -> BoxFuture<'_, Result<OwnedFd>>;
}

impl DescriptorSource for IpcStream {
    fn recv_fd(&mut self) -> BoxFuture<'_, Result<OwnedFd>> {
        Box::pin(IpcStream::recv_fd(self))
    }
}
