//! Unix domain socket connection to the store.
//!
//! Besides length-prefixed messages, the socket carries arena descriptors as
//! `SCM_RIGHTS` ancillary data: the store sends one data byte with one
//! descriptor attached right after a reply that references a new arena.
//!
//! # Example
//!
//! ```ignore
//! use shm_store_client::transport::{IpcStream, RetryPolicy};
//!
//! let mut stream = IpcStream::connect(path, &RetryPolicy::default(), max).await?;
//! stream.send(br#"{"type":"exit_request"}"#).await?;
//! ```

use std::io::{self, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::UnixStream;

use crate::error::{Result, StoreError};
use crate::protocol::{read_message, write_message};

/// Default number of connect attempts.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;

/// Default delay before the first connect retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Default upper bound for the delay between connect retries.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

/// Bounded exponential backoff for the initial connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (at least 1).
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Delay cap; each retry doubles the previous delay up to this.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_CONNECT_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Whether a connect failure may go away if we wait (store still starting).
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::AddrNotAvailable
    )
}

/// Connected store socket.
#[derive(Debug)]
pub struct IpcStream {
    stream: UnixStream,
    max_message_size: usize,
}

impl IpcStream {
    /// Connect to the store socket at `path`.
    ///
    /// Transient failures are retried per `retry`; permanent ones (missing
    /// socket file, permission denied) fail on the spot.
    pub async fn connect(
        path: &Path,
        retry: &RetryPolicy,
        max_message_size: usize,
    ) -> Result<Self> {
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match UnixStream::connect(path).await {
                Ok(stream) => {
                    tracing::debug!("Connected to {} on attempt {}", path.display(), attempt);
                    return Ok(Self {
                        stream,
                        max_message_size,
                    });
                }
                Err(e) if is_transient(&e) && attempt < max_attempts => {
                    let delay = retry.backoff(attempt);
                    tracing::warn!(
                        "Connect to {} failed ({}), retrying in {:?} ({}/{})",
                        path.display(),
                        e,
                        delay,
                        attempt,
                        max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    return Err(StoreError::Connect {
                        path: path.to_path_buf(),
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    /// Send one length-prefixed message.
    pub async fn send(&mut self, message: &[u8]) -> Result<()> {
        write_message(&mut self.stream, message).await
    }

    /// Receive one length-prefixed message.
    pub async fn recv(&mut self) -> Result<Bytes> {
        read_message(&mut self.stream, self.max_message_size).await
    }

    /// Receive exactly one descriptor from the ancillary channel.
    ///
    /// The returned descriptor is owned by the caller and closed on drop.
    pub async fn recv_fd(&mut self) -> Result<OwnedFd> {
        let socket = self.stream.as_raw_fd();
        let (bytes, mut fds) = self
            .stream
            .async_io(Interest::READABLE, || recv_descriptors(socket))
            .await
            .map_err(|e| StoreError::DescriptorTransfer(e.to_string()))?;

        if fds.is_empty() {
            return Err(StoreError::DescriptorTransfer(if bytes == 0 {
                "connection closed before descriptor arrived".to_string()
            } else {
                "message carried no descriptor".to_string()
            }));
        }
        if fds.len() > 1 {
            // extras are closed when `fds` drops
            return Err(StoreError::DescriptorTransfer(format!(
                "expected one descriptor, received {}",
                fds.len()
            )));
        }
        Ok(fds.remove(0))
    }

    /// Shut down the write half; the store sees EOF.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// One `recvmsg` for a single data byte plus any `SCM_RIGHTS` descriptors.
///
/// Descriptors are wrapped into `OwnedFd` as soon as they are seen so none
/// leak on an error path.
fn recv_descriptors(socket: RawFd) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut byte = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut byte)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 4]);

    let msg = recvmsg::<UnixAddr>(socket, &mut iov, Some(&mut cmsg_buf), RECV_FLAGS)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for fd in received {
                if fd < 0 {
                    continue;
                }
                // SAFETY: the kernel just installed `fd` in our table and
                // nothing else refers to it yet.
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }

    Ok((msg.bytes, fds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };

        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
        assert_eq!(retry.backoff(30), Duration::from_millis(350));
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::NotFound)));
        assert!(!is_transient(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }

    #[tokio::test]
    async fn test_missing_socket_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        let retry = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(10),
        };

        let start = std::time::Instant::now();
        let err = IpcStream::connect(&path, &retry, 1024).await.unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(5));
        match err {
            StoreError::Connect { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_send_recv_over_socket_pair() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut client = IpcStream {
            stream: client,
            max_message_size: 1024,
        };
        let mut server = IpcStream {
            stream: server,
            max_message_size: 1024,
        };

        client.send(b"ping").await.unwrap();
        assert_eq!(&server.recv().await.unwrap()[..], b"ping");
    }

    #[tokio::test]
    async fn test_recv_fd_without_descriptor_fails() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let mut client = IpcStream {
            stream: client,
            max_message_size: 1024,
        };

        server.write_all(&[0]).await.unwrap();
        let err = client.recv_fd().await.unwrap_err();
        assert!(matches!(err, StoreError::DescriptorTransfer(_)));
    }

    #[tokio::test]
    async fn test_recv_fd_on_closed_socket_fails() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut client = IpcStream {
            stream: client,
            max_message_size: 1024,
        };
        drop(server);

        let err = client.recv_fd().await.unwrap_err();
        assert!(matches!(err, StoreError::DescriptorTransfer(_)));
    }
}
