//! Client builder and connection lifecycle.
//!
//! The [`ClientBuilder`] collects configuration; [`IpcClient`] owns one
//! registered connection to the store:
//! 1. Connect the Unix socket (bounded retry)
//! 2. Register and learn instance id, server version and endpoints
//! 3. Serve buffer and name operations, one request/reply cycle at a time
//! 4. Disconnect: `exit_request`, close the socket, release arena mappings
//!
//! # Example
//!
//! ```ignore
//! use shm_store_client::IpcClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = IpcClient::builder()
//!         .socket("/var/run/shm-store.sock")
//!         .connect()
//!         .await?;
//!
//!     let mut writer = client.create_buffer(1024).await?;
//!     writer.as_mut_slice().fill(7);
//!
//!     let blob = client.get_buffer(writer.id(), true).await?;
//!     assert_eq!(blob.data()?[0], 7);
//!
//!     client.put_name(writer.id(), "sevens").await?;
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::blob::{Blob, BlobWriter};
use crate::codec::JsonCodec;
use crate::error::{Result, StoreError};
use crate::mmap::MmapTable;
use crate::protocol::{
    decode_reply, CreateBufferReply, DropNameReply, GetBuffersReply, GetNameReply, PutNameReply,
    RegisterReply, Reply, Request, StatusCode, DEFAULT_MAX_MESSAGE_SIZE,
};
use crate::transport::{IpcStream, RetryPolicy};
use crate::types::{InstanceId, ObjectId};

/// Protocol version announced at registration.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Environment variable naming the store socket.
pub const SOCKET_ENV: &str = "SHM_STORE_IPC_SOCKET";

/// Socket path used when nothing else is configured.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/shm-store.sock";

/// Default bound on waiting for a reply or a descriptor.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Arena offsets published by the store assume the header reservation.
const REALIGN: bool = true;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Store socket path.
    pub socket_path: PathBuf,
    /// Retry policy for the initial connect.
    pub retry: RetryPolicy,
    /// Bound on each reply/descriptor wait; `None` waits forever.
    pub reply_timeout: Option<Duration>,
    /// Largest reply accepted before the stream is declared corrupt.
    pub max_message_size: usize,
    /// Refuse servers whose major protocol version differs.
    pub enforce_server_version: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            retry: RetryPolicy::default(),
            reply_timeout: Some(DEFAULT_REPLY_TIMEOUT),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            enforce_server_version: true,
        }
    }
}

impl ClientConfig {
    /// Defaults, with the socket path taken from `SHM_STORE_IPC_SOCKET` if set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os(SOCKET_ENV).filter(|p| !p.is_empty()) {
            config.socket_path = PathBuf::from(path);
        }
        config
    }
}

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registering,
    Connected,
}

/// Builder for configuring and connecting an [`IpcClient`].
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a builder from [`ClientConfig::from_env`].
    pub fn new() -> Self {
        Self {
            config: ClientConfig::from_env(),
        }
    }

    /// Create a builder from an explicit configuration.
    pub fn with_config(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Set the store socket path.
    pub fn socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.socket_path = path.into();
        self
    }

    /// Set the total number of connect attempts.
    ///
    /// Default: 10
    pub fn connect_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    /// Set the first and the maximum delay between connect attempts.
    ///
    /// Default: 100ms doubling up to 2s
    pub fn connect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.retry.initial_backoff = initial;
        self.config.retry.max_backoff = max;
        self
    }

    /// Bound every reply wait.
    ///
    /// Default: 30 seconds
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.reply_timeout = Some(timeout);
        self
    }

    /// Wait for replies without a bound.
    pub fn no_reply_timeout(mut self) -> Self {
        self.config.reply_timeout = None;
        self
    }

    /// Set the largest accepted reply.
    ///
    /// Default: 64 MB
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Whether to refuse servers with a different major protocol version.
    ///
    /// Default: true
    pub fn enforce_server_version(mut self, enforce: bool) -> Self {
        self.config.enforce_server_version = enforce;
        self
    }

    /// Connect and register.
    pub async fn connect(self) -> Result<IpcClient> {
        IpcClient::connect(self.config).await
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered connection to the local store.
///
/// Share it across tasks behind an `Arc`; operations serialize on the
/// connection, since replies carry no request id and are matched by order.
pub struct IpcClient {
    config: ClientConfig,
    /// Exclusive access token: held for a whole request/reply cycle.
    conn: Mutex<Option<IpcStream>>,
    mmaps: MmapTable,
    connected: AtomicBool,
    /// Fired by `disconnect` to release a parked `get_name`.
    teardown: Notify,
    instance_id: InstanceId,
    server_version: String,
    rpc_endpoint: String,
    ipc_socket: String,
}

impl IpcClient {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect with the given configuration and register.
    ///
    /// A failed registration (status error, malformed reply, incompatible
    /// version) closes the socket and never yields a client.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        tracing::debug!(
            "Client state {:?}: {}",
            ConnectionState::Connecting,
            config.socket_path.display()
        );
        let mut stream =
            IpcStream::connect(&config.socket_path, &config.retry, config.max_message_size)
                .await?;

        tracing::debug!("Client state {:?}", ConnectionState::Registering);
        let reply: RegisterReply = round_trip(
            &mut stream,
            &Request::register(PROTOCOL_VERSION),
            config.reply_timeout,
        )
        .await
        .map_err(|e| {
            tracing::warn!("Registration failed: {}", e);
            e
        })?;

        check_server_version(&reply.version, config.enforce_server_version)?;

        tracing::info!(
            "Connected to store instance {} (version {}) at {}",
            reply.instance_id,
            reply.version,
            config.socket_path.display()
        );

        let ipc_socket = if reply.ipc_socket.is_empty() {
            config.socket_path.display().to_string()
        } else {
            reply.ipc_socket
        };

        Ok(Self {
            config,
            conn: Mutex::new(Some(stream)),
            mmaps: MmapTable::new(),
            connected: AtomicBool::new(true),
            teardown: Notify::new(),
            instance_id: reply.instance_id,
            server_version: reply.version,
            rpc_endpoint: reply.rpc_endpoint,
            ipc_socket,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Store instance this client registered with.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Version string reported by the server.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// RPC endpoint of the same store instance.
    pub fn rpc_endpoint(&self) -> &str {
        &self.rpc_endpoint
    }

    /// IPC socket of the store, as reported by the server.
    pub fn ipc_socket(&self) -> &str {
        &self.ipc_socket
    }

    /// Socket path this client connected to.
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Number of arenas whose descriptor this connection holds.
    pub fn mapped_arenas(&self) -> usize {
        self.mmaps.len()
    }

    /// Allocate `size` bytes in the store and return a writer over them.
    ///
    /// `size == 0` returns [`BlobWriter::empty`] without contacting the store.
    pub async fn create_buffer(&self, size: usize) -> Result<BlobWriter> {
        self.ensure_connected()?;
        if size == 0 {
            return Ok(BlobWriter::empty());
        }
        let mut session = self.session().await?;
        let result = self.create_buffer_on(session.stream()?, size).await;
        session.finish(result)
    }

    async fn create_buffer_on(&self, stream: &mut IpcStream, size: usize) -> Result<BlobWriter> {
        let reply: CreateBufferReply = self
            .round_trip(stream, &Request::CreateBuffer { size })
            .await?;
        let payload = reply.created;

        // A new arena's descriptor follows the reply whatever its contents;
        // take it off the socket before judging the payload.
        self.bounded(
            self.mmaps
                .receive(&mut *stream, payload.store_fd, payload.map_size, REALIGN),
        )
        .await?;

        if payload.data_size != size {
            return Err(StoreError::SizeMismatch {
                requested: size,
                allocated: payload.data_size,
            });
        }

        let view = self.mmaps.write_view(payload.store_fd)?;
        BlobWriter::from_mapping(&payload, view)
    }

    /// Look up several blobs in one round trip.
    ///
    /// Ids the store does not know are absent from the result. An empty
    /// `ids` returns an empty map without contacting the store.
    pub async fn get_buffers(
        &self,
        ids: &[ObjectId],
        unsafe_mode: bool,
    ) -> Result<HashMap<ObjectId, Blob>> {
        self.ensure_connected()?;
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut session = self.session().await?;
        let result = self
            .get_buffers_on(session.stream()?, ids, unsafe_mode)
            .await;
        session.finish(result)
    }

    async fn get_buffers_on(
        &self,
        stream: &mut IpcStream,
        ids: &[ObjectId],
        unsafe_mode: bool,
    ) -> Result<HashMap<ObjectId, Blob>> {
        let reply: GetBuffersReply = self
            .round_trip(stream, &Request::get_buffers(ids, unsafe_mode))
            .await?;

        // Drain every pending descriptor first so a bad payload further down
        // cannot leave one on the socket.
        for payload in reply.payloads.iter().filter(|p| !p.is_empty()) {
            self.bounded(
                self.mmaps
                    .receive(&mut *stream, payload.store_fd, payload.map_size, REALIGN),
            )
            .await?;
        }

        let mut buffers = HashMap::with_capacity(reply.payloads.len());
        for payload in &reply.payloads {
            let blob = if payload.is_empty() {
                Blob::empty(payload.object_id)
            } else {
                Blob::from_mapping(payload, self.mmaps.read_view(payload.store_fd)?)?
            };
            buffers.insert(payload.object_id, blob);
        }
        Ok(buffers)
    }

    /// Look up one blob.
    ///
    /// # Errors
    ///
    /// `Status { code: ObjectNotExists, .. }` if the store does not know `id`.
    pub async fn get_buffer(&self, id: ObjectId, unsafe_mode: bool) -> Result<Blob> {
        let mut buffers = self.get_buffers(&[id], unsafe_mode).await?;
        buffers.remove(&id).ok_or_else(|| {
            StoreError::status(
                StatusCode::ObjectNotExists,
                format!("buffer {} not found", id),
            )
        })
    }

    /// Associate `name` with `id`.
    pub async fn put_name(&self, id: ObjectId, name: &str) -> Result<()> {
        let _: PutNameReply = self
            .call(&Request::PutName {
                object_id: id,
                name,
            })
            .await?;
        Ok(())
    }

    /// Resolve `name` to an object id.
    ///
    /// With `wait`, the store parks the reply until the name appears; the
    /// reply timeout does not apply then, and a concurrent
    /// [`IpcClient::disconnect`] ends the wait with `NotConnected`.
    pub async fn get_name(&self, name: &str, wait: bool) -> Result<ObjectId> {
        let request = Request::GetName { name, wait };
        let reply: GetNameReply = if wait {
            self.call_parked(&request).await?
        } else {
            self.call(&request).await?
        };
        Ok(reply.object_id)
    }

    /// Remove `name`.
    pub async fn drop_name(&self, name: &str) -> Result<()> {
        let _: DropNameReply = self.call(&Request::DropName { name }).await?;
        Ok(())
    }

    /// Leave the store: send `exit_request`, close the socket and release
    /// every arena mapping held by this client. Idempotent.
    ///
    /// Blobs handed out earlier keep their own mapping alive; the table's
    /// references are dropped here.
    pub async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        self.teardown.notify_waiters();

        let mut conn = self.conn.lock().await;
        let Some(mut stream) = conn.take() else {
            return Ok(());
        };
        let released = self.mmaps.release_all();

        match JsonCodec::encode(&Request::Exit) {
            Ok(message) => {
                if let Err(e) = stream.send(&message).await {
                    tracing::debug!("exit_request not delivered: {}", e);
                }
            }
            Err(e) => tracing::debug!("exit_request not encoded: {}", e),
        }
        if let Err(e) = stream.shutdown().await {
            tracing::debug!("Socket shutdown failed: {}", e);
        }

        tracing::info!(
            "Disconnected from {} ({} arena(s) released)",
            self.config.socket_path.display(),
            released
        );
        Ok(())
    }

    /// One bounded request/reply cycle under the connection guard.
    async fn call<R: Reply>(&self, request: &Request<'_>) -> Result<R> {
        let mut session = self.session().await?;
        let result = self.round_trip(session.stream()?, request).await;
        session.finish(result)
    }

    /// A cycle whose reply the store may park indefinitely: no reply bound,
    /// but `disconnect` cuts it short.
    async fn call_parked<R: Reply>(&self, request: &Request<'_>) -> Result<R> {
        // registered before locking so a disconnect during acquisition is seen
        let cancelled = self.teardown.notified();
        let mut session = self.session().await?;

        let outcome = {
            let reply = round_trip::<R>(session.stream()?, request, None);
            tokio::select! {
                result = reply => Some(result),
                _ = cancelled => None,
            }
        };

        match outcome {
            Some(result) => session.finish(result),
            None => {
                tracing::debug!("Parked {} released by disconnect", request.kind());
                // the stream goes to `disconnect`, which is closing it anyway
                session.abandon();
                Err(StoreError::NotConnected)
            }
        }
    }

    async fn round_trip<R: Reply>(
        &self,
        stream: &mut IpcStream,
        request: &Request<'_>,
    ) -> Result<R> {
        round_trip(stream, request, self.config.reply_timeout).await
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        bounded(self.config.reply_timeout, fut).await
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }

    /// Acquire the connection for one request/reply cycle.
    async fn session(&self) -> Result<Session<'_>> {
        let conn = self.conn.lock().await;
        if conn.is_none() || !self.is_connected() {
            return Err(StoreError::NotConnected);
        }
        Ok(Session {
            client: self,
            conn,
            armed: true,
        })
    }

    /// Drop the stream and every mapping; later calls fail with `NotConnected`.
    fn poison(&self, conn: &mut Option<IpcStream>, reason: &dyn fmt::Display) {
        if conn.take().is_none() {
            return;
        }
        self.connected.store(false, Ordering::Release);
        let released = self.mmaps.release_all();
        tracing::error!(
            "Connection to {} dropped: {} ({} arena(s) released)",
            self.config.socket_path.display(),
            reason,
            released
        );
    }
}

/// Exclusive use of the connection for one request/reply cycle.
///
/// Armed from acquisition until the cycle's outcome is known. An armed
/// session that is dropped (its operation was cancelled between request and
/// reply) poisons the connection, since a reply or descriptor may still be
/// on its way.
struct Session<'a> {
    client: &'a IpcClient,
    conn: MutexGuard<'a, Option<IpcStream>>,
    armed: bool,
}

impl Session<'_> {
    fn stream(&mut self) -> Result<&mut IpcStream> {
        self.conn.as_mut().ok_or(StoreError::NotConnected)
    }

    /// Close the cycle; errors that leave the stream out of step poison it.
    fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        self.armed = false;
        if let Err(e) = &result {
            if e.is_fatal() {
                self.client.poison(&mut self.conn, e);
            }
        }
        result
    }

    /// Release the connection without judging the stream.
    fn abandon(mut self) {
        self.armed = false;
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.client
                .poison(&mut self.conn, &"operation cancelled mid-request");
        }
    }
}

/// Send `request` and decode the matching reply.
async fn round_trip<R: Reply>(
    stream: &mut IpcStream,
    request: &Request<'_>,
    timeout: Option<Duration>,
) -> Result<R> {
    let message = JsonCodec::encode(request)?;
    tracing::trace!("Sending {} ({} bytes)", request.kind(), message.len());
    stream.send(&message).await?;
    let reply = bounded(timeout, stream.recv()).await?;
    decode_reply(&reply)
}

async fn bounded<T>(timeout: Option<Duration>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| StoreError::Timeout(limit))?,
        None => fut.await,
    }
}

fn major_version(version: &str) -> Option<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .next()?
        .parse()
        .ok()
}

/// Compare major versions; unparsable server versions are accepted with a warning.
fn check_server_version(server: &str, enforce: bool) -> Result<()> {
    let (Some(ours), Some(theirs)) = (major_version(PROTOCOL_VERSION), major_version(server))
    else {
        tracing::warn!("Cannot parse server version {:?}, proceeding", server);
        return Ok(());
    };
    if ours == theirs {
        return Ok(());
    }
    if enforce {
        return Err(StoreError::IncompatibleVersion {
            server: server.to_string(),
            client: PROTOCOL_VERSION.to_string(),
        });
    }
    tracing::warn!(
        "Server version {} differs from client version {}, proceeding",
        server,
        PROTOCOL_VERSION
    );
    Ok(())
}
