//! # shm-store-client
//!
//! Rust client for a local shared-memory object store.
//!
//! A client process talks to the store over a Unix domain socket and reads
//! or writes blob payloads directly in shared-memory arenas the store owns.
//!
//! ## Architecture
//!
//! - **Control channel**: 8-byte length-prefixed JSON requests and replies
//! - **Descriptor channel**: arena descriptors passed as `SCM_RIGHTS`, once
//!   per arena per connection
//! - **Data plane**: lazily created, deduplicated `mmap` views of each arena
//!
//! ## Example
//!
//! ```ignore
//! use shm_store_client::IpcClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = IpcClient::builder()
//!         .socket("/var/run/shm-store.sock")
//!         .connect()
//!         .await
//!         .unwrap();
//!
//!     let mut writer = client.create_buffer(4).await.unwrap();
//!     writer.as_mut_slice().copy_from_slice(b"data");
//!
//!     let blob = client.get_buffer(writer.id(), true).await.unwrap();
//!     assert_eq!(blob.data().unwrap(), b"data");
//!
//!     client.disconnect().await.unwrap();
//! }
//! ```

#[cfg(not(unix))]
compile_error!("shm-store-client needs Unix domain sockets and descriptor passing");

pub mod blob;
pub mod codec;
pub mod error;
pub mod meta;
pub mod mmap;
pub mod protocol;
pub mod transport;
pub mod types;

mod client;

pub use blob::{Blob, BlobWriter, BufferSet};
pub use client::{
    ClientBuilder, ClientConfig, ConnectionState, IpcClient, DEFAULT_REPLY_TIMEOUT,
    DEFAULT_SOCKET_PATH, PROTOCOL_VERSION, SOCKET_ENV,
};
pub use error::{Result, StoreError};
pub use meta::ObjectMeta;
pub use protocol::StatusCode;
pub use types::{InstanceId, ObjectId, Signature};
