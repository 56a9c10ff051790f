//! Codec module - serialization/deserialization for wire messages.
//!
//! The store speaks JSON on its control socket:
//!
//! - [`JsonCodec`] - `serde_json` encode/decode of request and reply bodies
//!
//! # Design
//!
//! Codecs are marker structs with static methods rather than trait objects,
//! so callers pick the codec at compile time.
//!
//! # Example
//!
//! ```
//! use shm_store_client::codec::JsonCodec;
//!
//! let encoded = JsonCodec::encode(&"hello").unwrap();
//! let decoded: String = JsonCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod json;

pub use json::JsonCodec;
