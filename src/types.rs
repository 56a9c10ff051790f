//! Identifier types shared by the protocol, the blob model and object metadata.
//!
//! Object ids travel as plain JSON numbers on the wire and are shown to
//! humans as `o` followed by 16 hex digits:
//!
//! ```
//! use shm_store_client::ObjectId;
//!
//! let id = ObjectId::new(0x2a);
//! assert_eq!(id.to_string(), "o000000000000002a");
//! assert_eq!("o000000000000002a".parse::<ObjectId>().unwrap(), id);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Identifier of a store instance (one store process on one host).
pub type InstanceId = u64;

/// Instance id used when the peer instance is not known.
pub const UNSPECIFIED_INSTANCE_ID: InstanceId = u64::MAX;

/// Signature of a composite object, stable across persist/migrate.
pub type Signature = u64;

/// Bit that marks blob ids.
const BLOB_BIT: u64 = 0x8000_0000_0000_0000;

/// Store-wide object identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Id that never names an object.
    pub const INVALID: ObjectId = ObjectId(u64::MAX);

    /// Id of the zero-size blob.
    pub const EMPTY_BLOB: ObjectId = ObjectId(BLOB_BIT);

    /// Wrap a raw id.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Generate a fresh (non-blob) id for a client-built object.
    pub fn generate() -> Self {
        Self(rand::random::<u64>() & !BLOB_BIT)
    }

    /// Raw numeric value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this id names a blob.
    #[inline]
    pub const fn is_blob(self) -> bool {
        self.0 & BLOB_BIT != 0
    }

    /// Whether this is [`ObjectId::INVALID`].
    #[inline]
    pub const fn is_invalid(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o{:016x}", self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for ObjectId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let hex = s
            .strip_prefix('o')
            .ok_or_else(|| StoreError::Protocol(format!("invalid object id: {:?}", s)))?;
        u64::from_str_radix(hex, 16)
            .map(ObjectId)
            .map_err(|e| StoreError::Protocol(format!("invalid object id {:?}: {}", s, e)))
    }
}

impl From<u64> for ObjectId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Generate a fresh object signature.
pub fn generate_signature() -> Signature {
    rand::random()
}
