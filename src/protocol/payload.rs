//! Payload descriptor: where an object's bytes live inside a store arena.

use serde::{Deserialize, Serialize};

use crate::types::ObjectId;

/// Server description of one object's location in shared memory.
///
/// `store_fd` is the server's own descriptor number for the arena. It is only
/// an identifier: the client receives its own descriptor for the same arena
/// over the socket the first time it sees a given `store_fd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub object_id: ObjectId,
    pub store_fd: i32,
    pub data_offset: usize,
    pub data_size: usize,
    pub map_size: usize,
    #[serde(rename = "is_owner", default)]
    pub owning: bool,
    #[serde(rename = "is_sealed", default)]
    pub sealed: bool,
    #[serde(rename = "is_gpu", default)]
    pub gpu: bool,
}

impl Payload {
    /// Whether the payload has no bytes (and therefore no arena).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data_size == 0
    }
}
