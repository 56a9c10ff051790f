//! Object metadata: a property bag describing a composite object.
//!
//! Builders fill it key by key; the blobs the object references are tracked
//! in a [`BufferSet`]. The `incomplete` flag says whether some referenced
//! blob is not available in this process.
//!
//! # Example
//!
//! ```
//! use shm_store_client::{ObjectId, ObjectMeta};
//!
//! let mut meta = ObjectMeta::new();
//! meta.set_typename("Tensor<f64>");
//! meta.set_nbytes(4096);
//! meta.add_key_value("shape", vec![32, 16]).unwrap();
//! meta.add_buffer(ObjectId::new(0x8000_0000_0000_0001));
//!
//! assert!(meta.has_key("shape"));
//! assert!(meta.incomplete());
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::blob::{Blob, BufferSet};
use crate::error::{Result, StoreError};
use crate::types::{InstanceId, ObjectId, Signature};

/// Property bag plus referenced buffers of one object.
#[derive(Debug, Clone, Default)]
pub struct ObjectMeta {
    meta: Map<String, Value>,
    buffer_set: BufferSet,
    incomplete: bool,
    forced_incomplete: bool,
}

impl ObjectMeta {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_id(&mut self, id: ObjectId) {
        self.meta.insert("id".into(), Value::String(id.to_string()));
    }

    /// Object id, if set.
    pub fn id(&self) -> Option<ObjectId> {
        self.meta.get("id")?.as_str()?.parse().ok()
    }

    pub fn set_instance_id(&mut self, instance_id: InstanceId) {
        self.meta.insert("instance_id".into(), instance_id.into());
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        self.meta.get("instance_id")?.as_u64()
    }

    pub fn set_signature(&mut self, signature: Signature) {
        self.meta.insert("signature".into(), signature.into());
    }

    pub fn signature(&self) -> Option<Signature> {
        self.meta.get("signature")?.as_u64()
    }

    pub fn set_transient(&mut self, transient: bool) {
        self.meta.insert("transient".into(), transient.into());
    }

    /// Objects are transient unless persisted; absent means transient.
    pub fn is_transient(&self) -> bool {
        self.meta
            .get("transient")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    pub fn set_nbytes(&mut self, nbytes: usize) {
        self.meta.insert("nbytes".into(), nbytes.into());
    }

    pub fn nbytes(&self) -> Option<usize> {
        self.meta.get("nbytes")?.as_u64().map(|n| n as usize)
    }

    pub fn set_typename(&mut self, typename: &str) {
        self.meta.insert("typename".into(), typename.into());
    }

    pub fn typename(&self) -> Option<&str> {
        self.meta.get("typename")?.as_str()
    }

    /// Insert or replace `key`.
    pub fn add_key_value<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        self.meta.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Read `key` as `T`.
    ///
    /// # Errors
    ///
    /// `KeyError` status if the key is absent, `Protocol` if it has another shape.
    pub fn get_key_value<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self.meta.get(key).ok_or_else(|| {
            StoreError::status(
                crate::protocol::StatusCode::KeyError,
                format!("metadata has no key {:?}", key),
            )
        })?;
        T::deserialize(value)
            .map_err(|e| StoreError::Protocol(format!("metadata key {:?}: {}", key, e)))
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.meta.contains_key(key)
    }

    /// Raw property bag.
    pub fn meta_data(&self) -> &Map<String, Value> {
        &self.meta
    }

    /// Replace the property bag wholesale.
    pub fn set_meta_data(&mut self, meta: Map<String, Value>) {
        self.meta = meta;
    }

    /// Reference a buffer that is not resolved yet.
    pub fn add_buffer(&mut self, id: ObjectId) {
        self.buffer_set.emplace_buffer(id);
        self.refresh_incomplete();
    }

    /// Reference a buffer and attach its blob.
    pub fn set_buffer(&mut self, blob: Blob) {
        let id = blob.id();
        self.buffer_set.emplace_buffer(id);
        // registered on the line above, cannot fail
        let _ = self.buffer_set.emplace_blob(blob);
        self.refresh_incomplete();
    }

    pub fn buffer_set(&self) -> &BufferSet {
        &self.buffer_set
    }

    /// Whether some referenced payload is not available locally.
    pub fn incomplete(&self) -> bool {
        self.incomplete
    }

    /// Flag the object incomplete regardless of its buffers.
    pub fn mark_incomplete(&mut self) {
        self.forced_incomplete = true;
        self.incomplete = true;
    }

    /// Clear everything.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn refresh_incomplete(&mut self) {
        self.incomplete = self.forced_incomplete || !self.buffer_set.all_resolved();
    }
}
