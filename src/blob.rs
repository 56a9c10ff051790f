//! Blob handles over arena mappings.
//!
//! - [`Blob`]: immutable, cheaply cloneable, zero-copy view of a sealed payload
//! - [`BlobWriter`]: exclusive writable view of a freshly created buffer
//! - [`BufferSet`]: the blobs a composite object references
//!
//! Every view is built from a checked `[offset, offset + len)` range over its
//! mapping and keeps that mapping alive by reference count, so a handle never
//! dangles even if it outlives the client that produced it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use memmap2::{Mmap, MmapRaw};

use crate::error::{Result, StoreError};
use crate::protocol::Payload;
use crate::types::ObjectId;

/// Check that `[offset, offset + len)` fits in a mapping of `map_len` bytes.
fn checked_range(offset: usize, len: usize, map_len: usize) -> Result<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= map_len => Ok(offset..end),
        _ => Err(StoreError::OutOfBounds {
            offset,
            len,
            map_len,
        }),
    }
}

/// Owner handed to `Bytes` so slices keep the read mapping alive.
struct SharedMapping(Arc<Mmap>);

impl AsRef<[u8]> for SharedMapping {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Immutable handle to an object's payload bytes.
#[derive(Clone)]
pub struct Blob {
    id: ObjectId,
    size: usize,
    buffer: Bytes,
}

impl Blob {
    /// Slice a payload out of a read-only arena view.
    pub(crate) fn from_mapping(payload: &Payload, map: Arc<Mmap>) -> Result<Self> {
        let range = checked_range(payload.data_offset, payload.data_size, map.len())?;
        let buffer = Bytes::from_owner(SharedMapping(map)).slice(range);
        Ok(Self {
            id: payload.object_id,
            size: payload.data_size,
            buffer,
        })
    }

    /// Zero-size blob.
    pub fn empty(id: ObjectId) -> Self {
        Self {
            id,
            size: 0,
            buffer: Bytes::new(),
        }
    }

    /// Placeholder for an object whose `size` bytes are not mapped here.
    pub fn unresolved(id: ObjectId, size: usize) -> Self {
        Self {
            id,
            size,
            buffer: Bytes::new(),
        }
    }

    /// Object id.
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Object size as reported by the store.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the payload bytes are available in this process.
    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.size == 0 || self.buffer.len() == self.size
    }

    /// Payload bytes.
    ///
    /// # Errors
    ///
    /// [`StoreError::PartialObject`] if the object has a size but nothing is
    /// mapped locally, instead of silently returning an empty slice.
    pub fn data(&self) -> Result<&[u8]> {
        if self.size > 0 && self.buffer.is_empty() {
            return Err(StoreError::PartialObject(self.id));
        }
        Ok(&self.buffer)
    }

    /// Payload as `Bytes` (zero-copy clone of the view).
    pub fn bytes(&self) -> Result<Bytes> {
        self.data()?;
        Ok(self.buffer.clone())
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Writable window into a read-write arena mapping.
struct WriteView {
    map: Arc<MmapRaw>,
    offset: usize,
    len: usize,
}

/// Mutable handle to a freshly created buffer.
///
/// Not `Clone`: mutation goes through `&mut self`, so one handle has one
/// writer. The store does not arbitrate between separate handles to the
/// same buffer.
pub struct BlobWriter {
    id: ObjectId,
    size: usize,
    view: Option<WriteView>,
}

impl BlobWriter {
    /// Slice a payload out of a read-write arena view.
    pub(crate) fn from_mapping(payload: &Payload, map: Arc<MmapRaw>) -> Result<Self> {
        let range = checked_range(payload.data_offset, payload.data_size, map.len())?;
        Ok(Self {
            id: payload.object_id,
            size: payload.data_size,
            view: Some(WriteView {
                map,
                offset: range.start,
                len: range.len(),
            }),
        })
    }

    /// No-op writer for a zero-size buffer.
    pub fn empty() -> Self {
        Self {
            id: ObjectId::EMPTY_BLOB,
            size: 0,
            view: None,
        }
    }

    /// Object id.
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Buffer size.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current contents.
    pub fn as_slice(&self) -> &[u8] {
        match &self.view {
            // SAFETY: `checked_range` proved [offset, offset+len) lies inside
            // the mapping, which `map` keeps alive.
            Some(v) => unsafe { std::slice::from_raw_parts(v.map.as_ptr().add(v.offset), v.len) },
            None => &[],
        }
    }

    /// Writable contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.view {
            // SAFETY: as in `as_slice`; `&mut self` makes this the only
            // slice handed out by this writer.
            Some(v) => unsafe {
                std::slice::from_raw_parts_mut(v.map.as_mut_ptr().add(v.offset), v.len)
            },
            None => &mut [],
        }
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let range = checked_range(offset, data.len(), self.size)?;
        self.as_mut_slice()[range].copy_from_slice(data);
        Ok(())
    }
}

impl fmt::Debug for BlobWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobWriter")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

/// Blobs referenced by a composite object; placeholders until resolved.
#[derive(Debug, Clone, Default)]
pub struct BufferSet {
    buffers: HashMap<ObjectId, Option<Blob>>,
}

impl BufferSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a buffer id. Returns `false` if it was already present.
    pub fn emplace_buffer(&mut self, id: ObjectId) -> bool {
        if self.buffers.contains_key(&id) {
            return false;
        }
        self.buffers.insert(id, None);
        true
    }

    /// Attach a resolved blob to its registered id.
    pub fn emplace_blob(&mut self, blob: Blob) -> Result<()> {
        match self.buffers.get_mut(&blob.id()) {
            Some(slot) => {
                *slot = Some(blob);
                Ok(())
            }
            None => Err(StoreError::Protocol(format!(
                "buffer {} is not part of this object",
                blob.id()
            ))),
        }
    }

    /// Whether `id` is referenced.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.buffers.contains_key(&id)
    }

    /// Resolved blob for `id`, if any.
    pub fn get(&self, id: ObjectId) -> Option<&Blob> {
        self.buffers.get(&id).and_then(Option::as_ref)
    }

    /// Referenced ids, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.buffers.keys().copied()
    }

    /// Number of referenced buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffer is referenced.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Whether every referenced buffer has a locally available blob.
    pub fn all_resolved(&self) -> bool {
        self.buffers
            .values()
            .all(|slot| slot.as_ref().is_some_and(Blob::is_resolved))
    }

    /// Forget every buffer.
    pub fn reset(&mut self) {
        self.buffers.clear();
    }
}
