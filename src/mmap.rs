//! Per-connection table of arena mappings.
//!
//! The store hands out each arena descriptor once per connection, right
//! after the first reply that mentions the arena's `store_fd`. The table
//! keeps the received descriptor and maps it lazily, read-only and
//! read-write views independently, on first demand for each mode.
//!
//! ```text
//! store_fd ──► MmapEntry { file, size, ro: Option<Mmap>, rw: Option<MmapRaw> }
//! ```
//!
//! Views are reference counted: blobs keep their view alive, while
//! [`MmapTable::release_all`] drops the table's own references at teardown.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions, MmapRaw};
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::transport::DescriptorSource;

/// Bytes the arena format reserves in front of the published region
/// (one `size_t`). Added to the reported map size when realigning.
pub const HEADER_RESERVATION: usize = std::mem::size_of::<u64>();

/// Mapping length for a reported arena map size.
#[inline]
pub fn mapping_size(map_size: usize, realign: bool) -> usize {
    if realign {
        map_size.saturating_add(HEADER_RESERVATION)
    } else {
        map_size
    }
}

/// One arena: the local descriptor and its lazily created views.
struct MmapEntry {
    file: File,
    size: usize,
    ro: Option<Arc<Mmap>>,
    rw: Option<Arc<MmapRaw>>,
}

impl MmapEntry {
    fn read_view(&mut self, store_fd: i32) -> Result<Arc<Mmap>> {
        if let Some(view) = &self.ro {
            return Ok(view.clone());
        }
        // SAFETY: the arena is shared memory owned by the store. Its bytes may
        // change under us, which is the contract of a shared mapping; the
        // mapping itself stays valid for as long as `Mmap` lives.
        let map = unsafe { MmapOptions::new().len(self.size).map(&self.file) }.map_err(|source| {
            StoreError::Mapping {
                store_fd,
                size: self.size,
                source,
            }
        })?;
        tracing::debug!("Mapped arena {} read-only ({} bytes)", store_fd, self.size);
        let view = Arc::new(map);
        self.ro = Some(view.clone());
        Ok(view)
    }

    fn write_view(&mut self, store_fd: i32) -> Result<Arc<MmapRaw>> {
        if let Some(view) = &self.rw {
            return Ok(view.clone());
        }
        let map = MmapOptions::new()
            .len(self.size)
            .map_raw(&self.file)
            .map_err(|source| StoreError::Mapping {
                store_fd,
                size: self.size,
                source,
            })?;
        tracing::debug!("Mapped arena {} read-write ({} bytes)", store_fd, self.size);
        let view = Arc::new(map);
        self.rw = Some(view.clone());
        Ok(view)
    }
}

/// Arena mappings of one connection, keyed by the server's `store_fd`.
#[derive(Default)]
pub struct MmapTable {
    entries: Mutex<HashMap<i32, MmapEntry>>,
}

impl MmapTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the read-only view of an arena, receiving its descriptor
    /// from `source` if this is the arena's first use.
    ///
    /// `source` is borrowed mutably for the whole call; callers that share a
    /// connection must hold its exclusive guard, which makes "receive if
    /// absent" atomic across tasks.
    pub async fn resolve_read<S>(
        &self,
        source: &mut S,
        store_fd: i32,
        map_size: usize,
        realign: bool,
    ) -> Result<Arc<Mmap>>
    where
        S: DescriptorSource + ?Sized,
    {
        self.receive(source, store_fd, map_size, realign).await?;
        self.read_view(store_fd)
    }

    /// Resolve the read-write view of an arena; see [`MmapTable::resolve_read`].
    pub async fn resolve_write<S>(
        &self,
        source: &mut S,
        store_fd: i32,
        map_size: usize,
        realign: bool,
    ) -> Result<Arc<MmapRaw>>
    where
        S: DescriptorSource + ?Sized,
    {
        self.receive(source, store_fd, map_size, realign).await?;
        self.write_view(store_fd)
    }

    /// Receive and register the arena descriptor unless already known.
    ///
    /// Creates no mapping.
    pub async fn receive<S>(
        &self,
        source: &mut S,
        store_fd: i32,
        map_size: usize,
        realign: bool,
    ) -> Result<()>
    where
        S: DescriptorSource + ?Sized,
    {
        if self.contains(store_fd) {
            return Ok(());
        }
        let fd = source.recv_fd().await?;
        if !self.insert(store_fd, fd, mapping_size(map_size, realign)) {
            tracing::warn!(
                "Arena {} registered concurrently, dropping duplicate descriptor",
                store_fd
            );
        }
        Ok(())
    }

    /// Register a received descriptor for `store_fd`.
    ///
    /// Returns `false`, closing `fd`, if the arena already has an entry.
    pub fn insert(&self, store_fd: i32, fd: OwnedFd, size: usize) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&store_fd) {
            return false;
        }
        entries.insert(
            store_fd,
            MmapEntry {
                file: File::from(fd),
                size,
                ro: None,
                rw: None,
            },
        );
        true
    }

    /// Read-only view of an arena whose descriptor was already received.
    pub fn read_view(&self, store_fd: i32) -> Result<Arc<Mmap>> {
        self.with_entry(store_fd, |entry| entry.read_view(store_fd))
    }

    /// Read-write view of an arena whose descriptor was already received.
    pub fn write_view(&self, store_fd: i32) -> Result<Arc<MmapRaw>> {
        self.with_entry(store_fd, |entry| entry.write_view(store_fd))
    }

    fn with_entry<T>(
        &self,
        store_fd: i32,
        f: impl FnOnce(&mut MmapEntry) -> Result<T>,
    ) -> Result<T> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&store_fd).ok_or_else(|| {
            StoreError::DescriptorTransfer(format!("no descriptor for arena {}", store_fd))
        })?;
        f(entry)
    }

    /// Whether `store_fd` already has an entry.
    pub fn contains(&self, store_fd: i32) -> bool {
        self.entries.lock().contains_key(&store_fd)
    }

    /// Number of arenas known to this connection.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no arena has been received yet.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry, closing descriptors and releasing the table's views.
    ///
    /// Returns the number of entries released.
    pub fn release_all(&self) -> usize {
        let released: Vec<_> = self.entries.lock().drain().collect();
        released.len()
    }
}
