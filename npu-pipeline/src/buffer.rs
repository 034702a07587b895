// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Fixed-size buffers and the objects built from them.
//!
//! A [`Buffer`] owns its memory and cannot be cloned: whoever holds it has
//! exclusive access, and handing it to a queue moves it there. Buffers are
//! only ever created when a pool is allocated, so the number of buffers in
//! circulation is fixed for the lifetime of the pool.

use std::fmt;

use npu_track::Id;

/// Maximum number of buffers (model input tensors) in one job.
pub const MAX_BUFFERS_PER_OBJECT: usize = 5;

/// Identifies the pool that a buffer was allocated from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolTag(pub Id);

pub struct Buffer {
    id: Id,
    pool: PoolTag,
    data: Box<[u8]>,
    len: usize,
}

impl Buffer {
    pub(crate) fn new(id: Id, pool: PoolTag, size: usize) -> Self {
        Self {
            id,
            pool,
            data: vec![0; size].into_boxed_slice(),
            len: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> Id {
        self.id
    }

    #[must_use]
    pub fn pool(&self) -> PoolTag {
        self.pool
    }

    /// Total size of the buffer in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the number of valid bytes, clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// The valid bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole of the underlying memory.
    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replace the contents with `bytes`, truncating to the capacity.
    /// Returns the number of bytes stored.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.len = n;
        n
    }

    /// Append `bytes` after the valid bytes, truncating to the capacity.
    /// Returns the number of bytes appended.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len() - self.len);
        self.data[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Buffer {{ id: {}, len: {}/{} }}",
            self.id,
            self.len,
            self.data.len()
        )
    }
}

/// Something that can live on a pool's data queue.
pub trait PoolEntry {
    /// Identifier used when tracing the entry.
    fn id(&self) -> Id;

    /// The buffers making up the entry.
    fn buffers(&self) -> &[Buffer];

    /// Break the entry up into its buffers.
    fn into_buffers(self) -> Vec<Buffer>;
}

impl PoolEntry for Buffer {
    fn id(&self) -> Id {
        self.id
    }

    fn buffers(&self) -> &[Buffer] {
        std::slice::from_ref(self)
    }

    fn into_buffers(self) -> Vec<Buffer> {
        vec![self]
    }
}

/// One logical inference job: an ordered set of buffers, one per model
/// input tensor.
#[derive(Debug)]
pub struct BufferObject {
    buffers: Vec<Buffer>,
}

impl BufferObject {
    /// Build an object from buffers that are already in index order.
    #[must_use]
    pub fn new(buffers: Vec<Buffer>) -> Self {
        Self { buffers }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Buffer> {
        self.buffers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }
}

impl PoolEntry for BufferObject {
    fn id(&self) -> Id {
        self.buffers.first().map(Buffer::id).unwrap_or_default()
    }

    fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    fn into_buffers(self) -> Vec<Buffer> {
        self.buffers
    }
}
