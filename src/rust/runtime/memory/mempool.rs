// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use super::{
    mbuf::Mbuf,
    mem::PGSIZE_4KB,
};
use crate::runtime::fail::Fail;
use std::{
    cell::RefCell,
    rc::Rc,
};

//==============================================================================
// Constants
//==============================================================================

/// Bytes reserved in front of the data area of every buffer.
pub const DEFAULT_HEADROOM: usize = 128;

//==============================================================================
// Structures
//==============================================================================

/// One virtually-contiguous memory area backing part of a pool.
#[derive(Clone, Copy, Debug)]
pub struct MemChunk {
    /// Base virtual address.
    pub addr: usize,
    /// Length in bytes.
    pub len: usize,
    /// Size of the backing pages.
    pub pgsize: usize,
}

struct PoolChunk {
    mem: Box<[u8]>,
    /// Number of buffers carved out of this chunk.
    nbufs: usize,
}

struct PoolInner {
    name: String,
    /// Full per-buffer length, headroom included.
    buf_len: usize,
    headroom: usize,
    pgsize: usize,
    chunks: Vec<PoolChunk>,
    /// Global buffer index of the first buffer of each chunk.
    chunk_base: Vec<usize>,
    nbufs: usize,
    free: RefCell<Vec<u32>>,
    refcnt: RefCell<Box<[u16]>>,
}

/// Pool of fixed-size packet buffers. Cheap to clone; clones share the
/// backing storage. Buffer identity (for MR caching) is the pool identity,
/// compared with [`Mempool::ptr_eq`].
#[derive(Clone)]
pub struct Mempool {
    inner: Rc<PoolInner>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Mempool {
    /// Creates a pool of `nbufs` buffers of `buf_len` bytes each (headroom
    /// included), in a single virtually-contiguous chunk.
    pub fn new(name: &str, nbufs: usize, buf_len: usize) -> Result<Self, Fail> {
        Self::with_layout(name, buf_len, DEFAULT_HEADROOM, &[nbufs], PGSIZE_4KB)
    }

    /// Creates a pool with an explicit chunk layout and backing page size.
    /// Several chunks produce a pool that is (almost certainly) not
    /// virtually contiguous, which the queue setup paths must reject.
    pub fn with_layout(
        name: &str,
        buf_len: usize,
        headroom: usize,
        chunk_bufs: &[usize],
        pgsize: usize,
    ) -> Result<Self, Fail> {
        if buf_len == 0 || buf_len <= headroom {
            return Err(Fail::new(libc::EINVAL, "buffer length must exceed headroom"));
        }
        if chunk_bufs.is_empty() || chunk_bufs.iter().any(|&n| n == 0) {
            return Err(Fail::new(libc::EINVAL, "empty mempool layout"));
        }
        let mut chunks: Vec<PoolChunk> = Vec::with_capacity(chunk_bufs.len());
        let mut chunk_base: Vec<usize> = Vec::with_capacity(chunk_bufs.len());
        let mut nbufs: usize = 0;
        for &n in chunk_bufs {
            chunk_base.push(nbufs);
            chunks.push(PoolChunk {
                mem: vec![0u8; n * buf_len].into_boxed_slice(),
                nbufs: n,
            });
            nbufs += n;
        }
        debug!("mempool \"{}\": {} buffers of {} bytes", name, nbufs, buf_len);
        Ok(Self {
            inner: Rc::new(PoolInner {
                name: name.to_string(),
                buf_len,
                headroom,
                pgsize,
                chunks,
                chunk_base,
                nbufs,
                free: RefCell::new((0..nbufs as u32).rev().collect()),
                refcnt: RefCell::new(vec![0u16; nbufs].into_boxed_slice()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Full per-buffer length, headroom included.
    pub fn data_room_size(&self) -> usize {
        self.inner.buf_len
    }

    pub fn headroom(&self) -> usize {
        self.inner.headroom
    }

    /// Number of buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.inner.nbufs - self.inner.free.borrow().len()
    }

    pub fn free_count(&self) -> usize {
        self.inner.free.borrow().len()
    }

    /// Whether two handles refer to the same pool.
    pub fn ptr_eq(&self, other: &Mempool) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Iterates the memory areas backing this pool, lowest global index
    /// first. Areas are reported in allocation order, not address order.
    pub fn mem_iter(&self) -> Vec<MemChunk> {
        self.inner
            .chunks
            .iter()
            .map(|c| MemChunk {
                addr: c.mem.as_ptr() as usize,
                len: c.mem.len(),
                pgsize: self.inner.pgsize,
            })
            .collect()
    }

    /// Allocates a buffer without resetting its metadata. Returns `None`
    /// when the pool is exhausted.
    pub fn raw_alloc(&self) -> Option<Mbuf> {
        let index: u32 = self.inner.free.borrow_mut().pop()?;
        self.inner.refcnt.borrow_mut()[index as usize] = 1;
        Some(Mbuf::raw(self.clone(), index))
    }

    /// Allocates a buffer with reset metadata (headroom reserved, zero
    /// lengths, single segment).
    pub fn alloc(&self) -> Option<Mbuf> {
        let mut buf: Mbuf = self.raw_alloc()?;
        buf.reset();
        Some(buf)
    }

    /// Base address of buffer `index`.
    pub(crate) fn buf_addr(&self, index: u32) -> *mut u8 {
        let inner: &PoolInner = &self.inner;
        let index: usize = index as usize;
        debug_assert!(index < inner.nbufs);
        let chunk: usize = match inner.chunk_base.binary_search(&index) {
            Ok(c) => c,
            Err(c) => c - 1,
        };
        let slot: usize = index - inner.chunk_base[chunk];
        debug_assert!(slot < inner.chunks[chunk].nbufs);
        unsafe { (inner.chunks[chunk].mem.as_ptr() as *mut u8).add(slot * inner.buf_len) }
    }

    pub(crate) fn inc_ref(&self, index: u32) {
        self.inner.refcnt.borrow_mut()[index as usize] += 1;
    }

    pub(crate) fn dec_ref(&self, index: u32) {
        let mut refcnt = self.inner.refcnt.borrow_mut();
        let cnt: &mut u16 = &mut refcnt[index as usize];
        debug_assert!(*cnt > 0);
        *cnt -= 1;
        if *cnt == 0 {
            self.inner.free.borrow_mut().push(index);
        }
    }
}

impl std::fmt::Debug for Mempool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mempool")
            .field("name", &self.inner.name)
            .field("nbufs", &self.inner.nbufs)
            .field("buf_len", &self.inner.buf_len)
            .finish()
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
