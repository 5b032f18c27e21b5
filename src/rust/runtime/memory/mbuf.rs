// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use super::mempool::Mempool;
use crate::runtime::fail::Fail;
use std::slice;

//==============================================================================
// Structures
//==============================================================================

/// Owned handle to one pool buffer plus packet metadata. Segment chains are
/// owned through `next`; dropping a chain head releases every segment back
/// to its pool.
pub struct Mbuf {
    /// Pool owning this mbuf's own buffer.
    pool: Mempool,
    /// Index of this mbuf's own buffer within `pool`.
    index: u32,
    /// When indirect, the data-bearing buffer this mbuf is attached to.
    attached: Option<(Mempool, u32)>,
    data_off: u16,
    data_len: u32,
    /// Total length of the packet, valid on the first segment only.
    pkt_len: u32,
    /// Number of segments, valid on the first segment only.
    nb_segs: u16,
    /// Input port, valid on the first segment only.
    port: u16,
    next: Option<Box<Mbuf>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Mbuf {
    /// Builds a raw mbuf for `index` in `pool`. Metadata is not reset; debug
    /// builds poison user-visible fields so stale reads stand out.
    pub(super) fn raw(pool: Mempool, index: u32) -> Self {
        let poison: bool = cfg!(debug_assertions);
        Self {
            pool,
            index,
            attached: None,
            data_off: if poison { 0xdead } else { 0 },
            data_len: if poison { 0xd00d } else { 0 },
            pkt_len: if poison { 0xdeadd00d } else { 0 },
            nb_segs: if poison { 0x2a } else { 1 },
            port: if poison { 0x2a } else { u16::MAX },
            next: None,
        }
    }

    /// Resets packet metadata: headroom reserved, zero lengths, single
    /// segment.
    pub fn reset(&mut self) {
        self.data_off = self.pool.headroom() as u16;
        self.data_len = 0;
        self.pkt_len = 0;
        self.nb_segs = 1;
        self.port = u16::MAX;
        self.next = None;
    }

    /// Base address of the data-bearing buffer.
    pub fn buf_addr(&self) -> *mut u8 {
        match &self.attached {
            Some((pool, index)) => pool.buf_addr(*index),
            None => self.pool.buf_addr(self.index),
        }
    }

    /// Full length of the data-bearing buffer.
    pub fn buf_len(&self) -> usize {
        self.data_pool().data_room_size()
    }

    /// Pool this mbuf's metadata came from.
    pub fn pool(&self) -> &Mempool {
        &self.pool
    }

    /// Pool where the data actually lives. For an indirect mbuf this is the
    /// attached buffer's pool, not the clone's own pool.
    pub fn data_pool(&self) -> &Mempool {
        match &self.attached {
            Some((pool, _)) => pool,
            None => &self.pool,
        }
    }

    pub fn is_indirect(&self) -> bool {
        self.attached.is_some()
    }

    /// Attaches this mbuf to `parent`'s data buffer, making it an indirect
    /// clone. The parent's buffer gains a reference.
    pub fn attach(&mut self, parent: &Mbuf) -> Result<(), Fail> {
        if self.attached.is_some() {
            return Err(Fail::new(libc::EINVAL, "mbuf is already indirect"));
        }
        if parent.is_indirect() {
            return Err(Fail::new(libc::EINVAL, "cannot attach to an indirect mbuf"));
        }
        parent.pool.inc_ref(parent.index);
        self.attached = Some((parent.pool.clone(), parent.index));
        self.data_off = parent.data_off;
        self.data_len = parent.data_len;
        self.pkt_len = parent.pkt_len;
        Ok(())
    }

    pub fn data_off(&self) -> u16 {
        self.data_off
    }

    pub fn set_data_off(&mut self, off: u16) {
        self.data_off = off;
    }

    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    pub fn set_data_len(&mut self, len: u32) {
        debug_assert!(self.data_off as usize + len as usize <= self.buf_len());
        self.data_len = len;
    }

    pub fn pkt_len(&self) -> u32 {
        self.pkt_len
    }

    pub fn set_pkt_len(&mut self, len: u32) {
        self.pkt_len = len;
    }

    pub fn nb_segs(&self) -> u16 {
        self.nb_segs
    }

    pub fn set_nb_segs(&mut self, n: u16) {
        self.nb_segs = n;
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Address of the first data byte.
    pub fn data_ptr(&self) -> *mut u8 {
        unsafe { self.buf_addr().add(self.data_off as usize) }
    }

    pub fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.data_ptr(), self.data_len as usize) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.data_ptr(), self.data_len as usize) }
    }

    /// Appends `bytes` to this segment, growing `data_len` and `pkt_len`.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), Fail> {
        let tail: usize = self.data_off as usize + self.data_len as usize;
        if tail + bytes.len() > self.buf_len() {
            return Err(Fail::new(libc::ENOMEM, "no tailroom left in mbuf"));
        }
        unsafe {
            slice::from_raw_parts_mut(self.buf_addr().add(tail), bytes.len()).copy_from_slice(bytes);
        }
        self.data_len += bytes.len() as u32;
        self.pkt_len += bytes.len() as u32;
        Ok(())
    }

    /// Links `seg` as the next segment. Does not update `nb_segs` or
    /// `pkt_len`; callers maintain first-segment metadata themselves.
    pub fn set_next(&mut self, seg: Mbuf) {
        debug_assert!(self.next.is_none());
        self.next = Some(Box::new(seg));
    }

    pub fn next(&self) -> Option<&Mbuf> {
        self.next.as_deref()
    }

    pub fn take_next(&mut self) -> Option<Mbuf> {
        self.next.take().map(|b| *b)
    }

    /// Iterates this segment and all linked segments.
    pub fn segments(&self) -> SegIter<'_> {
        SegIter { cur: Some(self) }
    }

    pub fn seg_count(&self) -> usize {
        self.segments().count()
    }

    /// Hints the data bytes into cache.
    #[inline]
    pub fn prefetch_data(&self) {
        prefetch(self.data_ptr() as *const u8);
    }
}

/// Hints one cacheline at `ptr` into cache. No-op on non-x86 targets.
#[inline]
pub(crate) fn prefetch(ptr: *const u8) {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            unsafe { std::arch::x86_64::_mm_prefetch::<{ std::arch::x86_64::_MM_HINT_T0 }>(ptr as *const i8) };
        } else {
            let _ = ptr;
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Drop for Mbuf {
    fn drop(&mut self) {
        if let Some((pool, index)) = self.attached.take() {
            pool.dec_ref(index);
        }
        self.pool.dec_ref(self.index);
        // `next` drops recursively, freeing the rest of the chain.
    }
}

impl std::fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mbuf")
            .field("pool", &self.pool.name())
            .field("index", &self.index)
            .field("data_off", &self.data_off)
            .field("data_len", &self.data_len)
            .field("pkt_len", &self.pkt_len)
            .field("nb_segs", &self.nb_segs)
            .finish()
    }
}

/// Iterator over the segments of a chain.
pub struct SegIter<'a> {
    cur: Option<&'a Mbuf>,
}

impl<'a> Iterator for SegIter<'a> {
    type Item = &'a Mbuf;

    fn next(&mut self) -> Option<Self::Item> {
        let cur: &Mbuf = self.cur?;
        self.cur = cur.next();
        Some(cur)
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::super::mempool::Mempool;
    use super::Mbuf;

    #[test]
    fn chain_drop_frees_every_segment() {
        let mp: Mempool = Mempool::new("chain", 4, 2048).unwrap();
        let mut head: Mbuf = mp.alloc().unwrap();
        let mut mid: Mbuf = mp.alloc().unwrap();
        let tail: Mbuf = mp.alloc().unwrap();
        mid.set_next(tail);
        head.set_next(mid);
        head.set_nb_segs(3);
        assert_eq!(head.seg_count(), 3);
        assert_eq!(mp.in_use(), 3);
        drop(head);
        assert_eq!(mp.in_use(), 0);
    }

    #[test]
    fn indirect_mbuf_reports_parent_pool() {
        let data_mp: Mempool = Mempool::new("data", 2, 2048).unwrap();
        let clone_mp: Mempool = Mempool::new("clones", 2, 2048).unwrap();
        let mut parent: Mbuf = data_mp.alloc().unwrap();
        parent.append(b"payload").unwrap();
        let mut clone: Mbuf = clone_mp.alloc().unwrap();
        clone.attach(&parent).unwrap();
        assert!(clone.is_indirect());
        assert!(clone.data_pool().ptr_eq(&data_mp));
        assert!(clone.pool().ptr_eq(&clone_mp));
        assert_eq!(clone.data(), b"payload");
        // Parent's buffer stays alive until the clone detaches.
        drop(parent);
        assert_eq!(data_mp.in_use(), 1);
        drop(clone);
        assert_eq!(data_mp.in_use(), 0);
    }

    #[test]
    fn append_respects_tailroom() {
        let mp: Mempool = Mempool::new("small", 1, 160).unwrap();
        let mut buf: Mbuf = mp.alloc().unwrap();
        // 160-byte buffer with 128 bytes of headroom leaves 32 bytes.
        assert!(buf.append(&[0u8; 32]).is_ok());
        assert!(buf.append(&[0u8; 1]).is_err());
    }
}
