// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Tx queue: descriptor ring, completion coalescing, scatter/gather with
//! linearization fallback, and the per-queue memory-pool to memory-region
//! cache.

//==============================================================================
// Imports
//==============================================================================

use super::{
    Port,
    TxConf,
    TxqStats,
    LINEAR_BUF_SIZE,
    SGE_WR_N,
    TX_MP_CACHE,
    TX_PER_COMP_REQ,
};
use crate::{
    runtime::{
        fail::Fail,
        memory::{
            prefetch,
            Mbuf,
            Mempool,
        },
    },
    verbs::{
        CqHandle,
        CqIntf,
        Mr,
        PdHandle,
        Qp,
        QpBurst,
        QpCap,
        QpGroup,
        QpHandle,
        QpInitAttr,
        QpState,
        QpType,
        RdHandle,
        SendFlags,
        Sge,
        Verbs,
    },
};
use arrayvec::ArrayVec;
use std::rc::Rc;

//==============================================================================
// Structures
//==============================================================================

/// One MP to MR translation.
struct MrCacheEntry {
    mp: Mempool,
    mr: Mr,
    lkey: u32,
}

/// Tx ring slot. The mbuf stays here until the slot is about to be reused
/// (lazy free).
struct TxqElt {
    buf: Option<Mbuf>,
}

/// Tx queue descriptor.
pub(crate) struct Txq {
    ctx: Rc<dyn Verbs>,
    pd: PdHandle,
    vf: bool,
    /// MP to MR translation table.
    mp2mr: [Option<MrCacheEntry>; TX_MP_CACHE],
    rd: RdHandle,
    cq: CqHandle,
    pub(crate) qp: QpHandle,
    if_qp: Rc<dyn QpBurst>,
    if_cq: Rc<dyn CqIntf>,
    /// Max inline send size, as reported by the created QP.
    max_inline: u32,
    elts: Vec<TxqElt>,
    /// Current index in `elts`.
    elts_head: usize,
    /// First element awaiting completion.
    elts_tail: usize,
    /// Number of completion requests outstanding.
    elts_comp: usize,
    /// Countdown for the next completion request.
    elts_comp_cd: usize,
    /// Initial value for the countdown.
    elts_comp_cd_init: usize,
    /// Linearized buffers, one slot of `LINEAR_BUF_SIZE` per element.
    linear: Box<[u8]>,
    /// Memory region covering `linear`.
    mr_linear: Mr,
    pub(crate) stats: TxqStats,
}

/// Rolls back partially-created Verbs objects when setup bails out.
struct SetupGuard<'a> {
    ctx: &'a Rc<dyn Verbs>,
    rd: Option<RdHandle>,
    cq: Option<CqHandle>,
    qp: Option<QpHandle>,
    mr_linear: Option<Mr>,
    armed: bool,
}

impl<'a> SetupGuard<'a> {
    fn new(ctx: &'a Rc<dyn Verbs>) -> Self {
        Self {
            ctx,
            rd: None,
            cq: None,
            qp: None,
            mr_linear: None,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SetupGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(mr) = self.mr_linear.take() {
            let _ = self.ctx.dereg_mr(mr.handle);
        }
        if let Some(qp) = self.qp.take() {
            let _ = self.ctx.destroy_qp(qp);
        }
        if let Some(cq) = self.cq.take() {
            let _ = self.ctx.destroy_cq(cq);
        }
        if let Some(rd) = self.rd.take() {
            let _ = self.ctx.destroy_res_domain(rd);
        }
    }
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Txq {
    /// Configures a Tx queue with `desc` requested descriptors. The
    /// effective ring has `desc / SGE_WR_N` slots.
    pub(crate) fn setup(port: &Port, idx: u16, desc: u16, conf: &TxConf) -> Result<Txq, Fail> {
        let ctx: &Rc<dyn Verbs> = &port.ctx;
        if desc == 0 || desc as usize % SGE_WR_N != 0 {
            error!(
                "txq {}: invalid number of Tx descriptors (must be a multiple of {})",
                idx, SGE_WR_N
            );
            return Err(Fail::new(libc::EINVAL, "invalid number of Tx descriptors"));
        }
        let desc: u32 = desc as u32 / SGE_WR_N as u32;
        // MRs are registered in mp2mr[] on first use by the burst path.
        let mut guard: SetupGuard = SetupGuard::new(ctx);
        guard.rd = Some(ctx.create_res_domain()?);
        guard.cq = Some(ctx.create_cq(desc, None, guard.rd)?);
        debug!(
            "device_attr: max_qp_wr={} max_sge={}",
            port.device_attr.max_qp_wr, port.device_attr.max_sge
        );
        let qp: Qp = ctx.create_qp(&QpInitAttr {
            send_cq: guard.cq,
            recv_cq: guard.cq,
            cap: QpCap {
                max_send_wr: port.device_attr.max_qp_wr.min(desc),
                max_recv_wr: 0,
                max_send_sge: port.device_attr.max_sge.min(SGE_WR_N as u32),
                max_recv_sge: 0,
                max_inline_data: conf.max_inline,
            },
            qp_type: QpType::RawPacket,
            pd: port.pd,
            res_domain: guard.rd,
            inl_recv: 0,
            qpg: QpGroup::None,
            port_num: None,
        })?;
        guard.qp = Some(qp.handle);
        // The created QP reports the effective inline limit.
        let max_inline: u32 = qp.cap.max_inline_data;
        ctx.modify_qp(qp.handle, QpState::Init, Some(port.port_num))?;

        let elts_n: usize = desc as usize;
        let mut elts: Vec<TxqElt> = Vec::with_capacity(elts_n);
        for _ in 0..elts_n {
            elts.push(TxqElt { buf: None });
        }
        let linear: Box<[u8]> = vec![0u8; elts_n * LINEAR_BUF_SIZE].into_boxed_slice();
        let mr_linear: Mr = ctx.reg_mr(
            port.pd,
            linear.as_ptr() as u64,
            linear.len(),
            crate::verbs::ACCESS_LOCAL_WRITE,
        )?;
        guard.mr_linear = Some(mr_linear);
        debug!("txq {}: allocated and configured {} WRs", idx, elts_n);

        ctx.modify_qp(qp.handle, QpState::Rtr, None)?;
        ctx.modify_qp(qp.handle, QpState::Rts, None)?;
        let if_cq: Rc<dyn CqIntf> = ctx.query_cq_intf(guard.cq.unwrap())?;
        let if_qp: Rc<dyn QpBurst> = ctx.query_qp_burst(qp.handle)?;

        // Request a completion every TX_PER_COMP_REQ packets or at least 4
        // times per ring. Rings smaller than 4 slots signal every send; the
        // countdown must never start at zero.
        let elts_comp_cd_init: usize = TX_PER_COMP_REQ.min(elts_n / 4).max(1);
        guard.disarm();
        Ok(Txq {
            ctx: ctx.clone(),
            pd: port.pd,
            vf: port.vf,
            mp2mr: Default::default(),
            rd: guard.rd.unwrap(),
            cq: guard.cq.unwrap(),
            qp: qp.handle,
            if_qp,
            if_cq,
            max_inline,
            elts,
            elts_head: 0,
            elts_tail: 0,
            elts_comp: 0,
            elts_comp_cd: elts_comp_cd_init,
            elts_comp_cd_init,
            linear,
            mr_linear,
            stats: TxqStats {
                idx,
                ..Default::default()
            },
        })
    }

    /// Manages Tx completions. A completion event is only requested once
    /// every `elts_comp_cd_init` sends, so each harvested completion stands
    /// for a full batch of transmitted WRs.
    fn complete(&mut self) -> Result<(), Fail> {
        let elts_comp: usize = self.elts_comp;
        let elts_n: usize = self.elts.len();
        if elts_comp == 0 {
            return Ok(());
        }
        let wcs_n: usize = match self.if_cq.poll_cnt(elts_comp) {
            Ok(n) => n,
            Err(e) => {
                debug!("txq {}: poll_cnt() failed: {}", self.stats.idx, e);
                return Err(e);
            },
        };
        if wcs_n == 0 {
            return Ok(());
        }
        // A spurious completion must not let the tail cross the head.
        debug_assert!(wcs_n <= elts_comp);
        let wcs_n: usize = wcs_n.min(elts_comp);
        // WC status is trusted successful: completions are coalesced and the
        // hardware cannot partially succeed a batch.
        let mut elts_tail: usize = self.elts_tail + wcs_n * self.elts_comp_cd_init;
        if elts_tail >= elts_n {
            elts_tail -= elts_n;
        }
        self.elts_tail = elts_tail;
        self.elts_comp = elts_comp - wcs_n;
        Ok(())
    }

    /// Returns the `lkey` for `mp`, registering a new MR when the pool is
    /// not cached yet. Evicts the oldest entry when the table is full.
    fn mp2mr(&mut self, mp: &Mempool) -> Option<u32> {
        let mut i: usize = 0;
        while i < TX_MP_CACHE {
            match &self.mp2mr[i] {
                None => break,
                Some(entry) if entry.mp.ptr_eq(mp) => {
                    debug_assert_eq!(entry.lkey, entry.mr.lkey);
                    return Some(entry.lkey);
                },
                Some(_) => i += 1,
            }
        }
        // Add a new entry, register the MR first.
        debug!("txq {}: discovered new memory pool \"{}\"", self.stats.idx, mp.name());
        let mr: Mr = match super::mp2mr(&self.ctx, self.pd, mp) {
            Ok(mr) => mr,
            Err(_) => {
                debug!("txq {}: unable to configure MR, reg_mr() failed", self.stats.idx);
                return None;
            },
        };
        if i == TX_MP_CACHE {
            // Table is full, remove the oldest entry.
            debug!("txq {}: MP <-> MR table full, dropping oldest entry", self.stats.idx);
            i -= 1;
            let oldest: MrCacheEntry = self.mp2mr[0].take().unwrap();
            let _ = self.ctx.dereg_mr(oldest.mr.handle);
            self.mp2mr.rotate_left(1);
        }
        debug!(
            "txq {}: new MR lkey for MP \"{}\": {:#010x}",
            self.stats.idx,
            mp.name(),
            mr.lkey
        );
        self.mp2mr[i] = Some(MrCacheEntry {
            mp: mp.clone(),
            lkey: mr.lkey,
            mr,
        });
        Some(mr.lkey)
    }

    /// Handles scattered buffers: one SGE per segment, with extra segments
    /// linearized into this slot's fallback buffer. Returns the number of
    /// bytes queued.
    fn tx_burst_sg(
        &mut self,
        buf: &Mbuf,
        elts_head: usize,
        sges: &mut ArrayVec<Sge, SGE_WR_N>,
    ) -> Result<u32, ()> {
        let mut segs: usize = buf.nb_segs() as usize;
        let mut linearize: bool = false;

        // When there are too many segments, extra segments are linearized in
        // the last SGE.
        if segs > SGE_WR_N {
            segs = SGE_WR_N - 1;
            linearize = true;
        }
        let mut sent_size: u32 = 0;
        let mut iter = buf.segments();
        for _ in 0..segs {
            let seg: &Mbuf = match iter.next() {
                Some(seg) => seg,
                None => return Err(()),
            };
            let lkey: u32 = match self.mp2mr(seg.data_pool()) {
                Some(lkey) => lkey,
                None => {
                    debug!("txq {}: unable to get MP <-> MR association", self.stats.idx);
                    return Err(());
                },
            };
            if self.vf {
                seg.prefetch_data();
            }
            sges.push(Sge {
                addr: seg.data_ptr() as u64,
                length: seg.data_len(),
                lkey,
            });
            sent_size += seg.data_len();
        }
        // Linearize extra segments.
        if linearize {
            let base: usize = elts_head * LINEAR_BUF_SIZE;
            let mut size: usize = 0;
            for seg in iter {
                let len: usize = seg.data_len() as usize;
                if size + len > LINEAR_BUF_SIZE {
                    debug!("txq {}: packet too large to be linearized", self.stats.idx);
                    return Err(());
                }
                self.linear[base + size..base + size + len].copy_from_slice(seg.data());
                size += len;
            }
            if size == 0 {
                // Invalid packet.
                return Err(());
            }
            sges.push(Sge {
                addr: self.linear[base..].as_ptr() as u64,
                length: size as u32,
                lkey: self.mr_linear.lkey,
            });
            sent_size += size as u32;
        }
        Ok(sent_size)
    }

    /// Burst-sends up to `pkts.len()` packets, removing the posted prefix
    /// from `pkts`. A packet hitting a per-packet fault is dropped and the
    /// burst truncates there; the returned count covers posted packets only.
    pub(crate) fn tx_burst(&mut self, pkts: &mut Vec<Mbuf>) -> usize {
        let elts_n: usize = self.elts.len();
        let if_qp: Rc<dyn QpBurst> = self.if_qp.clone();
        debug_assert!(self.elts_comp_cd != 0);
        let _ = self.complete();
        let mut elts_head: usize = self.elts_head;
        let mut elts_comp_cd: usize = self.elts_comp_cd;
        let mut elts_comp: usize = 0;
        let used: usize = if elts_head >= self.elts_tail {
            elts_head - self.elts_tail
        } else {
            elts_head + elts_n - self.elts_tail
        };
        let mut max: usize = elts_n - used;
        debug_assert!(max >= 1);
        debug_assert!(max <= elts_n);
        // Always leave one free entry in the ring.
        max -= 1;
        if max == 0 {
            return 0;
        }
        if max > pkts.len() {
            max = pkts.len();
        }
        let mut incoming = pkts.drain(..max).collect::<Vec<Mbuf>>().into_iter();
        let mut i: usize = 0;
        while let Some(buf) = incoming.next() {
            let elts_head_next: usize = if elts_head + 1 == elts_n { 0 } else { elts_head + 1 };
            // Clean up the old buffer (lazy free). The very first burst hits
            // empty slots, hence the guard.
            if let Some(old) = self.elts[elts_head].buf.take() {
                drop(old);
            }
            // Request a Tx completion.
            let mut send_flags: SendFlags = SendFlags::default();
            elts_comp_cd -= 1;
            if elts_comp_cd == 0 {
                elts_comp_cd = self.elts_comp_cd_init;
                elts_comp += 1;
                send_flags.signaled = true;
            }
            let segs: usize = buf.nb_segs() as usize;
            let sent_size: u32;
            if segs == 1 {
                let addr: u64 = buf.data_ptr() as u64;
                let length: u32 = buf.data_len();
                if self.vf {
                    buf.prefetch_data();
                }
                if let Some(next_buf) = self.elts[elts_head_next].buf.as_ref() {
                    prefetch(next_buf as *const Mbuf as *const u8);
                }
                // Put the packet into the send queue.
                let err = if length <= self.max_inline {
                    if_qp.send_pending_inline(buf.data(), send_flags)
                } else {
                    // Retrieve the Memory Region key for this memory pool.
                    match self.mp2mr(buf.data_pool()) {
                        Some(lkey) => if_qp.send_pending(addr, length, lkey, send_flags),
                        None => {
                            // MR does not exist.
                            debug!("txq {}: unable to get MP <-> MR association", self.stats.idx);
                            Err(Fail::new(libc::EFAULT, "no MR for pool"))
                        },
                    }
                };
                if err.is_err() {
                    drop(buf);
                    self.stats.odropped += 1;
                    break;
                }
                sent_size = length;
            } else {
                let mut sges: ArrayVec<Sge, SGE_WR_N> = ArrayVec::new();
                let length: u32 = match self.tx_burst_sg(&buf, elts_head, &mut sges) {
                    Ok(length) => length,
                    Err(()) => {
                        drop(buf);
                        self.stats.odropped += 1;
                        break;
                    },
                };
                if let Some(next_buf) = self.elts[elts_head_next].buf.as_ref() {
                    prefetch(next_buf as *const Mbuf as *const u8);
                }
                // Put the SG list into the send queue.
                if if_qp.send_pending_sg_list(&sges, send_flags).is_err() {
                    drop(buf);
                    self.stats.odropped += 1;
                    break;
                }
                sent_size = length;
            }
            self.elts[elts_head].buf = Some(buf);
            elts_head = elts_head_next;
            // Increment the sent-bytes counter.
            self.stats.obytes += sent_size as u64;
            i += 1;
        }
        // Return unprocessed packets to the caller.
        let leftovers: Vec<Mbuf> = incoming.collect();
        pkts.splice(0..0, leftovers);
        // Take a shortcut if nothing was sent.
        if i == 0 {
            return 0;
        }
        // Increment the sent-packets counter.
        self.stats.opackets += i as u64;
        // Ring the QP doorbell.
        if let Err(e) = if_qp.send_flush() {
            // A nonzero value is not supposed to come back. Nothing can be
            // done about it.
            debug!("txq {}: send_flush() failed: {}", self.stats.idx, e);
        }
        self.elts_head = elts_head;
        self.elts_comp += elts_comp;
        self.elts_comp_cd = elts_comp_cd;
        i
    }

    /// Effective inline-send threshold.
    pub(crate) fn max_inline(&self) -> u32 {
        self.max_inline
    }

    /// Number of cached MP to MR translations.
    pub(crate) fn mp2mr_len(&self) -> usize {
        self.mp2mr.iter().take_while(|e| e.is_some()).count()
    }

    /// Whether `mp` currently has a cached translation.
    pub(crate) fn mp2mr_contains(&self, mp: &Mempool) -> bool {
        self.mp2mr
            .iter()
            .flatten()
            .any(|entry| entry.mp.ptr_eq(mp))
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Drop for Txq {
    fn drop(&mut self) {
        debug!("cleaning up txq {}", self.stats.idx);
        // Free in-flight mbufs; the elements own them.
        self.elts.clear();
        let _ = self.ctx.destroy_qp(self.qp);
        let _ = self.ctx.destroy_cq(self.cq);
        let _ = self.ctx.destroy_res_domain(self.rd);
        let _ = self.ctx.dereg_mr(self.mr_linear.handle);
        for entry in self.mp2mr.iter_mut() {
            if let Some(entry) = entry.take() {
                let _ = self.ctx.dereg_mr(entry.mr.handle);
            }
        }
    }
}
