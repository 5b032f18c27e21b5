// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Rx queue: single-segment and scattered receive rings, replacement-buffer
//! allocation with back-pressure, work-request reposting, and in-place
//! reconfiguration across MTU changes.

//==============================================================================
// Imports
//==============================================================================

use super::{
    wr_id_encode,
    wr_id_index,
    wr_id_offset,
    Port,
    RxMode,
    RxqStats,
    MAX_BURST,
    SGE_WR_N,
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
        ChannelHandle,
        CqHandle,
        CqIntf,
        Mr,
        PdHandle,
        PollLength,
        Qp,
        QpBurst,
        QpCap,
        QpGroup,
        QpHandle,
        QpInitAttr,
        QpState,
        QpType,
        RdHandle,
        RecvWr,
        Sge,
        Verbs,
        Wc,
        WcStatus,
    },
};
use arrayvec::ArrayVec;
use std::{
    cell::Cell,
    rc::Rc,
};

//==============================================================================
// Structures
//==============================================================================

/// Single-segment Rx element. The WR id encodes the slot index and the
/// headroom offset so the mbuf base address can be recovered from the SGE
/// address minus the offset.
struct RxqElt {
    wr_id: u64,
    sge: Sge,
    buf: Option<Mbuf>,
}

/// Scattered Rx element: one WR covering up to `SGE_WR_N` segments. The
/// first SGE preserves the standard headroom; subsequent segments give it up
/// so the full buffer length is available.
struct RxqEltSp {
    sges: [Sge; SGE_WR_N],
    bufs: [Option<Mbuf>; SGE_WR_N],
}

enum RxqElts {
    NoSp(Vec<RxqElt>),
    Sp(Vec<RxqEltSp>),
}

/// Rx queue descriptor.
pub(crate) struct Rxq {
    ctx: Rc<dyn Verbs>,
    pd: PdHandle,
    port_num: u8,
    /// Port ID for incoming packets.
    port_id: u16,
    /// Memory pool for allocations.
    mp: Mempool,
    /// Memory region covering the whole pool.
    mr: Mr,
    rd: RdHandle,
    channel: Option<ChannelHandle>,
    cq: CqHandle,
    /// Deferred in isolated mode until the first flow references the queue.
    pub(crate) qp: Option<QpHandle>,
    /// Whether the QP was created under an RSS parent.
    pub(crate) as_child: bool,
    if_qp: Option<Rc<dyn QpBurst>>,
    if_cq: Option<Rc<dyn CqIntf>>,
    /// Use scattered Rx elements.
    pub(crate) sp: bool,
    elts: RxqElts,
    /// Current index in the elements array.
    elts_head: usize,
    inl_recv: u32,
    pub(crate) stats: RxqStats,
    alloc_failed: Rc<Cell<u64>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Rxq {
    /// Configures an Rx queue with `desc` requested descriptors, choosing
    /// the element variant from the frame length and the pool's buffer
    /// size. In isolated mode the QP is not created here; the first flow
    /// referencing the queue creates it.
    pub(crate) fn setup(
        port: &Port,
        idx: u16,
        desc: u16,
        rx_mode: &RxMode,
        rxq_intr: bool,
        isolated: bool,
        mp: &Mempool,
    ) -> Result<Rxq, Fail> {
        let ctx: &Rc<dyn Verbs> = &port.ctx;
        let mb_len: usize = mp.data_room_size();
        if desc == 0 || desc as usize % SGE_WR_N != 0 {
            error!(
                "rxq {}: invalid number of Rx descriptors (must be a multiple of {})",
                idx, SGE_WR_N
            );
            return Err(Fail::new(libc::EINVAL, "invalid number of Rx descriptors"));
        }
        let mut desc: usize = desc as usize;
        // Enable scattered packets support for this queue if necessary.
        debug_assert!(mb_len >= mp.headroom());
        let mut sp: bool = false;
        if rx_mode.max_rx_pkt_len as usize <= mb_len - mp.headroom() {
            // Frame fits one mbuf.
        } else if rx_mode.enable_scatter {
            sp = true;
            desc /= SGE_WR_N;
        } else {
            warn!(
                "rxq {}: the requested maximum Rx packet size ({}) is larger than a single mbuf ({}) and scattered mode has not been requested",
                idx,
                rx_mode.max_rx_pkt_len,
                mb_len - mp.headroom()
            );
        }
        debug!(
            "rxq {}: {} scattered packets support ({} WRs)",
            idx,
            if sp { "enabling" } else { "disabling" },
            desc
        );
        // Use the entire Rx mempool as the memory region.
        let mr: Mr = super::mp2mr(ctx, port.pd, mp).map_err(|_| {
            error!("rxq {}: MR creation failure", idx);
            Fail::new(libc::EINVAL, "cannot register Rx pool")
        })?;
        let mut rxq: Rxq = Rxq {
            ctx: ctx.clone(),
            pd: port.pd,
            port_num: port.port_num,
            port_id: port.port_id,
            mp: mp.clone(),
            mr,
            rd: RdHandle(0),
            channel: None,
            cq: CqHandle(0),
            qp: None,
            as_child: false,
            if_qp: None,
            if_cq: None,
            sp,
            elts: RxqElts::NoSp(Vec::new()),
            elts_head: 0,
            inl_recv: port.inl_recv_size,
            stats: RxqStats {
                idx,
                ..Default::default()
            },
            alloc_failed: port.alloc_failed.clone(),
        };
        // From here on, a failed step leaves cleanup to the Drop impl;
        // RdHandle(0)/CqHandle(0) placeholders are never handed back.
        rxq.rd = ctx.create_res_domain()?;
        if rxq_intr {
            rxq.channel = Some(ctx.create_comp_channel()?);
        }
        rxq.cq = ctx.create_cq(desc as u32, rxq.channel, Some(rxq.rd))?;
        rxq.alloc_elts(desc, None)?;
        if !isolated {
            rxq.create_qp(None)?;
        }
        Ok(rxq)
    }

    /// Creates the queue pair, posts the initial receive chain, and drives
    /// the QP to RTR. With `parent`, the QP is created as a child of an RSS
    /// parent.
    pub(crate) fn create_qp(&mut self, parent: Option<QpHandle>) -> Result<(), Fail> {
        if self.qp.is_some() {
            return Err(Fail::new(libc::EEXIST, "queue already has a QP"));
        }
        let qp: Qp = self.ctx.create_qp(&QpInitAttr {
            send_cq: Some(self.cq),
            recv_cq: Some(self.cq),
            cap: QpCap {
                max_send_wr: 0,
                max_recv_wr: self.wr_count() as u32,
                max_send_sge: 0,
                max_recv_sge: SGE_WR_N as u32,
                max_inline_data: 0,
            },
            qp_type: QpType::RawPacket,
            pd: self.pd,
            res_domain: Some(self.rd),
            inl_recv: self.inl_recv,
            qpg: match parent {
                Some(parent) => QpGroup::Child { parent },
                None => QpGroup::None,
            },
            port_num: None,
        })?;
        self.ctx.modify_qp(qp.handle, QpState::Init, Some(self.port_num))?;
        let wrs: Vec<RecvWr> = self.build_wr_chain();
        self.ctx.post_recv(qp.handle, &wrs)?;
        self.ctx.modify_qp(qp.handle, QpState::Rtr, None)?;
        self.if_cq = Some(self.ctx.query_cq_intf(self.cq)?);
        self.if_qp = Some(self.ctx.query_qp_burst(qp.handle)?);
        self.qp = Some(qp.handle);
        self.as_child = parent.is_some();
        Ok(())
    }

    /// Number of work requests (ring slots) in the current variant.
    pub(crate) fn wr_count(&self) -> usize {
        match &self.elts {
            RxqElts::NoSp(elts) => elts.len(),
            RxqElts::Sp(elts) => elts.len(),
        }
    }

    /// (Re)allocates the element array. With `pool`, buffers are taken from
    /// the supplied array instead of the mempool; the reconfiguration path
    /// must not allocate.
    fn alloc_elts(&mut self, elts_n: usize, pool: Option<Vec<Mbuf>>) -> Result<(), Fail> {
        let headroom: usize = self.mp.headroom();
        let mut pool = pool.map(|bufs| bufs.into_iter());
        let mut take = |mp: &Mempool| -> Result<Mbuf, Fail> {
            match pool.as_mut() {
                Some(iter) => match iter.next() {
                    Some(mut buf) => {
                        buf.reset();
                        Ok(buf)
                    },
                    None => Err(Fail::new(libc::ENOMEM, "snapshot pool exhausted")),
                },
                None => match mp.alloc() {
                    Some(buf) => Ok(buf),
                    None => {
                        error!("rxq: empty mbuf pool");
                        Err(Fail::new(libc::ENOMEM, "empty mbuf pool"))
                    },
                },
            }
        };
        if self.sp {
            let mut elts: Vec<RxqEltSp> = Vec::with_capacity(elts_n);
            for _ in 0..elts_n {
                let mut sges: [Sge; SGE_WR_N] = [Sge::default(); SGE_WR_N];
                let mut bufs: [Option<Mbuf>; SGE_WR_N] = Default::default();
                for (j, slot) in bufs.iter_mut().enumerate() {
                    let mut buf: Mbuf = take(&self.mp)?;
                    let buf_len: usize = buf.buf_len();
                    if j == 0 {
                        // The first SGE keeps its headroom.
                        debug_assert_eq!(buf.data_off() as usize, headroom);
                        sges[j] = Sge {
                            addr: buf.buf_addr() as u64 + headroom as u64,
                            length: (buf_len - headroom) as u32,
                            lkey: self.mr.lkey,
                        };
                    } else {
                        // Subsequent SGEs lose theirs.
                        buf.set_data_off(0);
                        sges[j] = Sge {
                            addr: buf.buf_addr() as u64,
                            length: buf_len as u32,
                            lkey: self.mr.lkey,
                        };
                    }
                    *slot = Some(buf);
                }
                elts.push(RxqEltSp { sges, bufs });
            }
            debug!(
                "rxq {}: allocated and configured {} WRs ({} segments)",
                self.stats.idx,
                elts_n,
                elts_n * SGE_WR_N
            );
            self.elts = RxqElts::Sp(elts);
        } else {
            let mut elts: Vec<RxqElt> = Vec::with_capacity(elts_n);
            for i in 0..elts_n {
                let buf: Mbuf = take(&self.mp)?;
                debug_assert_eq!(buf.data_off() as usize, headroom);
                let sge: Sge = Sge {
                    addr: buf.buf_addr() as u64 + headroom as u64,
                    length: (buf.buf_len() - headroom) as u32,
                    lkey: self.mr.lkey,
                };
                // The WR id carries the element index and the offset between
                // the buffer base and its data.
                let wr_id: u64 = wr_id_encode(i as u32, headroom as u16);
                if wr_id_index(wr_id) != i as u32
                    || sge.addr - wr_id_offset(wr_id) as u64 != buf.buf_addr() as u64
                {
                    error!("rxq {}: cannot store index and offset in WR ID", self.stats.idx);
                    return Err(Fail::new(libc::EOVERFLOW, "cannot encode WR ID"));
                }
                elts.push(RxqElt {
                    wr_id,
                    sge,
                    buf: Some(buf),
                });
            }
            debug!(
                "rxq {}: allocated and configured {} single-segment WRs",
                self.stats.idx, elts_n
            );
            self.elts = RxqElts::NoSp(elts);
        }
        self.elts_head = 0;
        Ok(())
    }

    /// Builds the receive chain covering every element, in ring order. The
    /// chain is self-terminating: the last WR has no successor.
    fn build_wr_chain(&self) -> Vec<RecvWr> {
        match &self.elts {
            RxqElts::NoSp(elts) => elts
                .iter()
                .map(|elt| RecvWr {
                    wr_id: elt.wr_id,
                    sges: vec![elt.sge],
                })
                .collect(),
            RxqElts::Sp(elts) => elts
                .iter()
                .enumerate()
                .map(|(i, elt)| RecvWr {
                    wr_id: i as u64,
                    sges: elt.sges.to_vec(),
                })
                .collect(),
        }
    }

    /// Polls one completion, falling back to `poll_cq` on error status.
    /// Returns `None` when the CQ is drained, `Some(Err(()))` for a bad
    /// completion that must be reposted, and `Some(Ok(len))` otherwise.
    fn poll_one(&mut self, if_cq: &Rc<dyn CqIntf>) -> Option<Result<u32, ()>> {
        match if_cq.poll_length_flags() {
            PollLength::Empty => None,
            PollLength::Packet { len, .. } => Some(Ok(len)),
            PollLength::Error => {
                // poll_cq() must be used in case of failure.
                let wcs: Vec<Wc> = match self.ctx.poll_cq(self.cq, 1) {
                    Ok(wcs) => wcs,
                    Err(e) => {
                        debug!("rxq {}: poll_cq() failed: {}", self.stats.idx, e);
                        return None;
                    },
                };
                let wc: Wc = *wcs.first()?;
                if wc.status != WcStatus::Success {
                    // Whatever, just repost the offending WR.
                    debug!(
                        "rxq {}: bad work completion status: {}",
                        self.stats.idx,
                        wc.status.as_str()
                    );
                    self.stats.idropped += 1;
                    return Some(Err(()));
                }
                Some(Ok(wc.byte_len))
            },
        }
    }

    /// Receives up to `pkts_n` packets. Dispatches to the scattered variant
    /// when enabled on this queue.
    pub(crate) fn rx_burst(&mut self, pkts_n: usize) -> ArrayVec<Mbuf, MAX_BURST> {
        if self.sp {
            return self.rx_burst_sp(pkts_n);
        }
        let mut pkts: ArrayVec<Mbuf, MAX_BURST> = ArrayVec::new();
        let if_cq: Rc<dyn CqIntf> = match &self.if_cq {
            Some(if_cq) => if_cq.clone(),
            None => return pkts,
        };
        let if_qp: Rc<dyn QpBurst> = match &self.if_qp {
            Some(if_qp) => if_qp.clone(),
            None => return pkts,
        };
        let elts_n: usize = self.wr_count();
        let mut elts_head: usize = self.elts_head;
        let headroom: usize = self.mp.headroom();
        let mut sges: ArrayVec<Sge, MAX_BURST> = ArrayVec::new();
        for _ in 0..pkts_n.min(MAX_BURST) {
            debug_assert!(elts_head < elts_n);
            // Fetch initial bytes of the packet descriptor into a cacheline
            // while allocating the replacement.
            if let RxqElts::NoSp(elts) = &self.elts {
                if let Some(buf) = elts[elts_head].buf.as_ref() {
                    prefetch(buf as *const Mbuf as *const u8);
                }
            }
            let len: u32 = match self.poll_one(&if_cq) {
                None => break,
                Some(Err(())) => {
                    // Repost the offending WR unchanged.
                    if let RxqElts::NoSp(elts) = &self.elts {
                        sges.push(elts[elts_head].sge);
                    }
                    elts_head = if elts_head + 1 >= elts_n { 0 } else { elts_head + 1 };
                    continue;
                },
                Some(Ok(len)) => len,
            };
            let rep: Option<Mbuf> = self.mp.raw_alloc();
            let elts = match &mut self.elts {
                RxqElts::NoSp(elts) => elts,
                RxqElts::Sp(_) => unreachable!(),
            };
            let elt: &mut RxqElt = &mut elts[elts_head];
            let rep: Mbuf = match rep {
                Some(rep) => rep,
                None => {
                    // Unable to allocate a replacement mbuf, repost the WR.
                    debug!("rxq {}: can't allocate a new mbuf", self.stats.idx);
                    self.stats.rx_nombuf += 1;
                    self.alloc_failed.set(self.alloc_failed.get() + 1);
                    sges.push(elt.sge);
                    elts_head = if elts_head + 1 >= elts_n { 0 } else { elts_head + 1 };
                    continue;
                },
            };
            // Reconfigure the SGE to use the replacement instead.
            debug_assert_eq!(elt.sge.lkey, self.mr.lkey);
            let old_addr: u64 = elt.sge.addr;
            elt.sge.addr = rep.buf_addr() as u64 + headroom as u64;
            elt.wr_id = wr_id_encode(wr_id_index(elt.wr_id), headroom as u16);
            let mut seg: Mbuf = elt.buf.replace(rep).expect("rx slot without mbuf");
            debug_assert_eq!(old_addr - wr_id_offset(elt.wr_id) as u64, seg.buf_addr() as u64);
            sges.push(elt.sge);
            // Update the delivered segment.
            seg.set_data_off(headroom as u16);
            seg.set_nb_segs(1);
            seg.set_port(self.port_id);
            seg.set_pkt_len(len);
            seg.set_data_len(len);
            pkts.push(seg);
            self.stats.ibytes += len as u64;
            elts_head = if elts_head + 1 >= elts_n { 0 } else { elts_head + 1 };
        }
        // Nothing was consumed, nothing to repost.
        if sges.is_empty() {
            return pkts;
        }
        // Repost WRs.
        if let Err(e) = if_qp.recv_burst(&sges) {
            // Inability to repost WRs is fatal: the QP is unrecoverable.
            error!("rxq {}: recv_burst() failed: {}", self.stats.idx, e);
            panic!("rxq: failed to repost receive WRs");
        }
        self.elts_head = elts_head;
        self.stats.ipackets += pkts.len() as u64;
        pkts
    }

    /// Scattered receive: one completion covers one packet spread over up
    /// to `SGE_WR_N` segment slots of a single element.
    fn rx_burst_sp(&mut self, pkts_n: usize) -> ArrayVec<Mbuf, MAX_BURST> {
        let mut pkts: ArrayVec<Mbuf, MAX_BURST> = ArrayVec::new();
        let if_cq: Rc<dyn CqIntf> = match &self.if_cq {
            Some(if_cq) => if_cq.clone(),
            None => return pkts,
        };
        let qp: QpHandle = match self.qp {
            Some(qp) => qp,
            None => return pkts,
        };
        let elts_n: usize = self.wr_count();
        let mut elts_head: usize = self.elts_head;
        let headroom: usize = self.mp.headroom();
        let buf_len: usize = self.mp.data_room_size();
        let mut repost: Vec<RecvWr> = Vec::new();
        for _ in 0..pkts_n.min(MAX_BURST) {
            debug_assert!(elts_head < elts_n);
            let len: u32 = match self.poll_one(&if_cq) {
                None => break,
                Some(Err(())) => {
                    if let RxqElts::Sp(elts) = &self.elts {
                        repost.push(RecvWr {
                            wr_id: elts_head as u64,
                            sges: elts[elts_head].sges.to_vec(),
                        });
                    }
                    elts_head = if elts_head + 1 >= elts_n { 0 } else { elts_head + 1 };
                    continue;
                },
                Some(Ok(len)) => len,
            };
            // Replace spent segments with new ones, then concatenate and
            // deliver them as one packet.
            let mut segs_out: Vec<Mbuf> = Vec::with_capacity(SGE_WR_N);
            let mut remaining: usize = len as usize;
            let mut seg_headroom: usize = headroom;
            let mut failed: bool = false;
            for j in 0..SGE_WR_N {
                let rep: Option<Mbuf> = self.mp.raw_alloc();
                let elts = match &mut self.elts {
                    RxqElts::Sp(elts) => elts,
                    RxqElts::NoSp(_) => unreachable!(),
                };
                let elt: &mut RxqEltSp = &mut elts[elts_head];
                let rep: Mbuf = match rep {
                    Some(rep) => rep,
                    None => {
                        // Free the partially-built chain and repost the WR
                        // with whatever contents it has now.
                        debug!("rxq {}: can't allocate a new mbuf", self.stats.idx);
                        segs_out.clear();
                        self.stats.rx_nombuf += 1;
                        self.alloc_failed.set(self.alloc_failed.get() + 1);
                        failed = true;
                        break;
                    },
                };
                elt.sges[j].addr = rep.buf_addr() as u64 + seg_headroom as u64;
                let mut seg: Mbuf = elt.bufs[j].replace(rep).expect("rx slot without mbuf");
                seg.set_data_off(seg_headroom as u16);
                let seg_tailroom: usize = buf_len - seg_headroom;
                if remaining <= seg_tailroom {
                    // Last segment.
                    seg.set_data_len(remaining as u32);
                    seg.set_pkt_len(remaining as u32);
                    segs_out.push(seg);
                    break;
                }
                seg.set_data_len(seg_tailroom as u32);
                seg.set_pkt_len(seg_tailroom as u32);
                segs_out.push(seg);
                // Fix the length and clear the headroom for what follows.
                remaining -= seg_tailroom;
                seg_headroom = 0;
            }
            let elts = match &self.elts {
                RxqElts::Sp(elts) => elts,
                RxqElts::NoSp(_) => unreachable!(),
            };
            repost.push(RecvWr {
                wr_id: elts_head as u64,
                sges: elts[elts_head].sges.to_vec(),
            });
            elts_head = if elts_head + 1 >= elts_n { 0 } else { elts_head + 1 };
            if failed {
                continue;
            }
            // Link the chain and fill first-segment metadata.
            debug_assert!(!segs_out.is_empty());
            let nb_segs: u16 = segs_out.len() as u16;
            let mut iter = segs_out.into_iter().rev();
            let mut head: Mbuf = iter.next().unwrap();
            for mut prev in iter {
                prev.set_next(head);
                head = prev;
            }
            head.set_nb_segs(nb_segs);
            head.set_port(self.port_id);
            head.set_pkt_len(len);
            pkts.push(head);
            self.stats.ibytes += len as u64;
        }
        if repost.is_empty() {
            return pkts;
        }
        // Repost WRs.
        if let Err(e) = self.ctx.post_recv(qp, &repost) {
            // Inability to repost WRs is fatal: the QP is unrecoverable.
            error!("rxq {}: post_recv() failed: {}", self.stats.idx, e);
            panic!("rxq: failed to repost receive WRs");
        }
        self.elts_head = elts_head;
        self.stats.ipackets += pkts.len() as u64;
        pkts
    }

    /// Reconfigures the queue in place after an MTU change, switching the
    /// element variant when needed. Never allocates mbufs: the buffers held
    /// by the old variant are snatched and reused, keeping the pool fill
    /// level invariant. A failure past the QP reset leaves the queue
    /// unusable.
    pub(crate) fn rehash(&mut self, rx_mode: &RxMode) -> Result<(), Fail> {
        let mb_len: usize = self.mp.data_room_size();
        debug!("rxq {}: rehashing", self.stats.idx);
        // Number of descriptors and mbufs currently allocated.
        let mut desc_n: usize = self.wr_count() * if self.sp { SGE_WR_N } else { 1 };
        let mbuf_n: usize = desc_n;
        let sp: bool = rx_mode.enable_scatter
            && rx_mode.max_rx_pkt_len as usize > mb_len - self.mp.headroom();
        if sp {
            desc_n /= SGE_WR_N;
        }
        debug!(
            "rxq {}: {} scattered packets support ({} WRs)",
            self.stats.idx,
            if sp { "enabling" } else { "disabling" },
            desc_n
        );
        // If scatter mode is the same as before, nothing to do.
        if sp == self.sp {
            debug!("rxq {}: nothing to do", self.stats.idx);
            return Ok(());
        }
        let qp: QpHandle = self
            .qp
            .ok_or_else(|| Fail::new(libc::EINVAL, "queue has no QP"))?;
        // From now on, any failure renders the queue unusable.
        self.ctx.modify_qp(qp, QpState::Reset, None).map_err(|e| {
            error!("rxq {}: cannot reset QP: {}", self.stats.idx, e);
            e
        })?;
        self.ctx.resize_cq(self.cq, desc_n as u32).map_err(|e| {
            error!("rxq {}: cannot resize CQ: {}", self.stats.idx, e);
            e
        })?;
        self.ctx
            .modify_qp(qp, QpState::Init, Some(self.port_num))
            .map_err(|e| {
                error!("rxq {}: QP state to INIT failed: {}", self.stats.idx, e);
                e
            })?;
        // Snatch mbufs from the original queue.
        let mut pool: Vec<Mbuf> = Vec::with_capacity(mbuf_n);
        match &mut self.elts {
            RxqElts::Sp(elts) => {
                for elt in elts.iter_mut() {
                    for buf in elt.bufs.iter_mut() {
                        pool.push(buf.take().expect("scattered slot without mbuf"));
                    }
                }
            },
            RxqElts::NoSp(elts) => {
                for elt in elts.iter_mut() {
                    pool.push(elt.buf.take().expect("rx slot without mbuf"));
                }
            },
        }
        debug_assert_eq!(pool.len(), mbuf_n);
        self.sp = sp;
        self.alloc_elts(desc_n, Some(pool)).map_err(|e| {
            error!("rxq {}: cannot reallocate WRs, aborting", self.stats.idx);
            e
        })?;
        // Post WRs.
        let wrs: Vec<RecvWr> = self.build_wr_chain();
        self.ctx.post_recv(qp, &wrs).map_err(|e| {
            error!("rxq {}: post_recv() failed: {}", self.stats.idx, e);
            e
        })?;
        self.ctx.modify_qp(qp, QpState::Rtr, None).map_err(|e| {
            error!("rxq {}: QP state to RTR failed: {}", self.stats.idx, e);
            e
        })?;
        Ok(())
    }

    /// Arms the Rx interrupt on this queue.
    pub(crate) fn intr_enable(&self) -> Result<(), Fail> {
        if self.channel.is_none() {
            return Err(Fail::new(libc::EINVAL, "queue has no completion channel"));
        }
        self.ctx.req_notify_cq(self.cq)
    }

    /// Consumes and acknowledges one pending Rx interrupt event.
    pub(crate) fn intr_disable(&self) -> Result<(), Fail> {
        let channel: ChannelHandle = self
            .channel
            .ok_or_else(|| Fail::new(libc::EINVAL, "queue has no completion channel"))?;
        match self.ctx.get_cq_event(channel)? {
            Some(cq) if cq == self.cq => {
                self.ctx.ack_cq_events(self.cq, 1);
                Ok(())
            },
            _ => Err(Fail::new(libc::EINVAL, "no pending CQ event")),
        }
    }

    pub(crate) fn has_channel(&self) -> bool {
        self.channel.is_some()
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Drop for Rxq {
    fn drop(&mut self) {
        debug!("cleaning up rxq {}", self.stats.idx);
        // Elements own their mbufs; dropping them returns the buffers.
        self.elts = RxqElts::NoSp(Vec::new());
        if let Some(qp) = self.qp.take() {
            let _ = self.ctx.destroy_qp(qp);
        }
        if self.cq != CqHandle(0) {
            let _ = self.ctx.destroy_cq(self.cq);
        }
        if let Some(channel) = self.channel.take() {
            let _ = self.ctx.destroy_comp_channel(channel);
        }
        if self.rd != RdHandle(0) {
            let _ = self.ctx.destroy_res_domain(self.rd);
        }
        let _ = self.ctx.dereg_mr(self.mr.handle);
    }
}
