// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Software implementation of the Verbs transport. Frames handed to
//! [`LoopbackVerbs::deliver`] land in posted receive work requests by
//! writing the registered buffers they point at; transmitted work requests
//! are captured on a wire log at `send_flush` time by reading their
//! scatter/gather elements. Completion coalescing matches the hardware
//! contract: one CQ entry per *signaled* send work request.

//==============================================================================
// Imports
//==============================================================================

use super::{
    flow_spec,
    AccessFlags,
    AsyncEvent,
    ChannelHandle,
    CqHandle,
    CqIntf,
    DeviceAttr,
    FlowHandle,
    LinkLayer,
    Mr,
    MrHandle,
    PdHandle,
    PollLength,
    PortAttr,
    PortPhysState,
    Qp,
    QpBurst,
    QpCap,
    QpGroup,
    QpHandle,
    QpInitAttr,
    QpState,
    RdHandle,
    RecvWr,
    SendFlags,
    SendWr,
    Sge,
    Verbs,
    Wc,
    WcStatus,
};
use crate::runtime::fail::Fail;
use crossbeam_channel::{
    unbounded,
    Receiver,
    Sender,
};
use eui48::MacAddress;
use std::{
    cell::RefCell,
    collections::{
        HashMap,
        HashSet,
        VecDeque,
    },
    rc::{
        Rc,
        Weak,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// Largest inline-send size the software device reports.
const MAX_INLINE_CAP: u32 = 512;

/// Largest inline-receive size the software device reports.
const MAX_INLINE_RECV_CAP: u32 = 1024;

//==============================================================================
// Structures
//==============================================================================

struct MrRec {
    pd: u32,
    addr: u64,
    len: usize,
    lkey: u32,
}

struct ChanRec {
    tx: Sender<u32>,
    rx: Receiver<u32>,
}

struct CqRec {
    cqe: u32,
    channel: Option<u32>,
    queue: VecDeque<Wc>,
    armed: bool,
    unacked: u32,
}

enum PendingSend {
    Sges(Vec<Sge>, bool),
    Inline(Vec<u8>, bool),
}

struct QpRec {
    state: QpState,
    cap: QpCap,
    send_cq: Option<u32>,
    recv_cq: Option<u32>,
    port: Option<u8>,
    qpg: QpGroup,
    recv_q: VecDeque<RecvWr>,
    pending: Vec<PendingSend>,
}

struct FlowRec {
    qp: u32,
    spec: Vec<u8>,
}

struct DevState {
    next_id: u32,
    pds: HashSet<u32>,
    rds: HashSet<u32>,
    mrs: HashMap<u32, MrRec>,
    channels: HashMap<u32, ChanRec>,
    cqs: HashMap<u32, CqRec>,
    qps: HashMap<u32, QpRec>,
    flows: HashMap<u32, FlowRec>,
    events: VecDeque<AsyncEvent>,
    wire: Vec<Vec<u8>>,
    ports: HashMap<u8, PortAttr>,
}

/// In-memory Verbs device.
pub struct LoopbackVerbs {
    attr: DeviceAttr,
    state: RefCell<DevState>,
    weak_self: RefCell<Weak<LoopbackVerbs>>,
}

struct LoopQpBurst {
    dev: Rc<LoopbackVerbs>,
    qp: u32,
}

struct LoopCqIntf {
    dev: Rc<LoopbackVerbs>,
    cq: u32,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl LoopbackVerbs {
    /// Creates a device with `phys_ports` Ethernet ports, all active.
    pub fn new(phys_ports: u8) -> Rc<Self> {
        let mut ports: HashMap<u8, PortAttr> = HashMap::new();
        for p in 1..=phys_ports {
            ports.insert(p, PortAttr {
                state: PortPhysState::Active,
                link_layer: LinkLayer::Ethernet,
                link_speed: 10_000,
                mac: MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, p]),
            });
        }
        Rc::new_cyclic(|weak| Self {
            attr: DeviceAttr {
                max_qp_wr: 16351,
                max_sge: 32,
                max_cq: 65408,
                max_qp: 65408,
                phys_port_cnt: phys_ports,
                max_inline_recv: MAX_INLINE_RECV_CAP,
                max_rss_tbl_sz: 256,
            },
            state: RefCell::new(DevState {
                next_id: 1,
                pds: HashSet::new(),
                rds: HashSet::new(),
                mrs: HashMap::new(),
                channels: HashMap::new(),
                cqs: HashMap::new(),
                qps: HashMap::new(),
                flows: HashMap::new(),
                events: VecDeque::new(),
                wire: Vec::new(),
                ports,
            }),
            weak_self: RefCell::new(weak.clone()),
        })
    }

    fn rc(&self) -> Rc<LoopbackVerbs> {
        self.weak_self
            .borrow()
            .upgrade()
            .expect("loopback device owner dropped")
    }

    //==========================================================================
    // Test Controls
    //==========================================================================

    /// Delivers one frame into the next posted receive work request of `qp`,
    /// scattering across its SGEs.
    pub fn deliver(&self, qp: QpHandle, frame: &[u8]) -> Result<(), Fail> {
        let mut state = self.state.borrow_mut();
        {
            let qp_rec = state
                .qps
                .get(&qp.0)
                .ok_or_else(|| Fail::new(libc::EINVAL, "no such QP"))?;
            if qp_rec.state < QpState::Rtr {
                return Err(Fail::new(libc::EINVAL, "QP is not ready to receive"));
            }
            let wr: &RecvWr = qp_rec
                .recv_q
                .front()
                .ok_or_else(|| Fail::new(libc::ENOBUFS, "no posted receive WR"))?;
            let room: usize = wr.sges.iter().map(|s| s.length as usize).sum();
            if frame.len() > room {
                return Err(Fail::new(libc::EMSGSIZE, "frame exceeds posted buffers"));
            }
            for sge in &wr.sges {
                Self::check_mr(&state, sge)?;
            }
        }
        let wr: RecvWr = state.qps.get_mut(&qp.0).unwrap().recv_q.pop_front().unwrap();
        let mut remaining: &[u8] = frame;
        for sge in &wr.sges {
            if remaining.is_empty() {
                break;
            }
            let n: usize = remaining.len().min(sge.length as usize);
            // The MR check above pins this range to registered pool memory.
            unsafe {
                std::ptr::copy_nonoverlapping(remaining.as_ptr(), sge.addr as *mut u8, n);
            }
            remaining = &remaining[n..];
        }
        let recv_cq: u32 = state.qps[&qp.0]
            .recv_cq
            .ok_or_else(|| Fail::new(libc::EINVAL, "QP has no receive CQ"))?;
        Self::complete_on(&mut state, recv_cq, Wc {
            wr_id: wr.wr_id,
            status: WcStatus::Success,
            byte_len: frame.len() as u32,
        });
        Ok(())
    }

    /// Consumes one posted receive work request of `qp` and completes it
    /// with an error status.
    pub fn deliver_bad(&self, qp: QpHandle) -> Result<(), Fail> {
        let mut state = self.state.borrow_mut();
        let qp_rec = state
            .qps
            .get_mut(&qp.0)
            .ok_or_else(|| Fail::new(libc::EINVAL, "no such QP"))?;
        let wr: RecvWr = qp_rec
            .recv_q
            .pop_front()
            .ok_or_else(|| Fail::new(libc::ENOBUFS, "no posted receive WR"))?;
        let recv_cq: u32 = qp_rec
            .recv_cq
            .ok_or_else(|| Fail::new(libc::EINVAL, "QP has no receive CQ"))?;
        Self::complete_on(&mut state, recv_cq, Wc {
            wr_id: wr.wr_id,
            status: WcStatus::GeneralErr,
            byte_len: 0,
        });
        Ok(())
    }

    /// Frames transmitted so far, oldest first.
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.state.borrow().wire.clone()
    }

    pub fn take_transmitted(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.borrow_mut().wire)
    }

    /// Number of currently registered memory regions.
    pub fn mr_count(&self) -> usize {
        self.state.borrow().mrs.len()
    }

    /// Number of installed flows.
    pub fn flow_count(&self) -> usize {
        self.state.borrow().flows.len()
    }

    /// Packed spec bytes of an installed flow.
    pub fn flow_spec_bytes(&self, flow: FlowHandle) -> Option<Vec<u8>> {
        self.state.borrow().flows.get(&flow.0).map(|f| f.spec.clone())
    }

    /// Queue pair the flow is attached to.
    pub fn flow_qp(&self, flow: FlowHandle) -> Option<QpHandle> {
        self.state.borrow().flows.get(&flow.0).map(|f| QpHandle(f.qp))
    }

    pub fn qp_state(&self, qp: QpHandle) -> Option<QpState> {
        self.state.borrow().qps.get(&qp.0).map(|q| q.state)
    }

    /// Number of receive work requests currently posted on `qp`.
    pub fn posted_recv(&self, qp: QpHandle) -> usize {
        self.state.borrow().qps.get(&qp.0).map(|q| q.recv_q.len()).unwrap_or(0)
    }

    /// Queues an asynchronous device event.
    pub fn push_event(&self, event: AsyncEvent) {
        self.state.borrow_mut().events.push_back(event);
    }

    /// Overrides the physical state and speed of a port.
    pub fn set_port_state(&self, port_num: u8, state: PortPhysState, speed: u32) {
        if let Some(attr) = self.state.borrow_mut().ports.get_mut(&port_num) {
            attr.state = state;
            attr.link_speed = speed;
        }
    }

    //==========================================================================
    // Internals
    //==========================================================================

    fn alloc_id(state: &mut DevState) -> u32 {
        let id: u32 = state.next_id;
        state.next_id += 1;
        id
    }

    /// Checks that an SGE points into a registered region of a live PD with
    /// the right key.
    fn check_mr(state: &DevState, sge: &Sge) -> Result<(), Fail> {
        let end: u64 = sge.addr + sge.length as u64;
        for mr in state.mrs.values() {
            if mr.lkey == sge.lkey
                && state.pds.contains(&mr.pd)
                && sge.addr >= mr.addr
                && end <= mr.addr + mr.len as u64
            {
                return Ok(());
            }
        }
        Err(Fail::new(libc::EFAULT, "SGE is outside every registered region"))
    }

    fn complete_on(state: &mut DevState, cq: u32, wc: Wc) {
        let DevState { cqs, channels, .. } = state;
        let cq_rec: &mut CqRec = cqs.get_mut(&cq).expect("completion on destroyed CQ");
        if cq_rec.queue.len() >= cq_rec.cqe as usize {
            // CQ overrun: the entry is lost, as it would be on hardware.
            warn!("CQ {} overrun, dropping completion", cq);
            return;
        }
        cq_rec.queue.push_back(wc);
        if cq_rec.armed {
            cq_rec.armed = false;
            cq_rec.unacked += 1;
            if let Some(ch) = cq_rec.channel {
                if let Some(chan) = channels.get(&ch) {
                    let _ = chan.tx.send(cq);
                }
            }
        }
    }

    fn flush_sends(&self, qp: u32) -> Result<(), Fail> {
        let mut state = self.state.borrow_mut();
        let pending: Vec<PendingSend> = {
            let qp_rec = state
                .qps
                .get_mut(&qp)
                .ok_or_else(|| Fail::new(libc::EINVAL, "no such QP"))?;
            if qp_rec.state != QpState::Rts {
                return Err(Fail::new(libc::EINVAL, "QP is not ready to send"));
            }
            std::mem::take(&mut qp_rec.pending)
        };
        let send_cq: u32 = state.qps[&qp]
            .send_cq
            .ok_or_else(|| Fail::new(libc::EINVAL, "QP has no send CQ"))?;
        for wr in pending {
            let (frame, signaled): (Vec<u8>, bool) = match wr {
                PendingSend::Inline(bytes, signaled) => (bytes, signaled),
                PendingSend::Sges(sges, signaled) => {
                    let mut frame: Vec<u8> = Vec::new();
                    for sge in &sges {
                        Self::check_mr(&state, sge)?;
                        // Registered above; the read stays inside the region.
                        unsafe {
                            frame.extend_from_slice(std::slice::from_raw_parts(
                                sge.addr as *const u8,
                                sge.length as usize,
                            ));
                        }
                    }
                    (frame, signaled)
                },
            };
            let byte_len: u32 = frame.len() as u32;
            state.wire.push(frame);
            if signaled {
                Self::complete_on(&mut state, send_cq, Wc {
                    wr_id: 0,
                    status: WcStatus::Success,
                    byte_len,
                });
            }
        }
        Ok(())
    }

    fn push_send(&self, qp: u32, wr: PendingSend) -> Result<(), Fail> {
        let mut state = self.state.borrow_mut();
        let qp_rec = state
            .qps
            .get_mut(&qp)
            .ok_or_else(|| Fail::new(libc::EINVAL, "no such QP"))?;
        if qp_rec.state != QpState::Rts {
            return Err(Fail::new(libc::EINVAL, "QP is not ready to send"));
        }
        if qp_rec.pending.len() >= qp_rec.cap.max_send_wr as usize {
            return Err(Fail::new(libc::ENOMEM, "send queue is full"));
        }
        if let PendingSend::Inline(ref bytes, _) = wr {
            if bytes.len() > qp_rec.cap.max_inline_data as usize {
                return Err(Fail::new(libc::EINVAL, "inline data exceeds QP limit"));
            }
        }
        qp_rec.pending.push(wr);
        Ok(())
    }

    fn push_recvs(&self, qp: u32, wrs: &[RecvWr]) -> Result<(), Fail> {
        let mut state = self.state.borrow_mut();
        let qp_rec = state
            .qps
            .get_mut(&qp)
            .ok_or_else(|| Fail::new(libc::EINVAL, "no such QP"))?;
        if qp_rec.state < QpState::Init {
            return Err(Fail::new(libc::EINVAL, "QP was not initialized"));
        }
        // Hardware rounds receive queues up generously; only the device-wide
        // limit is enforced here.
        if qp_rec.recv_q.len() + wrs.len() > self.attr.max_qp_wr as usize {
            return Err(Fail::new(libc::ENOMEM, "receive queue is full"));
        }
        for wr in wrs {
            if wr.sges.len() > qp_rec.cap.max_recv_sge as usize {
                return Err(Fail::new(libc::EINVAL, "too many SGEs in receive WR"));
            }
            qp_rec.recv_q.push_back(wr.clone());
        }
        Ok(())
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Verbs for LoopbackVerbs {
    fn query_device(&self) -> DeviceAttr {
        self.attr
    }

    fn query_port(&self, port_num: u8) -> Result<PortAttr, Fail> {
        self.state
            .borrow()
            .ports
            .get(&port_num)
            .copied()
            .ok_or_else(|| Fail::new(libc::ENODEV, "no such physical port"))
    }

    fn alloc_pd(&self) -> Result<PdHandle, Fail> {
        let mut state = self.state.borrow_mut();
        let id: u32 = Self::alloc_id(&mut state);
        state.pds.insert(id);
        Ok(PdHandle(id))
    }

    fn dealloc_pd(&self, pd: PdHandle) -> Result<(), Fail> {
        if !self.state.borrow_mut().pds.remove(&pd.0) {
            return Err(Fail::new(libc::EINVAL, "no such PD"));
        }
        Ok(())
    }

    fn reg_mr(&self, pd: PdHandle, addr: u64, len: usize, _access: AccessFlags) -> Result<Mr, Fail> {
        let mut state = self.state.borrow_mut();
        if !state.pds.contains(&pd.0) {
            return Err(Fail::new(libc::EINVAL, "no such PD"));
        }
        if len == 0 {
            return Err(Fail::new(libc::EINVAL, "cannot register an empty range"));
        }
        let id: u32 = Self::alloc_id(&mut state);
        let lkey: u32 = 0x1000 + id;
        state.mrs.insert(id, MrRec {
            pd: pd.0,
            addr,
            len,
            lkey,
        });
        Ok(Mr {
            handle: MrHandle(id),
            lkey,
            addr,
            len,
        })
    }

    fn dereg_mr(&self, mr: MrHandle) -> Result<(), Fail> {
        if self.state.borrow_mut().mrs.remove(&mr.0).is_none() {
            return Err(Fail::new(libc::EINVAL, "no such MR"));
        }
        Ok(())
    }

    fn create_res_domain(&self) -> Result<RdHandle, Fail> {
        let mut state = self.state.borrow_mut();
        let id: u32 = Self::alloc_id(&mut state);
        state.rds.insert(id);
        Ok(RdHandle(id))
    }

    fn destroy_res_domain(&self, rd: RdHandle) -> Result<(), Fail> {
        if !self.state.borrow_mut().rds.remove(&rd.0) {
            return Err(Fail::new(libc::EINVAL, "no such resource domain"));
        }
        Ok(())
    }

    fn create_comp_channel(&self) -> Result<ChannelHandle, Fail> {
        let mut state = self.state.borrow_mut();
        let id: u32 = Self::alloc_id(&mut state);
        let (tx, rx) = unbounded();
        state.channels.insert(id, ChanRec { tx, rx });
        Ok(ChannelHandle(id))
    }

    fn destroy_comp_channel(&self, channel: ChannelHandle) -> Result<(), Fail> {
        if self.state.borrow_mut().channels.remove(&channel.0).is_none() {
            return Err(Fail::new(libc::EINVAL, "no such completion channel"));
        }
        Ok(())
    }

    fn create_cq(&self, cqe: u32, channel: Option<ChannelHandle>, rd: Option<RdHandle>) -> Result<CqHandle, Fail> {
        let mut state = self.state.borrow_mut();
        if cqe == 0 {
            return Err(Fail::new(libc::EINVAL, "CQ must have at least one entry"));
        }
        if let Some(ch) = channel {
            if !state.channels.contains_key(&ch.0) {
                return Err(Fail::new(libc::EINVAL, "no such completion channel"));
            }
        }
        if let Some(rd) = rd {
            if !state.rds.contains(&rd.0) {
                return Err(Fail::new(libc::EINVAL, "no such resource domain"));
            }
        }
        let id: u32 = Self::alloc_id(&mut state);
        state.cqs.insert(id, CqRec {
            cqe,
            channel: channel.map(|c| c.0),
            queue: VecDeque::new(),
            armed: false,
            unacked: 0,
        });
        Ok(CqHandle(id))
    }

    fn resize_cq(&self, cq: CqHandle, cqe: u32) -> Result<(), Fail> {
        let mut state = self.state.borrow_mut();
        let cq_rec = state
            .cqs
            .get_mut(&cq.0)
            .ok_or_else(|| Fail::new(libc::EINVAL, "no such CQ"))?;
        if (cqe as usize) < cq_rec.queue.len() {
            return Err(Fail::new(libc::EINVAL, "cannot shrink below queued completions"));
        }
        cq_rec.cqe = cqe;
        Ok(())
    }

    fn destroy_cq(&self, cq: CqHandle) -> Result<(), Fail> {
        let mut state = self.state.borrow_mut();
        match state.cqs.get(&cq.0) {
            None => return Err(Fail::new(libc::EINVAL, "no such CQ")),
            Some(cq_rec) if cq_rec.unacked > 0 => {
                return Err(Fail::new(libc::EBUSY, "CQ has unacknowledged events"));
            },
            Some(_) => (),
        }
        state.cqs.remove(&cq.0);
        Ok(())
    }

    fn poll_cq(&self, cq: CqHandle, max: usize) -> Result<Vec<Wc>, Fail> {
        let mut state = self.state.borrow_mut();
        let cq_rec = state
            .cqs
            .get_mut(&cq.0)
            .ok_or_else(|| Fail::new(libc::EINVAL, "no such CQ"))?;
        let n: usize = max.min(cq_rec.queue.len());
        Ok(cq_rec.queue.drain(..n).collect())
    }

    fn req_notify_cq(&self, cq: CqHandle) -> Result<(), Fail> {
        let mut state = self.state.borrow_mut();
        let cq_rec = state
            .cqs
            .get_mut(&cq.0)
            .ok_or_else(|| Fail::new(libc::EINVAL, "no such CQ"))?;
        cq_rec.armed = true;
        Ok(())
    }

    fn get_cq_event(&self, channel: ChannelHandle) -> Result<Option<CqHandle>, Fail> {
        let state = self.state.borrow();
        let chan = state
            .channels
            .get(&channel.0)
            .ok_or_else(|| Fail::new(libc::EINVAL, "no such completion channel"))?;
        Ok(chan.rx.try_recv().ok().map(CqHandle))
    }

    fn ack_cq_events(&self, cq: CqHandle, n: u32) {
        if let Some(cq_rec) = self.state.borrow_mut().cqs.get_mut(&cq.0) {
            cq_rec.unacked = cq_rec.unacked.saturating_sub(n);
        }
    }

    fn create_qp(&self, attr: &QpInitAttr) -> Result<Qp, Fail> {
        let mut state = self.state.borrow_mut();
        if !state.pds.contains(&attr.pd.0) {
            return Err(Fail::new(libc::EINVAL, "no such PD"));
        }
        for cq in [attr.send_cq, attr.recv_cq].into_iter().flatten() {
            if !state.cqs.contains_key(&cq.0) {
                return Err(Fail::new(libc::EINVAL, "no such CQ"));
            }
        }
        if let QpGroup::Child { parent } = attr.qpg {
            match state.qps.get(&parent.0) {
                Some(p) if matches!(p.qpg, QpGroup::Parent { .. }) => (),
                _ => return Err(Fail::new(libc::EINVAL, "QP group parent is invalid")),
            }
        }
        let mut cap: QpCap = attr.cap;
        cap.max_send_sge = cap.max_send_sge.min(self.attr.max_sge);
        cap.max_recv_sge = cap.max_recv_sge.min(self.attr.max_sge);
        cap.max_send_wr = cap.max_send_wr.min(self.attr.max_qp_wr);
        cap.max_recv_wr = cap.max_recv_wr.min(self.attr.max_qp_wr);
        cap.max_inline_data = cap.max_inline_data.min(MAX_INLINE_CAP);
        let id: u32 = Self::alloc_id(&mut state);
        state.qps.insert(id, QpRec {
            state: QpState::Reset,
            cap,
            send_cq: attr.send_cq.map(|c| c.0),
            recv_cq: attr.recv_cq.map(|c| c.0),
            port: attr.port_num,
            qpg: attr.qpg,
            recv_q: VecDeque::new(),
            pending: Vec::new(),
        });
        Ok(Qp {
            handle: QpHandle(id),
            cap,
        })
    }

    fn destroy_qp(&self, qp: QpHandle) -> Result<(), Fail> {
        if self.state.borrow_mut().qps.remove(&qp.0).is_none() {
            return Err(Fail::new(libc::EINVAL, "no such QP"));
        }
        Ok(())
    }

    fn modify_qp(&self, qp: QpHandle, state: QpState, port_num: Option<u8>) -> Result<(), Fail> {
        let mut dev = self.state.borrow_mut();
        let qp_rec = dev
            .qps
            .get_mut(&qp.0)
            .ok_or_else(|| Fail::new(libc::EINVAL, "no such QP"))?;
        match (qp_rec.state, state) {
            (_, QpState::Reset) => {
                qp_rec.recv_q.clear();
                qp_rec.pending.clear();
            },
            (QpState::Reset, QpState::Init) => {
                if port_num.is_none() && qp_rec.port.is_none() {
                    return Err(Fail::new(libc::EINVAL, "INIT requires a port number"));
                }
            },
            (QpState::Init, QpState::Rtr) => (),
            (QpState::Rtr, QpState::Rts) => (),
            (from, to) => {
                warn!("invalid QP transition {:?} -> {:?}", from, to);
                return Err(Fail::new(libc::EINVAL, "invalid QP state transition"));
            },
        }
        if let Some(port) = port_num {
            qp_rec.port = Some(port);
        }
        qp_rec.state = state;
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, wrs: &[SendWr]) -> Result<(), Fail> {
        for wr in wrs {
            self.push_send(qp.0, PendingSend::Sges(wr.sges.clone(), wr.flags.signaled))?;
        }
        // The plain post interface rings the doorbell itself.
        self.flush_sends(qp.0)
    }

    fn post_recv(&self, qp: QpHandle, wrs: &[RecvWr]) -> Result<(), Fail> {
        self.push_recvs(qp.0, wrs)
    }

    fn create_flow(&self, qp: QpHandle, spec: &[u8]) -> Result<FlowHandle, Fail> {
        // The device rejects malformed packed buffers outright.
        flow_spec::validate_packed(spec)?;
        let mut state = self.state.borrow_mut();
        if !state.qps.contains_key(&qp.0) {
            return Err(Fail::new(libc::EINVAL, "no such QP"));
        }
        let id: u32 = Self::alloc_id(&mut state);
        state.flows.insert(id, FlowRec {
            qp: qp.0,
            spec: spec.to_vec(),
        });
        Ok(FlowHandle(id))
    }

    fn destroy_flow(&self, flow: FlowHandle) -> Result<(), Fail> {
        if self.state.borrow_mut().flows.remove(&flow.0).is_none() {
            return Err(Fail::new(libc::EINVAL, "no such flow"));
        }
        Ok(())
    }

    fn get_async_event(&self) -> Option<AsyncEvent> {
        self.state.borrow_mut().events.pop_front()
    }

    fn ack_async_event(&self, _event: &AsyncEvent) {}

    fn query_qp_burst(&self, qp: QpHandle) -> Result<Rc<dyn QpBurst>, Fail> {
        let state = self.state.borrow();
        let qp_rec = state
            .qps
            .get(&qp.0)
            .ok_or_else(|| Fail::new(libc::EINVAL, "no such QP"))?;
        if qp_rec.state < QpState::Rtr {
            return Err(Fail::new(libc::EINVAL, "QP burst interface requires RTR"));
        }
        Ok(Rc::new(LoopQpBurst {
            dev: self.rc(),
            qp: qp.0,
        }))
    }

    fn query_cq_intf(&self, cq: CqHandle) -> Result<Rc<dyn CqIntf>, Fail> {
        if !self.state.borrow().cqs.contains_key(&cq.0) {
            return Err(Fail::new(libc::EINVAL, "no such CQ"));
        }
        Ok(Rc::new(LoopCqIntf {
            dev: self.rc(),
            cq: cq.0,
        }))
    }
}

impl QpBurst for LoopQpBurst {
    fn send_pending(&self, addr: u64, length: u32, lkey: u32, flags: SendFlags) -> Result<(), Fail> {
        self.dev.push_send(
            self.qp,
            PendingSend::Sges(
                vec![Sge {
                    addr,
                    length,
                    lkey,
                }],
                flags.signaled,
            ),
        )
    }

    fn send_pending_inline(&self, data: &[u8], flags: SendFlags) -> Result<(), Fail> {
        self.dev
            .push_send(self.qp, PendingSend::Inline(data.to_vec(), flags.signaled))
    }

    fn send_pending_sg_list(&self, sges: &[Sge], flags: SendFlags) -> Result<(), Fail> {
        self.dev
            .push_send(self.qp, PendingSend::Sges(sges.to_vec(), flags.signaled))
    }

    fn send_flush(&self) -> Result<(), Fail> {
        self.dev.flush_sends(self.qp)
    }

    fn recv_burst(&self, sges: &[Sge]) -> Result<(), Fail> {
        let wrs: Vec<RecvWr> = sges
            .iter()
            .map(|sge| RecvWr {
                wr_id: 0,
                sges: vec![*sge],
            })
            .collect();
        self.dev.push_recvs(self.qp, &wrs)
    }
}

impl CqIntf for LoopCqIntf {
    fn poll_cnt(&self, max: usize) -> Result<usize, Fail> {
        let mut state = self.dev.state.borrow_mut();
        let cq_rec = state
            .cqs
            .get_mut(&self.cq)
            .ok_or_else(|| Fail::new(libc::EINVAL, "no such CQ"))?;
        let n: usize = max.min(cq_rec.queue.len());
        cq_rec.queue.drain(..n);
        Ok(n)
    }

    fn poll_length_flags(&self) -> PollLength {
        let mut state = self.dev.state.borrow_mut();
        let cq_rec = match state.cqs.get_mut(&self.cq) {
            Some(cq_rec) => cq_rec,
            None => return PollLength::Error,
        };
        let consume: bool = match cq_rec.queue.front() {
            None => return PollLength::Empty,
            Some(wc) => wc.status == WcStatus::Success,
        };
        if consume {
            let wc: Wc = cq_rec.queue.pop_front().unwrap();
            PollLength::Packet {
                len: wc.byte_len,
                flags: 0,
            }
        } else {
            PollLength::Error
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory::Mempool;

    fn dev_pd(dev: &Rc<LoopbackVerbs>) -> PdHandle {
        dev.alloc_pd().unwrap()
    }

    fn raw_packet_qp(dev: &Rc<LoopbackVerbs>, pd: PdHandle, cq: CqHandle) -> Qp {
        dev.create_qp(&QpInitAttr {
            send_cq: Some(cq),
            recv_cq: Some(cq),
            cap: QpCap {
                max_send_wr: 16,
                max_recv_wr: 16,
                max_send_sge: 4,
                max_recv_sge: 4,
                max_inline_data: 64,
            },
            qp_type: crate::verbs::QpType::RawPacket,
            pd,
            res_domain: None,
            inl_recv: 0,
            qpg: QpGroup::None,
            port_num: None,
        })
        .unwrap()
    }

    #[test]
    fn qp_state_machine_enforced() {
        let dev = LoopbackVerbs::new(1);
        let pd: PdHandle = dev_pd(&dev);
        let cq: CqHandle = dev.create_cq(16, None, None).unwrap();
        let qp: Qp = raw_packet_qp(&dev, pd, cq);
        // RTR before INIT is invalid.
        assert!(dev.modify_qp(qp.handle, QpState::Rtr, None).is_err());
        assert!(dev.modify_qp(qp.handle, QpState::Init, Some(1)).is_ok());
        assert!(dev.modify_qp(qp.handle, QpState::Rtr, None).is_ok());
        assert!(dev.modify_qp(qp.handle, QpState::Rts, None).is_ok());
        assert!(dev.modify_qp(qp.handle, QpState::Reset, None).is_ok());
    }

    #[test]
    fn unsignaled_sends_produce_no_completion() {
        let dev = LoopbackVerbs::new(1);
        let pd: PdHandle = dev_pd(&dev);
        let cq: CqHandle = dev.create_cq(16, None, None).unwrap();
        let qp: Qp = raw_packet_qp(&dev, pd, cq);
        dev.modify_qp(qp.handle, QpState::Init, Some(1)).unwrap();
        dev.modify_qp(qp.handle, QpState::Rtr, None).unwrap();
        dev.modify_qp(qp.handle, QpState::Rts, None).unwrap();
        let burst = dev.query_qp_burst(qp.handle).unwrap();
        burst
            .send_pending_inline(b"one", SendFlags { signaled: false })
            .unwrap();
        burst
            .send_pending_inline(b"two", SendFlags { signaled: true })
            .unwrap();
        burst.send_flush().unwrap();
        assert_eq!(dev.transmitted().len(), 2);
        assert_eq!(dev.poll_cq(cq, 16).unwrap().len(), 1);
    }

    #[test]
    fn deliver_scatters_across_sges() {
        let dev = LoopbackVerbs::new(1);
        let pd: PdHandle = dev_pd(&dev);
        let cq: CqHandle = dev.create_cq(16, None, None).unwrap();
        let qp: Qp = raw_packet_qp(&dev, pd, cq);
        dev.modify_qp(qp.handle, QpState::Init, Some(1)).unwrap();

        let mp: Mempool = Mempool::new("lo", 2, 512).unwrap();
        let chunk = mp.mem_iter()[0];
        let mr: Mr = dev
            .reg_mr(pd, chunk.addr as u64, chunk.len, crate::verbs::ACCESS_LOCAL_WRITE)
            .unwrap();
        let a = mp.alloc().unwrap();
        let b = mp.alloc().unwrap();
        let wr: RecvWr = RecvWr {
            wr_id: 7,
            sges: vec![
                Sge {
                    addr: a.buf_addr() as u64,
                    length: 4,
                    lkey: mr.lkey,
                },
                Sge {
                    addr: b.buf_addr() as u64,
                    length: 16,
                    lkey: mr.lkey,
                },
            ],
        };
        dev.post_recv(qp.handle, &[wr]).unwrap();
        dev.modify_qp(qp.handle, QpState::Rtr, None).unwrap();
        dev.deliver(qp.handle, b"0123456789").unwrap();
        let wcs: Vec<Wc> = dev.poll_cq(cq, 1).unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].wr_id, 7);
        assert_eq!(wcs[0].byte_len, 10);
        unsafe {
            assert_eq!(std::slice::from_raw_parts(a.buf_addr(), 4), b"0123");
            assert_eq!(std::slice::from_raw_parts(b.buf_addr(), 6), b"456789");
        }
    }

    #[test]
    fn unregistered_sge_is_rejected() {
        let dev = LoopbackVerbs::new(1);
        let pd: PdHandle = dev_pd(&dev);
        let cq: CqHandle = dev.create_cq(16, None, None).unwrap();
        let qp: Qp = raw_packet_qp(&dev, pd, cq);
        dev.modify_qp(qp.handle, QpState::Init, Some(1)).unwrap();
        dev.modify_qp(qp.handle, QpState::Rtr, None).unwrap();
        dev.modify_qp(qp.handle, QpState::Rts, None).unwrap();
        let burst = dev.query_qp_burst(qp.handle).unwrap();
        let bogus: [u8; 64] = [0u8; 64];
        burst
            .send_pending(bogus.as_ptr() as u64, 64, 0xbad, SendFlags { signaled: true })
            .unwrap();
        assert!(burst.send_flush().is_err());
    }

    #[test]
    fn comp_channel_fires_once_per_arm() {
        let dev = LoopbackVerbs::new(1);
        let pd: PdHandle = dev_pd(&dev);
        let ch: ChannelHandle = dev.create_comp_channel().unwrap();
        let cq: CqHandle = dev.create_cq(16, Some(ch), None).unwrap();
        let qp: Qp = raw_packet_qp(&dev, pd, cq);
        dev.modify_qp(qp.handle, QpState::Init, Some(1)).unwrap();

        let mp: Mempool = Mempool::new("ev", 1, 512).unwrap();
        let chunk = mp.mem_iter()[0];
        let mr: Mr = dev
            .reg_mr(pd, chunk.addr as u64, chunk.len, crate::verbs::ACCESS_LOCAL_WRITE)
            .unwrap();
        let buf = mp.alloc().unwrap();
        let sge: Sge = Sge {
            addr: buf.buf_addr() as u64,
            length: 512,
            lkey: mr.lkey,
        };
        dev.post_recv(qp.handle, &[
            RecvWr {
                wr_id: 0,
                sges: vec![sge],
            },
            RecvWr {
                wr_id: 1,
                sges: vec![sge],
            },
        ])
        .unwrap();
        dev.modify_qp(qp.handle, QpState::Rtr, None).unwrap();
        dev.req_notify_cq(cq).unwrap();
        dev.deliver(qp.handle, b"x").unwrap();
        dev.deliver(qp.handle, b"y").unwrap();
        assert_eq!(dev.get_cq_event(ch).unwrap(), Some(cq));
        // Not rearmed: the second completion did not signal.
        assert_eq!(dev.get_cq_event(ch).unwrap(), None);
        dev.ack_cq_events(cq, 1);
    }
}
