// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Ethernet device layer: port state, device operations, queue lifecycle
//! glue, and the burst dispatch vector.

mod config;
mod flow;
mod intr;
mod rxq;
mod txq;

//==============================================================================
// Imports
//==============================================================================

use crate::{
    runtime::{
        fail::Fail,
        memory::{
            align_ceil,
            align_floor,
            Mbuf,
            MemChunk,
            Mempool,
            PGSIZE_4KB,
        },
    },
    verbs::{
        DeviceAttr,
        LinkLayer,
        Mr,
        PdHandle,
        PortPhysState,
        QpHandle,
        Verbs,
        ACCESS_LOCAL_WRITE,
    },
};
use arrayvec::ArrayVec;
use bit_iter::BitIter;
use eui48::MacAddress;
use slab::Slab;
use std::{
    cell::{
        Cell,
        RefCell,
    },
    rc::Rc,
    sync::atomic::{
        AtomicU8,
        Ordering,
    },
    time::Instant,
};

//==============================================================================
// Exports
//==============================================================================

pub use self::{
    config::{
        DriverConf,
        IntrConf,
        RxMode,
        TxConf,
    },
    flow::{
        EthPattern,
        FlowAction,
        FlowAttrDesc,
        FlowRuleHandle,
        Ipv4Pattern,
        ItemDesc,
        L4Pattern,
        PatternItem,
        VlanPattern,
    },
    intr::{
        PortEvent,
        ALARM_TIMEOUT,
    },
};
pub(crate) use self::{
    rxq::Rxq,
    txq::Txq,
};

//==============================================================================
// Constants
//==============================================================================

/// Driver name.
pub const DRIVER_NAME: &str = "net_cx3";

/// Request a send completion once every so many sends, might be less.
pub const TX_PER_COMP_REQ: usize = 64;

/// Maximum number of scatter/gather elements per work request.
pub const SGE_WR_N: usize = 4;

/// Maximum number of cached memory pools per Tx queue.
pub const TX_MP_CACHE: usize = 8;

/// Size of one linearization buffer. Large enough for a jumbo frame with 8
/// segments of about 2048 bytes each.
pub const LINEAR_BUF_SIZE: usize = 16384;

/// Largest burst the Rx path returns in one call.
pub const MAX_BURST: usize = 64;

/// Number of per-queue entries in the aggregate statistics.
pub const QUEUE_STAT_CNTRS: usize = 16;

/// Ethernet framing constants.
pub const ETHER_HDR_LEN: u32 = 14;
pub const ETHER_MAX_LEN: u32 = 1518;
pub const ETHER_MAX_VLAN_FRAME_LEN: u32 = 1522;

/// Largest number of Rx queues with interrupt vector entries.
pub const MAX_RX_INTR_VEC: usize = 32;

/// Device-argument key selecting physical ports.
pub const PORT_KVARG: &str = "port";

/// Environment variable requesting an inline-receive size.
pub const INLINE_RECV_SIZE_ENV: &str = "CX3_INLINE_RECV_SIZE";

//==============================================================================
// Statistics
//==============================================================================

/// Rx queue counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct RxqStats {
    /// Mapping index.
    pub idx: u16,
    /// Total of successfully received packets.
    pub ipackets: u64,
    /// Total of successfully received bytes.
    pub ibytes: u64,
    /// Total of packets dropped on bad completion status.
    pub idropped: u64,
    /// Total of Rx mbuf allocation failures.
    pub rx_nombuf: u64,
}

/// Tx queue counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct TxqStats {
    /// Mapping index.
    pub idx: u16,
    /// Total of successfully sent packets.
    pub opackets: u64,
    /// Total of successfully sent bytes.
    pub obytes: u64,
    /// Total of packets dropped on per-packet faults.
    pub odropped: u64,
}

/// Aggregate port statistics.
#[derive(Clone, Debug, Default)]
pub struct PortStats {
    pub ipackets: u64,
    pub ibytes: u64,
    pub ierrors: u64,
    pub rx_nombuf: u64,
    pub opackets: u64,
    pub obytes: u64,
    pub oerrors: u64,
    pub rx_mbuf_alloc_failed: u64,
    pub q_ipackets: [u64; QUEUE_STAT_CNTRS],
    pub q_ibytes: [u64; QUEUE_STAT_CNTRS],
    pub q_opackets: [u64; QUEUE_STAT_CNTRS],
    pub q_obytes: [u64; QUEUE_STAT_CNTRS],
    pub q_errors: [u64; QUEUE_STAT_CNTRS],
}

/// Link state as last observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EthLink {
    /// Link speed in Mb/s; 0 when unknown.
    pub link_speed: u32,
    pub link_status: bool,
}

/// Device information reported to the host framework.
#[derive(Clone, Copy, Debug)]
pub struct DevInfo {
    pub min_rx_bufsize: u32,
    pub max_rx_pktlen: u32,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub max_mac_addrs: u16,
    pub speed_capa: u32,
}

/// Generic filter-control surface; only the generic flow API is supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterType {
    Generic,
    Ethertype,
    Ntuple,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
    Get,
    Add,
    Delete,
}

//==============================================================================
// Dispatch
//==============================================================================

/// Rx burst callback selector. `Removed` temporarily disables the data path
/// during unsafe control operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RxDispatch {
    SingleSeg = 0,
    Scattered = 1,
    Removed = 2,
}

impl RxDispatch {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RxDispatch::SingleSeg,
            1 => RxDispatch::Scattered,
            _ => RxDispatch::Removed,
        }
    }
}

/// Tx burst callback selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TxDispatch {
    Real = 0,
    Removed = 1,
}

impl TxDispatch {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TxDispatch::Real,
            _ => TxDispatch::Removed,
        }
    }
}

//==============================================================================
// Work-Request ID Encoding
//==============================================================================

/// Packs a slot index and a headroom offset into one 64-bit WR id. The
/// original buffer address is `sge.addr - offset`.
#[inline]
pub(crate) fn wr_id_encode(index: u32, offset: u16) -> u64 {
    ((offset as u64) << 32) | index as u64
}

#[inline]
pub(crate) fn wr_id_index(wr_id: u64) -> u32 {
    wr_id as u32
}

#[inline]
pub(crate) fn wr_id_offset(wr_id: u64) -> u16 {
    (wr_id >> 32) as u16
}

//==============================================================================
// Memory Region Registration
//==============================================================================

/// Registers a whole mempool as one memory region. The pool must be
/// virtually contiguous; the range is rounded outward to huge-page
/// boundaries when it falls within a huge-page backed area.
pub(crate) fn mp2mr(ctx: &Rc<dyn Verbs>, pd: PdHandle, mp: &Mempool) -> Result<Mr, Fail> {
    let chunks: Vec<MemChunk> = mp.mem_iter();
    let mut start: usize = 0;
    let mut end: usize = 0;
    for chunk in &chunks {
        if start == 0 && end == 0 {
            start = chunk.addr;
            end = chunk.addr + chunk.len;
            continue;
        }
        if end == chunk.addr {
            end += chunk.len;
            continue;
        }
        if start == chunk.addr + chunk.len {
            start -= chunk.len;
            continue;
        }
        error!("mempool \"{}\": not virtually contiguous", mp.name());
        return Err(Fail::new(libc::EINVAL, "mempool is not virtually contiguous"));
    }
    debug!(
        "mempool \"{}\" area start={:#x} end={:#x} size={}",
        mp.name(),
        start,
        end,
        end - start
    );
    // Round start and end to page boundaries when backed by huge pages.
    // Spanning differently-sized huge-page areas is not supported.
    let mut huge_sizes: Vec<usize> = chunks
        .iter()
        .map(|c| c.pgsize)
        .filter(|&p| p > PGSIZE_4KB)
        .collect();
    huge_sizes.sort_unstable();
    huge_sizes.dedup();
    if huge_sizes.len() > 1 {
        error!("mempool \"{}\": mixed huge-page sizes", mp.name());
        return Err(Fail::new(libc::EINVAL, "mempool spans differently-sized huge pages"));
    }
    for chunk in chunks.iter().filter(|c| c.pgsize > PGSIZE_4KB) {
        if start > chunk.addr && start < chunk.addr + chunk.len {
            start = align_floor(start, chunk.pgsize);
        }
        if end > chunk.addr && end < chunk.addr + chunk.len {
            end = align_ceil(end, chunk.pgsize);
        }
    }
    debug!(
        "mempool \"{}\" using start={:#x} end={:#x} size={} for MR",
        mp.name(),
        start,
        end,
        end - start
    );
    ctx.reg_mr(pd, start as u64, end - start, ACCESS_LOCAL_WRITE)
}

/// Reads physical link information from the transport and stores it,
/// reporting whether it changed.
pub(crate) fn priv_link_update(port: &Port, state: &mut PortState) -> Result<bool, Fail> {
    let attr = port.ctx.query_port(port.port_num)?;
    let link: EthLink = EthLink {
        link_speed: attr.link_speed,
        link_status: attr.state == PortPhysState::Active,
    };
    if link != state.link {
        // Link status changed.
        state.link = link;
        return Ok(true);
    }
    Ok(false)
}

//==============================================================================
// Port
//==============================================================================

/// Mutable per-port state, guarded by the control lock.
pub(crate) struct PortState {
    pub(crate) mac: MacAddress,
    pub(crate) mtu: u16,
    pub(crate) started: bool,
    pub(crate) isolated: bool,
    pub(crate) closed: bool,
    pub(crate) rx_mode: RxMode,
    /// Interrupt configuration requested at configure time.
    pub(crate) conf_intr: IntrConf,
    /// Interrupt handlers actually installed.
    pub(crate) active_intr: IntrConf,
    pub(crate) rxqs: Vec<Option<Rc<RefCell<Rxq>>>>,
    pub(crate) txqs: Vec<Option<Rc<RefCell<Txq>>>>,
    pub(crate) flows: Slab<flow::FlowRule>,
    pub(crate) parents: Slab<flow::RssParent>,
    pub(crate) drop_q: Option<flow::DropQueue>,
    pub(crate) mac_flow: Option<crate::verbs::FlowHandle>,
    pub(crate) pending_alarm: Option<Instant>,
    pub(crate) link: EthLink,
    pub(crate) intr_vec: Option<Vec<Option<usize>>>,
}

/// One Ethernet port of the adapter.
pub struct Port {
    pub(crate) ctx: Rc<dyn Verbs>,
    pub(crate) pd: PdHandle,
    /// Physical port number, one-based.
    pub(crate) port_num: u8,
    /// Port ID for delivered packets.
    pub(crate) port_id: u16,
    pub(crate) vf: bool,
    pub(crate) device_attr: DeviceAttr,
    /// Effective inline-receive size.
    pub(crate) inl_recv_size: u32,
    /// Control lock serializing port-wide mutations.
    ctrl: spin::Mutex<()>,
    state: RefCell<PortState>,
    rx_dispatch: AtomicU8,
    tx_dispatch: AtomicU8,
    /// Port-level replacement-allocation failure counter.
    pub(crate) alloc_failed: Rc<Cell<u64>>,
}

//==============================================================================
// Probe
//==============================================================================

/// Creates one [`Port`] per enabled physical port of the device behind
/// `ctx`. The `port=` kvargs select ports; none selects all.
pub fn probe(ctx: Rc<dyn Verbs>, devargs: Option<&str>) -> Result<Vec<Port>, Fail> {
    crate::runtime::logging::initialize();
    let device_attr: DeviceAttr = ctx.query_device();
    info!("{} port(s) detected", device_attr.phys_port_cnt);
    let conf: DriverConf = DriverConf::parse(devargs, device_attr.phys_port_cnt)?;
    let mut ports: Vec<Port> = Vec::new();
    for (port_id, i) in BitIter::from(conf.ports_enabled).enumerate() {
        let port_num: u8 = i as u8 + 1;
        debug!("using port {}", port_num);
        let port_attr = ctx.query_port(port_num)?;
        if port_attr.link_layer != LinkLayer::Ethernet {
            error!("port {} is not configured in Ethernet mode", port_num);
            return Err(Fail::new(libc::EINVAL, "port is not in Ethernet mode"));
        }
        if port_attr.state != PortPhysState::Active {
            debug!("port {} is not active: \"{}\"", port_num, port_attr.state.as_str());
        }
        let pd: PdHandle = ctx.alloc_pd().map_err(|e| {
            error!("PD allocation failure");
            e
        })?;
        let mut inl_recv_size: u32 = conf.inline_recv_size;
        if inl_recv_size > device_attr.max_inline_recv {
            info!(
                "max inline-receive ({}) < requested inline-receive ({})",
                device_attr.max_inline_recv, inl_recv_size
            );
            inl_recv_size = device_attr.max_inline_recv;
        }
        if inl_recv_size != 0 {
            info!("set inline receive size to {}", inl_recv_size);
        }
        info!("port {} MAC address is {}", port_num, port_attr.mac);
        ports.push(Port {
            ctx: ctx.clone(),
            pd,
            port_num,
            port_id: port_id as u16,
            vf: false,
            device_attr,
            inl_recv_size,
            ctrl: spin::Mutex::new(()),
            state: RefCell::new(PortState {
                mac: port_attr.mac,
                mtu: 1500,
                started: false,
                isolated: false,
                closed: false,
                rx_mode: RxMode::default(),
                conf_intr: IntrConf::default(),
                active_intr: IntrConf::default(),
                rxqs: Vec::new(),
                txqs: Vec::new(),
                flows: Slab::new(),
                parents: Slab::new(),
                drop_q: None,
                mac_flow: None,
                pending_alarm: None,
                link: EthLink {
                    link_speed: port_attr.link_speed,
                    link_status: port_attr.state == PortPhysState::Active,
                },
                intr_vec: None,
            }),
            rx_dispatch: AtomicU8::new(RxDispatch::Removed as u8),
            tx_dispatch: AtomicU8::new(TxDispatch::Removed as u8),
            alloc_failed: Rc::new(Cell::new(0)),
        });
    }
    Ok(ports)
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Port {
    /// Prepares the port for the given number of queues.
    pub fn configure(
        &self,
        rxqs_n: u16,
        txqs_n: u16,
        rx_mode: RxMode,
        intr_conf: IntrConf,
    ) -> Result<(), Fail> {
        let _guard = self.ctrl.lock();
        let mut state = self.state.borrow_mut();
        if state.rxqs.len() != rxqs_n as usize {
            info!(
                "port {}: Rx queues number update: {} -> {}",
                self.port_id,
                state.rxqs.len(),
                rxqs_n
            );
            state.rxqs.resize_with(rxqs_n as usize, || None);
        }
        if state.txqs.len() != txqs_n as usize {
            info!(
                "port {}: Tx queues number update: {} -> {}",
                self.port_id,
                state.txqs.len(),
                txqs_n
            );
            state.txqs.resize_with(txqs_n as usize, || None);
        }
        state.rx_mode = rx_mode;
        state.conf_intr = intr_conf;
        Ok(())
    }

    /// Configures one Rx queue.
    pub fn rx_queue_setup(&self, idx: u16, desc: u16, mp: &Mempool) -> Result<(), Fail> {
        let _guard = self.ctrl.lock();
        let mut state = self.state.borrow_mut();
        debug!("port {}: configuring Rx queue {} for {} descriptors", self.port_id, idx, desc);
        if idx as usize >= state.rxqs.len() {
            error!(
                "port {}: queue index out of range ({} >= {})",
                self.port_id,
                idx,
                state.rxqs.len()
            );
            return Err(Fail::new(libc::EOVERFLOW, "queue index out of range"));
        }
        if state.rxqs[idx as usize].is_some() {
            debug!("port {}: reusing already allocated queue index {}", self.port_id, idx);
            if state.started {
                return Err(Fail::new(libc::EEXIST, "port is started"));
            }
            state.rxqs[idx as usize] = None;
            if idx == 0 {
                flow::priv_mac_addr_del(self, &mut state);
            }
        }
        let mode: RxMode = state.rx_mode;
        let rxq: Rxq = rxq::Rxq::setup(self, idx, desc, &mode, state.conf_intr.rxq, state.isolated, mp)?;
        // Update the receive callback.
        let dispatch: RxDispatch = if rxq.sp { RxDispatch::Scattered } else { RxDispatch::SingleSeg };
        debug!("port {}: adding Rx queue {} to list", self.port_id, idx);
        state.rxqs[idx as usize] = Some(Rc::new(RefCell::new(rxq)));
        self.rx_dispatch.store(dispatch as u8, Ordering::Release);
        Ok(())
    }

    /// Configures one Tx queue.
    pub fn tx_queue_setup(&self, idx: u16, desc: u16, conf: &TxConf) -> Result<(), Fail> {
        let _guard = self.ctrl.lock();
        let mut state = self.state.borrow_mut();
        debug!("port {}: configuring Tx queue {} for {} descriptors", self.port_id, idx, desc);
        if idx as usize >= state.txqs.len() {
            error!(
                "port {}: queue index out of range ({} >= {})",
                self.port_id,
                idx,
                state.txqs.len()
            );
            return Err(Fail::new(libc::EOVERFLOW, "queue index out of range"));
        }
        if state.txqs[idx as usize].is_some() {
            debug!("port {}: reusing already allocated queue index {}", self.port_id, idx);
            if state.started {
                return Err(Fail::new(libc::EEXIST, "port is started"));
            }
            state.txqs[idx as usize] = None;
        }
        let txq: Txq = txq::Txq::setup(self, idx, desc, conf)?;
        debug!("port {}: adding Tx queue {} to list", self.port_id, idx);
        state.txqs[idx as usize] = Some(Rc::new(RefCell::new(txq)));
        // Update the send callback.
        self.tx_dispatch.store(TxDispatch::Real as u8, Ordering::Release);
        Ok(())
    }

    /// Releases one Rx queue.
    pub fn rx_queue_release(&self, idx: u16) {
        let _guard = self.ctrl.lock();
        let mut state = self.state.borrow_mut();
        if let Some(slot) = state.rxqs.get_mut(idx as usize) {
            if slot.take().is_some() {
                debug!("port {}: removing Rx queue {} from list", self.port_id, idx);
                if idx == 0 {
                    flow::priv_mac_addr_del(self, &mut state);
                }
            }
        }
    }

    /// Releases one Tx queue.
    pub fn tx_queue_release(&self, idx: u16) {
        let _guard = self.ctrl.lock();
        let mut state = self.state.borrow_mut();
        if let Some(slot) = state.txqs.get_mut(idx as usize) {
            if slot.take().is_some() {
                debug!("port {}: removing Tx queue {} from list", self.port_id, idx);
            }
        }
    }

    /// Starts the device: installs the MAC flow, interrupt handlers, the Rx
    /// interrupt vector, and every configured flow rule. Starting a started
    /// port is a no-op.
    pub fn start(&self) -> Result<(), Fail> {
        let _guard = self.ctrl.lock();
        let mut state = self.state.borrow_mut();
        if state.started {
            return Ok(());
        }
        debug!("port {}: attaching configured flows to all Rx queues", self.port_id);
        state.started = true;
        let result: Result<(), Fail> = flow::priv_mac_addr_add(self, &mut state)
            .and_then(|()| {
                intr::priv_link_interrupt_handler_install(self, &mut state).map_err(|e| {
                    error!("port {}: LSC handler install failed", self.port_id);
                    e
                })
            })
            .and_then(|()| {
                intr::priv_removal_interrupt_handler_install(self, &mut state).map_err(|e| {
                    error!("port {}: RMV handler install failed", self.port_id);
                    e
                })
            })
            .and_then(|()| {
                intr::priv_rx_intr_vec_enable(self, &mut state).map_err(|e| {
                    error!("port {}: Rx interrupt vector creation failed", self.port_id);
                    e
                })
            })
            .and_then(|()| {
                flow::priv_flow_start(self, &mut state).map_err(|e| {
                    error!("port {}: flow start failed: {}", self.port_id, e);
                    e
                })
            });
        if let Err(e) = result {
            // Rollback.
            flow::priv_mac_addr_del(self, &mut state);
            state.started = false;
            return Err(e);
        }
        Ok(())
    }

    /// Stops the device: detaches every flow rule but keeps the rule
    /// descriptors for a later restart. Stopping a stopped port is a no-op.
    pub fn stop(&self) -> Result<(), Fail> {
        let _guard = self.ctrl.lock();
        let mut state = self.state.borrow_mut();
        if !state.started {
            return Ok(());
        }
        debug!("port {}: detaching flows from all Rx queues", self.port_id);
        state.started = false;
        flow::priv_flow_stop(self, &mut state);
        flow::priv_mac_addr_del(self, &mut state);
        Ok(())
    }

    /// Closes the device, destroying all queues and objects.
    pub fn close(&self) {
        let _guard = self.ctrl.lock();
        {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return;
            }
            debug!("port {}: closing device", self.port_id);
            flow::priv_mac_addr_del(self, &mut state);
        }
        // Prevent crashes when queues are still in use: replace the burst
        // callbacks, then give in-flight bursts a moment to drain.
        self.rx_dispatch.store(RxDispatch::Removed as u8, Ordering::Release);
        self.tx_dispatch.store(TxDispatch::Removed as u8, Ordering::Release);
        std::thread::sleep(std::time::Duration::from_millis(1));
        let mut state = self.state.borrow_mut();
        flow::priv_flow_stop(self, &mut state);
        state.flows.clear();
        flow::priv_parents_destroy(self, &mut state);
        state.rxqs.clear();
        state.txqs.clear();
        let _ = self.ctx.dealloc_pd(self.pd);
        intr::priv_removal_interrupt_handler_uninstall(self, &mut state);
        intr::priv_link_interrupt_handler_uninstall(self, &mut state);
        intr::priv_rx_intr_vec_disable(self, &mut state);
        state.closed = true;
    }

    /// Swaps the burst callbacks between the live and removed variants.
    fn priv_set_link(&self, state: &PortState, up: bool) {
        if up {
            let any_sp: bool = state
                .rxqs
                .iter()
                .flatten()
                .any(|rxq| rxq.borrow().sp);
            let dispatch: RxDispatch = if any_sp { RxDispatch::Scattered } else { RxDispatch::SingleSeg };
            self.rx_dispatch.store(dispatch as u8, Ordering::Release);
            self.tx_dispatch.store(TxDispatch::Real as u8, Ordering::Release);
        } else {
            self.rx_dispatch.store(RxDispatch::Removed as u8, Ordering::Release);
            self.tx_dispatch.store(TxDispatch::Removed as u8, Ordering::Release);
        }
    }

    pub fn set_link_up(&self) -> Result<(), Fail> {
        let _guard = self.ctrl.lock();
        let state = self.state.borrow();
        self.priv_set_link(&state, true);
        Ok(())
    }

    pub fn set_link_down(&self) -> Result<(), Fail> {
        let _guard = self.ctrl.lock();
        let state = self.state.borrow();
        self.priv_set_link(&state, false);
        Ok(())
    }

    /// Refreshes physical link information. Returns whether it changed.
    /// The control lock is not taken to allow concurrent calls.
    pub fn link_update(&self) -> Result<bool, Fail> {
        let mut state = self.state.borrow_mut();
        priv_link_update(self, &mut state)
    }

    pub fn link(&self) -> EthLink {
        self.state.borrow().link
    }

    /// Changes the MTU. Scattered-mode support is recomputed per queue and
    /// the Rx rings are reconfigured in place; the Rx callback is swapped
    /// out for the duration.
    pub fn mtu_set(&self, mtu: u16) -> Result<(), Fail> {
        let _guard = self.ctrl.lock();
        let mode: RxMode;
        {
            let mut state = self.state.borrow_mut();
            state.mtu = mtu;
            // Remove the MAC flow while queues are being reworked.
            flow::priv_mac_addr_del(self, &mut state);
            // New maximum frame length according to the MTU.
            let max_frame_len: u32 =
                mtu as u32 + ETHER_HDR_LEN + (ETHER_MAX_VLAN_FRAME_LEN - ETHER_MAX_LEN);
            state.rx_mode.max_rx_pkt_len = max_frame_len;
            mode = state.rx_mode;
        }
        // Temporarily replace the Rx handler and make sure every worker
        // observes the swap before touching the rings.
        self.rx_dispatch.store(RxDispatch::Removed as u8, Ordering::Release);
        std::thread::sleep(std::time::Duration::from_millis(1));
        let mut dispatch: RxDispatch = RxDispatch::SingleSeg;
        let mut result: Result<(), Fail> = Ok(());
        let rxqs: Vec<Rc<RefCell<Rxq>>> = self.state.borrow().rxqs.iter().flatten().cloned().collect();
        for rxq in rxqs {
            let mut rxq = rxq.borrow_mut();
            let ret: Result<(), Fail> = rxq.rehash(&mode);
            if rxq.sp {
                // The scattered burst function takes priority.
                dispatch = RxDispatch::Scattered;
            }
            if let Err(e) = ret {
                result = Err(e);
                break;
            }
        }
        // Burst functions can now be called again.
        self.rx_dispatch.store(dispatch as u8, Ordering::Release);
        // Restore the MAC flow.
        let mut state = self.state.borrow_mut();
        let mac_ret: Result<(), Fail> = flow::priv_mac_addr_add(self, &mut state);
        result.and(mac_ret)
    }

    pub fn mtu(&self) -> u16 {
        self.state.borrow().mtu
    }

    /// Replaces the primary MAC address, recreating the MAC flow.
    pub fn mac_addr_set(&self, mac: MacAddress) -> Result<(), Fail> {
        let _guard = self.ctrl.lock();
        let mut state = self.state.borrow_mut();
        flow::priv_mac_addr_del(self, &mut state);
        state.mac = mac;
        flow::priv_mac_addr_add(self, &mut state)
    }

    pub fn mac(&self) -> MacAddress {
        self.state.borrow().mac
    }

    /// Multicast address lists are not supported.
    pub fn mc_addr_list(&self, _addrs: &[MacAddress]) -> Result<(), Fail> {
        Err(Fail::new(libc::ENOTSUP, "multicast address lists are not supported"))
    }

    /// Filter-control surface: only the generic flow API can be retrieved.
    pub fn filter_ctrl(&self, filter_type: FilterType, filter_op: FilterOp) -> Result<(), Fail> {
        match filter_type {
            FilterType::Generic => {
                if filter_op != FilterOp::Get {
                    return Err(Fail::new(libc::EINVAL, "unsupported filter operation"));
                }
                Ok(())
            },
            _ => {
                error!("port {}: filter type {:?} not supported", self.port_id, filter_type);
                Err(Fail::new(libc::ENOTSUP, "filter type not supported"))
            },
        }
    }

    /// Aggregates the software counters of every queue.
    pub fn stats_get(&self) -> PortStats {
        let _guard = self.ctrl.lock();
        let state = self.state.borrow();
        let mut stats: PortStats = PortStats::default();
        for rxq in state.rxqs.iter().flatten() {
            let rxq = rxq.borrow();
            let idx: usize = rxq.stats.idx as usize;
            if idx < QUEUE_STAT_CNTRS {
                stats.q_ipackets[idx] += rxq.stats.ipackets;
                stats.q_ibytes[idx] += rxq.stats.ibytes;
                stats.q_errors[idx] += rxq.stats.idropped + rxq.stats.rx_nombuf;
            }
            stats.ipackets += rxq.stats.ipackets;
            stats.ibytes += rxq.stats.ibytes;
            stats.ierrors += rxq.stats.idropped;
            stats.rx_nombuf += rxq.stats.rx_nombuf;
        }
        for txq in state.txqs.iter().flatten() {
            let txq = txq.borrow();
            let idx: usize = txq.stats.idx as usize;
            if idx < QUEUE_STAT_CNTRS {
                stats.q_opackets[idx] += txq.stats.opackets;
                stats.q_obytes[idx] += txq.stats.obytes;
                stats.q_errors[idx] += txq.stats.odropped;
            }
            stats.opackets += txq.stats.opackets;
            stats.obytes += txq.stats.obytes;
            stats.oerrors += txq.stats.odropped;
        }
        stats.rx_mbuf_alloc_failed = self.alloc_failed.get();
        stats
    }

    /// Clears the software counters.
    pub fn stats_reset(&self) {
        let _guard = self.ctrl.lock();
        let state = self.state.borrow();
        for rxq in state.rxqs.iter().flatten() {
            let mut rxq = rxq.borrow_mut();
            let idx: u16 = rxq.stats.idx;
            rxq.stats = RxqStats {
                idx,
                ..Default::default()
            };
        }
        for txq in state.txqs.iter().flatten() {
            let mut txq = txq.borrow_mut();
            let idx: u16 = txq.stats.idx;
            txq.stats = TxqStats {
                idx,
                ..Default::default()
            };
        }
        self.alloc_failed.set(0);
    }

    /// Reports device capabilities.
    pub fn dev_infos_get(&self) -> DevInfo {
        let max: u32 = self.device_attr.max_cq.min(self.device_attr.max_qp);
        let max: u16 = if max >= 65535 { 65535 } else { max as u16 };
        DevInfo {
            min_rx_bufsize: 32,
            max_rx_pktlen: 65536,
            max_rx_queues: max,
            max_tx_queues: max,
            // The last entry is reserved for broadcast.
            max_mac_addrs: 1,
            speed_capa: 0x3f,
        }
    }

    //==========================================================================
    // Data Path
    //==========================================================================

    /// Burst-receives up to `pkts_n` packets from queue `queue`.
    pub fn rx_burst(&self, queue: u16, pkts_n: usize) -> ArrayVec<Mbuf, MAX_BURST> {
        match RxDispatch::from_u8(self.rx_dispatch.load(Ordering::Acquire)) {
            RxDispatch::Removed => ArrayVec::new(),
            _ => {
                let rxq: Option<Rc<RefCell<Rxq>>> = {
                    let state = self.state.borrow();
                    state.rxqs.get(queue as usize).cloned().flatten()
                };
                match rxq {
                    Some(rxq) => rxq.borrow_mut().rx_burst(pkts_n),
                    None => ArrayVec::new(),
                }
            },
        }
    }

    /// Burst-sends packets from queue `queue`, removing the posted prefix
    /// from `pkts` and returning its length.
    pub fn tx_burst(&self, queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
        match TxDispatch::from_u8(self.tx_dispatch.load(Ordering::Acquire)) {
            TxDispatch::Removed => 0,
            TxDispatch::Real => {
                let txq: Option<Rc<RefCell<Txq>>> = {
                    let state = self.state.borrow();
                    state.txqs.get(queue as usize).cloned().flatten()
                };
                match txq {
                    Some(txq) => txq.borrow_mut().tx_burst(pkts),
                    None => 0,
                }
            },
        }
    }

    //==========================================================================
    // Introspection
    //==========================================================================

    pub fn port_num(&self) -> u8 {
        self.port_num
    }

    pub fn port_id(&self) -> u16 {
        self.port_id
    }

    pub fn is_started(&self) -> bool {
        self.state.borrow().started
    }

    pub fn rx_dispatch(&self) -> RxDispatch {
        RxDispatch::from_u8(self.rx_dispatch.load(Ordering::Acquire))
    }

    pub fn tx_dispatch(&self) -> TxDispatch {
        TxDispatch::from_u8(self.tx_dispatch.load(Ordering::Acquire))
    }

    pub fn rxq_stats(&self, idx: u16) -> Option<RxqStats> {
        let state = self.state.borrow();
        state
            .rxqs
            .get(idx as usize)?
            .as_ref()
            .map(|rxq| rxq.borrow().stats)
    }

    pub fn txq_stats(&self, idx: u16) -> Option<TxqStats> {
        let state = self.state.borrow();
        state
            .txqs
            .get(idx as usize)?
            .as_ref()
            .map(|txq| txq.borrow().stats)
    }

    /// Verbs QP handle of an Rx queue, when created.
    pub fn rxq_qp(&self, idx: u16) -> Option<QpHandle> {
        let state = self.state.borrow();
        state
            .rxqs
            .get(idx as usize)?
            .as_ref()
            .and_then(|rxq| rxq.borrow().qp)
    }

    /// Verbs QP handle of a Tx queue.
    pub fn txq_qp(&self, idx: u16) -> Option<QpHandle> {
        let state = self.state.borrow();
        state
            .txqs
            .get(idx as usize)?
            .as_ref()
            .map(|txq| txq.borrow().qp)
    }

    /// Whether an Rx queue uses the scattered variant.
    pub fn rxq_is_scattered(&self, idx: u16) -> Option<bool> {
        let state = self.state.borrow();
        state
            .rxqs
            .get(idx as usize)?
            .as_ref()
            .map(|rxq| rxq.borrow().sp)
    }

    /// Effective inline-send threshold of a Tx queue.
    pub fn txq_max_inline(&self, idx: u16) -> Option<u32> {
        let state = self.state.borrow();
        state
            .txqs
            .get(idx as usize)?
            .as_ref()
            .map(|txq| txq.borrow().max_inline())
    }

    /// Number of live MP to MR cache entries of a Tx queue.
    pub fn txq_mp2mr_len(&self, idx: u16) -> Option<usize> {
        let state = self.state.borrow();
        state
            .txqs
            .get(idx as usize)?
            .as_ref()
            .map(|txq| txq.borrow().mp2mr_len())
    }

    /// Whether a Tx queue currently caches a translation for `mp`.
    pub fn txq_mp2mr_contains(&self, idx: u16, mp: &Mempool) -> Option<bool> {
        let state = self.state.borrow();
        state
            .txqs
            .get(idx as usize)?
            .as_ref()
            .map(|txq| txq.borrow().mp2mr_contains(mp))
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Drop for Port {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("port_num", &self.port_num)
            .field("port_id", &self.port_id)
            .finish()
    }
}
