// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use derive_more::{
    From,
    Into,
};
use eui48::MacAddress;

//==============================================================================
// Handle Types
//==============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, From, Into)]
pub struct PdHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, From, Into)]
pub struct MrHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, From, Into)]
pub struct CqHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, From, Into)]
pub struct QpHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, From, Into)]
pub struct RdHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, From, Into)]
pub struct ChannelHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, From, Into)]
pub struct FlowHandle(pub u32);

//==============================================================================
// Structures
//==============================================================================

/// Registered memory region. The `lkey` goes into scatter/gather elements.
#[derive(Clone, Copy, Debug)]
pub struct Mr {
    pub handle: MrHandle,
    pub lkey: u32,
    pub addr: u64,
    pub len: usize,
}

/// Memory access rights requested at registration time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessFlags(pub u32);

pub const ACCESS_LOCAL_WRITE: AccessFlags = AccessFlags(1);

/// Scatter/gather element of a work request.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Receive work request. Chain order is slice order when posting; the chain
/// terminates with the last element of the slice.
#[derive(Clone, Debug)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sges: Vec<Sge>,
}

/// Send work request for the plain (non-burst) post interface.
#[derive(Clone, Debug)]
pub struct SendWr {
    pub wr_id: u64,
    pub sges: Vec<Sge>,
    pub flags: SendFlags,
}

/// Send flags of the burst interface.
#[derive(Clone, Copy, Debug, Default)]
pub struct SendFlags {
    /// Request a completion for this work request.
    pub signaled: bool,
}

/// Work completion.
#[derive(Clone, Copy, Debug)]
pub struct Wc {
    pub wr_id: u64,
    pub status: WcStatus,
    pub byte_len: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocalLengthErr,
    LocalProtErr,
    WrFlushErr,
    GeneralErr,
}

impl WcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WcStatus::Success => "success",
            WcStatus::LocalLengthErr => "local length error",
            WcStatus::LocalProtErr => "local protection error",
            WcStatus::WrFlushErr => "WR flushed error",
            WcStatus::GeneralErr => "general error",
        }
    }
}

/// Result of the CQ family's `poll_length_flags`.
#[derive(Clone, Copy, Debug)]
pub enum PollLength {
    /// No completion available.
    Empty,
    /// One successful receive completion was consumed.
    Packet { len: u32, flags: u32 },
    /// The head completion carries an error; retrieve it with `poll_cq`.
    Error,
}

//==============================================================================
// Queue Pair Types
//==============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QpType {
    /// Carries Ethernet frames verbatim.
    RawPacket,
}

/// Queue pair capabilities. The transport may clamp these on creation and
/// reports the effective values back.
#[derive(Clone, Copy, Debug, Default)]
pub struct QpCap {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

/// Role of a queue pair within a QP group, used for RSS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QpGroup {
    None,
    /// TSS/RSS parent referencing `children_n` child queue pairs.
    Parent { children_n: u32 },
    /// Child attached to an existing parent.
    Child { parent: QpHandle },
}

#[derive(Clone, Debug)]
pub struct QpInitAttr {
    pub send_cq: Option<CqHandle>,
    pub recv_cq: Option<CqHandle>,
    pub cap: QpCap,
    pub qp_type: QpType,
    pub pd: PdHandle,
    pub res_domain: Option<RdHandle>,
    /// Requested inline-receive size; the device may clamp it.
    pub inl_recv: u32,
    pub qpg: QpGroup,
    /// Physical port, when bound at creation time (drop queues).
    pub port_num: Option<u8>,
}

/// Queue pair as created: handle plus effective capabilities.
#[derive(Clone, Copy, Debug)]
pub struct Qp {
    pub handle: QpHandle,
    pub cap: QpCap,
}

//==============================================================================
// Device Types
//==============================================================================

#[derive(Clone, Copy, Debug)]
pub struct DeviceAttr {
    pub max_qp_wr: u32,
    pub max_sge: u32,
    pub max_cq: u32,
    pub max_qp: u32,
    pub phys_port_cnt: u8,
    /// Largest inline-receive size the device supports.
    pub max_inline_recv: u32,
    /// Largest RSS indirection table.
    pub max_rss_tbl_sz: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    Infiniband,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortPhysState {
    Active,
    Down,
}

impl PortPhysState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortPhysState::Active => "active",
            PortPhysState::Down => "down",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PortAttr {
    pub state: PortPhysState,
    pub link_layer: LinkLayer,
    /// Link speed in Mb/s; 0 when unknown.
    pub link_speed: u32,
    pub mac: MacAddress,
}

/// Asynchronous device events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncEvent {
    PortActive(u8),
    PortErr(u8),
    DeviceFatal,
}
