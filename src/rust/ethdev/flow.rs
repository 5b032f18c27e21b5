// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Flow engine: validates a pattern/action rule against the layered item
//! graph, compiles it into one packed Verbs specification, and manages the
//! per-port rule list plus the shared drop and RSS-parent queue pairs.

//==============================================================================
// Imports
//==============================================================================

use super::{
    Port,
    PortState,
};
use crate::{
    runtime::fail::Fail,
    verbs::{
        flow_spec::{
            EthFilter,
            FlowAttr,
            FlowSpecBuf,
            FlowSpecEth,
            FlowSpecIpv4,
            FlowSpecTcpUdp,
            FlowSpecType,
            Ipv4Filter,
            TcpUdpFilter,
            FLOW_ATTR_ALL_DEFAULT,
            FLOW_ATTR_NORMAL,
            FLOW_ATTR_SIZE,
            FLOW_SPEC_ETH_SIZE,
            FLOW_SPEC_IPV4_SIZE,
            FLOW_SPEC_TCP_UDP_SIZE,
        },
        CqHandle,
        FlowHandle,
        Qp,
        QpCap,
        QpGroup,
        QpHandle,
        QpInitAttr,
        QpState,
        QpType,
    },
};
use arrayvec::ArrayVec;
use eui48::MacAddress;
use std::net::Ipv4Addr;

//==============================================================================
// Public Types
//==============================================================================

/// Flow rule attributes.
#[derive(Clone, Copy, Debug)]
pub struct FlowAttrDesc {
    pub group: u32,
    pub priority: u32,
    pub ingress: bool,
    pub egress: bool,
}

impl Default for FlowAttrDesc {
    fn default() -> Self {
        Self {
            group: 0,
            priority: 0,
            ingress: true,
            egress: false,
        }
    }
}

/// Spec/last/mask triple of one pattern item.
#[derive(Clone, Copy, Debug)]
pub struct ItemDesc<T: Copy> {
    pub spec: Option<T>,
    pub last: Option<T>,
    pub mask: Option<T>,
}

impl<T: Copy> Default for ItemDesc<T> {
    fn default() -> Self {
        Self {
            spec: None,
            last: None,
            mask: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EthPattern {
    pub dst: MacAddress,
    pub src: MacAddress,
}

#[derive(Clone, Copy, Debug)]
pub struct VlanPattern {
    /// VLAN TCI in host order.
    pub tci: u16,
}

#[derive(Clone, Copy, Debug)]
pub struct Ipv4Pattern {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

#[derive(Clone, Copy, Debug)]
pub struct L4Pattern {
    /// Ports in host order.
    pub src_port: u16,
    pub dst_port: u16,
}

/// One typed pattern item.
#[derive(Clone, Copy, Debug)]
pub enum PatternItem {
    Void,
    Eth(ItemDesc<EthPattern>),
    Vlan(ItemDesc<VlanPattern>),
    Ipv4(ItemDesc<Ipv4Pattern>),
    Udp(ItemDesc<L4Pattern>),
    Tcp(ItemDesc<L4Pattern>),
}

/// One action of the rule's action list.
#[derive(Clone, Debug)]
pub enum FlowAction {
    Void,
    Passthru,
    Drop,
    Queue { index: u16 },
    Rss { queues: Vec<u16> },
}

/// Handle to an installed rule, keyed by the per-port rule list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowRuleHandle(pub usize);

//==============================================================================
// Internal Types
//==============================================================================

/// One rule in the per-port list. `ibv_flow` is present only while the rule
/// is installed on the device.
pub(crate) struct FlowRule {
    pub(crate) spec: FlowSpecBuf,
    pub(crate) ibv_flow: Option<FlowHandle>,
    /// Target QP, `None` for drop rules (resolved at install time).
    pub(crate) qp: Option<QpHandle>,
    pub(crate) rss_parent: Option<usize>,
}

/// Shared RSS parent queue pair.
pub(crate) struct RssParent {
    pub(crate) queues: Vec<u16>,
    pub(crate) qp: Qp,
    pub(crate) cq: CqHandle,
    pub(crate) refs: usize,
}

/// Shared drop queue, one per port.
pub(crate) struct DropQueue {
    pub(crate) qp: QpHandle,
    pub(crate) cq: CqHandle,
}

/// Selected targets of an action list.
#[derive(Default)]
struct FlowTargets {
    drop: bool,
    queue: bool,
    queues: Vec<u16>,
}

/// Conversion context threaded through the item graph on the second pass.
struct ConvertCtx {
    buf: FlowSpecBuf,
    /// Offset of the Ethernet record, patched in place by the VLAN item.
    eth_offset: Option<usize>,
}

//==============================================================================
// Pattern Byte Views
//==============================================================================

/// Byte view used by the mask-subset checks. Layout is stable per type and
/// big-endian for multi-byte fields.
trait PatternBytes: Copy {
    fn bytes(&self) -> ArrayVec<u8, 16>;
}

impl PatternBytes for EthPattern {
    fn bytes(&self) -> ArrayVec<u8, 16> {
        let mut out: ArrayVec<u8, 16> = ArrayVec::new();
        out.try_extend_from_slice(self.dst.as_bytes()).unwrap();
        out.try_extend_from_slice(self.src.as_bytes()).unwrap();
        out
    }
}

impl PatternBytes for VlanPattern {
    fn bytes(&self) -> ArrayVec<u8, 16> {
        let mut out: ArrayVec<u8, 16> = ArrayVec::new();
        out.try_extend_from_slice(&self.tci.to_be_bytes()).unwrap();
        out
    }
}

impl PatternBytes for Ipv4Pattern {
    fn bytes(&self) -> ArrayVec<u8, 16> {
        let mut out: ArrayVec<u8, 16> = ArrayVec::new();
        out.try_extend_from_slice(&self.src.octets()).unwrap();
        out.try_extend_from_slice(&self.dst.octets()).unwrap();
        out
    }
}

impl PatternBytes for L4Pattern {
    fn bytes(&self) -> ArrayVec<u8, 16> {
        let mut out: ArrayVec<u8, 16> = ArrayVec::new();
        out.try_extend_from_slice(&self.src_port.to_be_bytes()).unwrap();
        out.try_extend_from_slice(&self.dst_port.to_be_bytes()).unwrap();
        out
    }
}

//==============================================================================
// Supported and Default Masks
//==============================================================================

fn eth_supported_mask() -> EthPattern {
    EthPattern {
        dst: MacAddress::new([0xff; 6]),
        src: MacAddress::new([0xff; 6]),
    }
}

fn eth_default_mask() -> EthPattern {
    eth_supported_mask()
}

/// The generic default VLAN mask is invalid here; only the TCI's VLAN-ID
/// bits can be matched.
const VLAN_SUPPORTED_MASK: VlanPattern = VlanPattern { tci: 0x0fff };

const VLAN_DEFAULT_MASK: VlanPattern = VLAN_SUPPORTED_MASK;

const IPV4_SUPPORTED_MASK: Ipv4Pattern = Ipv4Pattern {
    src: Ipv4Addr::new(255, 255, 255, 255),
    dst: Ipv4Addr::new(255, 255, 255, 255),
};

const IPV4_DEFAULT_MASK: Ipv4Pattern = IPV4_SUPPORTED_MASK;

const L4_SUPPORTED_MASK: L4Pattern = L4Pattern {
    src_port: 0xffff,
    dst_port: 0xffff,
};

const L4_DEFAULT_MASK: L4Pattern = L4_SUPPORTED_MASK;

//==============================================================================
// Item Graph
//==============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ItemKind {
    Eth = 0,
    Vlan = 1,
    Ipv4 = 2,
    Udp = 3,
    Tcp = 4,
}

impl ItemKind {
    fn of(item: &PatternItem) -> Option<ItemKind> {
        match item {
            PatternItem::Void => None,
            PatternItem::Eth(_) => Some(ItemKind::Eth),
            PatternItem::Vlan(_) => Some(ItemKind::Vlan),
            PatternItem::Ipv4(_) => Some(ItemKind::Ipv4),
            PatternItem::Udp(_) => Some(ItemKind::Udp),
            PatternItem::Tcp(_) => Some(ItemKind::Tcp),
        }
    }
}

struct ItemOps {
    /// Allowed successor items.
    next: &'static [ItemKind],
    /// Size of the emitted Verbs spec record.
    dst_sz: usize,
    validate: fn(&PatternItem) -> Result<(), Fail>,
    convert: fn(&PatternItem, &mut ConvertCtx),
}

/// Items allowed at the head of a pattern.
const FIRST_ITEMS: &[ItemKind] = &[ItemKind::Eth];

/// Graph of supported items, indexed by `ItemKind`.
static FLOW_ITEMS: [ItemOps; 5] = [
    // Eth
    ItemOps {
        next: &[ItemKind::Vlan, ItemKind::Ipv4],
        dst_sz: FLOW_SPEC_ETH_SIZE,
        validate: validate_eth,
        convert: convert_eth,
    },
    // Vlan: folds into the preceding Ethernet record.
    ItemOps {
        next: &[ItemKind::Ipv4],
        dst_sz: 0,
        validate: validate_vlan,
        convert: convert_vlan,
    },
    // Ipv4
    ItemOps {
        next: &[ItemKind::Udp, ItemKind::Tcp],
        dst_sz: FLOW_SPEC_IPV4_SIZE,
        validate: validate_ipv4,
        convert: convert_ipv4,
    },
    // Udp
    ItemOps {
        next: &[],
        dst_sz: FLOW_SPEC_TCP_UDP_SIZE,
        validate: validate_udp,
        convert: convert_udp,
    },
    // Tcp
    ItemOps {
        next: &[],
        dst_sz: FLOW_SPEC_TCP_UDP_SIZE,
        validate: validate_tcp,
        convert: convert_tcp,
    },
];

//==============================================================================
// Item Validation
//==============================================================================

fn subset(bytes: &[u8], mask: &[u8]) -> bool {
    bytes.iter().zip(mask).all(|(b, m)| b | m == *m)
}

/// Generic spec/last/mask checks shared by every item type.
fn item_validate<T: PatternBytes>(item: &ItemDesc<T>, supported: &T) -> Result<(), Fail> {
    let supported: ArrayVec<u8, 16> = supported.bytes();
    if item.spec.is_none() && (item.mask.is_some() || item.last.is_some()) {
        return Err(Fail::new(libc::ENOTSUP, "mask or range without a spec"));
    }
    if let Some(mask) = &item.mask {
        if !subset(&mask.bytes(), &supported) {
            return Err(Fail::new(libc::ENOTSUP, "mask exceeds the supported fields"));
        }
    }
    if let (Some(spec), None) = (&item.spec, &item.mask) {
        if !subset(&spec.bytes(), &supported) {
            return Err(Fail::new(libc::ENOTSUP, "spec exceeds the supported fields"));
        }
    }
    if let (Some(last), None) = (&item.last, &item.mask) {
        if !subset(&last.bytes(), &supported) {
            return Err(Fail::new(libc::ENOTSUP, "range end exceeds the supported fields"));
        }
    }
    if let (Some(spec), Some(last)) = (&item.spec, &item.last) {
        let apply: ArrayVec<u8, 16> = match &item.mask {
            Some(mask) => mask.bytes(),
            None => supported,
        };
        let spec_masked: Vec<u8> = spec.bytes().iter().zip(&apply).map(|(b, m)| b & m).collect();
        let last_masked: Vec<u8> = last.bytes().iter().zip(&apply).map(|(b, m)| b & m).collect();
        if spec_masked == last_masked {
            return Err(Fail::new(libc::ENOTSUP, "degenerate range"));
        }
    }
    Ok(())
}

fn validate_eth(item: &PatternItem) -> Result<(), Fail> {
    let desc: &ItemDesc<EthPattern> = match item {
        PatternItem::Eth(desc) => desc,
        _ => unreachable!(),
    };
    if let Some(mask) = &desc.mask {
        // Only an exact destination MAC match is supported.
        if mask.dst.as_bytes() != [0xff; 6] {
            return Err(Fail::new(
                libc::ENOTSUP,
                "destination MAC mask must match all bits",
            ));
        }
    }
    item_validate(desc, &eth_supported_mask())
}

fn validate_vlan(item: &PatternItem) -> Result<(), Fail> {
    let desc: &ItemDesc<VlanPattern> = match item {
        PatternItem::Vlan(desc) => desc,
        _ => unreachable!(),
    };
    if let Some(mask) = &desc.mask {
        if mask.tci != 0 && mask.tci != 0x0fff {
            return Err(Fail::new(libc::ENOTSUP, "VLAN TCI mask must be 0 or 0x0fff"));
        }
    }
    item_validate(desc, &VLAN_SUPPORTED_MASK)
}

fn validate_ipv4(item: &PatternItem) -> Result<(), Fail> {
    let desc: &ItemDesc<Ipv4Pattern> = match item {
        PatternItem::Ipv4(desc) => desc,
        _ => unreachable!(),
    };
    if let Some(mask) = &desc.mask {
        for addr in [mask.src, mask.dst] {
            let raw: u32 = addr.into();
            if raw != 0 && raw != u32::MAX {
                return Err(Fail::new(libc::ENOTSUP, "IPv4 masks must match all bits or none"));
            }
        }
    }
    item_validate(desc, &IPV4_SUPPORTED_MASK)
}

fn validate_l4(desc: &ItemDesc<L4Pattern>) -> Result<(), Fail> {
    if let Some(mask) = &desc.mask {
        for port in [mask.src_port, mask.dst_port] {
            if port != 0 && port != 0xffff {
                return Err(Fail::new(libc::ENOTSUP, "port masks must match all bits or none"));
            }
        }
    }
    item_validate(desc, &L4_SUPPORTED_MASK)
}

fn validate_udp(item: &PatternItem) -> Result<(), Fail> {
    match item {
        PatternItem::Udp(desc) => validate_l4(desc),
        _ => unreachable!(),
    }
}

fn validate_tcp(item: &PatternItem) -> Result<(), Fail> {
    match item {
        PatternItem::Tcp(desc) => validate_l4(desc),
        _ => unreachable!(),
    }
}

//==============================================================================
// Item Conversion
//==============================================================================

fn mac_octets(mac: &MacAddress) -> [u8; 6] {
    mac.as_bytes().try_into().unwrap()
}

fn convert_eth(item: &PatternItem, ctx: &mut ConvertCtx) {
    let desc: &ItemDesc<EthPattern> = match item {
        PatternItem::Eth(desc) => desc,
        _ => unreachable!(),
    };
    ctx.buf.update_attr(|attr| {
        attr.num_of_specs += 1;
        attr.priority = 2;
    });
    let mut eth: FlowSpecEth = FlowSpecEth {
        spec_type: FlowSpecType::Eth as u32,
        size: FLOW_SPEC_ETH_SIZE as u16,
        val: EthFilter::default(),
        mask: EthFilter::default(),
    };
    let spec: EthPattern = match desc.spec {
        Some(spec) => spec,
        None => {
            // No spec: the rule becomes a default-all catch.
            ctx.buf.update_attr(|attr| attr.attr_type = FLOW_ATTR_ALL_DEFAULT);
            ctx.eth_offset = Some(ctx.buf.push(&eth));
            return;
        },
    };
    let mask: EthPattern = desc.mask.unwrap_or_else(eth_default_mask);
    eth.val.dst_mac = mac_octets(&spec.dst);
    eth.val.src_mac = mac_octets(&spec.src);
    eth.mask.dst_mac = mac_octets(&mask.dst);
    eth.mask.src_mac = mac_octets(&mask.src);
    // Remove unwanted bits from the values.
    for i in 0..6 {
        eth.val.dst_mac[i] &= eth.mask.dst_mac[i];
        eth.val.src_mac[i] &= eth.mask.src_mac[i];
    }
    ctx.eth_offset = Some(ctx.buf.push(&eth));
}

fn convert_vlan(item: &PatternItem, ctx: &mut ConvertCtx) {
    let desc: &ItemDesc<VlanPattern> = match item {
        PatternItem::Vlan(desc) => desc,
        _ => unreachable!(),
    };
    let spec: VlanPattern = match desc.spec {
        Some(spec) => spec,
        None => return,
    };
    let mask: VlanPattern = desc.mask.unwrap_or(VLAN_DEFAULT_MASK);
    let offset: usize = ctx.eth_offset.expect("VLAN item without a preceding Ethernet record");
    let mut eth: FlowSpecEth = ctx.buf.read_at(offset);
    eth.val.vlan_tag = (spec.tci & mask.tci).to_be();
    eth.mask.vlan_tag = mask.tci.to_be();
    ctx.buf.write_at(offset, &eth);
}

fn convert_ipv4(item: &PatternItem, ctx: &mut ConvertCtx) {
    let desc: &ItemDesc<Ipv4Pattern> = match item {
        PatternItem::Ipv4(desc) => desc,
        _ => unreachable!(),
    };
    ctx.buf.update_attr(|attr| {
        attr.num_of_specs += 1;
        attr.priority = 1;
    });
    let mut ipv4: FlowSpecIpv4 = FlowSpecIpv4 {
        spec_type: FlowSpecType::Ipv4 as u32,
        size: FLOW_SPEC_IPV4_SIZE as u16,
        val: Ipv4Filter::default(),
        mask: Ipv4Filter::default(),
    };
    if let Some(spec) = desc.spec {
        let mask: Ipv4Pattern = desc.mask.unwrap_or(IPV4_DEFAULT_MASK);
        ipv4.val = Ipv4Filter {
            src_ip: u32::from(spec.src).to_be(),
            dst_ip: u32::from(spec.dst).to_be(),
        };
        ipv4.mask = Ipv4Filter {
            src_ip: u32::from(mask.src).to_be(),
            dst_ip: u32::from(mask.dst).to_be(),
        };
        // Remove unwanted bits from the values.
        ipv4.val.src_ip &= ipv4.mask.src_ip;
        ipv4.val.dst_ip &= ipv4.mask.dst_ip;
    }
    ctx.buf.push(&ipv4);
}

fn convert_l4(desc: &ItemDesc<L4Pattern>, spec_type: FlowSpecType, ctx: &mut ConvertCtx) {
    ctx.buf.update_attr(|attr| {
        attr.num_of_specs += 1;
        attr.priority = 0;
    });
    let mut rec: FlowSpecTcpUdp = FlowSpecTcpUdp {
        spec_type: spec_type as u32,
        size: FLOW_SPEC_TCP_UDP_SIZE as u16,
        val: TcpUdpFilter::default(),
        mask: TcpUdpFilter::default(),
    };
    if let Some(spec) = desc.spec {
        let mask: L4Pattern = desc.mask.unwrap_or(L4_DEFAULT_MASK);
        rec.val = TcpUdpFilter {
            dst_port: (spec.dst_port & mask.dst_port).to_be(),
            src_port: (spec.src_port & mask.src_port).to_be(),
        };
        rec.mask = TcpUdpFilter {
            dst_port: mask.dst_port.to_be(),
            src_port: mask.src_port.to_be(),
        };
    }
    ctx.buf.push(&rec);
}

fn convert_udp(item: &PatternItem, ctx: &mut ConvertCtx) {
    match item {
        PatternItem::Udp(desc) => convert_l4(desc, FlowSpecType::Udp, ctx),
        _ => unreachable!(),
    }
}

fn convert_tcp(item: &PatternItem, ctx: &mut ConvertCtx) {
    match item {
        PatternItem::Tcp(desc) => convert_l4(desc, FlowSpecType::Tcp, ctx),
        _ => unreachable!(),
    }
}

//==============================================================================
// Validation and Compilation
//==============================================================================

/// Validates a rule and, when `flow` is given, emits the packed records.
/// Returns the total spec-record size and the selected targets.
fn priv_flow_validate(
    port: &Port,
    state: &PortState,
    attr: &FlowAttrDesc,
    pattern: &[PatternItem],
    actions: &[FlowAction],
    mut flow: Option<&mut ConvertCtx>,
) -> Result<(usize, FlowTargets), Fail> {
    if attr.group != 0 {
        return Err(Fail::new(libc::ENOTSUP, "groups are not supported"));
    }
    if attr.priority != 0 {
        return Err(Fail::new(libc::ENOTSUP, "priorities are not supported"));
    }
    if attr.egress {
        return Err(Fail::new(libc::ENOTSUP, "egress is not supported"));
    }
    if !attr.ingress {
        return Err(Fail::new(libc::ENOTSUP, "only ingress is supported"));
    }
    // Go over the items list.
    let mut allowed: &'static [ItemKind] = FIRST_ITEMS;
    let mut offset: usize = 0;
    let mut seen: bool = false;
    for (pos, item) in pattern.iter().enumerate() {
        let kind: ItemKind = match ItemKind::of(item) {
            Some(kind) => kind,
            None => continue,
        };
        // A null Ethernet spec is only valid for a single-item rule.
        if let PatternItem::Eth(desc) = item {
            if desc.spec.is_none()
                && pattern[pos + 1..]
                    .iter()
                    .any(|i| !matches!(i, PatternItem::Void))
            {
                return Err(Fail::new(libc::ENOTSUP, "the rule requires an Ethernet spec"));
            }
        }
        if !allowed.contains(&kind) {
            return Err(Fail::new(libc::ENOTSUP, "item not supported"));
        }
        let ops: &ItemOps = &FLOW_ITEMS[kind as usize];
        (ops.validate)(item)?;
        if let Some(ctx) = flow.as_mut() {
            (ops.convert)(item, ctx);
        }
        offset += ops.dst_sz;
        allowed = ops.next;
        seen = true;
    }
    if !seen {
        return Err(Fail::new(libc::ENOTSUP, "an Ethernet pattern item is required"));
    }
    // Go over the actions list.
    let mut targets: FlowTargets = FlowTargets::default();
    for action in actions {
        match action {
            FlowAction::Void | FlowAction::Passthru => continue,
            FlowAction::Drop => {
                targets.drop = true;
            },
            FlowAction::Queue { index } => {
                if *index as usize >= state.rxqs.len() {
                    return Err(Fail::new(libc::ENOTSUP, "queue index out of range"));
                }
                targets.queue = true;
                targets.queues = vec![*index];
            },
            FlowAction::Rss { queues } => {
                if !state.isolated {
                    return Err(Fail::new(
                        libc::ENOTSUP,
                        "RSS cannot be used without isolated mode",
                    ));
                }
                if !queues.len().is_power_of_two() {
                    return Err(Fail::new(
                        libc::ENOTSUP,
                        "the number of queues should be a power of two",
                    ));
                }
                if (port.device_attr.max_rss_tbl_sz as usize) < queues.len() {
                    return Err(Fail::new(libc::ENOTSUP, "the number of queues is too large"));
                }
                for (i, q) in queues.iter().enumerate() {
                    if *q as usize >= state.rxqs.len() {
                        return Err(Fail::new(libc::ENOTSUP, "queue index out of range"));
                    }
                    // The same queue cannot appear twice.
                    if queues[i + 1..].contains(q) {
                        return Err(Fail::new(
                            libc::ENOTSUP,
                            "RSS action only supports unique queue indices in a list",
                        ));
                    }
                }
                targets.queue = true;
                targets.queues = queues.clone();
            },
        }
    }
    // Exactly one target must be selected.
    if targets.queue == targets.drop {
        return Err(Fail::new(libc::ENOTSUP, "exactly one target action is required"));
    }
    Ok((offset, targets))
}

//==============================================================================
// Drop Queue
//==============================================================================

/// Creates the single drop queue shared by all drop rules on the port.
fn priv_flow_create_drop_queue(port: &Port, state: &mut PortState) -> Result<(), Fail> {
    let cq: CqHandle = port.ctx.create_cq(1, None, None).map_err(|e| {
        error!("port {}: cannot create drop CQ", port.port_id);
        e
    })?;
    let qp: Qp = match port.ctx.create_qp(&QpInitAttr {
        send_cq: Some(cq),
        recv_cq: Some(cq),
        cap: QpCap {
            max_send_wr: 0,
            max_recv_wr: 1,
            max_send_sge: 0,
            max_recv_sge: 1,
            max_inline_data: 0,
        },
        qp_type: QpType::RawPacket,
        pd: port.pd,
        res_domain: None,
        inl_recv: 0,
        qpg: QpGroup::None,
        port_num: Some(port.port_num),
    }) {
        Ok(qp) => qp,
        Err(e) => {
            error!("port {}: cannot create drop QP", port.port_id);
            let _ = port.ctx.destroy_cq(cq);
            return Err(e);
        },
    };
    state.drop_q = Some(DropQueue { qp: qp.handle, cq });
    Ok(())
}

fn priv_flow_destroy_drop_queue(port: &Port, state: &mut PortState) {
    if let Some(drop_q) = state.drop_q.take() {
        let _ = port.ctx.destroy_qp(drop_q.qp);
        let _ = port.ctx.destroy_cq(drop_q.cq);
    }
}

//==============================================================================
// RSS Parents
//==============================================================================

/// Creates a new parent QP referencing the requested child queues, creating
/// deferred child QPs along the way.
fn priv_parent_create(port: &Port, state: &mut PortState, queues: &[u16]) -> Result<usize, Fail> {
    let cq: CqHandle = port.ctx.create_cq(1, None, None)?;
    let qp: Qp = match port.ctx.create_qp(&QpInitAttr {
        send_cq: Some(cq),
        recv_cq: Some(cq),
        cap: QpCap {
            max_send_wr: 0,
            max_recv_wr: 1,
            max_send_sge: 0,
            max_recv_sge: 1,
            max_inline_data: 0,
        },
        qp_type: QpType::RawPacket,
        pd: port.pd,
        res_domain: None,
        inl_recv: 0,
        qpg: QpGroup::Parent {
            children_n: queues.len() as u32,
        },
        port_num: Some(port.port_num),
    }) {
        Ok(qp) => qp,
        Err(e) => {
            let _ = port.ctx.destroy_cq(cq);
            return Err(e);
        },
    };
    let mut result: Result<(), Fail> = port
        .ctx
        .modify_qp(qp.handle, QpState::Init, Some(port.port_num))
        .and_then(|()| port.ctx.modify_qp(qp.handle, QpState::Rtr, None));
    if result.is_ok() {
        for &q in queues {
            let rxq = state.rxqs[q as usize].clone().expect("validated queue vanished");
            let mut rxq = rxq.borrow_mut();
            if rxq.qp.is_none() {
                if let Err(e) = rxq.create_qp(Some(qp.handle)) {
                    result = Err(e);
                    break;
                }
            }
        }
    }
    if let Err(e) = result {
        let _ = port.ctx.destroy_qp(qp.handle);
        let _ = port.ctx.destroy_cq(cq);
        return Err(e);
    }
    Ok(state.parents.insert(RssParent {
        queues: queues.to_vec(),
        qp,
        cq,
        refs: 0,
    }))
}

/// Finds a shareable parent for `queues` or creates one. A parent is reused
/// only on an exact queue-set match; any partial overlap, or a child whose
/// QP already exists stand-alone, rejects the rule.
fn priv_parent_get(port: &Port, state: &mut PortState, queues: &[u16]) -> Result<(usize, bool), Fail> {
    for (key, parent) in state.parents.iter() {
        let mut same: usize = 0;
        let mut overlap: usize = 0;
        for (i, q) in queues.iter().enumerate() {
            for (j, pq) in parent.queues.iter().enumerate() {
                if pq != q {
                    continue;
                }
                overlap += 1;
                if i == j {
                    same += 1;
                }
            }
        }
        if same == queues.len() && queues.len() == parent.queues.len() {
            return Ok((key, false));
        }
        if overlap != 0 {
            return Err(Fail::new(
                libc::EEXIST,
                "sharing a queue between several RSS groups is not supported",
            ));
        }
    }
    // Exclude queues whose QPs were created without RSS: a stand-alone
    // child cannot be demoted into a parent.
    for &q in queues {
        let rxq = state.rxqs[q as usize]
            .clone()
            .ok_or_else(|| Fail::new(libc::EINVAL, "queue is not configured"))?;
        let rxq = rxq.borrow();
        if rxq.qp.is_some() && !rxq.as_child {
            return Err(Fail::new(
                libc::EEXIST,
                "sharing a queue between several RSS groups is not supported",
            ));
        }
    }
    let key: usize = priv_parent_create(port, state, queues)?;
    Ok((key, true))
}

/// Drops one reference; the parent disappears with the last rule using it.
fn priv_parent_put(port: &Port, state: &mut PortState, key: usize) {
    let refs: usize = {
        let parent: &mut RssParent = &mut state.parents[key];
        debug_assert!(parent.refs > 0);
        parent.refs -= 1;
        parent.refs
    };
    if refs == 0 {
        let parent: RssParent = state.parents.remove(key);
        let _ = port.ctx.destroy_qp(parent.qp.handle);
        let _ = port.ctx.destroy_cq(parent.cq);
    }
}

pub(crate) fn priv_parents_destroy(port: &Port, state: &mut PortState) {
    let keys: Vec<usize> = state.parents.iter().map(|(k, _)| k).collect();
    for key in keys {
        let parent: RssParent = state.parents.remove(key);
        let _ = port.ctx.destroy_qp(parent.qp.handle);
        let _ = port.ctx.destroy_cq(parent.cq);
    }
}

//==============================================================================
// Rule Creation and Destruction
//==============================================================================

fn priv_flow_create(
    port: &Port,
    state: &mut PortState,
    attr: &FlowAttrDesc,
    pattern: &[PatternItem],
    actions: &[FlowAction],
) -> Result<FlowRuleHandle, Fail> {
    let (spec_bytes, targets) = priv_flow_validate(port, state, attr, pattern, actions, None)?;
    let mut ctx: ConvertCtx = ConvertCtx {
        buf: FlowSpecBuf::new(
            FlowAttr {
                attr_type: FLOW_ATTR_NORMAL,
                size: FLOW_ATTR_SIZE as u16,
                priority: attr.priority as u16,
                num_of_specs: 0,
                port: port.port_num,
                flags: 0,
            },
            spec_bytes,
        ),
        eth_offset: None,
    };
    // The second pass over an already-validated rule cannot fail.
    priv_flow_validate(port, state, attr, pattern, actions, Some(&mut ctx))
        .expect("validated flow failed to convert");
    // Resolve the target QP.
    let mut rss_parent: Option<usize> = None;
    let mut parent_created: bool = false;
    let qp: Option<QpHandle> = if targets.drop {
        None
    } else if targets.queues.len() > 1 {
        let (key, created) = priv_parent_get(port, state, &targets.queues)?;
        rss_parent = Some(key);
        parent_created = created;
        Some(state.parents[key].qp.handle)
    } else {
        let rxq = state.rxqs[targets.queues[0] as usize]
            .clone()
            .ok_or_else(|| Fail::new(libc::EINVAL, "queue is not configured"))?;
        let mut rxq = rxq.borrow_mut();
        if rxq.qp.is_none() {
            // Isolated mode defers queue creation until a rule needs it.
            debug_assert!(state.isolated);
            rxq.create_qp(None)?;
        }
        Some(rxq.qp.unwrap())
    };
    // Install right away only on a started port.
    let ibv_flow: Option<FlowHandle> = if state.started {
        let target: QpHandle = match qp {
            Some(qp) => qp,
            None => {
                state
                    .drop_q
                    .as_ref()
                    .map(|drop_q| drop_q.qp)
                    .ok_or_else(|| Fail::new(libc::EINVAL, "started port has no drop queue"))?
            },
        };
        match port.ctx.create_flow(target, ctx.buf.as_bytes()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                if parent_created {
                    if let Some(key) = rss_parent {
                        let parent: RssParent = state.parents.remove(key);
                        let _ = port.ctx.destroy_qp(parent.qp.handle);
                        let _ = port.ctx.destroy_cq(parent.cq);
                    }
                }
                return Err(e);
            },
        }
    } else {
        None
    };
    if let Some(key) = rss_parent {
        state.parents[key].refs += 1;
    }
    let key: usize = state.flows.insert(FlowRule {
        spec: ctx.buf,
        ibv_flow,
        qp,
        rss_parent,
    });
    debug!("port {}: flow {} created", port.port_id, key);
    Ok(FlowRuleHandle(key))
}

fn priv_flow_destroy(port: &Port, state: &mut PortState, handle: FlowRuleHandle) {
    let flow: FlowRule = state.flows.remove(handle.0);
    if let Some(ibv_flow) = flow.ibv_flow {
        let _ = port.ctx.destroy_flow(ibv_flow);
    }
    if let Some(key) = flow.rss_parent {
        priv_parent_put(port, state, key);
    }
    debug!("port {}: flow {} destroyed", port.port_id, handle.0);
}

//==============================================================================
// Start / Stop
//==============================================================================

/// Applies every configured rule, creating the drop queue first so drop
/// rules have a target.
pub(crate) fn priv_flow_start(port: &Port, state: &mut PortState) -> Result<(), Fail> {
    priv_flow_create_drop_queue(port, state)?;
    let drop_qp: QpHandle = state.drop_q.as_ref().unwrap().qp;
    let keys: Vec<usize> = state.flows.iter().map(|(k, _)| k).collect();
    for key in keys {
        let qp: QpHandle = state.flows[key].qp.unwrap_or(drop_qp);
        let spec: Vec<u8> = state.flows[key].spec.as_bytes().to_vec();
        match port.ctx.create_flow(qp, &spec) {
            Ok(handle) => {
                state.flows[key].ibv_flow = Some(handle);
                debug!("port {}: flow {} applied", port.port_id, key);
            },
            Err(_) => {
                debug!("port {}: flow {} cannot be applied", port.port_id, key);
                return Err(Fail::new(libc::EINVAL, "cannot apply flow rule"));
            },
        }
    }
    Ok(())
}

/// Removes every installed rule from the device, keeping the descriptors
/// for a later restart, then destroys the drop queue.
pub(crate) fn priv_flow_stop(port: &Port, state: &mut PortState) {
    for (key, flow) in state.flows.iter_mut() {
        if let Some(ibv_flow) = flow.ibv_flow.take() {
            let _ = port.ctx.destroy_flow(ibv_flow);
            debug!("port {}: flow {} removed", port.port_id, key);
        }
    }
    priv_flow_destroy_drop_queue(port, state);
}

//==============================================================================
// MAC Flow
//==============================================================================

/// Installs the flow steering the port's MAC address to queue 0. Nothing to
/// do on a stopped or isolated port.
pub(crate) fn priv_mac_addr_add(port: &Port, state: &mut PortState) -> Result<(), Fail> {
    if !state.started || state.isolated {
        return Ok(());
    }
    let rxq = match state.rxqs.first().and_then(|slot| slot.clone()) {
        Some(rxq) => rxq,
        None => return Ok(()),
    };
    let qp: QpHandle = match rxq.borrow().qp {
        Some(qp) => qp,
        None => return Ok(()),
    };
    if state.mac_flow.is_some() {
        priv_mac_addr_del(port, state);
    }
    let mac: MacAddress = state.mac;
    debug!("port {}: adding MAC address {}", port.port_id, mac);
    let mut buf: FlowSpecBuf = FlowSpecBuf::new(
        FlowAttr {
            attr_type: FLOW_ATTR_NORMAL,
            size: FLOW_ATTR_SIZE as u16,
            priority: 3,
            num_of_specs: 1,
            port: port.port_num,
            flags: 0,
        },
        FLOW_SPEC_ETH_SIZE,
    );
    buf.push(&FlowSpecEth {
        spec_type: FlowSpecType::Eth as u32,
        size: FLOW_SPEC_ETH_SIZE as u16,
        val: EthFilter {
            dst_mac: mac_octets(&mac),
            ..Default::default()
        },
        mask: EthFilter {
            dst_mac: [0xff; 6],
            ..Default::default()
        },
    });
    let flow: FlowHandle = port.ctx.create_flow(qp, buf.as_bytes()).map_err(|e| {
        error!("port {}: MAC flow configuration failed: {}", port.port_id, e);
        e
    })?;
    debug_assert!(state.mac_flow.is_none());
    state.mac_flow = Some(flow);
    Ok(())
}

/// Removes the MAC flow, if installed.
pub(crate) fn priv_mac_addr_del(port: &Port, state: &mut PortState) {
    if let Some(flow) = state.mac_flow.take() {
        debug!("port {}: removing MAC address {}", port.port_id, state.mac);
        let _ = port.ctx.destroy_flow(flow);
    }
}

//==============================================================================
// Port Surface
//==============================================================================

impl Port {
    /// Checks whether a rule is supported without creating it.
    pub fn flow_validate(
        &self,
        attr: &FlowAttrDesc,
        pattern: &[PatternItem],
        actions: &[FlowAction],
    ) -> Result<(), Fail> {
        let _guard = self.ctrl.lock();
        let state = self.state.borrow();
        priv_flow_validate(self, &state, attr, pattern, actions, None).map(|_| ())
    }

    /// Creates a flow rule. On a stopped port the rule is recorded and
    /// installed at the next start.
    pub fn flow_create(
        &self,
        attr: &FlowAttrDesc,
        pattern: &[PatternItem],
        actions: &[FlowAction],
    ) -> Result<FlowRuleHandle, Fail> {
        let _guard = self.ctrl.lock();
        let mut state = self.state.borrow_mut();
        priv_flow_create(self, &mut state, attr, pattern, actions)
    }

    /// Destroys a flow rule. The rule list is the authority: destroying an
    /// already-destroyed rule succeeds without side effects.
    pub fn flow_destroy(&self, handle: FlowRuleHandle) -> Result<(), Fail> {
        let _guard = self.ctrl.lock();
        let mut state = self.state.borrow_mut();
        if !state.flows.contains(handle.0) {
            return Ok(());
        }
        priv_flow_destroy(self, &mut state, handle);
        Ok(())
    }

    /// Destroys every flow rule.
    pub fn flow_flush(&self) -> Result<(), Fail> {
        let _guard = self.ctrl.lock();
        let mut state = self.state.borrow_mut();
        let keys: Vec<usize> = state.flows.iter().map(|(key, _)| key).collect();
        for key in keys {
            priv_flow_destroy(self, &mut state, FlowRuleHandle(key));
        }
        Ok(())
    }

    /// Enters or leaves isolated mode. Must be called before queues are
    /// configured.
    pub fn flow_isolate(&self, enable: bool) -> Result<(), Fail> {
        let _guard = self.ctrl.lock();
        let mut state = self.state.borrow_mut();
        if !state.rxqs.is_empty() {
            return Err(Fail::new(
                libc::ENOTSUP,
                "isolated mode must be set before configuring the device",
            ));
        }
        state.isolated = enable;
        Ok(())
    }

    /// Packed spec bytes of a rule.
    pub fn flow_spec_bytes(&self, handle: FlowRuleHandle) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        state
            .flows
            .get(handle.0)
            .map(|flow| flow.spec.as_bytes().to_vec())
    }

    /// Whether a rule currently has a Verbs handle installed.
    pub fn flow_is_installed(&self, handle: FlowRuleHandle) -> Option<bool> {
        let state = self.state.borrow();
        state.flows.get(handle.0).map(|flow| flow.ibv_flow.is_some())
    }

    /// Target QP of a rule; `None` for drop rules.
    pub fn flow_target_qp(&self, handle: FlowRuleHandle) -> Option<Option<QpHandle>> {
        let state = self.state.borrow();
        state.flows.get(handle.0).map(|flow| flow.qp)
    }

    /// RSS parent key of a rule, when it has one.
    pub fn flow_rss_parent(&self, handle: FlowRuleHandle) -> Option<usize> {
        let state = self.state.borrow();
        state.flows.get(handle.0).and_then(|flow| flow.rss_parent)
    }

    /// Number of live RSS parents.
    pub fn rss_parent_count(&self) -> usize {
        self.state.borrow().parents.len()
    }

    /// Number of rules in the list.
    pub fn flow_count(&self) -> usize {
        self.state.borrow().flows.len()
    }
}
