// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Interface to the Verbs-style transport. The driver core talks to the
//! device exclusively through the [`Verbs`] trait plus the per-queue burst
//! interfaces queried once a queue pair is up.

pub mod flow_spec;
pub mod loopback;
mod types;

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use std::rc::Rc;

//==============================================================================
// Exports
//==============================================================================

pub use self::types::*;

//==============================================================================
// Traits
//==============================================================================

/// Verbs transport. One instance per device context.
pub trait Verbs {
    // Device.
    fn query_device(&self) -> DeviceAttr;
    fn query_port(&self, port_num: u8) -> Result<PortAttr, Fail>;

    // Protection domains.
    fn alloc_pd(&self) -> Result<PdHandle, Fail>;
    fn dealloc_pd(&self, pd: PdHandle) -> Result<(), Fail>;

    // Memory regions.
    fn reg_mr(&self, pd: PdHandle, addr: u64, len: usize, access: AccessFlags) -> Result<Mr, Fail>;
    fn dereg_mr(&self, mr: MrHandle) -> Result<(), Fail>;

    // Resource domains.
    fn create_res_domain(&self) -> Result<RdHandle, Fail>;
    fn destroy_res_domain(&self, rd: RdHandle) -> Result<(), Fail>;

    // Completion channels.
    fn create_comp_channel(&self) -> Result<ChannelHandle, Fail>;
    fn destroy_comp_channel(&self, channel: ChannelHandle) -> Result<(), Fail>;

    // Completion queues.
    fn create_cq(&self, cqe: u32, channel: Option<ChannelHandle>, rd: Option<RdHandle>) -> Result<CqHandle, Fail>;
    fn resize_cq(&self, cq: CqHandle, cqe: u32) -> Result<(), Fail>;
    fn destroy_cq(&self, cq: CqHandle) -> Result<(), Fail>;
    fn poll_cq(&self, cq: CqHandle, max: usize) -> Result<Vec<Wc>, Fail>;
    fn req_notify_cq(&self, cq: CqHandle) -> Result<(), Fail>;
    fn get_cq_event(&self, channel: ChannelHandle) -> Result<Option<CqHandle>, Fail>;
    fn ack_cq_events(&self, cq: CqHandle, n: u32);

    // Queue pairs.
    fn create_qp(&self, attr: &QpInitAttr) -> Result<Qp, Fail>;
    fn destroy_qp(&self, qp: QpHandle) -> Result<(), Fail>;
    fn modify_qp(&self, qp: QpHandle, state: QpState, port_num: Option<u8>) -> Result<(), Fail>;
    fn post_send(&self, qp: QpHandle, wrs: &[SendWr]) -> Result<(), Fail>;
    fn post_recv(&self, qp: QpHandle, wrs: &[RecvWr]) -> Result<(), Fail>;

    // Flow steering.
    fn create_flow(&self, qp: QpHandle, spec: &[u8]) -> Result<FlowHandle, Fail>;
    fn destroy_flow(&self, flow: FlowHandle) -> Result<(), Fail>;

    // Asynchronous events.
    fn get_async_event(&self) -> Option<AsyncEvent>;
    fn ack_async_event(&self, event: &AsyncEvent);

    // Fast-path interface families, available once the QP reached RTR/RTS.
    fn query_qp_burst(&self, qp: QpHandle) -> Result<Rc<dyn QpBurst>, Fail>;
    fn query_cq_intf(&self, cq: CqHandle) -> Result<Rc<dyn CqIntf>, Fail>;
}

/// Per-QP burst interface. Pending sends accumulate until `send_flush`
/// rings the doorbell.
pub trait QpBurst {
    /// Queues one single-SGE send.
    fn send_pending(&self, addr: u64, length: u32, lkey: u32, flags: SendFlags) -> Result<(), Fail>;

    /// Queues one send with the payload copied into the descriptor.
    fn send_pending_inline(&self, data: &[u8], flags: SendFlags) -> Result<(), Fail>;

    /// Queues one scatter/gather send.
    fn send_pending_sg_list(&self, sges: &[Sge], flags: SendFlags) -> Result<(), Fail>;

    /// Posts all queued sends to the device.
    fn send_flush(&self) -> Result<(), Fail>;

    /// Posts one single-SGE receive work request per element of `sges`.
    fn recv_burst(&self, sges: &[Sge]) -> Result<(), Fail>;
}

/// Per-CQ interface.
pub trait CqIntf {
    /// Consumes up to `max` completions, returning how many were consumed.
    /// Statuses are discarded.
    fn poll_cnt(&self, max: usize) -> Result<usize, Fail>;

    /// Consumes the next successful receive completion, reporting its byte
    /// length and completion flags.
    fn poll_length_flags(&self) -> PollLength;
}
