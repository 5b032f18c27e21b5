// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Interrupt plumbing: asynchronous device events, the deferred link-status
//! re-check, and the per-queue Rx interrupt vector.

//==============================================================================
// Imports
//==============================================================================

use super::{
    Port,
    PortState,
    Rxq,
    MAX_RX_INTR_VEC,
};
use crate::{
    runtime::fail::Fail,
    verbs::AsyncEvent,
};
use std::{
    cell::RefCell,
    rc::Rc,
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// Delay before re-checking an inconsistent link status.
pub const ALARM_TIMEOUT: Duration = Duration::from_micros(100_000);

//==============================================================================
// Structures
//==============================================================================

/// Events surfaced to the host framework.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortEvent {
    LinkStatusChange,
    Removal,
}

//==============================================================================
// Handler Installation
//==============================================================================

pub(crate) fn priv_link_interrupt_handler_install(_port: &Port, state: &mut PortState) -> Result<(), Fail> {
    if state.conf_intr.lsc {
        state.active_intr.lsc = true;
    }
    Ok(())
}

pub(crate) fn priv_removal_interrupt_handler_install(_port: &Port, state: &mut PortState) -> Result<(), Fail> {
    if state.conf_intr.rmv {
        state.active_intr.rmv = true;
    }
    Ok(())
}

pub(crate) fn priv_link_interrupt_handler_uninstall(_port: &Port, state: &mut PortState) {
    state.active_intr.lsc = false;
    // Cancel any pending re-check.
    state.pending_alarm = None;
}

pub(crate) fn priv_removal_interrupt_handler_uninstall(_port: &Port, state: &mut PortState) {
    state.active_intr.rmv = false;
}

//==============================================================================
// Rx Interrupt Vector
//==============================================================================

/// Builds the queue interrupt vector from the queues that own a completion
/// channel. Queues without one get a disabled entry.
pub(crate) fn priv_rx_intr_vec_enable(port: &Port, state: &mut PortState) -> Result<(), Fail> {
    if !state.conf_intr.rxq {
        return Ok(());
    }
    priv_rx_intr_vec_disable(port, state);
    let n: usize = state.rxqs.len().min(MAX_RX_INTR_VEC);
    let mut vec: Vec<Option<usize>> = vec![None; state.rxqs.len()];
    let mut count: usize = 0;
    for (i, slot) in state.rxqs.iter().enumerate().take(n) {
        // Skip queues that cannot request interrupts.
        let with_channel: bool = slot
            .as_ref()
            .map(|rxq| rxq.borrow().has_channel())
            .unwrap_or(false);
        if !with_channel {
            continue;
        }
        vec[i] = Some(count);
        count += 1;
    }
    if count == 0 {
        priv_rx_intr_vec_disable(port, state);
    } else {
        state.intr_vec = Some(vec);
    }
    Ok(())
}

pub(crate) fn priv_rx_intr_vec_disable(_port: &Port, state: &mut PortState) {
    state.intr_vec = None;
}

//==============================================================================
// Status Handler
//==============================================================================

/// Drains and acknowledges pending asynchronous events, refreshing the link
/// state on port changes. An inconsistent link reading (speed without
/// status, or status without speed) schedules a single deferred re-check
/// instead of reporting anything.
fn priv_dev_status_handler(port: &Port, state: &mut PortState) -> Vec<PortEvent> {
    let mut events: Vec<PortEvent> = Vec::new();
    let mut port_change: bool = false;
    // Read all messages and acknowledge them.
    while let Some(event) = port.ctx.get_async_event() {
        match event {
            AsyncEvent::PortActive(_) | AsyncEvent::PortErr(_) if state.active_intr.lsc => {
                port_change = true;
            },
            AsyncEvent::DeviceFatal if state.active_intr.rmv => {
                events.push(PortEvent::Removal);
            },
            other => debug!("port {}: event {:?} not handled", port.port_id, other),
        }
        port.ctx.ack_async_event(&event);
    }
    if !port_change {
        return events;
    }
    let _ = super::priv_link_update(port, state);
    let link = state.link;
    if (link.link_speed == 0 && link.link_status) || (link.link_speed != 0 && !link.link_status) {
        if state.pending_alarm.is_none() {
            // Inconsistent status, check again later.
            state.pending_alarm = Some(Instant::now() + ALARM_TIMEOUT);
        }
    } else {
        events.push(PortEvent::LinkStatusChange);
    }
    events
}

//==============================================================================
// Port Surface
//==============================================================================

impl Port {
    /// Handles pending device interrupts, returning the events the host
    /// framework must be told about.
    pub fn handle_async_events(&self) -> Vec<PortEvent> {
        let _guard = self.ctrl.lock();
        let mut state = self.state.borrow_mut();
        priv_dev_status_handler(self, &mut state)
    }

    /// Runs the deferred link-status re-check when due. At most one
    /// re-check is ever pending.
    pub fn poll_alarm(&self, now: Instant) -> Vec<PortEvent> {
        let _guard = self.ctrl.lock();
        let mut state = self.state.borrow_mut();
        match state.pending_alarm {
            Some(deadline) if now >= deadline => {
                state.pending_alarm = None;
                priv_dev_status_handler(self, &mut state)
            },
            _ => Vec::new(),
        }
    }

    pub fn has_pending_alarm(&self) -> bool {
        self.state.borrow().pending_alarm.is_some()
    }

    /// Arms the Rx interrupt of one queue.
    pub fn rx_intr_enable(&self, idx: u16) -> Result<(), Fail> {
        let rxq: Option<Rc<RefCell<Rxq>>> = {
            let state = self.state.borrow();
            state.rxqs.get(idx as usize).cloned().flatten()
        };
        let result: Result<(), Fail> = match rxq {
            Some(rxq) => rxq.borrow().intr_enable(),
            None => Err(Fail::new(libc::EINVAL, "no such Rx queue")),
        };
        if result.is_err() {
            warn!("port {}: unable to arm interrupt on rx queue {}", self.port_id, idx);
        }
        result
    }

    /// Consumes and acknowledges one pending Rx interrupt event.
    pub fn rx_intr_disable(&self, idx: u16) -> Result<(), Fail> {
        let rxq: Option<Rc<RefCell<Rxq>>> = {
            let state = self.state.borrow();
            state.rxqs.get(idx as usize).cloned().flatten()
        };
        let result: Result<(), Fail> = match rxq {
            Some(rxq) => rxq.borrow().intr_disable(),
            None => Err(Fail::new(libc::EINVAL, "no such Rx queue")),
        };
        if result.is_err() {
            warn!(
                "port {}: unable to disable interrupt on rx queue {}",
                self.port_id, idx
            );
        }
        result
    }

    /// Interrupt-vector entry of a queue, when the vector is enabled.
    pub fn rx_intr_vec_entry(&self, idx: u16) -> Option<usize> {
        let state = self.state.borrow();
        state
            .intr_vec
            .as_ref()
            .and_then(|vec| vec.get(idx as usize).copied().flatten())
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
