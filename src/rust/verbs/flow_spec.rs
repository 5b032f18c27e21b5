// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Packed flow-specification records. These mirror the Verbs ABI byte
//! layout: a header immediately followed by per-layer spec records, with no
//! padding anywhere. Sizes are checked against the ABI constants at compile
//! time.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::{
    mem,
    ptr,
    slice,
};

//==============================================================================
// Constants
//==============================================================================

/// Flow attribute types.
pub const FLOW_ATTR_NORMAL: u32 = 0;
pub const FLOW_ATTR_ALL_DEFAULT: u32 = 1;

/// ABI sizes in bytes.
pub const FLOW_ATTR_SIZE: usize = 14;
pub const FLOW_SPEC_ETH_SIZE: usize = 38;
pub const FLOW_SPEC_IPV4_SIZE: usize = 22;
pub const FLOW_SPEC_TCP_UDP_SIZE: usize = 14;

//==============================================================================
// Enumerations
//==============================================================================

/// Spec record discriminators.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum FlowSpecType {
    Eth = 0x20,
    Ipv4 = 0x30,
    Tcp = 0x40,
    Udp = 0x41,
}

//==============================================================================
// Structures
//==============================================================================

/// Header preceding all spec records.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct FlowAttr {
    pub attr_type: u32,
    pub size: u16,
    pub priority: u16,
    pub num_of_specs: u8,
    pub port: u8,
    pub flags: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EthFilter {
    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub ether_type: u16,
    /// VLAN TCI, big-endian on the wire.
    pub vlan_tag: u16,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct FlowSpecEth {
    pub spec_type: u32,
    pub size: u16,
    pub val: EthFilter,
    pub mask: EthFilter,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Ipv4Filter {
    /// Big-endian addresses.
    pub src_ip: u32,
    pub dst_ip: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct FlowSpecIpv4 {
    pub spec_type: u32,
    pub size: u16,
    pub val: Ipv4Filter,
    pub mask: Ipv4Filter,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpUdpFilter {
    /// Big-endian ports.
    pub dst_port: u16,
    pub src_port: u16,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct FlowSpecTcpUdp {
    pub spec_type: u32,
    pub size: u16,
    pub val: TcpUdpFilter,
    pub mask: TcpUdpFilter,
}

// The layouts above are the wire contract; a size drift is an ABI break.
const _: () = assert!(mem::size_of::<FlowAttr>() == FLOW_ATTR_SIZE);
const _: () = assert!(mem::size_of::<FlowSpecEth>() == FLOW_SPEC_ETH_SIZE);
const _: () = assert!(mem::size_of::<FlowSpecIpv4>() == FLOW_SPEC_IPV4_SIZE);
const _: () = assert!(mem::size_of::<FlowSpecTcpUdp>() == FLOW_SPEC_TCP_UDP_SIZE);

//==============================================================================
// Spec Buffer
//==============================================================================

/// Byte buffer holding one packed flow specification: header plus appended
/// spec records, contiguous and unpadded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowSpecBuf {
    buf: Vec<u8>,
}

impl FlowSpecBuf {
    /// Starts a buffer with the given header and room for `spec_bytes` of
    /// spec records.
    pub fn new(attr: FlowAttr, spec_bytes: usize) -> Self {
        let mut buf: Vec<u8> = Vec::with_capacity(FLOW_ATTR_SIZE + spec_bytes);
        buf.extend_from_slice(unsafe { as_bytes(&attr) });
        Self { buf }
    }

    pub fn attr(&self) -> FlowAttr {
        unsafe { ptr::read_unaligned(self.buf.as_ptr() as *const FlowAttr) }
    }

    /// Reads, updates, and writes back the header.
    pub fn update_attr<F: FnOnce(&mut FlowAttr)>(&mut self, f: F) {
        let mut attr: FlowAttr = self.attr();
        f(&mut attr);
        self.buf[..FLOW_ATTR_SIZE].copy_from_slice(unsafe { as_bytes(&attr) });
    }

    /// Appends one packed record and returns its byte offset.
    pub fn push<T: Copy>(&mut self, rec: &T) -> usize {
        let offset: usize = self.buf.len();
        self.buf.extend_from_slice(unsafe { as_bytes(rec) });
        offset
    }

    /// Reads a packed record back from `offset`.
    pub fn read_at<T: Copy>(&self, offset: usize) -> T {
        debug_assert!(offset + mem::size_of::<T>() <= self.buf.len());
        unsafe { ptr::read_unaligned(self.buf.as_ptr().add(offset) as *const T) }
    }

    /// Overwrites a packed record at `offset`.
    pub fn write_at<T: Copy>(&mut self, offset: usize, rec: &T) {
        debug_assert!(offset + mem::size_of::<T>() <= self.buf.len());
        self.buf[offset..offset + mem::size_of::<T>()].copy_from_slice(unsafe { as_bytes(rec) });
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Raw bytes of a packed record. Only sound for `repr(C, packed)` types with
/// no padding and no pointers, which is all this module defines.
unsafe fn as_bytes<T: Copy>(rec: &T) -> &[u8] {
    slice::from_raw_parts(rec as *const T as *const u8, mem::size_of::<T>())
}

//==============================================================================
// Validation
//==============================================================================

/// Summary of a parsed packed specification.
#[derive(Clone, Debug)]
pub struct PackedFlowSummary {
    pub attr_type: u32,
    pub priority: u16,
    pub num_of_specs: u8,
    pub port: u8,
    pub spec_types: Vec<FlowSpecType>,
}

/// Walks a packed buffer and checks its structure: header size, record
/// sizes, record count, and exact total length.
pub fn validate_packed(buf: &[u8]) -> Result<PackedFlowSummary, Fail> {
    if buf.len() < FLOW_ATTR_SIZE {
        return Err(Fail::new(libc::EINVAL, "flow spec shorter than its header"));
    }
    let attr: FlowAttr = unsafe { ptr::read_unaligned(buf.as_ptr() as *const FlowAttr) };
    if attr.size as usize != FLOW_ATTR_SIZE {
        return Err(Fail::new(libc::EINVAL, "flow attr size mismatch"));
    }
    let mut offset: usize = FLOW_ATTR_SIZE;
    let mut spec_types: Vec<FlowSpecType> = Vec::with_capacity(attr.num_of_specs as usize);
    while offset < buf.len() {
        if offset + 6 > buf.len() {
            return Err(Fail::new(libc::EINVAL, "truncated flow spec record"));
        }
        let raw_type: u32 = unsafe { ptr::read_unaligned(buf.as_ptr().add(offset) as *const u32) };
        let size: u16 = unsafe { ptr::read_unaligned(buf.as_ptr().add(offset + 4) as *const u16) };
        let spec_type: FlowSpecType = FlowSpecType::from_u32(raw_type)
            .ok_or_else(|| Fail::new(libc::EINVAL, "unknown flow spec record type"))?;
        let expected: usize = match spec_type {
            FlowSpecType::Eth => FLOW_SPEC_ETH_SIZE,
            FlowSpecType::Ipv4 => FLOW_SPEC_IPV4_SIZE,
            FlowSpecType::Tcp | FlowSpecType::Udp => FLOW_SPEC_TCP_UDP_SIZE,
        };
        if size as usize != expected || offset + expected > buf.len() {
            return Err(Fail::new(libc::EINVAL, "flow spec record size mismatch"));
        }
        spec_types.push(spec_type);
        offset += expected;
    }
    if spec_types.len() != attr.num_of_specs as usize {
        return Err(Fail::new(libc::EINVAL, "flow spec record count mismatch"));
    }
    Ok(PackedFlowSummary {
        attr_type: attr.attr_type,
        priority: attr.priority,
        num_of_specs: attr.num_of_specs,
        port: attr.port,
        spec_types,
    })
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn header(num_of_specs: u8) -> FlowAttr {
        FlowAttr {
            attr_type: FLOW_ATTR_NORMAL,
            size: FLOW_ATTR_SIZE as u16,
            priority: 2,
            num_of_specs,
            port: 1,
            flags: 0,
        }
    }

    #[test]
    fn header_plus_eth_record_parses() {
        let mut buf: FlowSpecBuf = FlowSpecBuf::new(header(1), FLOW_SPEC_ETH_SIZE);
        let eth: FlowSpecEth = FlowSpecEth {
            spec_type: FlowSpecType::Eth as u32,
            size: FLOW_SPEC_ETH_SIZE as u16,
            val: EthFilter::default(),
            mask: EthFilter::default(),
        };
        buf.push(&eth);
        assert_eq!(buf.len(), FLOW_ATTR_SIZE + FLOW_SPEC_ETH_SIZE);
        let summary: PackedFlowSummary = validate_packed(buf.as_bytes()).unwrap();
        assert_eq!(summary.num_of_specs, 1);
        assert_eq!(summary.spec_types, vec![FlowSpecType::Eth]);
    }

    #[test]
    fn record_count_mismatch_is_rejected() {
        let buf: FlowSpecBuf = FlowSpecBuf::new(header(1), 0);
        assert!(validate_packed(buf.as_bytes()).is_err());
    }

    #[test]
    fn truncated_record_is_rejected() {
        let mut buf: FlowSpecBuf = FlowSpecBuf::new(header(1), 4);
        buf.push(&0u32);
        assert!(validate_packed(buf.as_bytes()).is_err());
    }

    #[test]
    fn record_roundtrips_through_buffer() {
        let mut buf: FlowSpecBuf = FlowSpecBuf::new(header(1), FLOW_SPEC_IPV4_SIZE);
        let ipv4: FlowSpecIpv4 = FlowSpecIpv4 {
            spec_type: FlowSpecType::Ipv4 as u32,
            size: FLOW_SPEC_IPV4_SIZE as u16,
            val: Ipv4Filter {
                src_ip: 0x0a000001u32.to_be(),
                dst_ip: 0x0a000002u32.to_be(),
            },
            mask: Ipv4Filter {
                src_ip: u32::MAX,
                dst_ip: u32::MAX,
            },
        };
        let offset: usize = buf.push(&ipv4);
        let back: FlowSpecIpv4 = buf.read_at(offset);
        assert_eq!({ back.val.src_ip }, { ipv4.val.src_ip });
        assert_eq!({ back.mask.dst_ip }, u32::MAX);
    }
}
