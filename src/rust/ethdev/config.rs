// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use super::{
    INLINE_RECV_SIZE_ENV,
    PORT_KVARG,
};
use crate::runtime::fail::Fail;

//==============================================================================
// Structures
//==============================================================================

/// Probe-time driver configuration derived from device arguments and the
/// environment.
#[derive(Clone, Copy, Debug)]
pub struct DriverConf {
    /// Bit-field of physical ports present on the device.
    pub ports_present: u32,
    /// Bit-field of ports enabled by the `port=` kvargs.
    pub ports_enabled: u32,
    /// Requested inline-receive size, before clamping by device caps.
    pub inline_recv_size: u32,
}

/// Tx queue configuration block.
#[derive(Clone, Copy, Debug, Default)]
pub struct TxConf {
    /// Largest payload to send inline; the device may clamp it.
    pub max_inline: u32,
}

/// Port-level Rx configuration.
#[derive(Clone, Copy, Debug)]
pub struct RxMode {
    /// Largest receive frame the port must accept.
    pub max_rx_pkt_len: u32,
    /// Allow scattered receive elements when a frame exceeds one mbuf.
    pub enable_scatter: bool,
}

impl Default for RxMode {
    fn default() -> Self {
        Self {
            max_rx_pkt_len: 1518,
            enable_scatter: false,
        }
    }
}

/// Interrupt configuration requested by the host framework.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntrConf {
    /// Link-status-change interrupts.
    pub lsc: bool,
    /// Device-removal interrupts.
    pub rmv: bool,
    /// Per-queue Rx interrupts.
    pub rxq: bool,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl DriverConf {
    /// Parses a comma-separated `key=value` device-argument string. The only
    /// recognized key is `port=<index>`; every occurrence enables one
    /// physical port. No occurrence enables all present ports.
    pub fn parse(devargs: Option<&str>, phys_port_cnt: u8) -> Result<Self, Fail> {
        let ports: u32 = phys_port_cnt as u32;
        let present: u32 = if ports >= 32 { u32::MAX } else { (1u32 << ports) - 1 };
        let mut enabled: u32 = 0;
        if let Some(args) = devargs {
            for kv in args.split(',').filter(|s| !s.is_empty()) {
                let (key, val) = match kv.split_once('=') {
                    Some(pair) => pair,
                    None => {
                        warn!("\"{}\": missing value", kv);
                        return Err(Fail::new(libc::EINVAL, "malformed device argument"));
                    },
                };
                if key != PORT_KVARG {
                    warn!("{}: unknown parameter", key);
                    return Err(Fail::new(libc::EINVAL, "unknown device argument"));
                }
                let idx: u32 = match val.parse() {
                    Ok(idx) => idx,
                    Err(_) => {
                        warn!("{}: \"{}\" is not a valid integer", key, val);
                        return Err(Fail::new(libc::EINVAL, "invalid port index"));
                    },
                };
                if idx >= ports || present & (1 << idx) == 0 {
                    error!("port index {} outside range [0,{})", idx, ports);
                    return Err(Fail::new(libc::EINVAL, "port index out of range"));
                }
                enabled |= 1 << idx;
            }
        }
        // Use all ports when none are defined.
        if enabled == 0 {
            enabled = present;
        }
        Ok(Self {
            ports_present: present,
            ports_enabled: enabled,
            inline_recv_size: getenv_int(INLINE_RECV_SIZE_ENV),
        })
    }
}

/// Integer value of an environment variable, 0 when unset or unparsable.
fn getenv_int(name: &str) -> u32 {
    match std::env::var(name) {
        Ok(val) => val.trim().parse().unwrap_or(0),
        Err(_) => 0,
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::DriverConf;

    #[test]
    fn no_devargs_enables_all_ports() {
        let conf: DriverConf = DriverConf::parse(None, 2).unwrap();
        assert_eq!(conf.ports_present, 0b11);
        assert_eq!(conf.ports_enabled, 0b11);
    }

    #[test]
    fn port_kvarg_accumulates_bits() {
        let conf: DriverConf = DriverConf::parse(Some("port=1"), 2).unwrap();
        assert_eq!(conf.ports_enabled, 0b10);
        let conf: DriverConf = DriverConf::parse(Some("port=0,port=1"), 2).unwrap();
        assert_eq!(conf.ports_enabled, 0b11);
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        assert!(DriverConf::parse(Some("port=2"), 2).is_err());
    }

    #[test]
    fn unknown_kvarg_is_rejected() {
        assert!(DriverConf::parse(Some("speed=100"), 2).is_err());
    }
}
