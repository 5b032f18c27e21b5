// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! User-space Ethernet poll-mode driver core for ConnectX-3 class adapters
//! over a Verbs-style interface: Tx/Rx descriptor rings, queue lifecycle,
//! memory-region caching, and a flow-steering rule compiler.

#[macro_use]
extern crate log;

mod ethdev;
pub mod runtime;
pub mod verbs;

//==============================================================================
// Exports
//==============================================================================

pub use self::ethdev::{
    probe,
    DevInfo,
    DriverConf,
    EthLink,
    EthPattern,
    FilterOp,
    FilterType,
    FlowAction,
    FlowAttrDesc,
    FlowRuleHandle,
    IntrConf,
    Ipv4Pattern,
    ItemDesc,
    L4Pattern,
    PatternItem,
    Port,
    PortEvent,
    PortStats,
    RxDispatch,
    RxMode,
    RxqStats,
    TxConf,
    TxDispatch,
    TxqStats,
    VlanPattern,
    ALARM_TIMEOUT,
    ETHER_HDR_LEN,
    INLINE_RECV_SIZE_ENV,
    LINEAR_BUF_SIZE,
    MAX_BURST,
    PORT_KVARG,
    SGE_WR_N,
    TX_MP_CACHE,
    TX_PER_COMP_REQ,
};
