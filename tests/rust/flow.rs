// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Flow engine tests: attribute/item/action validation, packed spec
//! compilation, deferred installation, the shared drop queue, and RSS
//! parent sharing.

use cx3_pmd::{
    runtime::memory::Mempool,
    test,
    verbs::flow_spec::{
        validate_packed,
        FlowSpecType,
        FLOW_ATTR_SIZE,
        FLOW_SPEC_ETH_SIZE,
        FLOW_SPEC_IPV4_SIZE,
        FLOW_SPEC_TCP_UDP_SIZE,
    },
    EthPattern,
    FlowAction,
    FlowAttrDesc,
    FlowRuleHandle,
    IntrConf,
    Ipv4Pattern,
    ItemDesc,
    L4Pattern,
    PatternItem,
    Port,
    RxMode,
    VlanPattern,
};
use eui48::MacAddress;
use std::net::Ipv4Addr;
use std::rc::Rc;

//==============================================================================
// Builders
//==============================================================================

fn mac(last: u8) -> MacAddress {
    MacAddress::new([0x02, 0, 0, 0, 0, last])
}

fn eth_item() -> PatternItem {
    PatternItem::Eth(ItemDesc {
        spec: Some(EthPattern {
            dst: mac(1),
            src: mac(2),
        }),
        last: None,
        mask: None,
    })
}

fn eth_null_item() -> PatternItem {
    PatternItem::Eth(ItemDesc::default())
}

fn ipv4_item() -> PatternItem {
    PatternItem::Ipv4(ItemDesc {
        spec: Some(Ipv4Pattern {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
        }),
        last: None,
        mask: None,
    })
}

fn udp_item() -> PatternItem {
    PatternItem::Udp(ItemDesc {
        spec: Some(L4Pattern {
            src_port: 1234,
            dst_port: 4321,
        }),
        last: None,
        mask: None,
    })
}

fn queue0() -> Vec<FlowAction> {
    vec![FlowAction::Queue { index: 0 }]
}

/// A port with `n` configured Rx queues over a fresh pool.
fn flow_rig(n: u16, isolated: bool) -> (Rc<cx3_pmd::verbs::loopback::LoopbackVerbs>, Port, Mempool) {
    let dev = test::transport();
    let port: Port = test::port(&dev);
    if isolated {
        port.flow_isolate(true).unwrap();
    }
    port.configure(n, 0, RxMode::default(), IntrConf::default()).unwrap();
    let mp: Mempool = test::pool("flows", 1024, 2048);
    for i in 0..n {
        port.rx_queue_setup(i, 128, &mp).unwrap();
    }
    (dev, port, mp)
}

//==============================================================================
// Attribute Validation
//==============================================================================

#[test]
fn nonzero_group_is_rejected() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc {
        group: 1,
        ..Default::default()
    };
    assert!(port.flow_validate(&attr, &[eth_item()], &queue0()).is_err());
}

#[test]
fn nonzero_priority_is_rejected() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc {
        priority: 1,
        ..Default::default()
    };
    assert!(port.flow_validate(&attr, &[eth_item()], &queue0()).is_err());
}

#[test]
fn egress_is_rejected() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc {
        egress: true,
        ..Default::default()
    };
    assert!(port.flow_validate(&attr, &[eth_item()], &queue0()).is_err());
}

#[test]
fn ingress_is_required() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc {
        ingress: false,
        ..Default::default()
    };
    assert!(port.flow_validate(&attr, &[eth_item()], &queue0()).is_err());
}

//==============================================================================
// Item Validation
//==============================================================================

#[test]
fn pattern_must_start_with_eth() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc::default();
    assert!(port.flow_validate(&attr, &[ipv4_item()], &queue0()).is_err());
    assert!(port.flow_validate(&attr, &[], &queue0()).is_err());
}

#[test]
fn out_of_order_items_are_rejected() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc::default();
    // UDP directly after ETH skips the IPv4 layer.
    assert!(port
        .flow_validate(&attr, &[eth_item(), udp_item()], &queue0())
        .is_err());
    // Nothing may follow UDP.
    assert!(port
        .flow_validate(&attr, &[eth_item(), ipv4_item(), udp_item(), udp_item()], &queue0())
        .is_err());
}

#[test]
fn null_eth_spec_must_be_the_only_item() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc::default();
    assert!(port.flow_validate(&attr, &[eth_null_item()], &queue0()).is_ok());
    assert!(port
        .flow_validate(&attr, &[eth_null_item(), ipv4_item()], &queue0())
        .is_err());
}

#[test]
fn partial_dst_mac_mask_is_rejected() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc::default();
    let item = PatternItem::Eth(ItemDesc {
        spec: Some(EthPattern {
            dst: mac(1),
            src: mac(2),
        }),
        last: None,
        mask: Some(EthPattern {
            dst: MacAddress::new([0xff, 0xff, 0xff, 0xff, 0xff, 0x00]),
            src: mac(0),
        }),
    });
    assert!(port.flow_validate(&attr, &[item], &queue0()).is_err());
}

#[test]
fn vlan_tci_mask_must_be_all_or_nothing() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc::default();
    let vlan = |mask: u16| {
        PatternItem::Vlan(ItemDesc {
            spec: Some(VlanPattern { tci: 0x0123 }),
            last: None,
            mask: Some(VlanPattern { tci: mask }),
        })
    };
    assert!(port
        .flow_validate(&attr, &[eth_item(), vlan(0x0ff0)], &queue0())
        .is_err());
    assert!(port
        .flow_validate(&attr, &[eth_item(), vlan(0x0fff)], &queue0())
        .is_ok());
    assert!(port
        .flow_validate(&attr, &[eth_item(), vlan(0)], &queue0())
        .is_ok());
}

#[test]
fn ipv4_prefix_masks_are_rejected() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc::default();
    let item = PatternItem::Ipv4(ItemDesc {
        spec: Some(Ipv4Pattern {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
        }),
        last: None,
        mask: Some(Ipv4Pattern {
            src: Ipv4Addr::new(255, 255, 255, 0),
            dst: Ipv4Addr::new(255, 255, 255, 255),
        }),
    });
    assert!(port.flow_validate(&attr, &[eth_item(), item], &queue0()).is_err());
}

//==============================================================================
// Action Validation
//==============================================================================

#[test]
fn exactly_one_target_is_required() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc::default();
    assert!(port.flow_validate(&attr, &[eth_item()], &[]).is_err());
    assert!(port
        .flow_validate(&attr, &[eth_item()], &[FlowAction::Void])
        .is_err());
    assert!(port
        .flow_validate(
            &attr,
            &[eth_item()],
            &[FlowAction::Drop, FlowAction::Queue { index: 0 }],
        )
        .is_err());
    assert!(port
        .flow_validate(
            &attr,
            &[eth_item()],
            &[FlowAction::Void, FlowAction::Queue { index: 0 }],
        )
        .is_ok());
}

#[test]
fn queue_index_must_be_in_range() {
    let (_dev, port, _mp) = flow_rig(2, false);
    let attr = FlowAttrDesc::default();
    assert!(port
        .flow_validate(&attr, &[eth_item()], &[FlowAction::Queue { index: 2 }])
        .is_err());
}

#[test]
fn rss_requires_isolated_mode() {
    let (_dev, port, _mp) = flow_rig(2, false);
    let attr = FlowAttrDesc::default();
    let err = port
        .flow_validate(
            &attr,
            &[eth_item()],
            &[FlowAction::Rss { queues: vec![0, 1] }],
        )
        .unwrap_err();
    assert_eq!(err.errno, libc::ENOTSUP);
}

#[test]
fn rss_queue_count_must_be_a_power_of_two() {
    let (_dev, port, _mp) = flow_rig(4, true);
    let attr = FlowAttrDesc::default();
    assert!(port
        .flow_validate(
            &attr,
            &[eth_item()],
            &[FlowAction::Rss {
                queues: vec![0, 1, 2],
            }],
        )
        .is_err());
}

#[test]
fn rss_queues_must_be_distinct() {
    let (_dev, port, _mp) = flow_rig(4, true);
    let attr = FlowAttrDesc::default();
    assert!(port
        .flow_validate(
            &attr,
            &[eth_item()],
            &[FlowAction::Rss { queues: vec![0, 0] }],
        )
        .is_err());
}

//==============================================================================
// Compilation
//==============================================================================

/// The packed buffer carries the header plus one record per layer, and the
/// header priority reflects the deepest layer converted.
#[test]
fn compiled_spec_layout_and_priority() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc::default();

    let eth_only: FlowRuleHandle = port.flow_create(&attr, &[eth_item()], &queue0()).unwrap();
    let bytes: Vec<u8> = port.flow_spec_bytes(eth_only).unwrap();
    assert_eq!(bytes.len(), FLOW_ATTR_SIZE + FLOW_SPEC_ETH_SIZE);
    let summary = validate_packed(&bytes).unwrap();
    assert_eq!(summary.priority, 2);
    assert_eq!(summary.spec_types, vec![FlowSpecType::Eth]);

    let l3: FlowRuleHandle = port
        .flow_create(&attr, &[eth_item(), ipv4_item()], &queue0())
        .unwrap();
    let bytes: Vec<u8> = port.flow_spec_bytes(l3).unwrap();
    assert_eq!(bytes.len(), FLOW_ATTR_SIZE + FLOW_SPEC_ETH_SIZE + FLOW_SPEC_IPV4_SIZE);
    let summary = validate_packed(&bytes).unwrap();
    assert_eq!(summary.priority, 1);

    let l4: FlowRuleHandle = port
        .flow_create(&attr, &[eth_item(), ipv4_item(), udp_item()], &queue0())
        .unwrap();
    let bytes: Vec<u8> = port.flow_spec_bytes(l4).unwrap();
    assert_eq!(
        bytes.len(),
        FLOW_ATTR_SIZE + FLOW_SPEC_ETH_SIZE + FLOW_SPEC_IPV4_SIZE + FLOW_SPEC_TCP_UDP_SIZE
    );
    let summary = validate_packed(&bytes).unwrap();
    assert_eq!(summary.priority, 0);
    assert_eq!(summary.spec_types, vec![
        FlowSpecType::Eth,
        FlowSpecType::Ipv4,
        FlowSpecType::Udp
    ]);
}

/// Compiling the same inputs twice yields byte-identical buffers, including
/// across a destroy.
#[test]
fn recompilation_is_byte_identical() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc::default();
    let pattern = [eth_item(), ipv4_item(), udp_item()];

    let first: FlowRuleHandle = port.flow_create(&attr, &pattern, &queue0()).unwrap();
    let first_bytes: Vec<u8> = port.flow_spec_bytes(first).unwrap();
    let second: FlowRuleHandle = port.flow_create(&attr, &pattern, &queue0()).unwrap();
    assert_eq!(first_bytes, port.flow_spec_bytes(second).unwrap());

    port.flow_destroy(first).unwrap();
    let third: FlowRuleHandle = port.flow_create(&attr, &pattern, &queue0()).unwrap();
    assert_eq!(first_bytes, port.flow_spec_bytes(third).unwrap());
}

/// The VLAN item folds into the preceding Ethernet record instead of
/// emitting its own.
#[test]
fn vlan_folds_into_eth_record() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc::default();
    let vlan = PatternItem::Vlan(ItemDesc {
        spec: Some(VlanPattern { tci: 0x0123 }),
        last: None,
        mask: None,
    });
    let handle: FlowRuleHandle = port.flow_create(&attr, &[eth_item(), vlan], &queue0()).unwrap();
    let bytes: Vec<u8> = port.flow_spec_bytes(handle).unwrap();
    // No extra record for the VLAN layer.
    assert_eq!(bytes.len(), FLOW_ATTR_SIZE + FLOW_SPEC_ETH_SIZE);
    let summary = validate_packed(&bytes).unwrap();
    assert_eq!(summary.num_of_specs, 1);
    // The TCI lands in the Ethernet record's vlan_tag field (offset 20
    // within the record), big-endian.
    let tag_off: usize = FLOW_ATTR_SIZE + 20;
    assert_eq!(&bytes[tag_off..tag_off + 2], &0x0123u16.to_be_bytes());
}

//==============================================================================
// Deferred Installation and the Drop Queue
//==============================================================================

/// Rules created on a stopped port are recorded only; starting the port
/// creates the drop queue and installs them.
#[test]
fn drop_flow_defers_until_start() {
    let (dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc::default();
    let handle: FlowRuleHandle = port
        .flow_create(&attr, &[eth_null_item()], &[FlowAction::Drop])
        .unwrap();
    assert_eq!(port.flow_is_installed(handle), Some(false));
    assert_eq!(port.flow_target_qp(handle), Some(None));
    assert_eq!(dev.flow_count(), 0);

    port.start().unwrap();
    assert_eq!(port.flow_is_installed(handle), Some(true));
    // The drop flow plus the MAC flow of queue 0.
    assert_eq!(dev.flow_count(), 2);

    port.stop().unwrap();
    assert_eq!(port.flow_is_installed(handle), Some(false));
    assert_eq!(dev.flow_count(), 0);

    // The descriptor survives the stop and reinstalls on restart.
    port.start().unwrap();
    assert_eq!(port.flow_is_installed(handle), Some(true));
    port.stop().unwrap();
}

#[test]
fn start_and_stop_are_idempotent() {
    let (_dev, port, _mp) = flow_rig(1, false);
    port.start().unwrap();
    port.start().unwrap();
    assert!(port.is_started());
    port.stop().unwrap();
    port.stop().unwrap();
    assert!(!port.is_started());
}

#[test]
fn destroying_a_destroyed_flow_succeeds() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc::default();
    let handle: FlowRuleHandle = port.flow_create(&attr, &[eth_item()], &queue0()).unwrap();
    port.flow_destroy(handle).unwrap();
    port.flow_destroy(handle).unwrap();
    assert_eq!(port.flow_count(), 0);
}

#[test]
fn flush_destroys_everything() {
    let (_dev, port, _mp) = flow_rig(1, false);
    let attr = FlowAttrDesc::default();
    port.flow_create(&attr, &[eth_item()], &queue0()).unwrap();
    port.flow_create(&attr, &[eth_item(), ipv4_item()], &queue0()).unwrap();
    assert_eq!(port.flow_count(), 2);
    port.flow_flush().unwrap();
    assert_eq!(port.flow_count(), 0);
}

/// The MAC flow tracks start/stop and MAC changes.
#[test]
fn mac_flow_follows_port_state() {
    let (dev, port, _mp) = flow_rig(1, false);
    assert_eq!(dev.flow_count(), 0);
    port.start().unwrap();
    assert_eq!(dev.flow_count(), 1);
    port.mac_addr_set(mac(0x99)).unwrap();
    assert_eq!(dev.flow_count(), 1);
    assert_eq!(port.mac(), mac(0x99));
    port.stop().unwrap();
    assert_eq!(dev.flow_count(), 0);
}

//==============================================================================
// RSS Parents
//==============================================================================

/// Identical queue sets share one parent; overlapping-but-unequal sets are
/// rejected.
#[test]
fn rss_parent_sharing_and_overlap() {
    let (_dev, port, _mp) = flow_rig(4, true);
    let attr = FlowAttrDesc::default();
    let rss = |queues: Vec<u16>| vec![FlowAction::Rss { queues }];

    let f1: FlowRuleHandle = port.flow_create(&attr, &[eth_item()], &rss(vec![0, 1])).unwrap();
    let f2: FlowRuleHandle = port.flow_create(&attr, &[eth_item()], &rss(vec![0, 1])).unwrap();
    assert_eq!(port.rss_parent_count(), 1);
    assert_eq!(port.flow_rss_parent(f1), port.flow_rss_parent(f2));

    let err = port
        .flow_create(&attr, &[eth_item()], &rss(vec![0, 2]))
        .unwrap_err();
    assert_eq!(err.errno, libc::EEXIST);
    assert!(err.cause.contains("sharing a queue between several RSS groups"));
    assert_eq!(port.rss_parent_count(), 1);
}

/// The parent disappears with the last rule referencing it.
#[test]
fn rss_parent_is_reference_counted() {
    let (_dev, port, _mp) = flow_rig(4, true);
    let attr = FlowAttrDesc::default();
    let rss = vec![FlowAction::Rss { queues: vec![0, 1] }];
    let f1: FlowRuleHandle = port.flow_create(&attr, &[eth_item()], &rss).unwrap();
    let f2: FlowRuleHandle = port.flow_create(&attr, &[eth_item()], &rss).unwrap();
    port.flow_destroy(f1).unwrap();
    assert_eq!(port.rss_parent_count(), 1);
    port.flow_destroy(f2).unwrap();
    assert_eq!(port.rss_parent_count(), 0);
}

/// A queue whose QP exists stand-alone cannot join an RSS group.
#[test]
fn standalone_queue_cannot_join_rss_group() {
    let (_dev, port, _mp) = flow_rig(4, true);
    let attr = FlowAttrDesc::default();
    // A single-queue rule creates queue 3's QP stand-alone.
    port.flow_create(&attr, &[eth_item()], &[FlowAction::Queue { index: 3 }])
        .unwrap();
    let err = port
        .flow_create(
            &attr,
            &[eth_item()],
            &[FlowAction::Rss { queues: vec![2, 3] }],
        )
        .unwrap_err();
    assert_eq!(err.errno, libc::EEXIST);
}

/// Isolated mode must be chosen before queues exist, and suppresses the
/// MAC flow.
#[test]
fn isolated_mode_ordering_and_mac_flow() {
    let (dev, port, _mp) = flow_rig(2, true);
    assert!(port.flow_isolate(false).is_err());
    port.start().unwrap();
    // No MAC flow in isolated mode, and no rules yet: only nothing.
    assert_eq!(dev.flow_count(), 0);
    port.stop().unwrap();
}
