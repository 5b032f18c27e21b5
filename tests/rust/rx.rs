// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Rx data-path tests: single-segment and scattered receive, replacement
//! back-pressure, error completions, the MTU-driven rehash, and per-queue
//! interrupts.

use cx3_pmd::{
    runtime::memory::Mempool,
    test,
    IntrConf,
    RxDispatch,
    RxMode,
};
use cx3_pmd::verbs::QpHandle;

fn scatter_mode(max_rx_pkt_len: u32) -> RxMode {
    RxMode {
        max_rx_pkt_len,
        enable_scatter: true,
    }
}

//==============================================================================
// Single-Segment Receive
//==============================================================================

#[test]
fn single_segment_delivery() {
    let mp: Mempool = test::pool("rx", 256, 2048);
    let rig = test::rig_with_rx(128, RxMode::default(), &mp);
    let qp: QpHandle = rig.port.rxq_qp(0).unwrap();
    assert_eq!(rig.dev.posted_recv(qp), 128);
    assert_eq!(rig.port.rx_dispatch(), RxDispatch::SingleSeg);

    for seed in 0..3u8 {
        rig.dev.deliver(qp, &test::payload(200, seed)).unwrap();
    }
    let pkts = rig.port.rx_burst(0, 32);
    assert_eq!(pkts.len(), 3);
    for (i, pkt) in pkts.iter().enumerate() {
        assert_eq!(pkt.data(), test::payload(200, i as u8).as_slice());
        assert_eq!(pkt.pkt_len(), 200);
        assert_eq!(pkt.nb_segs(), 1);
        assert_eq!(pkt.port(), rig.port.port_id());
    }
    // Every consumed slot was reposted with a replacement buffer.
    assert_eq!(rig.dev.posted_recv(qp), 128);
    let stats = rig.port.rxq_stats(0).unwrap();
    assert_eq!(stats.ipackets, 3);
    assert_eq!(stats.ibytes, 600);
}

#[test]
fn empty_cq_returns_no_packets() {
    let mp: Mempool = test::pool("idle", 256, 2048);
    let rig = test::rig_with_rx(128, RxMode::default(), &mp);
    assert!(rig.port.rx_burst(0, 32).is_empty());
}

/// Replacement exhaustion: the frame is lost, the WR is reposted with its
/// original buffer, and `rx_nombuf` counts the failure.
#[test]
fn pool_exhaustion_reposts_original_buffer() {
    // The ring consumes the entire pool, leaving nothing for replacements.
    let mp: Mempool = test::pool("tight", 128, 2048);
    let rig = test::rig_with_rx(128, RxMode::default(), &mp);
    let qp: QpHandle = rig.port.rxq_qp(0).unwrap();
    assert_eq!(mp.free_count(), 0);

    rig.dev.deliver(qp, &test::payload(64, 1)).unwrap();
    let pkts = rig.port.rx_burst(0, 32);
    assert!(pkts.is_empty());
    let stats = rig.port.rxq_stats(0).unwrap();
    assert_eq!(stats.rx_nombuf, 1);
    assert_eq!(stats.ipackets, 0);
    assert_eq!(rig.dev.posted_recv(qp), 128);
    assert_eq!(rig.port.stats_get().rx_mbuf_alloc_failed, 1);
    // The ring still owns every buffer of the pool.
    assert_eq!(mp.in_use(), 128);
}

/// A completion with an error status is counted and its WR reposted.
#[test]
fn bad_completion_is_dropped_and_reposted() {
    let mp: Mempool = test::pool("bad", 256, 2048);
    let rig = test::rig_with_rx(128, RxMode::default(), &mp);
    let qp: QpHandle = rig.port.rxq_qp(0).unwrap();
    rig.dev.deliver_bad(qp).unwrap();
    rig.dev.deliver(qp, &test::payload(64, 5)).unwrap();
    let pkts = rig.port.rx_burst(0, 32);
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0].data(), test::payload(64, 5).as_slice());
    let stats = rig.port.rxq_stats(0).unwrap();
    assert_eq!(stats.idropped, 1);
    assert_eq!(stats.ipackets, 1);
    assert_eq!(rig.dev.posted_recv(qp), 128);
}

//==============================================================================
// Scattered Receive
//==============================================================================

/// A frame larger than one buffer comes back as a chain: full headroom on
/// the first segment, none on the rest.
#[test]
fn scattered_delivery_reassembles_chain() {
    let mp: Mempool = test::pool("sp", 256, 1024);
    let rig = test::rig_with_rx(128, scatter_mode(2048), &mp);
    assert_eq!(rig.port.rxq_is_scattered(0), Some(true));
    assert_eq!(rig.port.rx_dispatch(), RxDispatch::Scattered);
    let qp: QpHandle = rig.port.rxq_qp(0).unwrap();
    // 128 requested descriptors collapse into 32 scattered WRs.
    assert_eq!(rig.dev.posted_recv(qp), 32);

    let frame: Vec<u8> = test::payload(2000, 9);
    rig.dev.deliver(qp, &frame).unwrap();
    let pkts = rig.port.rx_burst(0, 32);
    assert_eq!(pkts.len(), 1);
    let head = &pkts[0];
    assert_eq!(head.pkt_len(), 2000);
    // First segment keeps its headroom: 1024 - 128 = 896 bytes of data.
    assert_eq!(head.data_len(), 896);
    assert_eq!(head.nb_segs(), 3);
    assert_eq!(test::chain_bytes(head), frame);
    assert_eq!(rig.dev.posted_recv(qp), 32);
    assert_eq!(rig.port.rxq_stats(0).unwrap().ibytes, 2000);
}

/// Mid-packet replacement failure frees the partial chain and reposts.
#[test]
fn scattered_pool_exhaustion_frees_partial_chain() {
    // 32 WRs * 4 segments consume 128 buffers exactly.
    let mp: Mempool = test::pool("sp-tight", 128, 1024);
    let rig = test::rig_with_rx(128, scatter_mode(2048), &mp);
    let qp: QpHandle = rig.port.rxq_qp(0).unwrap();
    assert_eq!(mp.free_count(), 0);

    rig.dev.deliver(qp, &test::payload(2000, 3)).unwrap();
    let pkts = rig.port.rx_burst(0, 32);
    assert!(pkts.is_empty());
    let stats = rig.port.rxq_stats(0).unwrap();
    assert_eq!(stats.rx_nombuf, 1);
    // Nothing leaked: the ring still owns every buffer.
    assert_eq!(mp.in_use(), 128);
    assert_eq!(rig.dev.posted_recv(qp), 32);
}

//==============================================================================
// MTU Rehash
//==============================================================================

/// Raising the MTU over the buffer size flips the queue to the scattered
/// variant in place, reusing the mbufs it already holds.
#[test]
fn mtu_increase_switches_to_scattered() {
    let mp: Mempool = test::pool("rehash", 256, 2048);
    let rig = test::rig_with_rx(128, scatter_mode(1518), &mp);
    assert_eq!(rig.port.rxq_is_scattered(0), Some(false));
    assert_eq!(rig.port.rx_dispatch(), RxDispatch::SingleSeg);
    let in_use_before: usize = mp.in_use();

    rig.port.mtu_set(9000).unwrap();
    assert_eq!(rig.port.mtu(), 9000);
    assert_eq!(rig.port.rxq_is_scattered(0), Some(true));
    assert_eq!(rig.port.rx_dispatch(), RxDispatch::Scattered);
    // The rehash allocates nothing and leaks nothing.
    assert_eq!(mp.in_use(), in_use_before);
    assert_eq!(rig.port.rxq_stats(0).unwrap().rx_nombuf, 0);

    // The reconfigured queue receives scattered frames.
    let qp: QpHandle = rig.port.rxq_qp(0).unwrap();
    assert_eq!(rig.dev.posted_recv(qp), 32);
    let frame: Vec<u8> = test::payload(4000, 7);
    rig.dev.deliver(qp, &frame).unwrap();
    let pkts = rig.port.rx_burst(0, 32);
    assert_eq!(pkts.len(), 1);
    assert_eq!(test::chain_bytes(&pkts[0]), frame);
}

/// Lowering the MTU back flips the queue to single-segment again.
#[test]
fn mtu_decrease_switches_back() {
    let mp: Mempool = test::pool("rehash2", 256, 2048);
    let rig = test::rig_with_rx(128, scatter_mode(9018), &mp);
    assert_eq!(rig.port.rxq_is_scattered(0), Some(true));
    rig.port.mtu_set(1500).unwrap();
    assert_eq!(rig.port.rxq_is_scattered(0), Some(false));
    let qp: QpHandle = rig.port.rxq_qp(0).unwrap();
    assert_eq!(rig.dev.posted_recv(qp), 128);
    rig.dev.deliver(qp, &test::payload(512, 2)).unwrap();
    assert_eq!(rig.port.rx_burst(0, 32).len(), 1);
}

/// A same-mode MTU change leaves the queue untouched.
#[test]
fn mtu_change_without_mode_flip_is_noop() {
    let mp: Mempool = test::pool("same", 256, 2048);
    let rig = test::rig_with_rx(128, RxMode::default(), &mp);
    rig.port.mtu_set(1400).unwrap();
    assert_eq!(rig.port.rxq_is_scattered(0), Some(false));
    assert_eq!(rig.dev.posted_recv(rig.port.rxq_qp(0).unwrap()), 128);
}

//==============================================================================
// Tx/Rx Round Trip
//==============================================================================

/// A scattered frame delivered by Rx, resegmented and sent back through Tx,
/// reproduces the same bytes on the wire.
#[test]
fn scattered_rx_to_tx_roundtrip() {
    let mp: Mempool = test::pool("loop", 256, 1024);
    let dev = test::transport();
    let port = test::port(&dev);
    port.configure(1, 1, scatter_mode(4096), IntrConf::default()).unwrap();
    port.rx_queue_setup(0, 128, &mp).unwrap();
    port.tx_queue_setup(0, 128, &Default::default()).unwrap();

    let frame: Vec<u8> = test::payload(3000, 11);
    let qp: QpHandle = port.rxq_qp(0).unwrap();
    dev.deliver(qp, &frame).unwrap();
    let mut pkts: Vec<_> = port.rx_burst(0, 4).into_iter().collect();
    assert_eq!(pkts.len(), 1);
    assert_eq!(test::chain_bytes(&pkts[0]), frame);

    assert_eq!(port.tx_burst(0, &mut pkts), 1);
    assert_eq!(dev.transmitted()[0], frame);
}

//==============================================================================
// Rx Interrupts
//==============================================================================

#[test]
fn rx_interrupt_arm_and_ack() {
    let mp: Mempool = test::pool("intr", 256, 2048);
    let dev = test::transport();
    let port = test::port(&dev);
    port.configure(
        1,
        0,
        RxMode::default(),
        IntrConf {
            rxq: true,
            ..Default::default()
        },
    )
    .unwrap();
    port.rx_queue_setup(0, 128, &mp).unwrap();
    port.start().unwrap();
    assert_eq!(port.rx_intr_vec_entry(0), Some(0));

    port.rx_intr_enable(0).unwrap();
    let qp: QpHandle = port.rxq_qp(0).unwrap();
    dev.deliver(qp, &test::payload(64, 0)).unwrap();
    // One event is pending; disabling consumes and acknowledges it.
    port.rx_intr_disable(0).unwrap();
    // No event left.
    assert!(port.rx_intr_disable(0).is_err());
}

/// Queues without a completion channel cannot arm interrupts.
#[test]
fn rx_interrupt_requires_channel() {
    let mp: Mempool = test::pool("nochan", 256, 2048);
    let rig = test::rig_with_rx(128, RxMode::default(), &mp);
    assert!(rig.port.rx_intr_enable(0).is_err());
}
