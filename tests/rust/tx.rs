// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Tx data-path tests: ring accounting, completion coalescing, inline and
//! scatter/gather emission, linearization, and the MP to MR cache.

use cx3_pmd::{
    runtime::memory::Mempool,
    test,
    TxConf,
};

//==============================================================================
// Ring Accounting
//==============================================================================

/// A 128-slot ring accepts 127 packets in one burst (one slot stays free),
/// then drains completions and takes the remainder.
#[test]
fn single_segment_burst_fills_ring_minus_sentinel() {
    let rig = test::rig_with_tx(512, &TxConf::default());
    let mp: Mempool = test::pool("tx-pkts", 256, 2048);
    let mut pkts: Vec<_> = (0..129).map(|i| test::pkt(&mp, 64, i as u8)).collect();

    let sent: usize = rig.port.tx_burst(0, &mut pkts);
    assert_eq!(sent, 127);
    assert_eq!(pkts.len(), 2);
    assert_eq!(rig.dev.transmitted().len(), 127);

    // The prior burst left completions behind; the next call reclaims the
    // corresponding batches and accepts the rest.
    let sent: usize = rig.port.tx_burst(0, &mut pkts);
    assert_eq!(sent, 2);
    assert!(pkts.is_empty());
    let wire: Vec<Vec<u8>> = rig.dev.transmitted();
    assert_eq!(wire.len(), 129);
    for (i, frame) in wire.iter().enumerate() {
        assert_eq!(frame, &test::payload(64, i as u8), "frame {} corrupted", i);
    }

    let stats = rig.port.txq_stats(0).unwrap();
    assert_eq!(stats.opackets, 129);
    assert_eq!(stats.obytes, 129 * 64);
    assert_eq!(stats.odropped, 0);

    // Lazy free: exactly one slot was reused so far, releasing one chain.
    assert_eq!(mp.in_use(), 128);
}

/// The smallest accepted descriptor counts leave fewer than four slots; the
/// completion countdown then requests a completion on every send instead of
/// starting at zero.
#[test]
fn tiny_ring_signals_every_send() {
    // 8 requested descriptors collapse into a 2-slot ring.
    let rig = test::rig_with_tx(8, &TxConf::default());
    let mp: Mempool = test::pool("tiny-ring", 8, 2048);
    let mut pkts: Vec<_> = vec![test::pkt(&mp, 64, 1), test::pkt(&mp, 64, 2)];

    // One slot stays free, so the bursts drain one packet at a time.
    assert_eq!(rig.port.tx_burst(0, &mut pkts), 1);
    assert_eq!(pkts.len(), 1);
    assert_eq!(rig.port.tx_burst(0, &mut pkts), 1);
    assert!(pkts.is_empty());

    let wire: Vec<Vec<u8>> = rig.dev.transmitted();
    assert_eq!(wire.len(), 2);
    assert_eq!(wire[0], test::payload(64, 1));
    assert_eq!(wire[1], test::payload(64, 2));
    assert_eq!(rig.port.txq_stats(0).unwrap().opackets, 2);
}

#[test]
fn descriptor_count_must_be_sge_multiple() {
    let dev = test::transport();
    let port = test::port(&dev);
    port.configure(0, 1, Default::default(), Default::default()).unwrap();
    let err = port.tx_queue_setup(0, 510, &TxConf::default()).unwrap_err();
    assert_eq!(err.errno, libc::EINVAL);
}

#[test]
fn empty_burst_is_a_noop() {
    let rig = test::rig_with_tx(64, &TxConf::default());
    let mut pkts: Vec<_> = Vec::new();
    assert_eq!(rig.port.tx_burst(0, &mut pkts), 0);
    assert!(rig.dev.transmitted().is_empty());
}

//==============================================================================
// Inline Sends
//==============================================================================

/// Packets at or below the inline threshold bypass the MR cache entirely.
#[test]
fn small_packets_go_inline() {
    let rig = test::rig_with_tx(64, &TxConf { max_inline: 64 });
    assert_eq!(rig.port.txq_max_inline(0), Some(64));
    let mp: Mempool = test::pool("inline", 8, 2048);
    let mut pkts: Vec<_> = vec![test::pkt(&mp, 32, 7)];
    assert_eq!(rig.port.tx_burst(0, &mut pkts), 1);
    assert_eq!(rig.dev.transmitted()[0], test::payload(32, 7));
    // No MR was needed for the inline payload.
    assert_eq!(rig.port.txq_mp2mr_len(0), Some(0));
}

#[test]
fn large_packets_use_the_sge_path() {
    let rig = test::rig_with_tx(64, &TxConf { max_inline: 64 });
    let mp: Mempool = test::pool("sge", 8, 2048);
    let mut pkts: Vec<_> = vec![test::pkt(&mp, 512, 9)];
    assert_eq!(rig.port.tx_burst(0, &mut pkts), 1);
    assert_eq!(rig.dev.transmitted()[0], test::payload(512, 9));
    assert_eq!(rig.port.txq_mp2mr_len(0), Some(1));
}

//==============================================================================
// Scatter/Gather
//==============================================================================

/// A packet within the SGE limit is sent with one SGE per segment.
#[test]
fn multi_segment_packet_within_sge_limit() {
    let rig = test::rig_with_tx(64, &TxConf::default());
    let mp: Mempool = test::pool("segs", 16, 2048);
    let chain = test::seg_pkt(&mp, &[100, 200, 300], 3);
    let expected: Vec<u8> = test::chain_bytes(&chain);
    let mut pkts: Vec<_> = vec![chain];
    assert_eq!(rig.port.tx_burst(0, &mut pkts), 1);
    assert_eq!(rig.dev.transmitted()[0], expected);
}

/// Six 128-byte segments against a 4-SGE limit: three direct SGEs plus one
/// 384-byte linearized SGE, with every byte preserved.
#[test]
fn excess_segments_are_linearized() {
    let rig = test::rig_with_tx(64, &TxConf::default());
    let mp: Mempool = test::pool("linear", 16, 2048);
    let chain = test::seg_pkt(&mp, &[128; 6], 42);
    let expected: Vec<u8> = test::chain_bytes(&chain);
    assert_eq!(expected.len(), 768);
    let mut pkts: Vec<_> = vec![chain];
    assert_eq!(rig.port.tx_burst(0, &mut pkts), 1);
    let wire: Vec<Vec<u8>> = rig.dev.transmitted();
    assert_eq!(wire[0].len(), 768);
    assert_eq!(wire[0], expected);
}

/// A chain whose trailing segments exceed the linearization buffer is
/// dropped and the burst truncates.
#[test]
fn oversized_linearization_drops_the_packet() {
    let rig = test::rig_with_tx(64, &TxConf::default());
    let mp: Mempool = test::pool("huge", 32, 2048);
    // 16 segments of 1500 bytes: 13 trailing segments (19500 bytes) cannot
    // fit the 16384-byte linear buffer.
    let chain = test::seg_pkt(&mp, &[1500; 16], 1);
    let mut pkts: Vec<_> = vec![chain, test::pkt(&mp, 64, 2)];
    assert_eq!(rig.port.tx_burst(0, &mut pkts), 0);
    // The offending packet was dropped; the rest stays with the caller.
    assert_eq!(pkts.len(), 1);
    assert_eq!(rig.port.txq_stats(0).unwrap().odropped, 1);
    // The dropped chain went back to its pool.
    assert_eq!(mp.in_use(), 1);
}

//==============================================================================
// MP to MR Cache
//==============================================================================

/// Nine pools through an eight-entry cache: FIFO eviction deregisters the
/// oldest translation.
#[test]
fn mr_cache_evicts_oldest_pool() {
    let rig = test::rig_with_tx(512, &TxConf::default());
    let pools: Vec<Mempool> = (0..9)
        .map(|i| test::pool(&format!("mp{}", i), 4, 2048))
        .collect();
    let mut pkts: Vec<_> = pools.iter().map(|mp| test::pkt(mp, 64, 0)).collect();
    assert_eq!(rig.port.tx_burst(0, &mut pkts), 9);
    assert_eq!(rig.port.txq_mp2mr_len(0), Some(8));
    assert_eq!(rig.port.txq_mp2mr_contains(0, &pools[0]), Some(false));
    for mp in &pools[1..] {
        assert_eq!(rig.port.txq_mp2mr_contains(0, mp), Some(true));
    }
    // Eight cached pool MRs plus the linearization MR remain registered.
    assert_eq!(rig.dev.mr_count(), 9);
}

/// The same pool is registered only once across bursts.
#[test]
fn mr_cache_hits_do_not_reregister() {
    let rig = test::rig_with_tx(64, &TxConf::default());
    let mp: Mempool = test::pool("hot", 64, 2048);
    for round in 0..4u8 {
        let mut pkts: Vec<_> = (0..4u8).map(|i| test::pkt(&mp, 64, round * 4 + i)).collect();
        assert_eq!(rig.port.tx_burst(0, &mut pkts), 4);
    }
    assert_eq!(rig.port.txq_mp2mr_len(0), Some(1));
    assert_eq!(rig.dev.transmitted().len(), 16);
}

//==============================================================================
// Dispatch
//==============================================================================

/// The removed Tx callback swallows bursts without touching the ring.
#[test]
fn removed_dispatch_sends_nothing() {
    let rig = test::rig_with_tx(64, &TxConf::default());
    rig.port.set_link_down().unwrap();
    let mp: Mempool = test::pool("down", 4, 2048);
    let mut pkts: Vec<_> = vec![test::pkt(&mp, 64, 0)];
    assert_eq!(rig.port.tx_burst(0, &mut pkts), 0);
    assert_eq!(pkts.len(), 1);
    assert!(rig.dev.transmitted().is_empty());
    rig.port.set_link_up().unwrap();
    assert_eq!(rig.port.tx_burst(0, &mut pkts), 1);
}
