use mptcp_core::crypto::derive;
use mptcp_core::mapping::{ReceiveMapper, SendMapper};
use mptcp_core::types::option::{Dss, DssMapping, MptcpOption, SeqWidth};
use mptcp_core::{encode_options, parse_options};
use mptcp_integration_tests::common::{send, warm_up, FixedKey, Peer};
use mptcp_transport::{MptcpConfig, MptcpManager, SubflowState};
use std::sync::Arc;

const K1: u64 = 0x0123_4567_89ab_cdef;
const K2: u64 = 0xfedc_ba98_7654_3210;

fn keyed_peer(host: u8, key: u64) -> Peer {
    let manager = MptcpManager::builder(MptcpConfig::default())
        .key_source(Arc::new(FixedKey(key)))
        .build()
        .unwrap();
    Peer::with_manager(host, manager)
}

/// Scenario A: capability exchange binds the token to the client's key
#[test]
fn test_scenario_a_capable_handshake() {
    let a = keyed_peer(1, K1);
    let b = keyed_peer(2, K2);

    let (a_conn, b_conn) = a.connect(&b).unwrap();

    let (token1, idsn1) = derive(K1);
    let (token2, idsn2) = derive(K2);

    let conn = a_conn.lock();
    assert_eq!(conn.token(), token1);
    assert_eq!(conn.local_key(), K1);
    assert_eq!(conn.remote_key(), K2);
    assert_eq!(conn.remote_token(), token2);
    assert_eq!(conn.write_seq(), idsn1.wrapping_add(1));
    assert_eq!(conn.ack_seq(), idsn2.wrapping_add(1));
    assert_eq!(conn.subflow_count(), 1);
    assert_eq!(conn.subflow(0).unwrap().state(), SubflowState::Established);
    assert_eq!(conn.first(), Some(0));

    let peer = b_conn.lock();
    assert_eq!(peer.token(), token2);
    assert_eq!(peer.remote_key(), K1);
    assert_eq!(peer.subflow_count(), 1);
    assert_eq!(peer.subflow(0).unwrap().state(), SubflowState::Established);

    assert!(a.manager.lookup(token1).unwrap().ptr_eq(&a_conn));
    assert!(b.manager.lookup(token2).unwrap().ptr_eq(&b_conn));
}

/// Scenario B: a second path joins; the "first" policy keeps the primary
#[test]
fn test_scenario_b_join_keeps_primary() {
    let client = Peer::new(1).unwrap();
    let server = Peer::new(2).unwrap();
    let (client_conn, server_conn) = client.connect(&server).unwrap();
    warm_up(&client_conn, &server_conn).unwrap();

    let local = Peer::address(11, 40000);
    let (id, server_id) = client.join(&server, &client_conn, local, server.addr, false).unwrap();
    assert_ne!(id, 0);

    assert_eq!(client_conn.lock().subflow_count(), 2);
    assert_eq!(server_conn.lock().subflow_count(), 2);
    assert!(client_conn.lock().subflow(id).unwrap().is_fully_established());

    client.manager.set_scheduler(&client_conn, "first").unwrap();
    let mut conn = client_conn.lock();
    assert_eq!(conn.scheduler_name(), "first");
    for _ in 0..4 {
        assert_eq!(conn.select_subflow(false), Some(0));
    }
    assert_eq!(conn.last_used(), Some(0));
    drop(conn);

    // both paths carry data in the same sequence space
    let before = client_conn.lock().write_seq();
    let on_join = send(&client_conn, id, &server_conn, server_id, b"over the new path").unwrap();
    assert_eq!(on_join.data_seq, before);
    let on_first = send(&client_conn, 0, &server_conn, 0, b"and the old").unwrap();
    assert_eq!(on_first.data_seq, before + 17);
    assert_eq!(server_conn.lock().ack_seq(), client_conn.lock().write_seq());
}

/// Scenario C: 32-bit mappings reconstruct across the epoch boundary
#[test]
fn test_scenario_c_wraparound_reconstruction() {
    let mut rx = ReceiveMapper::new(0x0000_0000_FFFF_FF00, false);

    let first = DssMapping {
        data_seq: 0xFFFF_FFF0,
        width: SeqWidth::Bits32,
        subflow_seq: 1,
        data_len: 32,
        checksum: None,
    };
    assert_eq!(rx.install(&first, false).unwrap(), 0xFFFF_FFF0);

    let mapped = rx.consume(1, &[0u8; 32]).unwrap();
    assert!(mapped.mapping_complete);
    assert!(!rx.is_valid());

    // low half wrapped; the high half must move to epoch 1
    let wrapped = DssMapping {
        data_seq: 0x0000_0010,
        width: SeqWidth::Bits32,
        subflow_seq: 33,
        data_len: 16,
        checksum: None,
    };
    let data_seq = rx.install(&wrapped, false).unwrap();
    assert_eq!(data_seq >> 32, 1);
    assert_eq!(data_seq, 0x1_0000_0010);
}

/// Scenario C on the wire: the sender widens the DSN when the epoch moves
#[test]
fn test_scenario_c_over_the_wire() {
    let mut tx = SendMapper::new(0xFFFF_FFF0, false);
    let mut rx = ReceiveMapper::new(0xFFFF_FFF0, false);

    let mut subflow_seq = 1u32;
    let mut data_seq = 0xFFFF_FFF0u64;
    let payload = [7u8; 32];

    for expected_width in [SeqWidth::Bits32, SeqWidth::Bits64, SeqWidth::Bits32] {
        let mapping = tx.map(data_seq, subflow_seq, &payload, false).unwrap();
        assert_eq!(mapping.width, expected_width);

        let bytes = encode_options(&[MptcpOption::Dss(Dss {
            data_ack: None,
            mapping: Some(mapping),
            data_fin: false,
        })])
        .unwrap();
        let decoded = parse_options(&bytes).dss().and_then(|dss| dss.mapping).unwrap();

        assert_eq!(rx.install(&decoded, false).unwrap(), data_seq);
        let mapped = rx.consume(subflow_seq, &payload).unwrap();
        assert_eq!(mapped.data_seq, data_seq);

        subflow_seq += payload.len() as u32;
        data_seq += payload.len() as u64;
    }
    assert_eq!(data_seq >> 32, 1);
}
