use mptcp_core::types::option::{MpJoin, MptcpOption};
use mptcp_core::{encode_options, parse_options};
use mptcp_integration_tests::common::{warm_up, Peer};
use mptcp_transport::mptcp::handshake::RejectReason;
use mptcp_transport::{AcceptOutcome, JoinOutcome, MptcpConfig, SubflowState, SynDecision};

#[test]
fn test_join_with_forged_ack_is_rejected() {
    let client = Peer::new(1).unwrap();
    let server = Peer::new(2).unwrap();
    let (client_conn, server_conn) = client.connect(&server).unwrap();
    warm_up(&client_conn, &server_conn).unwrap();

    let local = Peer::address(11, 40000);
    let (id, syn) = client_conn.lock().open_join(Some(local), server.addr, 0, false).unwrap();
    let request = match server.manager.on_syn(&syn, server.addr, local).unwrap() {
        SynDecision::Join(request) => request,
        other => panic!("unexpected {:?}", other),
    };
    let syn_ack = request.syn_ack_options().unwrap();
    assert!(matches!(
        client_conn.lock().on_join_syn_ack(id, &syn_ack).unwrap(),
        JoinOutcome::Established { .. }
    ));

    let forged = encode_options(&[MptcpOption::MpJoin(MpJoin::Ack { hmac: [0x5a; 20] })]).unwrap();
    match server.manager.accept(request, &forged).unwrap() {
        AcceptOutcome::Rejected(RejectReason::AuthFailed) => {}
        other => panic!("unexpected {:?}", other),
    }

    // the connection itself is untouched
    let conn = server_conn.lock();
    assert!(!conn.is_closed());
    assert_eq!(conn.subflow_count(), 1);
    assert_eq!(server.manager.metrics().snapshot().joins_rejected, 1);
}

#[test]
fn test_join_with_forged_syn_ack_is_rejected() {
    let client = Peer::new(1).unwrap();
    let server = Peer::new(2).unwrap();
    let (client_conn, server_conn) = client.connect(&server).unwrap();
    warm_up(&client_conn, &server_conn).unwrap();

    let (id, _syn) = client_conn
        .lock()
        .open_join(Some(Peer::address(11, 40000)), server.addr, 0, false)
        .unwrap();
    let forged = encode_options(&[MptcpOption::MpJoin(MpJoin::SynAck {
        backup: false,
        address_id: 0,
        truncated_hmac: 0x0bad_0bad_0bad_0bad,
        nonce: 7,
    })])
    .unwrap();

    let mut conn = client_conn.lock();
    assert_eq!(conn.on_join_syn_ack(id, &forged).unwrap(), JoinOutcome::Rejected);
    assert!(conn.subflow(id).is_none());
    assert_eq!(conn.pending_count(), 0);
    assert_eq!(conn.subflow_count(), 1);
    assert!(!conn.is_closed());
}

#[test]
fn test_join_before_fully_established_is_refused() {
    let client = Peer::new(1).unwrap();
    let server = Peer::new(2).unwrap();
    let (client_conn, _server_conn) = client.connect(&server).unwrap();

    // build a join SYN by hand: the client refuses to open one this early
    let remote_token = client_conn.lock().remote_token();
    let syn = encode_options(&[MptcpOption::MpJoin(MpJoin::Syn {
        backup: false,
        address_id: 3,
        token: remote_token,
        nonce: 42,
    })])
    .unwrap();

    match server.manager.on_syn(&syn, server.addr, Peer::address(11, 40000)).unwrap() {
        SynDecision::Reject(RejectReason::NotFullyEstablished) => {}
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_join_over_subflow_limit_is_refused() {
    let client = Peer::new(1).unwrap();
    let server = Peer::with_config(2, MptcpConfig::builder().max_subflows(1).build()).unwrap();
    let (client_conn, server_conn) = client.connect(&server).unwrap();
    warm_up(&client_conn, &server_conn).unwrap();

    let err = client
        .join(&server, &client_conn, Peer::address(11, 40000), server.addr, false)
        .unwrap_err();
    assert!(err.to_string().contains("join refused"));
    assert_eq!(server_conn.lock().subflow_count(), 1);
}

#[test]
fn test_join_for_closed_connection_is_refused() {
    let client = Peer::new(1).unwrap();
    let server = Peer::new(2).unwrap();
    let (client_conn, server_conn) = client.connect(&server).unwrap();
    warm_up(&client_conn, &server_conn).unwrap();

    let local = Peer::address(11, 40000);
    let (_, syn) = client_conn.lock().open_join(Some(local), server.addr, 0, false).unwrap();
    server_conn.lock().close();

    // the token left the table with the connection
    match server.manager.on_syn(&syn, server.addr, local).unwrap() {
        SynDecision::Reject(RejectReason::UnknownToken) => {}
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_malformed_capable_option_means_plain() {
    let server = Peer::new(2).unwrap();

    // MP_CAPABLE with a length no variant uses
    let syn = [30u8, 6, 0x00, 0x81, 0, 0];
    match server.manager.on_syn(&syn, server.addr, Peer::address(1, 50000)).unwrap() {
        SynDecision::Plain => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(server.manager.metrics().snapshot().options_dropped, 1);
    assert!(server.manager.tokens().is_empty());
}

#[test]
fn test_syn_options_carry_local_key() {
    let client = Peer::new(1).unwrap();
    let server = Peer::new(2).unwrap();

    let (conn, syn) = client.manager.connect(client.addr, server.addr).unwrap();
    let parsed = parse_options(&syn);
    let cap = parsed.capable().unwrap();
    assert_eq!(cap.sender_key, conn.lock().local_key());
    assert_eq!(cap.receiver_key, None);
    assert!(cap.flags.hmac_sha1);
    assert_eq!(conn.lock().subflow(0).unwrap().state(), SubflowState::CapableSent);

    // a second SYN for the same subflow is a state error
    assert!(conn.lock().syn_options().is_err());
}
