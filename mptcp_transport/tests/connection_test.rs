use mptcp_core::mapping::MappingError;
use mptcp_core::types::option::{MpFastclose, MpPrio, MptcpOption};
use mptcp_core::{encode_options, parse_options};
use mptcp_transport::mptcp::scheduler::SchedulerState;
use mptcp_transport::{
    AcceptOutcome, ConnectionHandle, MptcpConfig, MptcpError, MptcpManager, SchedulerContext, SchedulerOps,
    SchedulerRegistry, SubflowId, SynDecision,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn addr(last: u8, port: u16) -> SocketAddr {
    SocketAddr::from(([192, 0, 2, last], port))
}

/// Run the three-way MP_CAPABLE exchange between two managers
fn handshake(client: &MptcpManager, server: &MptcpManager) -> (ConnectionHandle, ConnectionHandle) {
    let (client_conn, syn) = client.connect(addr(1, 50000), addr(2, 443)).unwrap();
    let request = match server.on_syn(&syn, addr(2, 443), addr(1, 50000)).unwrap() {
        SynDecision::Capable(request) => request,
        other => panic!("expected MP_CAPABLE request, got {:?}", other),
    };
    let syn_ack = request.syn_ack_options().unwrap();
    let ack = client_conn.lock().on_syn_ack(&syn_ack).unwrap();
    assert!(!ack.is_empty());
    let server_conn = match server.accept(request, &ack).unwrap() {
        AcceptOutcome::Established(handle) => handle,
        other => panic!("expected established connection, got {:?}", other),
    };
    (client_conn, server_conn)
}

#[test]
fn test_data_fin_is_consumed_after_payload() {
    let client = MptcpManager::new(MptcpConfig::default()).unwrap();
    let server = MptcpManager::new(MptcpConfig::default()).unwrap();
    let (client_conn, server_conn) = handshake(&client, &server);

    let start = client_conn.lock().write_seq();
    let options = client_conn.lock().build_data_options(0, b"hello", true).unwrap();
    assert_eq!(client_conn.lock().write_seq(), start + 6);
    assert!(client_conn.lock().flags().data_fin_sent);

    let outcome = server_conn.lock().on_options(0, &options).unwrap();
    assert_eq!(outcome.mapping, Some(start));
    // the DATA_FIN sits behind five payload bytes
    assert!(!outcome.data_fin);

    let mapped = server_conn.lock().on_data(0, 1, b"hello").unwrap();
    assert_eq!(mapped.data_seq, start);
    assert!(mapped.mapping_complete);

    let s = server_conn.lock();
    assert!(s.flags().data_fin_received);
    assert_eq!(s.ack_seq(), start + 6);
}

#[test]
fn test_data_ack_advances_snd_una() {
    let client = MptcpManager::new(MptcpConfig::default()).unwrap();
    let server = MptcpManager::new(MptcpConfig::default()).unwrap();
    let (client_conn, server_conn) = handshake(&client, &server);

    let options = client_conn.lock().build_data_options(0, b"0123456789", false).unwrap();
    server_conn.lock().on_options(0, &options).unwrap();
    server_conn.lock().on_data(0, 1, b"0123456789").unwrap();

    let ack = server_conn.lock().build_data_options(0, b"", false).unwrap();
    let outcome = client_conn.lock().on_options(0, &ack).unwrap();

    let c = client_conn.lock();
    assert_eq!(outcome.data_acked, Some(c.write_seq()));
    assert_eq!(c.snd_una(), c.write_seq());
    assert!(c.is_fully_established());
}

#[test]
fn test_checksum_failure_triggers_mp_fail() {
    let client = MptcpManager::new(MptcpConfig::default()).unwrap();
    let server = MptcpManager::new(MptcpConfig::builder().checksum_required(true).build()).unwrap();
    let (client_conn, server_conn) = handshake(&client, &server);

    assert!(client_conn.lock().use_checksum());
    assert!(server_conn.lock().use_checksum());

    let first = client_conn.lock().build_data_options(0, b"payload", false).unwrap();
    server_conn.lock().on_options(0, &first).unwrap();
    server_conn.lock().on_data(0, 1, b"payload").unwrap();

    let second = client_conn.lock().build_data_options(0, b"second", false).unwrap();
    server_conn.lock().on_options(0, &second).unwrap();
    let err = server_conn.lock().on_data(0, 8, b"secXnd").unwrap_err();
    assert!(matches!(err, MptcpError::Mapping(MappingError::ChecksumMismatch { .. })));
    assert_eq!(server.metrics().snapshot().checksum_failures, 1);

    let reply = server_conn.lock().build_data_options(0, b"", false).unwrap();
    let parsed = parse_options(&reply);
    assert!(parsed.options.iter().any(|o| matches!(o, MptcpOption::MpFail(_))));

    // a single path cannot be dropped, so the client falls back
    let outcome = client_conn.lock().on_options(0, &reply).unwrap();
    assert!(outcome.fallback);
    assert!(client_conn.lock().is_fallback());
    assert_eq!(client.metrics().snapshot().fallbacks, 1);
}

#[test]
fn test_fast_close_tears_down_both_ends() {
    let client = MptcpManager::new(MptcpConfig::default()).unwrap();
    let server = MptcpManager::new(MptcpConfig::default()).unwrap();
    let (client_conn, server_conn) = handshake(&client, &server);
    let client_token = client_conn.token();
    let server_token = server_conn.token();

    let options = client_conn.lock().fast_close().unwrap();
    assert!(client_conn.lock().is_closed());
    assert!(client.lookup(client_token).is_none());

    let outcome = server_conn.lock().on_options(0, &options).unwrap();
    assert!(outcome.closed);
    assert!(server_conn.lock().is_closed());
    assert!(server.lookup(server_token).is_none());
    assert!(server.tokens().is_empty());

    assert!(matches!(
        server_conn.lock().build_data_options(0, b"late", false),
        Err(MptcpError::Closed(_))
    ));
}

#[test]
fn test_fast_close_with_wrong_key_is_ignored() {
    let client = MptcpManager::new(MptcpConfig::default()).unwrap();
    let server = MptcpManager::new(MptcpConfig::default()).unwrap();
    let (_client_conn, server_conn) = handshake(&client, &server);

    let wrong = server_conn.lock().local_key() ^ 1;
    let options = encode_options(&[MptcpOption::MpFastclose(MpFastclose { receiver_key: wrong })]).unwrap();
    let outcome = server_conn.lock().on_options(0, &options).unwrap();

    assert!(!outcome.closed);
    assert!(!server_conn.lock().is_closed());
}

#[test]
fn test_mp_prio_marks_backup() {
    let client = MptcpManager::new(MptcpConfig::default()).unwrap();
    let server = MptcpManager::new(MptcpConfig::default()).unwrap();
    let (client_conn, _server_conn) = handshake(&client, &server);

    let options = encode_options(&[MptcpOption::MpPrio(MpPrio { backup: true, address_id: None })]).unwrap();
    client_conn.lock().on_options(0, &options).unwrap();
    assert!(client_conn.lock().subflow(0).unwrap().flags.backup);
}

#[test]
fn test_plain_peer_falls_back() {
    let client = MptcpManager::new(MptcpConfig::default()).unwrap();
    let plain = MptcpManager::new(MptcpConfig::builder().enabled(false).build()).unwrap();

    let (conn, syn) = client.connect(addr(1, 50001), addr(3, 443)).unwrap();
    assert!(matches!(
        plain.on_syn(&syn, addr(3, 443), addr(1, 50001)).unwrap(),
        SynDecision::Plain
    ));

    // SYN-ACK without MP_CAPABLE
    let ack = conn.lock().on_syn_ack(&[]).unwrap();
    assert!(ack.is_empty());

    let mut c = conn.lock();
    assert!(c.is_fallback());
    assert!(client.tokens().is_empty());
    assert_eq!(c.select_subflow(false), Some(0));

    let before = c.write_seq();
    assert!(c.build_data_options(0, b"abc", false).unwrap().is_empty());
    assert_eq!(c.write_seq(), before + 3);
    assert!(matches!(
        c.open_join(None, addr(4, 443), 1, false),
        Err(MptcpError::NotFullyEstablished)
    ));
}

#[test]
fn test_missing_capable_ack_falls_back_on_server() {
    let client = MptcpManager::new(MptcpConfig::default()).unwrap();
    let server = MptcpManager::new(MptcpConfig::default()).unwrap();

    let (_conn, syn) = client.connect(addr(1, 50002), addr(2, 443)).unwrap();
    let request = match server.on_syn(&syn, addr(2, 443), addr(1, 50002)).unwrap() {
        SynDecision::Capable(request) => request,
        other => panic!("expected MP_CAPABLE request, got {:?}", other),
    };
    assert_eq!(server.tokens().len(), 1);

    assert!(matches!(server.accept(request, &[]).unwrap(), AcceptOutcome::Fallback));
    // the pending token went with the request
    assert!(server.tokens().is_empty());
}

static SELECTIONS: AtomicU32 = AtomicU32::new(0);

fn counting_init(_: &SchedulerContext<'_>) -> Option<SchedulerState> {
    Some(Box::new(0u32))
}

fn counting_select(ctx: &mut SchedulerContext<'_>, _retransmission: bool) -> Option<SubflowId> {
    if let Some(count) = ctx.state_mut::<u32>() {
        *count += 1;
    }
    let id = ctx.eligible().next().map(|s| s.id)?;
    ctx.set_last_used(id);
    Some(id)
}

fn counting_release(ctx: &mut SchedulerContext<'_>) {
    if let Some(count) = ctx.state::<u32>() {
        SELECTIONS.store(*count, Ordering::SeqCst);
    }
}

#[test]
fn test_ops_scheduler_keeps_private_state() {
    let registry = Arc::new(SchedulerRegistry::with_defaults());
    registry
        .register_ops(SchedulerOps {
            name: "counting".to_string(),
            init: Some(counting_init),
            release: Some(counting_release),
            select: Some(counting_select),
        })
        .unwrap();

    let config = MptcpConfig::builder().scheduler("counting").build();
    let client = MptcpManager::builder(config).schedulers(registry).build().unwrap();
    let server = MptcpManager::new(MptcpConfig::default()).unwrap();
    let (client_conn, _server_conn) = handshake(&client, &server);

    let mut c = client_conn.lock();
    assert_eq!(c.scheduler_name(), "counting");
    c.build_data_options(0, b"x", false).unwrap();
    assert!(c.is_fully_established());

    for _ in 0..3 {
        assert_eq!(c.select_subflow(false), Some(0));
    }
    assert_eq!(c.last_used(), Some(0));

    c.close();
    assert_eq!(SELECTIONS.load(Ordering::SeqCst), 3);
}

#[test]
fn test_deferral_when_nothing_is_eligible() {
    let client = MptcpManager::new(MptcpConfig::default()).unwrap();
    let server = MptcpManager::new(MptcpConfig::default()).unwrap();
    let (client_conn, _server_conn) = handshake(&client, &server);

    let mut c = client_conn.lock();
    c.build_data_options(0, b"x", false).unwrap();
    c.remove_subflow(0);

    assert_eq!(c.select_subflow(false), None);
    assert_eq!(client.metrics().snapshot().scheduler_deferrals, 1);
}
