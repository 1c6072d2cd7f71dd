//! End-to-end tests for the DNS listener over UDP and TCP

mod common;

use common::{action, predicate, Fixture, PUBLIC_IP};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use hickory_proto::op::{Edns, Message, Query};
use hickory_proto::rr::{Name, RecordType};
use vigil::listener::dns::{DnsTcpListener, DnsUdpListener};
use vigil::listener::Listener;
use vigil::models::{Probe, ProbeResponse, Protocol};
use vigil::rules::Rule;
use vigil::storage::{RequestQuery, RequestStore};

const TTL: u32 = 60;

const TYPE_A: RecordType = RecordType::A;
const TYPE_AAAA: RecordType = RecordType::AAAA;
const TYPE_TXT: RecordType = RecordType::TXT;

fn query_message(id: u16, name: &str, qtype: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));
    message
}

fn query_packet(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
    query_message(id, name, qtype).to_vec().unwrap()
}

fn edns_query_packet(id: u16, name: &str, qtype: RecordType, payload: u16) -> Vec<u8> {
    let mut message = query_message(id, name, qtype);
    let mut edns = Edns::new();
    edns.set_max_payload(payload);
    message.set_edns(edns);
    message.to_vec().unwrap()
}

fn truncated(reply: &[u8]) -> bool {
    reply[2] & 0x02 != 0
}

fn rcode(reply: &[u8]) -> u8 {
    reply[3] & 0x0F
}

fn ancount(reply: &[u8]) -> u16 {
    u16::from_be_bytes([reply[6], reply[7]])
}

fn authoritative(reply: &[u8]) -> bool {
    reply[2] & 0x04 != 0
}

async fn start_udp(fx: &Fixture) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listener = DnsUdpListener::from_socket(socket, Arc::clone(&fx.ctx), TTL).unwrap();
    let addr = listener.local_addr();
    tokio::spawn(async move {
        let _ = listener.run().await;
    });
    addr
}

async fn ask(server: SocketAddr, packet: &[u8]) -> Vec<u8> {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(packet, server).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("no DNS reply")
        .unwrap();
    buf.truncate(len);
    buf
}

#[tokio::test]
async fn test_a_query_answers_public_ip_and_records() {
    let fx = Fixture::new();
    let zone = fx.zone("alice");
    let server = start_udp(&fx).await;

    let reply = ask(server, &query_packet(0xBEEF, &zone.fqdn, TYPE_A)).await;
    assert_eq!(&reply[..2], &[0xBE, 0xEF]);
    assert!(authoritative(&reply));
    assert_eq!(rcode(&reply), 0);
    assert_eq!(ancount(&reply), 1);
    assert_eq!(&reply[reply.len() - 4..], &PUBLIC_IP.octets());

    assert!(fx.wait_for_records(1).await);
    let records = fx.store.query(&zone.fqdn, &RequestQuery::default()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].protocol, Protocol::Dns);
    assert_eq!(records[0].fqdn, "alice.ssrf.uk");
    match &records[0].request {
        Probe::Dns(q) => assert_eq!(q.qtype, "A"),
        other => panic!("unexpected probe {:?}", other),
    }
}

#[tokio::test]
async fn test_subdomain_routes_to_zone() {
    let fx = Fixture::new();
    let zone = fx.zone("alice");
    let server = start_udp(&fx).await;

    let reply = ask(server, &query_packet(1, "deep.x.ALICE.ssrf.uk", TYPE_A)).await;
    assert_eq!(ancount(&reply), 1);

    assert!(fx.wait_for_records(1).await);
    let records = fx.store.query(&zone.fqdn, &RequestQuery::default()).await.unwrap();
    assert_eq!(records[0].fqdn, "deep.x.alice.ssrf.uk");
}

#[tokio::test]
async fn test_txt_rule_scenario() {
    let fx = Fixture::new();
    let zone = fx.zone("alice");
    fx.rules.add_rule(
        Rule::new(
            &zone.fqdn,
            "verify",
            Protocol::Dns,
            0,
            &[predicate("dns.qtype", "TXT"), action("dns.answer", "verified")],
        )
        .unwrap(),
    );
    let server = start_udp(&fx).await;

    let txt = ask(server, &query_packet(2, &zone.fqdn, TYPE_TXT)).await;
    assert_eq!(ancount(&txt), 1);
    assert!(txt.ends_with(b"\x08verified"));

    let a = ask(server, &query_packet(3, &zone.fqdn, TYPE_A)).await;
    assert_eq!(&a[a.len() - 4..], &PUBLIC_IP.octets());

    assert!(fx.wait_for_records(2).await);
    let records = fx.store.query(&zone.fqdn, &RequestQuery::default()).await.unwrap();
    let matched: Vec<bool> = records.iter().map(|r| r.rule_matched.is_some()).collect();
    assert!(matched.contains(&true) && matched.contains(&false));
}

#[tokio::test]
async fn test_unowned_names_get_nxdomain_and_are_not_recorded() {
    let fx = Fixture::new();
    fx.zone("alice");
    let server = start_udp(&fx).await;

    let under_domain = ask(server, &query_packet(4, "nobody.ssrf.uk", TYPE_A)).await;
    assert_eq!(rcode(&under_domain), 3);
    assert!(authoritative(&under_domain));

    let foreign = ask(server, &query_packet(5, "example.com", TYPE_A)).await;
    assert_eq!(rcode(&foreign), 3);
    assert!(!authoritative(&foreign));

    let apex = ask(server, &query_packet(6, "ssrf.uk", TYPE_A)).await;
    assert_eq!(rcode(&apex), 0);
    assert_eq!(ancount(&apex), 1);

    let apex_v6 = ask(server, &query_packet(7, "ssrf.uk", TYPE_AAAA)).await;
    assert_eq!(rcode(&apex_v6), 0);
    assert_eq!(ancount(&apex_v6), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fx.store.is_empty());
}

#[tokio::test]
async fn test_garbage_is_dropped_and_listener_keeps_serving() {
    let fx = Fixture::new();
    let zone = fx.zone("alice");
    let server = start_udp(&fx).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&[0xFF; 7], server).await.unwrap();
    let mut buf = [0u8; 512];
    let silent = tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(silent.is_err(), "garbage should not be answered");

    let reply = ask(server, &query_packet(8, &zone.fqdn, TYPE_A)).await;
    assert_eq!(ancount(&reply), 1);
}

#[tokio::test]
async fn test_tcp_query_is_length_framed() {
    let fx = Fixture::new();
    let zone = fx.zone("alice");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dns = DnsTcpListener::from_listener(listener, Arc::clone(&fx.ctx), TTL).unwrap();
    let addr = dns.local_addr();
    tokio::spawn(async move {
        let _ = dns.run().await;
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    for id in [10u16, 11] {
        let packet = query_packet(id, &zone.fqdn, TYPE_A);
        stream.write_u16(packet.len() as u16).await.unwrap();
        stream.write_all(&packet).await.unwrap();

        let len = stream.read_u16().await.unwrap() as usize;
        let mut reply = vec![0u8; len];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(u16::from_be_bytes([reply[0], reply[1]]), id);
        assert_eq!(&reply[reply.len() - 4..], &PUBLIC_IP.octets());
    }

    assert!(fx.wait_for_records(2).await);
}

#[tokio::test]
async fn test_large_txt_answer_respects_edns_size() {
    let fx = Fixture::new();
    let zone = fx.zone("alice");
    let token = "t".repeat(1000);
    fx.rules.add_rule(
        Rule::new(
            &zone.fqdn,
            "big",
            Protocol::Dns,
            0,
            &[predicate("dns.qtype", "TXT"), action("dns.answer", &token)],
        )
        .unwrap(),
    );
    let server = start_udp(&fx).await;

    let large = ask(server, &edns_query_packet(20, &zone.fqdn, TYPE_TXT, 4096)).await;
    assert!(!truncated(&large));
    assert_eq!(ancount(&large), 1);
    assert!(large.len() > 1000);

    let plain = ask(server, &query_packet(21, &zone.fqdn, TYPE_TXT)).await;
    assert!(truncated(&plain));
    assert_eq!(ancount(&plain), 0);
    assert!(plain.len() <= 512);

    assert!(fx.wait_for_records(2).await);
    let records = fx.store.query(&zone.fqdn, &RequestQuery::default()).await.unwrap();
    let mut answer_counts: Vec<usize> = records
        .iter()
        .map(|r| match &r.response {
            ProbeResponse::Dns(dns) => dns.answers.len(),
            other => panic!("unexpected response {:?}", other),
        })
        .collect();
    answer_counts.sort();
    assert_eq!(answer_counts, vec![0, 1]);
}

#[tokio::test]
async fn test_recorded_answers_match_what_was_sent() {
    let fx = Fixture::new();
    let zone = fx.zone("alice");
    fx.rules.add_rule(
        Rule::new(
            &zone.fqdn,
            "bogus",
            Protocol::Dns,
            0,
            &[predicate("dns.qtype", "A"), action("dns.answer", "not-an-address")],
        )
        .unwrap(),
    );
    let server = start_udp(&fx).await;

    let reply = ask(server, &query_packet(22, &zone.fqdn, TYPE_A)).await;
    assert_eq!(rcode(&reply), 0);
    assert_eq!(ancount(&reply), 0);

    assert!(fx.wait_for_records(1).await);
    let records = fx.store.query(&zone.fqdn, &RequestQuery::default()).await.unwrap();
    match &records[0].response {
        ProbeResponse::Dns(dns) => assert!(dns.answers.is_empty()),
        other => panic!("unexpected response {:?}", other),
    }
}
