//! End-to-end exercises of the DNS filter over real UDP sockets, with a
//! scripted upstream standing in for the external resolver.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::time::Duration;

use proctor_agent::dns_filter::{wire, DnsFilter, FilterConfig};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// The record bytes the scripted upstream appends to every answer.
const CANNED_RR: [u8; 16] = [
    0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x3C, 0x00, 0x04, 0x05, 0x06, 0x07, 0x08,
];

/// An upstream that answers every query with the query + one A record.
async fn scripted_upstream() -> (SocketAddr, JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            let mut answer = buf[..len].to_vec();
            answer[2] |= 0x80; // QR
            answer[7] = 1; // ANCOUNT
            answer.extend_from_slice(&CANNED_RR);
            socket.send_to(&answer, peer).await.ok();
        }
    });
    (addr, task)
}

/// An upstream that swallows every query.
async fn silent_upstream() -> (SocketAddr, JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while socket.recv_from(&mut buf).await.is_ok() {}
    });
    (addr, task)
}

fn config(upstream: SocketAddr, upstream_timeout: Duration) -> FilterConfig {
    FilterConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        upstream,
        allow_domains: vec!["codeforces.com".to_string()],
        upstream_timeout,
    }
}

async fn ask(filter: SocketAddr, datagram: &[u8]) -> Vec<u8> {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(datagram, filter).await.unwrap();
    let mut buf = [0u8; 512];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("filter should answer")
        .unwrap();
    buf[..len].to_vec()
}

#[tokio::test]
async fn allowed_query_relays_the_upstream_answer_verbatim() {
    let (upstream, upstream_task) = scripted_upstream().await;
    let filter = DnsFilter::start(config(upstream, Duration::from_secs(5)))
        .await
        .unwrap();

    let query = wire::query(0x1234, "codeforces.com");
    let response = ask(filter.local_addr(), &query).await;

    assert_eq!(response[0..2], 0x1234u16.to_be_bytes());
    assert_eq!(response[2] & 0x80, 0x80, "QR must be set");
    assert_ne!(response[3] & 0x0F, 3, "must not be NXDOMAIN");
    assert!(response.ends_with(&CANNED_RR), "answer must be relayed unchanged");

    filter.stop().await;
    upstream_task.abort();
}

#[tokio::test]
async fn subdomains_of_an_allow_entry_are_forwarded() {
    let (upstream, upstream_task) = scripted_upstream().await;
    let filter = DnsFilter::start(config(upstream, Duration::from_secs(5)))
        .await
        .unwrap();

    let response = ask(filter.local_addr(), &wire::query(7, "www.codeforces.com")).await;

    assert!(response.ends_with(&CANNED_RR));

    filter.stop().await;
    upstream_task.abort();
}

#[tokio::test]
async fn other_names_get_nxdomain() {
    let (upstream, upstream_task) = scripted_upstream().await;
    let filter = DnsFilter::start(config(upstream, Duration::from_secs(5)))
        .await
        .unwrap();

    let query = wire::query(0xBEEF, "evil.example.com");
    let response = ask(filter.local_addr(), &query).await;

    assert_eq!(response[0..2], 0xBEEFu16.to_be_bytes());
    assert_eq!(response[2], 0x81);
    assert_eq!(response[3], 0x83);
    assert_eq!(response[4..], query[4..], "question must be copied");

    filter.stop().await;
    upstream_task.abort();
}

#[tokio::test]
async fn upstream_timeout_degrades_to_nxdomain() {
    let (upstream, upstream_task) = silent_upstream().await;
    let filter = DnsFilter::start(config(upstream, Duration::from_millis(100)))
        .await
        .unwrap();

    let response = ask(filter.local_addr(), &wire::query(9, "codeforces.com")).await;

    assert_eq!(response[3] & 0x0F, 3);

    filter.stop().await;
    upstream_task.abort();
}

#[tokio::test]
async fn compressed_question_names_are_refused() {
    let (upstream, upstream_task) = scripted_upstream().await;
    let filter = DnsFilter::start(config(upstream, Duration::from_secs(5)))
        .await
        .unwrap();

    let mut query = wire::query(11, "");
    query[wire::HEADER_LEN] = 0xC0;
    query.insert(wire::HEADER_LEN + 1, 0x0C);

    let response = ask(filter.local_addr(), &query).await;

    assert_eq!(response[3] & 0x0F, 3);

    filter.stop().await;
    upstream_task.abort();
}

#[tokio::test]
async fn garbage_is_dropped_and_the_loop_survives() {
    let (upstream, upstream_task) = scripted_upstream().await;
    let filter = DnsFilter::start(config(upstream, Duration::from_secs(5)))
        .await
        .unwrap();

    // Three bytes of noise: no reply at all.
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&[1, 2, 3], filter.local_addr()).await.unwrap();
    let mut buf = [0u8; 512];
    let reply = tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "garbage must be dropped silently");

    // The receive loop is still alive afterwards.
    let response = ask(filter.local_addr(), &wire::query(1, "codeforces.com")).await;
    assert!(response.ends_with(&CANNED_RR));

    filter.stop().await;
    upstream_task.abort();
}
