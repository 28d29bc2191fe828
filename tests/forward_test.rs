use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use bifrost::Chain;
use bifrost::config::{ForwardConfig, UpstreamConfig};
use bifrost::context::QueryContext;
use bifrost::forward::ForwardStage;
use bifrost::message::{Message, Record, RecordType};

#[derive(Clone, Copy)]
enum Behavior {
    Answer(Ipv4Addr),
    Empty,
    Silent,
}

/// Minimal localhost upstream answering per its behavior.
async fn mock_upstream(behavior: Behavior) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                break;
            };
            if matches!(behavior, Behavior::Silent) {
                continue;
            }
            let Ok(query) = Message::parse(&buf[..n]) else {
                continue;
            };
            let mut resp = Message::reply_to(&query);
            if let Behavior::Answer(ip) = behavior {
                let name = query.question().map(|q| q.name()).unwrap_or_default();
                resp.answers.push(Record::a(&name, 60, ip));
            }
            let _ = socket.send_to(&resp.serialize().unwrap(), peer).await;
        }
    });
    addr
}

fn upstream_cfg(addr: SocketAddr, tag: &str) -> UpstreamConfig {
    UpstreamConfig {
        tag: tag.to_string(),
        addr: addr.to_string(),
        ..UpstreamConfig::default()
    }
}

fn forward_chain(stage: Arc<ForwardStage>) -> Chain {
    Chain::new(vec![stage])
}

#[tokio::test]
async fn first_usable_answer_wins() {
    let silent = mock_upstream(Behavior::Silent).await;
    let empty = mock_upstream(Behavior::Empty).await;
    let good = mock_upstream(Behavior::Answer(Ipv4Addr::new(10, 9, 9, 9))).await;

    let stage = Arc::new(
        ForwardStage::new(ForwardConfig {
            upstreams: vec![
                upstream_cfg(silent, "silent"),
                upstream_cfg(empty, "empty"),
                upstream_cfg(good, "good"),
            ],
            ..ForwardConfig::default()
        })
        .unwrap(),
    );

    let mut query = Message::query("example.com", RecordType::A);
    query.header.id = 0x4242;
    let mut ctx = QueryContext::new(query);
    let start = std::time::Instant::now();
    forward_chain(Arc::clone(&stage)).run(&mut ctx).await.unwrap();

    let resp = ctx.response().expect("winning response");
    assert_eq!(resp.header.id, 0x4242);
    assert_eq!(resp.answers[0].rdata, vec![10, 9, 9, 9]);
    // The silent upstream must not hold the request to its own timeout;
    // the winner cancels it.
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn all_upstreams_failing_surfaces_aggregate_error() {
    let a = mock_upstream(Behavior::Empty).await;
    let b = mock_upstream(Behavior::Empty).await;

    let stage = Arc::new(
        ForwardStage::new(ForwardConfig {
            upstreams: vec![upstream_cfg(a, "a"), upstream_cfg(b, "b")],
            ..ForwardConfig::default()
        })
        .unwrap(),
    );

    let mut ctx = QueryContext::new(Message::query("example.com", RecordType::A));
    let err = forward_chain(stage).run(&mut ctx).await.unwrap_err();
    assert!(err.to_string().contains("all 2 upstreams failed"), "{err}");
}

#[tokio::test]
async fn one_handle_per_distinct_address() {
    let good = mock_upstream(Behavior::Answer(Ipv4Addr::new(10, 0, 0, 7))).await;

    // The same address listed twice still resolves to one shared handle.
    let stage = Arc::new(
        ForwardStage::new(ForwardConfig {
            upstreams: vec![upstream_cfg(good, "a"), upstream_cfg(good, "b")],
            ..ForwardConfig::default()
        })
        .unwrap(),
    );
    let chain = forward_chain(Arc::clone(&stage));

    for id in 0..3 {
        let mut query = Message::query("example.com", RecordType::A);
        query.header.id = id;
        let mut ctx = QueryContext::new(query);
        chain.run(&mut ctx).await.unwrap();
    }
    assert_eq!(stage.cached_handles(), 1);
}

#[tokio::test]
async fn outer_deadline_bounds_the_dispatch() {
    let silent = mock_upstream(Behavior::Silent).await;

    let stage = Arc::new(
        ForwardStage::new(ForwardConfig {
            upstreams: vec![upstream_cfg(silent, "silent")],
            ..ForwardConfig::default()
        })
        .unwrap(),
    );

    let mut ctx = QueryContext::new(Message::query("example.com", RecordType::A));
    ctx.set_deadline(tokio::time::Instant::now() + Duration::from_millis(100));
    let start = std::time::Instant::now();
    let result = forward_chain(stage).run(&mut ctx).await;
    assert!(result.is_err());
    assert!(start.elapsed() < Duration::from_secs(1));
}
