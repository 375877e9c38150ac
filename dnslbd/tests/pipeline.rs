//! End-to-end pipeline scenarios over loopback UDP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};

use dnslbd::config::{
    BalancingConfig, Config, ForwarderConfig, FrontendConfig, RuntimeConfig, WatchdogConfig,
};
use dnslbd::context::Context;
use dnslbd::dns;
use dnslbd::metrics::Metrics;
use dnslbd::upstream::Policy;

fn base_config(listen: SocketAddr, upstream: SocketAddr) -> Config {
    Config {
        runtime: RuntimeConfig {
            workers: 1,
            max_pkt_size: 2048,
            req_ttl_ms: 10_000,
            epoch_ms: 50,
            gc_interval_ms: 100,
            drain_timeout_ms: 1_000,
        },
        // effectively disabled unless a test dials it down
        watchdog: WatchdogConfig {
            interval_ms: 3_600_000,
            retries: 1,
        },
        balancing: BalancingConfig {
            policy: Policy::RoundRobin,
        },
        frontends: vec![FrontendConfig {
            name: "fe".into(),
            listen,
            forwarders: vec!["up".into()],
        }],
        forwarders: vec![ForwarderConfig {
            name: "up".into(),
            address: upstream,
            weight: 1,
            watchdog_query: "probe.test.".into(),
        }],
    }
}

fn any_loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn query_bytes(id: u16, name: &str) -> Vec<u8> {
    let mut buf = dns::build_probe(name).unwrap();
    dns::rewrite_id(&mut buf, id);
    buf.to_vec()
}

fn wire_id(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[0], packet[1]])
}

fn flip_qr(packet: &[u8]) -> Vec<u8> {
    let mut reply = packet.to_vec();
    reply[2] |= 0x80;
    reply
}

/// Answer every query with an identical packet marked as a response.
async fn echo_upstream(sock: UdpSocket) {
    let mut buf = [0u8; 4096];
    loop {
        let Ok((n, src)) = sock.recv_from(&mut buf).await else {
            return;
        };
        let reply = flip_qr(&buf[..n]);
        let _ = sock.send_to(&reply, src).await;
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

async fn shut_down(ctx: &Arc<Context>, handles: Vec<tokio::task::JoinHandle<()>>) {
    ctx.begin_shutdown();
    for handle in handles {
        let _ = handle.await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwards_and_restores_the_client_id() {
    let upstream = UdpSocket::bind(any_loopback()).await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(echo_upstream(upstream));

    let metrics = Arc::new(Metrics::new());
    let cfg = base_config(any_loopback(), upstream_addr);
    let ctx = Context::new(&cfg, Arc::clone(&metrics)).unwrap();
    let handles = ctx.spawn().await.unwrap();
    let frontend = ctx.frontend_addr(0);

    let client = UdpSocket::bind(any_loopback()).await.unwrap();
    let query = query_bytes(0x4242, "a.test.");
    client.send_to(&query, frontend).await.unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("reply within deadline")
        .unwrap();
    let reply = &buf[..n];
    assert_eq!(wire_id(reply), 0x4242, "client id must be restored");
    assert_eq!(&reply[12..], &query[12..], "payload preserved");

    wait_until("in-flight drains", || ctx.in_flight() == 0).await;
    assert_eq!(ctx.tracked_entries(), 0);
    assert_eq!(metrics.queries_accepted(), 1);
    assert_eq!(metrics.queries_forwarded(), 1);
    assert_eq!(metrics.replies_sent(), 1);

    shut_down(&ctx, handles).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_in_flight_keeps_only_the_later_entry() {
    let upstream = UdpSocket::bind(any_loopback()).await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let metrics = Arc::new(Metrics::new());
    let cfg = base_config(any_loopback(), upstream_addr);
    let ctx = Context::new(&cfg, Arc::clone(&metrics)).unwrap();
    let handles = ctx.spawn().await.unwrap();
    let frontend = ctx.frontend_addr(0);

    let client = UdpSocket::bind(any_loopback()).await.unwrap();
    let query = query_bytes(0x1111, "dup.test.");
    client.send_to(&query, frontend).await.unwrap();
    client.send_to(&query, frontend).await.unwrap();

    // both copies reach the upstream, carrying the same stamped id
    let mut buf = [0u8; 2048];
    let (n1, src) = timeout(Duration::from_secs(2), upstream.recv_from(&mut buf))
        .await
        .expect("first forwarded copy")
        .unwrap();
    let first = buf[..n1].to_vec();
    let (n2, _) = timeout(Duration::from_secs(2), upstream.recv_from(&mut buf))
        .await
        .expect("second forwarded copy")
        .unwrap();
    let second = buf[..n2].to_vec();
    assert_eq!(first, second);

    wait_until("duplicate eviction", || metrics.duplicate_evictions() == 1).await;

    // answer both: the first reply is delivered, the second has nothing
    // left to correlate with
    upstream.send_to(&flip_qr(&first), src).await.unwrap();
    upstream.send_to(&flip_qr(&second), src).await.unwrap();

    let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("one reply delivered")
        .unwrap();
    assert_eq!(wire_id(&buf[..n]), 0x1111);

    wait_until("correlation miss", || metrics.correlation_misses() == 1).await;
    let extra = timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await;
    assert!(extra.is_err(), "second reply must not be delivered");

    wait_until("in-flight drains", || ctx.in_flight() == 0).await;
    assert_eq!(metrics.replies_sent(), 1);

    shut_down(&ctx, handles).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unanswered_queries_are_evicted() {
    // bound but mute: queries pile up in its receive buffer
    let upstream = UdpSocket::bind(any_loopback()).await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let metrics = Arc::new(Metrics::new());
    let mut cfg = base_config(any_loopback(), upstream_addr);
    cfg.runtime.req_ttl_ms = 200;
    cfg.runtime.epoch_ms = 20;
    cfg.runtime.gc_interval_ms = 50;
    let ctx = Context::new(&cfg, Arc::clone(&metrics)).unwrap();
    let handles = ctx.spawn().await.unwrap();

    let client = UdpSocket::bind(any_loopback()).await.unwrap();
    client
        .send_to(&query_bytes(0x2222, "slow.test."), ctx.frontend_addr(0))
        .await
        .unwrap();

    wait_until("expiry eviction", || metrics.expired_evictions() == 1).await;
    wait_until("in-flight drains", || ctx.in_flight() == 0).await;
    assert_eq!(ctx.tracked_entries(), 0);
    assert_eq!(metrics.replies_sent(), 0);

    shut_down(&ctx, handles).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watchdog_flips_liveness_exactly_once_per_transition() {
    // mute at first: probes go unanswered
    let upstream = UdpSocket::bind(any_loopback()).await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let metrics = Arc::new(Metrics::new());
    let mut cfg = base_config(any_loopback(), upstream_addr);
    cfg.watchdog.interval_ms = 100;
    cfg.watchdog.retries = 1;
    let ctx = Context::new(&cfg, Arc::clone(&metrics)).unwrap();
    let handles = ctx.spawn().await.unwrap();
    let forwarder = Arc::clone(&ctx.forwarders[0]);

    assert!(forwarder.is_alive());
    wait_until("forwarder marked dead", || !forwarder.is_alive()).await;
    assert_eq!(metrics.forwarders_lost(), 1);

    // with its only forwarder dead, a client query has nowhere to go
    let client = UdpSocket::bind(any_loopback()).await.unwrap();
    client
        .send_to(&query_bytes(0x3333, "noroute.test."), ctx.frontend_addr(0))
        .await
        .unwrap();
    wait_until("selection failure", || metrics.selection_failures() == 1).await;
    wait_until("in-flight drains", || ctx.in_flight() == 0).await;

    // the upstream comes back; the next answered probe revives it
    tokio::spawn(echo_upstream(upstream));
    wait_until("forwarder revived", || forwarder.is_alive()).await;
    assert_eq!(metrics.forwarders_recovered(), 1);
    assert_eq!(metrics.forwarders_lost(), 1, "death observed exactly once");

    shut_down(&ctx, handles).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dead_forwarder_is_routed_around() {
    let mute = UdpSocket::bind(any_loopback()).await.unwrap();
    let mute_addr = mute.local_addr().unwrap();
    let live = UdpSocket::bind(any_loopback()).await.unwrap();
    let live_addr = live.local_addr().unwrap();
    tokio::spawn(echo_upstream(live));

    let metrics = Arc::new(Metrics::new());
    let mut cfg = base_config(any_loopback(), mute_addr);
    cfg.watchdog.interval_ms = 100;
    cfg.watchdog.retries = 1;
    cfg.frontends[0].forwarders = vec!["up".into(), "backup".into()];
    cfg.forwarders.push(ForwarderConfig {
        name: "backup".into(),
        address: live_addr,
        weight: 1,
        watchdog_query: "probe.test.".into(),
    });
    let ctx = Context::new(&cfg, Arc::clone(&metrics)).unwrap();
    let handles = ctx.spawn().await.unwrap();

    wait_until("mute forwarder dies", || !ctx.forwarders[0].is_alive()).await;
    assert!(ctx.forwarders[1].is_alive());

    // every query lands on the surviving forwarder
    let client = UdpSocket::bind(any_loopback()).await.unwrap();
    let mut buf = [0u8; 2048];
    for i in 0..4u16 {
        let query = query_bytes(0x4000 + i, "route.test.");
        client.send_to(&query, ctx.frontend_addr(0)).await.unwrap();
        let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("live forwarder answers")
            .unwrap();
        assert_eq!(wire_id(&buf[..n]), 0x4000 + i);
    }
    assert_eq!(metrics.selection_failures(), 0);

    shut_down(&ctx, handles).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_routes_replies_through_the_successor() {
    let upstream = UdpSocket::bind(any_loopback()).await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let old_metrics = Arc::new(Metrics::new());
    let cfg = base_config(any_loopback(), upstream_addr);
    let old_ctx = Context::new(&cfg, Arc::clone(&old_metrics)).unwrap();
    let old_handles = old_ctx.spawn().await.unwrap();
    let frontend = old_ctx.frontend_addr(0);

    let client = UdpSocket::bind(any_loopback()).await.unwrap();
    client
        .send_to(&query_bytes(0x7777, "reload.test."), frontend)
        .await
        .unwrap();

    // hold the forwarded query so the reply arrives after the reload
    let mut buf = [0u8; 2048];
    let (n, src) = timeout(Duration::from_secs(2), upstream.recv_from(&mut buf))
        .await
        .expect("forwarded query")
        .unwrap();
    let held = buf[..n].to_vec();

    // successor generation on the same frontend address
    let new_metrics = Arc::new(Metrics::new());
    let mut next_cfg = cfg.clone();
    next_cfg.frontends[0].listen = frontend;
    let new_ctx = Context::new(&next_cfg, Arc::clone(&new_metrics)).unwrap();
    let new_handles = new_ctx.spawn().await.unwrap();
    old_ctx.set_reload_target(Arc::clone(&new_ctx));

    // the late reply traverses the successor back to the client
    upstream.send_to(&flip_qr(&held), src).await.unwrap();
    let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("reply via successor")
        .unwrap();
    assert_eq!(wire_id(&buf[..n]), 0x7777);

    wait_until("successor delivered it", || new_metrics.replies_sent() == 1).await;
    assert_eq!(old_metrics.replies_sent(), 0);

    wait_until("old generation settles", || old_ctx.in_flight() == 0).await;
    shut_down(&old_ctx, old_handles).await;
    assert_eq!(old_ctx.in_flight(), 0);

    wait_until("new generation settles", || new_ctx.in_flight() == 0).await;
    shut_down(&new_ctx, new_handles).await;
}
