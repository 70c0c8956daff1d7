//! End-to-end scenarios over real loopback UDP: bind a handler on an
//! ephemeral port, replay datagrams, assert on the records that come out
//! of the shared channel.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;

use netflow_collector::connections::{Closer, ConnectionManager};
use netflow_collector::handler::{
    BindConfig, BindHandler, IpfixHandler, NetflowV5Handler, SflowV5Handler,
};
use netflow_collector::metrics::CollectorMetrics;
use netflow_collector::record::Record;
use netflow_collector::session::Session;

struct Harness {
    config: BindConfig,
    rx: mpsc::Receiver<Record>,
    connections: Arc<ConnectionManager>,
    tasks: TaskTracker,
    metrics: Arc<CollectorMetrics>,
}

fn harness(ignore_timestamps: bool, session_dump: bool, dump_interval: Duration) -> Harness {
    let (tx, rx) = mpsc::channel(64);
    let connections = Arc::new(ConnectionManager::new());
    let tasks = TaskTracker::new();
    let metrics = Arc::new(CollectorMetrics::default());
    let config = BindConfig {
        tag: "test-tag".to_string(),
        channel: tx,
        tasks: tasks.clone(),
        ignore_timestamps,
        local_tz: false,
        session_dump_enabled: session_dump,
        session_dump_interval: dump_interval,
        connections: Arc::clone(&connections),
        metrics: Arc::clone(&metrics),
    };
    Harness {
        config,
        rx,
        connections,
        tasks,
        metrics,
    }
}

fn listen_and_start<H: BindHandler + Closer + 'static>(
    handler: H,
    connections: &Arc<ConnectionManager>,
) -> (Arc<H>, SocketAddr, u64) {
    let handler = Arc::new(handler);
    handler.listen("127.0.0.1:0").expect("bind loopback");
    let addr = handler.local_addr().expect("bound address");
    let id = connections.add(handler.clone());
    handler.start(id).expect("start receive task");
    (handler, addr, id)
}

async fn send_from(bind: &str, target: SocketAddr, payload: &[u8]) {
    let sender = UdpSocket::bind(bind).await.expect("bind udp sender");
    sender
        .send_to(payload, target)
        .await
        .expect("send datagram");
}

async fn recv_record(rx: &mut mpsc::Receiver<Record>) -> Record {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a record")
        .expect("record channel closed")
}

async fn wait_for<F>(metrics: &Arc<CollectorMetrics>, condition: F)
where
    F: Fn(&CollectorMetrics) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            if condition(metrics) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("metrics condition not reached in time");
}

fn v5_datagram(count: u16, unix_secs: u32, unix_nsecs: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&5u16.to_be_bytes());
    out.extend_from_slice(&count.to_be_bytes());
    out.extend_from_slice(&1234u32.to_be_bytes()); // sys-uptime
    out.extend_from_slice(&unix_secs.to_be_bytes());
    out.extend_from_slice(&unix_nsecs.to_be_bytes());
    out.extend_from_slice(&42u32.to_be_bytes()); // flow sequence
    out.push(0); // engine type
    out.push(0); // engine id
    out.extend_from_slice(&0u16.to_be_bytes()); // sampling interval
    for _ in 0..count {
        out.extend_from_slice(&[0u8; 48]);
    }
    out
}

fn ipfix_set(id: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&((4 + body.len()) as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn ipfix_packet(export_time: u32, domain: u32, sets: &[Vec<u8>]) -> Vec<u8> {
    let sets_len: usize = sets.iter().map(Vec::len).sum();
    let mut out = Vec::new();
    out.extend_from_slice(&10u16.to_be_bytes());
    out.extend_from_slice(&((16 + sets_len) as u16).to_be_bytes());
    out.extend_from_slice(&export_time.to_be_bytes());
    out.extend_from_slice(&1u32.to_be_bytes()); // sequence
    out.extend_from_slice(&domain.to_be_bytes());
    for set in sets {
        out.extend_from_slice(set);
    }
    out
}

// template 256 with two four-byte fields (source and destination address)
fn ipfix_template_set() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&256u16.to_be_bytes());
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&8u16.to_be_bytes());
    body.extend_from_slice(&4u16.to_be_bytes());
    body.extend_from_slice(&12u16.to_be_bytes());
    body.extend_from_slice(&4u16.to_be_bytes());
    ipfix_set(2, &body)
}

fn ipfix_data_set() -> Vec<u8> {
    ipfix_set(256, &[10, 0, 0, 1, 10, 0, 0, 2])
}

fn sflow_datagram() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&5u32.to_be_bytes());
    out.extend_from_slice(&1u32.to_be_bytes()); // agent address type: IPv4
    out.extend_from_slice(&[192, 0, 2, 1]);
    out.extend_from_slice(&0u32.to_be_bytes()); // sub-agent id
    out.extend_from_slice(&7u32.to_be_bytes()); // sequence
    out.extend_from_slice(&1000u32.to_be_bytes()); // uptime
    out.extend_from_slice(&0u32.to_be_bytes()); // sample count
    out
}

#[tokio::test]
async fn v5_happy_path_keeps_bytes_and_export_time() {
    let mut h = harness(false, false, Duration::from_secs(3600));
    let handler = NetflowV5Handler::new(h.config.clone()).unwrap();
    let (_handler, addr, _id) = listen_and_start(handler, &h.connections);

    let datagram = v5_datagram(1, 1_700_000_000, 0);
    send_from("127.0.0.1:0", addr, &datagram).await;

    let record = recv_record(&mut h.rx).await;
    assert_eq!(record.tag, "test-tag");
    assert_eq!(record.source, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(
        record.timestamp,
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    );
    assert_eq!(record.data, datagram);
}

#[tokio::test]
async fn v5_wall_clock_when_ignoring_export_time() {
    let mut h = harness(true, false, Duration::from_secs(3600));
    let handler = NetflowV5Handler::new(h.config.clone()).unwrap();
    let (_handler, addr, _id) = listen_and_start(handler, &h.connections);

    send_from("127.0.0.1:0", addr, &v5_datagram(2, 1_000, 0)).await;

    let record = recv_record(&mut h.rx).await;
    let age = SystemTime::now()
        .duration_since(record.timestamp)
        .unwrap_or_default();
    assert!(age < Duration::from_secs(1));
}

#[tokio::test]
async fn v5_rejects_undersized_packets() {
    let mut h = harness(false, false, Duration::from_secs(3600));
    let handler = NetflowV5Handler::new(h.config.clone()).unwrap();
    let (_handler, addr, _id) = listen_and_start(handler, &h.connections);

    // claims 3 records but carries 1
    let mut truncated = v5_datagram(1, 1_700_000_000, 0);
    truncated[2..4].copy_from_slice(&3u16.to_be_bytes());
    send_from("127.0.0.1:0", addr, &truncated).await;

    wait_for(&h.metrics, |m| {
        m.parse_errors.load(Ordering::Relaxed) >= 1
    })
    .await;

    // the loop is still alive and accepts the next well-formed packet
    let good = v5_datagram(1, 1_700_000_000, 0);
    send_from("127.0.0.1:0", addr, &good).await;
    let record = recv_record(&mut h.rx).await;
    assert_eq!(record.data, good);
}

#[tokio::test]
async fn ipfix_template_then_data_attaches_template() {
    let mut h = harness(false, false, Duration::from_secs(3600));
    let handler = IpfixHandler::new(h.config.clone()).unwrap();
    let (_handler, addr, _id) = listen_and_start(handler, &h.connections);

    let template = ipfix_packet(1_700_000_000, 7, &[ipfix_template_set()]);
    let data = ipfix_packet(1_700_000_100, 7, &[ipfix_data_set()]);

    send_from("127.0.0.1:0", addr, &template).await;
    let record_a = recv_record(&mut h.rx).await;
    send_from("127.0.0.1:0", addr, &data).await;
    let record_b = recv_record(&mut h.rx).await;

    assert_eq!(
        record_a.timestamp,
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    );
    assert_eq!(
        record_b.timestamp,
        UNIX_EPOCH + Duration::from_secs(1_700_000_100)
    );

    // the data record was re-marshaled and now carries template 256
    let mut fresh = Session::new();
    let reparsed = fresh.parse(&record_b.data).expect("rebuilt message parses");
    assert_eq!(reparsed.template_record_count, 1);
    assert_eq!(reparsed.data_set_count, 1);
    let templates = fresh.template_records().expect("template attached");
    assert_eq!(templates[0].template_id, 256);
}

#[tokio::test]
async fn ipfix_data_before_template_passes_through() {
    let mut h = harness(false, false, Duration::from_secs(3600));
    let handler = IpfixHandler::new(h.config.clone()).unwrap();
    let (_handler, addr, _id) = listen_and_start(handler, &h.connections);

    let data = ipfix_packet(1_700_000_100, 7, &[ipfix_data_set()]);
    send_from("127.0.0.1:0", addr, &data).await;

    let record = recv_record(&mut h.rx).await;
    assert_eq!(record.data, data, "verbatim passthrough without templates");
}

#[tokio::test]
async fn ipfix_sessions_are_isolated_by_source_address() {
    let mut h = harness(false, true, Duration::from_millis(200));
    let handler = IpfixHandler::new(h.config.clone()).unwrap();
    let (_handler, addr, _id) = listen_and_start(handler, &h.connections);

    // identical datagrams, same domain, two source addresses
    let data = ipfix_packet(1_700_000_100, 7, &[ipfix_data_set()]);
    send_from("127.0.0.1:0", addr, &data).await;
    send_from("127.0.0.2:0", addr, &data).await;

    wait_for(&h.metrics, |m| {
        m.sessions_created.load(Ordering::Relaxed) == 2
    })
    .await;

    // after the dump interval elapses the next datagram triggers a dump
    // covering both live session keys
    tokio::time::sleep(Duration::from_millis(250)).await;
    send_from("127.0.0.1:0", addr, &data).await;
    wait_for(&h.metrics, |m| {
        m.session_dumps.load(Ordering::Relaxed) >= 1
    })
    .await;

    // a third source joins: still per-key sessions, no sharing
    send_from("127.0.0.3:0", addr, &data).await;
    wait_for(&h.metrics, |m| {
        m.sessions_created.load(Ordering::Relaxed) == 3
    })
    .await;

    while h.rx.try_recv().is_ok() {}
}

#[tokio::test]
async fn ipfix_short_datagram_is_dropped_and_loop_survives() {
    let mut h = harness(false, false, Duration::from_secs(3600));
    let handler = IpfixHandler::new(h.config.clone()).unwrap();
    let (_handler, addr, _id) = listen_and_start(handler, &h.connections);

    send_from("127.0.0.1:0", addr, &[0x00]).await;
    wait_for(&h.metrics, |m| {
        m.parse_errors.load(Ordering::Relaxed) >= 1
    })
    .await;

    let template = ipfix_packet(1_700_000_000, 7, &[ipfix_template_set()]);
    send_from("127.0.0.1:0", addr, &template).await;
    let record = recv_record(&mut h.rx).await;
    assert!(record.data.len() > 1);
    assert_eq!(
        h.metrics
            .records_forwarded
            .load(Ordering::Relaxed),
        1,
        "the malformed datagram must not produce a record"
    );
}

#[tokio::test]
async fn sflow_forwards_validated_datagrams_with_wall_clock() {
    let mut h = harness(false, false, Duration::from_secs(3600));
    let handler = SflowV5Handler::new(h.config.clone()).unwrap();
    let (_handler, addr, _id) = listen_and_start(handler, &h.connections);

    // wrong version is dropped
    let mut bad = sflow_datagram();
    bad[..4].copy_from_slice(&4u32.to_be_bytes());
    send_from("127.0.0.1:0", addr, &bad).await;

    let good = sflow_datagram();
    send_from("127.0.0.1:0", addr, &good).await;

    let record = recv_record(&mut h.rx).await;
    assert_eq!(record.data, good);
    let age = SystemTime::now()
        .duration_since(record.timestamp)
        .unwrap_or_default();
    assert!(age < Duration::from_secs(1));
    assert_eq!(
        h.metrics
            .parse_errors
            .load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn close_terminates_the_receive_task_and_deregisters() {
    let mut h = harness(false, false, Duration::from_secs(3600));
    let handler = NetflowV5Handler::new(h.config.clone()).unwrap();
    let (handler, addr, _id) = listen_and_start(handler, &h.connections);
    assert_eq!(h.connections.count(), 1);

    for _ in 0..3 {
        send_from("127.0.0.1:0", addr, &v5_datagram(1, 1_700_000_000, 0)).await;
    }
    for _ in 0..3 {
        recv_record(&mut h.rx).await;
    }

    BindHandler::close(handler.as_ref()).expect("close handler");
    h.tasks.close();
    timeout(Duration::from_secs(5), h.tasks.wait())
        .await
        .expect("receive task must exit after close");
    assert_eq!(h.connections.count(), 0, "task deletes its own entry");
}

#[tokio::test]
async fn close_all_shuts_down_every_listener() {
    let mut h = harness(false, false, Duration::from_secs(3600));

    let v5 = NetflowV5Handler::new(h.config.clone()).unwrap();
    let (_v5, v5_addr, _) = listen_and_start(v5, &h.connections);
    let ipfix = IpfixHandler::new(h.config.clone()).unwrap();
    let (_ipfix, _, _) = listen_and_start(ipfix, &h.connections);
    let sflow = SflowV5Handler::new(h.config.clone()).unwrap();
    let (_sflow, _, _) = listen_and_start(sflow, &h.connections);
    assert_eq!(h.connections.count(), 3);

    send_from("127.0.0.1:0", v5_addr, &v5_datagram(1, 1_700_000_000, 0)).await;
    recv_record(&mut h.rx).await;

    h.connections.close_all();
    h.tasks.close();
    timeout(Duration::from_secs(5), h.tasks.wait())
        .await
        .expect("all receive tasks must exit after close_all");
    assert_eq!(h.connections.count(), 0);

    // shutdown is idempotent
    h.connections.close_all();
}
