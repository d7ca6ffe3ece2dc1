use super::*;
use crate::clock::ManualClock;
use crate::dns::TYPE_A;
use crate::doh::{new_connection_slot, CachingServerConnection, DohError};
use crate::packet::{build_udp, build_packet, parse_udp_packet, IPPROTO_UDP};
use crate::test_support::{self, FakeConnection};
use futures::FutureExt;
use parking_lot::Mutex;
use std::net::Ipv4Addr;

#[derive(Default)]
struct RecordingWriter {
    packets: Mutex<Vec<Vec<u8>>>,
}

impl ResponseWriter for RecordingWriter {
    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.packets.lock().push(packet.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingListener {
    transactions: Mutex<Vec<Transaction>>,
}

impl TransactionListener for RecordingListener {
    fn on_transaction(&self, transaction: &Transaction) {
        self.transactions.lock().push(transaction.clone());
    }
}

struct Harness {
    resolver: Arc<Resolver>,
    slot: crate::doh::ConnectionSlot,
    writer: Arc<RecordingWriter>,
    listener: Arc<RecordingListener>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new(connection: Option<Arc<FakeConnection>>) -> Self {
        let slot = new_connection_slot();
        let listener = Arc::new(RecordingListener::default());
        let clock = Arc::new(ManualClock::new(50_000));
        let harness = Self {
            resolver: Arc::new(Resolver::new(slot.clone(), listener.clone(), clock.clone())),
            slot,
            writer: Arc::new(RecordingWriter::default()),
            listener,
            clock,
        };
        if let Some(connection) = connection {
            harness.connect(connection);
        }
        harness
    }

    fn connect(&self, connection: Arc<FakeConnection>) {
        *self.slot.write() = Some(connection as Arc<dyn ServerConnection>);
    }

    fn writer(&self) -> Weak<dyn ResponseWriter> {
        let writer: Arc<dyn ResponseWriter> = self.writer.clone();
        Arc::downgrade(&writer)
    }

    fn written(&self) -> Vec<Vec<u8>> {
        self.writer.packets.lock().clone()
    }
}

fn client_endpoints() -> PacketEndpoints {
    PacketEndpoints {
        source: IpAddr::V4(Ipv4Addr::new(10, 111, 222, 1)),
        destination: IpAddr::V4(Ipv4Addr::new(10, 111, 222, 3)),
        source_port: 40_000,
        destination_port: 53,
    }
}

fn inbound_query(id: u16, name: &str) -> UdpQuery {
    let endpoints = client_endpoints();
    let segment = build_udp(&endpoints, &test_support::query(id, name, TYPE_A)).unwrap();
    let packet = build_packet(IPPROTO_UDP, endpoints.source, endpoints.destination, &segment).unwrap();
    UdpQuery::from_packet(&parse_udp_packet(&packet).unwrap()).unwrap()
}

#[tokio::test]
async fn reply_restores_id_and_swaps_endpoints() {
    let harness = Harness::new(None);
    let upstream = FakeConnection::answering(300, harness.clock.clone());
    harness.connect(upstream.clone());

    let transaction = harness
        .resolver
        .resolve(inbound_query(0x1234, "example.com"), harness.writer(), CancellationToken::new())
        .await;
    assert_eq!(transaction.status, TransactionStatus::Complete);
    assert_eq!(transaction.server_ip, Some(test_support::SERVER_IP));
    assert_eq!(transaction.http_status, Some(200));
    assert_eq!(transaction.name, "example.com");

    let written = harness.written();
    assert_eq!(written.len(), 1);
    let reply = parse_udp_packet(&written[0]).unwrap();
    assert_eq!(reply.endpoints, client_endpoints().reversed());
    assert_eq!(dns::read_id(reply.payload), Some(0x1234));
    assert_eq!(transaction.response.as_deref(), Some(reply.payload));
    assert_eq!(harness.listener.transactions.lock().len(), 1);
}

#[tokio::test]
async fn missing_connection_fails_without_writing() {
    let harness = Harness::new(None);
    let transaction = harness
        .resolver
        .resolve(inbound_query(1, "example.com"), harness.writer(), CancellationToken::new())
        .await;
    assert_eq!(transaction.status, TransactionStatus::SendFail);
    assert!(harness.written().is_empty());
    assert_eq!(harness.listener.transactions.lock().len(), 1);
}

#[tokio::test]
async fn transport_errors_map_to_statuses() {
    let cases = [
        (DohError::Timeout, TransactionStatus::SendFail, 1),
        (DohError::Connect("refused".into()), TransactionStatus::SendFail, 0),
        (DohError::Body("truncated".into()), TransactionStatus::BadResponse, 0),
        (DohError::Canceled, TransactionStatus::Canceled, 0),
    ];
    for (error, status, resets) in cases {
        let upstream = FakeConnection::failing(error.clone());
        let harness = Harness::new(Some(upstream.clone()));
        let transaction = harness
            .resolver
            .resolve(inbound_query(1, "example.com"), harness.writer(), CancellationToken::new())
            .await;
        assert_eq!(transaction.status, status, "{error:?}");
        assert_eq!(upstream.reset_count(), resets, "{error:?}");
        assert!(harness.written().is_empty());
    }
}

#[tokio::test]
async fn error_status_is_reported_not_written() {
    let upstream = FakeConnection::new(|_| {
        let mut response = test_support::ok_response(Vec::new(), 0);
        response.status = 503;
        futures::future::ready(Ok(response)).boxed()
    });
    let harness = Harness::new(Some(upstream));
    let transaction = harness
        .resolver
        .resolve(inbound_query(1, "example.com"), harness.writer(), CancellationToken::new())
        .await;
    assert_eq!(transaction.status, TransactionStatus::HttpError);
    assert_eq!(transaction.http_status, Some(503));
    assert!(harness.written().is_empty());
}

#[tokio::test]
async fn mismatched_question_is_a_bad_response() {
    let upstream = FakeConnection::new(|_| {
        let body = test_support::response(0, "evil.test", TYPE_A, 300);
        futures::future::ready(Ok(test_support::ok_response(body, 50_000))).boxed()
    });
    let harness = Harness::new(Some(upstream));
    let transaction = harness
        .resolver
        .resolve(inbound_query(9, "example.com"), harness.writer(), CancellationToken::new())
        .await;
    assert_eq!(transaction.status, TransactionStatus::BadResponse);
    assert!(transaction.response.is_none());
    assert!(harness.written().is_empty());
}

#[tokio::test]
async fn garbage_body_is_a_bad_response() {
    let upstream = FakeConnection::new(|_| {
        futures::future::ready(Ok(test_support::ok_response(vec![1, 2, 3], 50_000))).boxed()
    });
    let harness = Harness::new(Some(upstream));
    let transaction = harness
        .resolver
        .resolve(inbound_query(9, "example.com"), harness.writer(), CancellationToken::new())
        .await;
    assert_eq!(transaction.status, TransactionStatus::BadResponse);
    assert!(harness.written().is_empty());
}

#[tokio::test]
async fn ttl_reflects_http_and_local_age() {
    let upstream = FakeConnection::new(|query| {
        let name = dns::parse_query(query).unwrap().question.name;
        let mut response =
            test_support::ok_response(test_support::response(0, &name, TYPE_A, 300), 40_000);
        response.age_secs = 90;
        futures::future::ready(Ok(response)).boxed()
    });
    let harness = Harness::new(Some(upstream));
    // 90s of Age plus 10s since receipt
    let transaction = harness
        .resolver
        .resolve(inbound_query(2, "example.com"), harness.writer(), CancellationToken::new())
        .await;
    assert_eq!(transaction.status, TransactionStatus::Complete);
    let body = transaction.response.unwrap();
    assert_eq!(dns::extract_ttl(&body), Ok(200));
}

#[tokio::test]
async fn reply_after_teardown_is_dropped() {
    let harness = Harness::new(None);
    harness.connect(FakeConnection::answering(60, harness.clock.clone()));
    let gone: Weak<dyn ResponseWriter> = {
        let writer: Arc<dyn ResponseWriter> = Arc::new(RecordingWriter::default());
        Arc::downgrade(&writer)
    };
    let transaction = harness
        .resolver
        .resolve(inbound_query(3, "example.com"), gone, CancellationToken::new())
        .await;
    assert_eq!(transaction.status, TransactionStatus::Complete);
    assert_eq!(harness.listener.transactions.lock().len(), 1);
}

#[tokio::test]
async fn dispatch_runs_off_the_caller() {
    let harness = Harness::new(None);
    harness.connect(FakeConnection::answering(60, harness.clock.clone()));
    harness.resolver.dispatch(
        &tokio::runtime::Handle::current(),
        inbound_query(4, "example.com"),
        harness.writer(),
        CancellationToken::new(),
    );
    for _ in 0..100 {
        if !harness.written().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(harness.written().len(), 1);
}

fn gated(gate: &CancellationToken, outcome: DohError) -> Arc<FakeConnection> {
    let gate = gate.clone();
    FakeConnection::new(move |_| {
        let gate = gate.clone();
        let outcome = outcome.clone();
        async move {
            gate.cancelled().await;
            Err(outcome)
        }
        .boxed()
    })
}

#[tokio::test]
async fn shared_timeout_replaces_the_client_once() {
    let gate = CancellationToken::new();
    let upstream = gated(&gate, DohError::Timeout);
    let harness = Harness::new(None);
    let cached = CachingServerConnection::new(
        upstream.clone(),
        16,
        harness.clock.clone(),
        tokio::runtime::Handle::current(),
    );
    *harness.slot.write() = Some(Arc::new(cached) as Arc<dyn ServerConnection>);

    let first = harness
        .resolver
        .resolve(inbound_query(1, "stall.test"), harness.writer(), CancellationToken::new());
    let second = harness
        .resolver
        .resolve(inbound_query(2, "stall.test"), harness.writer(), CancellationToken::new());
    let release = async {
        tokio::task::yield_now().await;
        gate.cancel();
    };
    let (first, second, ()) = tokio::join!(first, second, release);

    assert_eq!(first.status, TransactionStatus::SendFail);
    assert_eq!(second.status, TransactionStatus::SendFail);
    assert_eq!(upstream.request_count(), 1);
    assert_eq!(upstream.reset_count(), 1);
}

#[tokio::test]
async fn closed_session_ends_in_flight_query_as_canceled() {
    let gate = CancellationToken::new();
    let upstream = gated(&gate, DohError::Timeout);
    let harness = Harness::new(Some(upstream.clone()));
    let session = CancellationToken::new();

    let resolve = harness
        .resolver
        .resolve(inbound_query(5, "example.com"), harness.writer(), session.clone());
    let close = async {
        tokio::task::yield_now().await;
        session.cancel();
    };
    let (transaction, ()) = tokio::join!(resolve, close);

    assert_eq!(transaction.status, TransactionStatus::Canceled);
    assert_eq!(upstream.request_count(), 1);
    assert_eq!(upstream.reset_count(), 0);
    assert!(harness.written().is_empty());
    assert_eq!(
        harness.listener.transactions.lock()[0].status,
        TransactionStatus::Canceled
    );
}

#[test]
fn status_labels() {
    assert_eq!(TransactionStatus::Complete.as_str(), "COMPLETE");
    assert_eq!(TransactionStatus::SendFail.as_str(), "SEND_FAIL");
    assert_eq!(TransactionStatus::HttpError.as_str(), "HTTP_ERROR");
    assert_eq!(TransactionStatus::BadResponse.as_str(), "BAD_RESPONSE");
    assert_eq!(TransactionStatus::Canceled.as_str(), "CANCELED");
}
