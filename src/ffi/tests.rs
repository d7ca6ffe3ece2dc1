use super::*;
use bytes::Bytes;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::net::Ipv4Addr;

#[test]
fn default_config_matches_engine_defaults() {
    let config = BridgeConfig::default().to_engine_config();
    let defaults = EngineConfig::default();
    assert_eq!(config.mtu, defaults.mtu);
    assert_eq!(config.cache_capacity, defaults.cache_capacity);
    assert_eq!(config.connect_timeout, defaults.connect_timeout);
    assert_eq!(config.read_timeout, defaults.read_timeout);
    assert!(!config.history_enabled);
}

#[test]
fn zero_fields_fall_back_and_mtu_is_clamped() {
    let bridge = BridgeConfig {
        mtu: 100,
        cache_capacity: 0,
        connect_timeout_ms: 1500,
        read_timeout_ms: 0,
        worker_threads: 0,
        queue_capacity: 0,
        history_enabled: true,
    };
    let config = bridge.to_engine_config();
    assert_eq!(config.mtu, config::MIN_MTU);
    assert_eq!(config.cache_capacity, config::DEFAULT_CACHE_CAPACITY);
    assert_eq!(config.connect_timeout, Duration::from_millis(1500));
    assert_eq!(config.read_timeout, config::DEFAULT_READ_TIMEOUT);
    assert_eq!(config.worker_threads, 2);
    assert!(config.history_enabled);
    assert_eq!(bridge.queue_capacity(), crate::device::DEFAULT_QUEUE_CAPACITY);
}

#[test]
fn ip_encoding_tags_family() {
    assert_eq!(BridgeIp::encode(None).family, 0);
    let v4 = BridgeIp::encode(Some(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
    assert_eq!(v4.family, 4);
    assert_eq!(&v4.bytes[..4], &[1, 2, 3, 4]);
    let v6 = BridgeIp::encode(Some("2001:db8::1".parse().unwrap()));
    assert_eq!(v6.family, 6);
    assert_eq!(v6.bytes[15], 1);
}

#[derive(Default)]
struct Recorded {
    transactions: Mutex<Vec<(String, i32, i32, usize)>>,
    packets: Mutex<Vec<Vec<u8>>>,
}

unsafe extern "C" fn record_transaction(transaction: *const BridgeTransaction, context: *mut c_void) {
    let recorded = unsafe { &*(context as *const Recorded) };
    let transaction = unsafe { &*transaction };
    let name = unsafe { CStr::from_ptr(transaction.name) }
        .to_string_lossy()
        .into_owned();
    recorded.transactions.lock().push((
        name,
        transaction.status,
        transaction.cache_status,
        transaction.response_len,
    ));
}

unsafe extern "C" fn emit_packets(
    packets: *const *const u8,
    sizes: *const usize,
    count: usize,
    context: *mut c_void,
) {
    let recorded = unsafe { &*(context as *const Recorded) };
    let packets = unsafe { std::slice::from_raw_parts(packets, count) };
    let sizes = unsafe { std::slice::from_raw_parts(sizes, count) };
    for (packet, size) in packets.iter().zip(sizes) {
        recorded
            .packets
            .lock()
            .push(unsafe { std::slice::from_raw_parts(*packet, *size) }.to_vec());
    }
}

fn callbacks(recorded: &Recorded) -> BridgeCallbacks {
    BridgeCallbacks {
        emit_packets,
        record_transaction: Some(record_transaction),
        context: recorded as *const Recorded as *mut c_void,
    }
}

#[test]
fn transactions_are_bridged_with_codes() {
    let recorded = Recorded::default();
    let callbacks = callbacks(&recorded);
    let transaction = Transaction {
        name: "example.com".into(),
        qtype: 1,
        status: TransactionStatus::Complete,
        server_ip: Some(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))),
        cache_status: Some(CacheStatus::Pending),
        response: Some(Bytes::from_static(&[0u8; 40])),
        http_status: Some(200),
        query_time_ms: 10,
        response_time_ms: 20,
    };
    callbacks.on_transaction(&transaction);
    callbacks.emit_packet(&[1, 2, 3]);

    assert_eq!(
        *recorded.transactions.lock(),
        vec![("example.com".to_string(), BRIDGE_STATUS_COMPLETE, BRIDGE_CACHE_PENDING, 40)]
    );
    assert_eq!(*recorded.packets.lock(), vec![vec![1, 2, 3]]);
}

#[test]
fn status_codes_are_stable() {
    assert_eq!(status_code(TransactionStatus::SendFail), 1);
    assert_eq!(status_code(TransactionStatus::Canceled), 4);
    assert_eq!(cache_code(None), -1);
    assert_eq!(cache_code(Some(CacheStatus::Miss)), 1);
}

#[test]
fn counters_convert_field_by_field() {
    let counters = BridgeCounters::from(TrackerCounters {
        num_requests: 5,
        recent_queries: 4,
        send_failures: 3,
        http_errors: 2,
        bad_responses: 1,
        canceled: 6,
    });
    assert_eq!(counters.num_requests, 5);
    assert_eq!(counters.recent_queries, 4);
    assert_eq!(counters.canceled, 6);
}
