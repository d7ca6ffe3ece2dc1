//! Fixtures shared by unit tests across modules.

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::clock::Clock;
use crate::doh::{DohError, DohFuture, DohResponse, ServerConnection};

pub fn encode_name(name: &str) -> Vec<u8> {
    let mut encoded = Vec::new();
    for label in name.split('.') {
        encoded.push(label.len() as u8);
        encoded.extend_from_slice(label.as_bytes());
    }
    encoded.push(0);
    encoded
}

pub fn query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&id.to_be_bytes());
    payload.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    payload.extend_from_slice(&encode_name(name));
    payload.extend_from_slice(&qtype.to_be_bytes());
    payload.extend_from_slice(&[0x00, 0x01]);
    payload
}

/// Response with a single `A` answer carrying `ttl`.
pub fn response(id: u16, name: &str, qtype: u16, ttl: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&id.to_be_bytes());
    payload.extend_from_slice(&[0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
    payload.extend_from_slice(&encode_name(name));
    payload.extend_from_slice(&qtype.to_be_bytes());
    payload.extend_from_slice(&[0x00, 0x01]);
    payload.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);
    payload.extend_from_slice(&ttl.to_be_bytes());
    payload.extend_from_slice(&[0x00, 0x04, 192, 0, 2, 1]);
    payload
}

pub const SERVER_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 53));

pub fn ok_response(body: Vec<u8>, received_at_ms: u64) -> DohResponse {
    DohResponse {
        status: 200,
        body: Bytes::from(body),
        age_secs: 0,
        received_at_ms,
        server_ip: Some(SERVER_IP),
        cache_status: None,
    }
}

type Responder = Box<dyn Fn(&[u8]) -> DohFuture + Send + Sync>;

/// A scripted `ServerConnection` that records what it was asked.
pub struct FakeConnection {
    responder: Responder,
    pub requests: Mutex<Vec<Vec<u8>>>,
    pub resets: AtomicUsize,
    url: Option<String>,
}

impl FakeConnection {
    pub fn new(responder: impl Fn(&[u8]) -> DohFuture + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            url: Some("https://doh.test/dns-query".into()),
        })
    }

    /// Answers every query with `ttl`, echoing the question with ID zero.
    pub fn answering(ttl: u32, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::new(move |query| {
            let received_at_ms = clock.now_ms();
            let parsed = crate::dns::parse_query(query);
            let result = match parsed {
                Ok(parsed) => Ok(ok_response(
                    response(0, parsed.name(), parsed.qtype(), ttl),
                    received_at_ms,
                )),
                Err(error) => Err(DohError::InvalidQuery(error.to_string())),
            };
            futures::future::ready(result).boxed()
        })
    }

    pub fn failing(error: DohError) -> Arc<Self> {
        Self::new(move |_| futures::future::ready(Err(error.clone())).boxed())
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl ServerConnection for FakeConnection {
    fn perform_request(&self, query: &[u8]) -> DohFuture {
        self.requests.lock().push(query.to_vec());
        (self.responder)(query)
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn generation(&self) -> u64 {
        self.resets.load(Ordering::SeqCst) as u64
    }

    fn reset_if_current(&self, generation: u64) -> bool {
        let current = generation as usize;
        self.resets
            .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}
