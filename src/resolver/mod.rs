//! Drives one query through the active `ServerConnection` and turns the
//! outcome into a reply packet and a `Transaction` record.

use bytes::Bytes;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::dns::{self, DnsError, Query};
use crate::doh::{CacheStatus, ConnectionSlot, DohError, DohResponse, ServerConnection};
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::packet::{self, PacketEndpoints, UdpPacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Complete,
    SendFail,
    HttpError,
    BadResponse,
    Canceled,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Complete => "COMPLETE",
            TransactionStatus::SendFail => "SEND_FAIL",
            TransactionStatus::HttpError => "HTTP_ERROR",
            TransactionStatus::BadResponse => "BAD_RESPONSE",
            TransactionStatus::Canceled => "CANCELED",
        }
    }
}

/// Outcome of one query. Built once the query reaches a terminal status and
/// handed out by value.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub name: String,
    pub qtype: u16,
    pub status: TransactionStatus,
    pub server_ip: Option<IpAddr>,
    pub cache_status: Option<CacheStatus>,
    /// Response as written to the tunnel (ID and TTL already patched).
    pub response: Option<Bytes>,
    pub http_status: Option<u16>,
    pub query_time_ms: u64,
    pub response_time_ms: u64,
}

impl Transaction {
    fn new(query: &Query, query_time_ms: u64) -> Self {
        Self {
            name: query.name().to_string(),
            qtype: query.qtype(),
            status: TransactionStatus::SendFail,
            server_ip: None,
            cache_status: None,
            response: None,
            http_status: None,
            query_time_ms,
            response_time_ms: query_time_ms,
        }
    }

    pub fn latency_ms(&self) -> u64 {
        self.response_time_ms.saturating_sub(self.query_time_ms)
    }
}

/// A DNS query lifted out of a tunnel datagram, with the addressing needed
/// to answer it.
#[derive(Debug, Clone)]
pub struct UdpQuery {
    pub endpoints: PacketEndpoints,
    pub query: Query,
    pub payload: Vec<u8>,
}

impl UdpQuery {
    pub fn from_packet(packet: &UdpPacket<'_>) -> Result<Self, DnsError> {
        let query = dns::parse_query(packet.payload)?;
        Ok(Self {
            endpoints: packet.endpoints,
            query,
            payload: packet.payload.to_vec(),
        })
    }
}

/// Where reply packets go. Usually the tunnel device.
pub trait ResponseWriter: Send + Sync {
    fn write_packet(&self, packet: &[u8]) -> io::Result<()>;
}

pub trait TransactionListener: Send + Sync {
    fn on_transaction(&self, transaction: &Transaction);
}

pub struct Resolver {
    connection: ConnectionSlot,
    listener: Arc<dyn TransactionListener>,
    clock: Arc<dyn Clock>,
}

impl Resolver {
    pub fn new(
        connection: ConnectionSlot,
        listener: Arc<dyn TransactionListener>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connection,
            listener,
            clock,
        }
    }

    /// Resolve `query` on `runtime` without waiting for it. The writer is
    /// weak so replies arriving after teardown are dropped; `session` ends
    /// the query as canceled once the owning tunnel closes.
    pub fn dispatch(
        self: &Arc<Self>,
        runtime: &Handle,
        query: UdpQuery,
        writer: Weak<dyn ResponseWriter>,
        session: CancellationToken,
    ) {
        let resolver = Arc::clone(self);
        runtime.spawn(async move {
            resolver.resolve(query, writer, session).await;
        });
    }

    pub async fn resolve(
        &self,
        request: UdpQuery,
        writer: Weak<dyn ResponseWriter>,
        session: CancellationToken,
    ) -> Transaction {
        let mut transaction = Transaction::new(&request.query, self.clock.now_ms());
        let connection = self.connection.read().clone();

        match connection {
            Some(connection) => {
                let generation = connection.generation();
                let result = tokio::select! {
                    biased;
                    _ = session.cancelled() => Err(DohError::Canceled),
                    result = connection.perform_request(&request.payload) => result,
                };
                self.complete(&mut transaction, &request, connection.as_ref(), generation, result, &writer);
            }
            None => {
                logger::breadcrumb(
                    BreadcrumbFlags::DNS,
                    format!("no server for {}", transaction.name),
                );
            }
        }

        transaction.response_time_ms = self.clock.now_ms();
        logger::breadcrumb(
            BreadcrumbFlags::DNS,
            format!(
                "{} type {} -> {} in {}ms",
                transaction.name,
                transaction.qtype,
                transaction.status.as_str(),
                transaction.latency_ms()
            ),
        );
        self.listener.on_transaction(&transaction);
        transaction
    }

    fn complete(
        &self,
        transaction: &mut Transaction,
        request: &UdpQuery,
        connection: &dyn ServerConnection,
        generation: u64,
        result: Result<DohResponse, DohError>,
        writer: &Weak<dyn ResponseWriter>,
    ) {
        let response = match result {
            Ok(response) => response,
            Err(error) => {
                transaction.status = status_for_error(&error);
                if transaction.status == TransactionStatus::SendFail {
                    logger::rate_limited_error(
                        ErrorCategory::Transport,
                        format!("query for {} failed: {error}", transaction.name),
                    );
                }
                if error == DohError::Timeout {
                    // A stalled pool keeps timing out until the client is replaced.
                    // Waiters sharing one timed-out fetch replace it only once.
                    connection.reset_if_current(generation);
                }
                return;
            }
        };

        transaction.server_ip = response.server_ip;
        transaction.cache_status = response.cache_status;
        transaction.http_status = Some(response.status);
        if !response.is_success() {
            transaction.status = TransactionStatus::HttpError;
            return;
        }

        let mut body = response.body.to_vec();
        dns::rewrite_id(&mut body, request.query.id);
        match dns::parse_query(&body) {
            Ok(answered) if answered.question.matches(&request.query.question) => {}
            Ok(answered) => {
                logger::error(format!(
                    "response for {} type {} answers {} type {}",
                    request.query.name(),
                    request.query.qtype(),
                    answered.name(),
                    answered.qtype()
                ));
                transaction.status = TransactionStatus::BadResponse;
                return;
            }
            Err(error) => {
                logger::rate_limited_error(
                    ErrorCategory::MalformedDns,
                    format!("unparseable response for {}: {error}", request.query.name()),
                );
                transaction.status = TransactionStatus::BadResponse;
                return;
            }
        }

        let elapsed_secs = u32::try_from(response.age_ms(self.clock.now_ms()) / 1000).unwrap_or(u32::MAX);
        if dns::reduce_ttl(&mut body, elapsed_secs).is_err() {
            transaction.status = TransactionStatus::BadResponse;
            return;
        }

        transaction.status = TransactionStatus::Complete;
        write_reply(&request.endpoints, &body, writer);
        transaction.response = Some(Bytes::from(body));
    }
}

fn status_for_error(error: &DohError) -> TransactionStatus {
    match error {
        DohError::Timeout
        | DohError::Connect(_)
        | DohError::InvalidQuery(_)
        | DohError::InvalidUrl(_) => TransactionStatus::SendFail,
        DohError::Body(_) => TransactionStatus::BadResponse,
        DohError::Canceled => TransactionStatus::Canceled,
    }
}

fn write_reply(endpoints: &PacketEndpoints, body: &[u8], writer: &Weak<dyn ResponseWriter>) {
    let Some(writer) = writer.upgrade() else {
        logger::breadcrumb(BreadcrumbFlags::TUNNEL, "reply after teardown dropped".to_string());
        return;
    };
    let packet = match packet::build_udp_reply(endpoints, body) {
        Ok(packet) => packet,
        Err(error) => {
            logger::rate_limited_error(ErrorCategory::TunnelWrite, format!("reply build failed: {error}"));
            return;
        }
    };
    if let Err(error) = writer.write_packet(&packet) {
        logger::rate_limited_error(ErrorCategory::TunnelWrite, format!("reply write failed: {error}"));
    }
}

#[cfg(test)]
mod tests;
