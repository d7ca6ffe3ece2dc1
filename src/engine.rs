//! The composition root. An `Engine` owns the async runtime, the active
//! server connection, the query tracker and at most one running tunnel.

use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::device::TunDevice;
use crate::doh::{
    equal_urls, new_connection_slot, CachingServerConnection, ConnectionSlot, DohError,
    ServerConnection, ServerDirectory,
};
use crate::logger::{self, BreadcrumbFlags};
use crate::probe::{Probe, Race, RaceListener, ServerConnectionProbe};
use crate::resolver::{Resolver, Transaction, TransactionListener};
use crate::tracker::{QueryTracker, TrackerCounters};
use crate::tunnel::Tunnel;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to build runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error("tunnel device error: {0}")]
    Device(#[source] io::Error),
    #[error("server unavailable: {0}")]
    Server(#[from] DohError),
    #[error("blocking engine call made from inside the engine runtime")]
    WrongContext,
}

/// Fans each transaction out to the tracker and, if installed, the host.
struct EngineListener {
    tracker: Arc<QueryTracker>,
    host: RwLock<Option<Arc<dyn TransactionListener>>>,
}

impl TransactionListener for EngineListener {
    fn on_transaction(&self, transaction: &Transaction) {
        self.tracker.record(transaction);
        let host = self.host.read().clone();
        if let Some(host) = host {
            host.on_transaction(transaction);
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    runtime: Runtime,
    clock: Arc<dyn Clock>,
    connection: ConnectionSlot,
    tracker: Arc<QueryTracker>,
    listener: Arc<EngineListener>,
    directory: Arc<ServerDirectory>,
    tunnel: Mutex<Option<Tunnel>>,
    race: Mutex<Option<Arc<Race>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self, EngineError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("doh-worker")
            .enable_all()
            .build()
            .map_err(EngineError::Runtime)?;

        let tracker = Arc::new(QueryTracker::new(config.history_enabled, Arc::clone(&clock)));
        let listener = Arc::new(EngineListener {
            tracker: Arc::clone(&tracker),
            host: RwLock::new(None),
        });
        let directory = Arc::new(ServerDirectory::new(&config, Arc::clone(&clock)));

        logger::breadcrumb(
            BreadcrumbFlags::TUNNEL,
            format!(
                "engine initialized (mtu={}, cache={}, workers={})",
                config.mtu, config.cache_capacity, config.worker_threads
            ),
        );

        Ok(Self {
            config,
            runtime,
            clock,
            connection: new_connection_slot(),
            tracker,
            listener,
            directory,
            tunnel: Mutex::new(None),
            race: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    pub fn tracker(&self) -> &Arc<QueryTracker> {
        &self.tracker
    }

    pub fn counters(&self) -> TrackerCounters {
        self.tracker.counters()
    }

    pub fn set_transaction_listener(&self, listener: Option<Arc<dyn TransactionListener>>) {
        *self.listener.host.write() = listener;
    }

    /// `None` means no server is configured, `Some("")` the built-in default.
    pub fn server_url(&self) -> Option<String> {
        self.connection
            .read()
            .as_ref()
            .map(|connection| connection.url().unwrap_or("").to_string())
    }

    /// Switch to `url` (`None` or empty for the built-in default). A running
    /// tunnel picks up the change with its next query. On failure no server
    /// is active until the next successful call.
    pub fn set_server(&self, url: Option<&str>) -> Result<(), EngineError> {
        let url = url.unwrap_or("");
        {
            let current = self.connection.read();
            if let Some(connection) = current.as_ref() {
                if equal_urls(connection.url(), Some(url)) {
                    return Ok(());
                }
            }
        }
        self.ensure_blocking_allowed()?;

        let result = self.runtime.block_on(self.directory.connect(url));
        match result {
            Ok(connection) => {
                let cached: Arc<dyn ServerConnection> = Arc::new(CachingServerConnection::new(
                    connection,
                    self.config.cache_capacity,
                    Arc::clone(&self.clock),
                    self.handle(),
                ));
                *self.connection.write() = Some(cached);
                logger::info(format!("server set to {}", display_url(url)));
                Ok(())
            }
            Err(error) => {
                self.connection.write().take();
                logger::error(format!("server {} unavailable: {error}", display_url(url)));
                Err(error.into())
            }
        }
    }

    /// Start a tunnel over `device`, replacing any running one.
    pub fn start_tunnel(&self, device: Arc<dyn TunDevice>) -> Result<(), EngineError> {
        self.stop_tunnel();
        let listener: Arc<dyn TransactionListener> = self.listener.clone();
        let resolver = Arc::new(Resolver::new(
            Arc::clone(&self.connection),
            listener,
            Arc::clone(&self.clock),
        ));
        let tunnel = Tunnel::new(device, resolver, self.handle(), self.config.mtu);
        tunnel.start().map_err(EngineError::Device)?;
        *self.tunnel.lock() = Some(tunnel);
        Ok(())
    }

    pub fn is_tunnel_running(&self) -> bool {
        self.tunnel.lock().as_ref().is_some_and(Tunnel::is_running)
    }

    fn stop_tunnel(&self) -> bool {
        let tunnel = self.tunnel.lock().take();
        match tunnel {
            Some(tunnel) => {
                tunnel.close();
                true
            }
            None => false,
        }
    }

    /// Stop the tunnel and abandon any race in progress. The configured
    /// server is kept, but its client is replaced so HTTPS calls the tunnel
    /// started are cancelled.
    pub fn stop(&self) {
        if self.stop_tunnel() {
            let connection = self.connection.read().clone();
            if let Some(connection) = connection {
                connection.reset();
            }
        }
        if let Some(race) = self.race.lock().take() {
            race.cancel();
        }
        logger::breadcrumb(BreadcrumbFlags::TUNNEL, "engine stopped".to_string());
    }

    /// Race `urls` and report the first that answers the canary query.
    /// Starting a race abandons the previous one.
    pub fn race(&self, urls: Vec<String>, listener: RaceListener) -> Arc<Race> {
        let prober: Arc<dyn Probe> = Arc::new(ServerConnectionProbe::new(Arc::clone(&self.directory)));
        let race = Race::start(self.runtime.handle(), prober, urls, listener);
        if let Some(previous) = self.race.lock().replace(Arc::clone(&race)) {
            previous.cancel();
        }
        race
    }

    /// Blocking health check of one server.
    pub fn probe(&self, url: &str) -> Result<bool, EngineError> {
        self.ensure_blocking_allowed()?;
        let prober = ServerConnectionProbe::new(Arc::clone(&self.directory));
        let probe = prober.probe(url.to_string(), Default::default());
        Ok(self.runtime.block_on(probe))
    }

    fn ensure_blocking_allowed(&self) -> Result<(), EngineError> {
        if Handle::try_current().is_ok() {
            return Err(EngineError::WrongContext);
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn display_url(url: &str) -> &str {
    if url.is_empty() {
        "<default>"
    } else {
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TunnelAddressing;
    use crate::device::MemoryTunDevice;
    use crate::dns::TYPE_A;
    use crate::packet::{build_packet, build_udp, parse_udp_packet, PacketEndpoints, IPPROTO_UDP};
    use crate::probe::RaceResult;
    use crate::resolver::TransactionStatus;
    use crate::test_support::{self, FakeConnection};
    use futures::FutureExt;
    use std::net::{IpAddr, Ipv4Addr};
    use std::thread;
    use std::time::{Duration, Instant};

    fn engine() -> Engine {
        let config = EngineConfig {
            worker_threads: 1,
            history_enabled: true,
            ..EngineConfig::default()
        };
        Engine::with_clock(config, Arc::new(ManualClock::new(1_000))).unwrap()
    }

    fn query_packet(id: u16) -> Vec<u8> {
        let endpoints = PacketEndpoints {
            source: IpAddr::V4(Ipv4Addr::new(10, 111, 222, 1)),
            destination: IpAddr::V4(Ipv4Addr::new(10, 111, 222, 3)),
            source_port: 41_000,
            destination_port: 53,
        };
        let payload = test_support::query(id, "example.com", TYPE_A);
        let segment = build_udp(&endpoints, &payload).unwrap();
        build_packet(IPPROTO_UDP, endpoints.source, endpoints.destination, &segment).unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn queries_without_a_server_fail_fast() {
        let engine = engine();
        let device = Arc::new(MemoryTunDevice::new(1500, 64, TunnelAddressing::default()));
        engine.start_tunnel(device.clone()).unwrap();
        assert!(engine.is_tunnel_running());
        assert!(device.push_inbound(&query_packet(1)));

        assert!(wait_until(|| engine.counters().send_failures == 1));
        assert!(device.drain_outbound().is_empty());
        engine.stop();
        assert!(!engine.is_tunnel_running());
    }

    #[test]
    fn server_changes_reach_a_running_tunnel() {
        let engine = engine();
        let device = Arc::new(MemoryTunDevice::new(1500, 64, TunnelAddressing::default()));
        engine.start_tunnel(device.clone()).unwrap();

        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let upstream: Arc<dyn ServerConnection> = FakeConnection::answering(60, clock);
        *engine.connection.write() = Some(upstream);
        assert!(device.push_inbound(&query_packet(0x1234)));

        let mut reply = None;
        assert!(wait_until(|| {
            reply = device.drain_outbound().into_iter().next();
            reply.is_some()
        }));
        let reply = reply.unwrap();
        let parsed = parse_udp_packet(&reply).unwrap();
        assert_eq!(crate::dns::read_id(parsed.payload), Some(0x1234));

        assert!(wait_until(|| engine.counters().num_requests == 1));
        let history = engine.tracker().recent_transactions();
        assert_eq!(history[0].status, TransactionStatus::Complete);
        assert_eq!(engine.server_url().as_deref(), Some("https://doh.test/dns-query"));
    }

    #[test]
    fn stop_cancels_queries_still_in_flight() {
        let engine = engine();
        let device = Arc::new(MemoryTunDevice::new(1500, 64, TunnelAddressing::default()));
        let upstream = FakeConnection::new(|_| futures::future::pending().boxed());
        *engine.connection.write() = Some(upstream.clone() as Arc<dyn ServerConnection>);
        engine.start_tunnel(device.clone()).unwrap();
        assert!(device.push_inbound(&query_packet(0x0101)));
        assert!(wait_until(|| upstream.request_count() == 1));

        engine.stop();
        assert!(wait_until(|| engine.counters().canceled == 1));
        let counters = engine.counters();
        assert_eq!(counters.send_failures, 0);
        assert_eq!(counters.num_requests, 0);
        assert_eq!(upstream.reset_count(), 1);
        assert_eq!(
            engine.tracker().recent_transactions()[0].status,
            TransactionStatus::Canceled
        );
        assert!(device.drain_outbound().is_empty());
    }

    #[test]
    fn stop_without_a_tunnel_keeps_the_client() {
        let engine = engine();
        let upstream = FakeConnection::failing(DohError::Timeout);
        *engine.connection.write() = Some(upstream.clone() as Arc<dyn ServerConnection>);
        engine.stop();
        assert_eq!(upstream.reset_count(), 0);
    }

    #[test]
    fn starting_a_tunnel_replaces_the_previous_one() {
        let engine = engine();
        let first = Arc::new(MemoryTunDevice::new(1500, 64, TunnelAddressing::default()));
        let second = Arc::new(MemoryTunDevice::new(1500, 64, TunnelAddressing::default()));
        engine.start_tunnel(first.clone()).unwrap();
        engine.start_tunnel(second.clone()).unwrap();
        assert!(first.is_closed());
        assert!(!second.is_closed());
        engine.stop();
        assert!(second.is_closed());
        engine.stop();
    }

    #[test]
    fn invalid_server_is_rejected_and_clears_the_slot() {
        let engine = engine();
        let result = engine.set_server(Some("http://plaintext.test/"));
        assert!(matches!(result, Err(EngineError::Server(DohError::InvalidUrl(_)))));
        assert_eq!(engine.server_url(), None);
    }

    #[test]
    fn empty_race_reports_all_failed() {
        let engine = engine();
        let (done, finished) = std::sync::mpsc::channel();
        engine.race(Vec::new(), Box::new(move |result| {
            let _ = done.send(result);
        }));
        assert_eq!(
            finished.recv_timeout(Duration::from_secs(1)).unwrap(),
            RaceResult::AllFailed
        );
    }

    #[test]
    fn blocking_calls_refuse_to_run_on_the_runtime() {
        let engine = Arc::new(engine());
        let inner = Arc::clone(&engine);
        let result = engine
            .handle()
            .block_on(async move { inner.probe("https://doh.test/dns-query") });
        assert!(matches!(result, Err(EngineError::WrongContext)));
    }
}
