//! The packet pump: a dedicated thread reads from the device, hands each DNS
//! query to the resolver and goes straight back to reading. Replies are
//! written by the resolver tasks.

use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::DNS_PORT;
use crate::device::TunDevice;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::packet::{self, PacketError};
use crate::resolver::{Resolver, ResponseWriter, UdpQuery};

const WOULD_BLOCK_BACKOFF: Duration = Duration::from_millis(5);

struct DeviceWriter {
    device: Arc<dyn TunDevice>,
}

impl ResponseWriter for DeviceWriter {
    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.device.write_packet(packet)
    }
}

/// What the reader did with one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDisposition {
    Dispatched,
    Interrupt,
    Dropped,
}

struct ReaderContext {
    device: Arc<dyn TunDevice>,
    resolver: Arc<Resolver>,
    runtime: Handle,
    writer: Weak<dyn ResponseWriter>,
    session: CancellationToken,
    interrupted: Arc<AtomicBool>,
    mtu: usize,
}

impl ReaderContext {
    fn run(self) {
        logger::breadcrumb(BreadcrumbFlags::TUNNEL, "reader started".to_string());
        let mut buf = vec![0u8; self.mtu];
        while !self.interrupted.load(Ordering::Acquire) {
            let len = match self.device.read_packet(&mut buf) {
                Ok(0) => break,
                Ok(len) => len,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(WOULD_BLOCK_BACKOFF);
                    continue;
                }
                Err(error) => {
                    logger::error(format!("tunnel read failed: {error}"));
                    break;
                }
            };
            handle_packet(&buf[..len], &self.resolver, &self.runtime, &self.writer, &self.session);
        }
        logger::breadcrumb(BreadcrumbFlags::TUNNEL, "reader stopped".to_string());
    }
}

/// Classify one packet read from the device and dispatch it if it is a DNS
/// query. Never fails: bad packets are logged and dropped.
pub fn handle_packet(
    bytes: &[u8],
    resolver: &Arc<Resolver>,
    runtime: &Handle,
    writer: &Weak<dyn ResponseWriter>,
    session: &CancellationToken,
) -> PacketDisposition {
    let udp = match packet::parse_udp_packet(bytes) {
        Ok(udp) => udp,
        Err(PacketError::NotUdp(protocol)) => {
            logger::breadcrumb(
                BreadcrumbFlags::PACKET,
                format!("dropping protocol {protocol} packet"),
            );
            return PacketDisposition::Dropped;
        }
        Err(error) => {
            logger::rate_limited_error(ErrorCategory::MalformedPacket, error.to_string());
            return PacketDisposition::Dropped;
        }
    };
    if udp.is_interrupt() {
        return PacketDisposition::Interrupt;
    }
    if udp.endpoints.destination_port != DNS_PORT {
        logger::breadcrumb(
            BreadcrumbFlags::PACKET,
            format!("dropping UDP to port {}", udp.endpoints.destination_port),
        );
        return PacketDisposition::Dropped;
    }
    let query = match UdpQuery::from_packet(&udp) {
        Ok(query) if !query.query.is_response => query,
        Ok(_) => {
            logger::breadcrumb(BreadcrumbFlags::DNS, "dropping DNS response".to_string());
            return PacketDisposition::Dropped;
        }
        Err(error) => {
            logger::rate_limited_error(ErrorCategory::MalformedDns, error.to_string());
            return PacketDisposition::Dropped;
        }
    };
    resolver.dispatch(runtime, query, writer.clone(), session.clone());
    PacketDisposition::Dispatched
}

/// One tunnel session over one device.
pub struct Tunnel {
    device: Arc<dyn TunDevice>,
    resolver: Arc<Resolver>,
    runtime: Handle,
    mtu: usize,
    interrupted: Arc<AtomicBool>,
    session: CancellationToken,
    writer: Mutex<Option<Arc<dyn ResponseWriter>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Tunnel {
    pub fn new(device: Arc<dyn TunDevice>, resolver: Arc<Resolver>, runtime: Handle, mtu: usize) -> Self {
        let writer: Arc<dyn ResponseWriter> = Arc::new(DeviceWriter {
            device: Arc::clone(&device),
        });
        Self {
            device,
            resolver,
            runtime,
            mtu,
            interrupted: Arc::new(AtomicBool::new(false)),
            session: CancellationToken::new(),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(None),
        }
    }

    /// Spawn the reader thread. Calling it again, or after `close`, does
    /// nothing.
    pub fn start(&self) -> io::Result<()> {
        let mut reader = self.reader.lock();
        if reader.is_some() || self.interrupted.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(writer) = self.writer.lock().as_ref().map(Arc::downgrade) else {
            return Ok(());
        };
        let context = ReaderContext {
            device: Arc::clone(&self.device),
            resolver: Arc::clone(&self.resolver),
            runtime: self.runtime.clone(),
            writer,
            session: self.session.clone(),
            interrupted: Arc::clone(&self.interrupted),
            mtu: self.mtu,
        };
        let handle = thread::Builder::new()
            .name("tun-reader".into())
            .spawn(move || context.run())?;
        *reader = Some(handle);
        logger::info(format!("tunnel started (mtu {})", self.mtu));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.reader
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the reader, wait for it, then close the device. Queries still in
    /// flight end as canceled. Safe to call at any point, any number of times.
    pub fn close(&self) {
        if self.interrupted.swap(true, Ordering::AcqRel) {
            return;
        }
        self.session.cancel();
        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            if !handle.is_finished() {
                if let Err(error) = self.device.wake() {
                    logger::warn(format!("tunnel wake failed: {error}"));
                    // Closing releases readers the wake could not reach.
                    self.device.close();
                }
            }
            if handle.join().is_err() {
                logger::error("tunnel reader panicked".to_string());
            }
        }
        self.writer.lock().take();
        self.device.close();
        logger::info("tunnel closed".to_string());
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}
