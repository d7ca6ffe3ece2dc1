//! Tunnel device endpoints. The reader thread blocks in `read_packet`;
//! replies are written from runtime workers, so every method takes `&self`.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::TunnelAddressing;
use crate::logger::{self, BreadcrumbFlags};
use crate::packet::{self, IPPROTO_UDP};

pub const MAX_EMIT_BATCH: usize = 64;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub trait TunDevice: Send + Sync {
    /// Block until a packet is available and copy it into `buf`. `Ok(0)`
    /// means the device is closed.
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_packet(&self, packet: &[u8]) -> io::Result<()>;

    /// Unblock a pending `read_packet` by getting an empty datagram to it.
    fn wake(&self) -> io::Result<()>;

    fn close(&self);
}

/// The empty UDP datagram the reader treats as an interrupt.
pub fn interrupt_packet(addressing: &TunnelAddressing) -> io::Result<Vec<u8>> {
    let endpoints = addressing.interrupt_endpoints();
    let segment = packet::build_udp(&endpoints, &[]).map_err(io::Error::other)?;
    packet::build_packet(IPPROTO_UDP, endpoints.source, endpoints.destination, &segment)
        .map_err(io::Error::other)
}

enum Outbound {
    Ring(Mutex<VecDeque<Vec<u8>>>),
    Sink(Box<dyn Fn(&[u8]) + Send + Sync>),
}

/// An in-process device: the host pushes inbound packets and either drains
/// replies from a ring or receives them through a callback.
pub struct MemoryTunDevice {
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<Vec<u8>>,
    outbound: Outbound,
    capacity: usize,
    mtu: usize,
    closed: AtomicBool,
    addressing: TunnelAddressing,
}

impl MemoryTunDevice {
    pub fn new(mtu: usize, capacity: usize, addressing: TunnelAddressing) -> Self {
        let capacity = capacity.max(16);
        Self::build(
            mtu,
            capacity,
            addressing,
            Outbound::Ring(Mutex::new(VecDeque::with_capacity(capacity))),
        )
    }

    pub fn with_sink(
        mtu: usize,
        capacity: usize,
        addressing: TunnelAddressing,
        sink: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Self {
        Self::build(mtu, capacity.max(16), addressing, Outbound::Sink(Box::new(sink)))
    }

    fn build(mtu: usize, capacity: usize, addressing: TunnelAddressing, outbound: Outbound) -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::bounded(capacity);
        Self {
            inbound_tx,
            inbound_rx,
            outbound,
            capacity,
            mtu: mtu.max(576),
            closed: AtomicBool::new(false),
            addressing,
        }
    }

    /// Queue a packet for the reader. Returns `false` if it was dropped
    /// because the device is closed or the queue is full.
    pub fn push_inbound(&self, packet: &[u8]) -> bool {
        if packet.is_empty() || self.closed.load(Ordering::Acquire) {
            return false;
        }
        let capped = packet.len().min(self.mtu);
        match self.inbound_tx.try_send(packet[..capped].to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                logger::breadcrumb(
                    BreadcrumbFlags::DEVICE,
                    "inbound queue full, dropping packet".to_string(),
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Up to `MAX_EMIT_BATCH` replies, oldest first. Empty when replies go
    /// to a sink.
    pub fn drain_outbound(&self) -> Vec<Vec<u8>> {
        match &self.outbound {
            Outbound::Ring(ring) => {
                let mut guard = ring.lock();
                let count = MAX_EMIT_BATCH.min(guard.len());
                guard.drain(..count).collect()
            }
            Outbound::Sink(_) => Vec::new(),
        }
    }

    pub fn inbound_queue_len(&self) -> usize {
        self.inbound_rx.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl TunDevice for MemoryTunDevice {
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Ok(0);
        }
        let packet = self
            .inbound_rx
            .recv()
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        if self.is_closed() {
            return Ok(0);
        }
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        match &self.outbound {
            Outbound::Ring(ring) => {
                let mut guard = ring.lock();
                if guard.len() >= self.capacity {
                    guard.pop_front();
                }
                guard.push_back(packet.to_vec());
            }
            Outbound::Sink(sink) => sink(packet),
        }
        Ok(())
    }

    fn wake(&self) -> io::Result<()> {
        let packet = interrupt_packet(&self.addressing)?;
        // Bypasses the closed check in push_inbound.
        match self.inbound_tx.try_send(packet) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            logger::breadcrumb(BreadcrumbFlags::DEVICE, "memory device closed".to_string());
            // Release a reader that is still parked in recv.
            let _ = self.inbound_tx.try_send(Vec::new());
        }
    }
}

#[cfg(unix)]
pub use self::fd::FdTunDevice;

#[cfg(unix)]
mod fd {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, UdpSocket};
    use std::os::fd::{AsRawFd, FromRawFd, RawFd};

    const POLL_TIMEOUT_MS: libc::c_int = 250;

    /// A device backed by a TUN file descriptor owned by the host. The fd is
    /// duplicated, so closing this device never closes the host's copy.
    pub struct FdTunDevice {
        file: File,
        fake_dns: SocketAddr,
        closed: AtomicBool,
    }

    impl FdTunDevice {
        pub fn from_host_fd(fd: RawFd, addressing: &TunnelAddressing) -> io::Result<Self> {
            if fd < 0 {
                return Err(io::Error::from(io::ErrorKind::InvalidInput));
            }
            let duplicate = unsafe { libc::dup(fd) };
            if duplicate < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: `duplicate` is a freshly created descriptor nobody else owns.
            let file = unsafe { File::from_raw_fd(duplicate) };
            logger::breadcrumb(
                BreadcrumbFlags::DEVICE,
                format!("tun fd {fd} duplicated as {duplicate}"),
            );
            Ok(Self {
                file,
                fake_dns: addressing.fake_dns(),
                closed: AtomicBool::new(false),
            })
        }

        pub fn from_file(file: File, addressing: &TunnelAddressing) -> Self {
            Self {
                file,
                fake_dns: addressing.fake_dns(),
                closed: AtomicBool::new(false),
            }
        }
    }

    impl TunDevice for FdTunDevice {
        fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            let mut pollfd = libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            // Bounded wait so the reader rechecks its interrupt flag even when
            // the wake datagram is not routed back to us.
            let ready = unsafe { libc::poll(&mut pollfd, 1, POLL_TIMEOUT_MS) };
            match ready {
                0 => Err(io::Error::from(io::ErrorKind::WouldBlock)),
                n if n < 0 => Err(io::Error::last_os_error()),
                _ => (&self.file).read(buf),
            }
        }

        fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            }
            (&self.file).write_all(packet)
        }

        /// The host routes the fake DNS address into the tunnel, so an empty
        /// datagram sent there comes back out of `read_packet`.
        fn wake(&self) -> io::Result<()> {
            let bind: SocketAddr = match self.fake_dns {
                SocketAddr::V4(_) => "0.0.0.0:0".parse().map_err(io::Error::other)?,
                SocketAddr::V6(_) => "[::]:0".parse().map_err(io::Error::other)?,
            };
            let socket = UdpSocket::bind(bind)?;
            socket.send_to(&[], self.fake_dns)?;
            Ok(())
        }

        fn close(&self) {
            if !self.closed.swap(true, Ordering::AcqRel) {
                logger::breadcrumb(BreadcrumbFlags::DEVICE, "fd device closed".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests;
