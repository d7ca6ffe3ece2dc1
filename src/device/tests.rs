use super::*;
use crate::packet::parse_udp_packet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TEST_MTU: usize = 1500;

fn make_device() -> MemoryTunDevice {
    MemoryTunDevice::new(TEST_MTU, 16, TunnelAddressing::default())
}

#[test]
fn push_inbound_truncates_to_mtu() {
    let device = make_device();
    assert!(device.push_inbound(&vec![0x45; TEST_MTU + 100]));
    let mut buf = vec![0u8; 4096];
    assert_eq!(device.read_packet(&mut buf).unwrap(), TEST_MTU);
}

#[test]
fn push_inbound_rejects_empty_and_full() {
    let device = make_device();
    assert!(!device.push_inbound(&[]));
    for _ in 0..16 {
        assert!(device.push_inbound(&[0x45; 20]));
    }
    assert!(!device.push_inbound(&[0x45; 20]));
    assert_eq!(device.inbound_queue_len(), 16);
}

#[test]
fn outbound_drains_in_order_and_in_batches() {
    let device = MemoryTunDevice::new(TEST_MTU, 256, TunnelAddressing::default());
    for tag in 0..(MAX_EMIT_BATCH as u8 + 4) {
        device.write_packet(&[tag]).unwrap();
    }
    let first = device.drain_outbound();
    assert_eq!(first.len(), MAX_EMIT_BATCH);
    assert_eq!(first[0], vec![0]);
    let rest = device.drain_outbound();
    assert_eq!(rest.len(), 4);
    assert_eq!(rest[3], vec![MAX_EMIT_BATCH as u8 + 3]);
}

#[test]
fn full_outbound_ring_evicts_oldest() {
    let device = make_device();
    for tag in 0..20u8 {
        device.write_packet(&[tag]).unwrap();
    }
    let drained = device.drain_outbound();
    assert_eq!(drained.len(), 16);
    assert_eq!(drained[0], vec![4]);
}

#[test]
fn sink_receives_replies() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let captured = seen.clone();
    let device = MemoryTunDevice::with_sink(TEST_MTU, 16, TunnelAddressing::default(), move |packet| {
        captured.lock().push(packet.to_vec());
    });
    device.write_packet(&[1, 2, 3]).unwrap();
    assert_eq!(*seen.lock(), vec![vec![1, 2, 3]]);
    assert!(device.drain_outbound().is_empty());
}

#[test]
fn wake_injects_an_empty_datagram_to_fake_dns() {
    let addressing = TunnelAddressing::default();
    let device = make_device();
    device.wake().unwrap();
    let mut buf = vec![0u8; TEST_MTU];
    let len = device.read_packet(&mut buf).unwrap();
    let packet = parse_udp_packet(&buf[..len]).unwrap();
    assert!(packet.is_interrupt());
    assert_eq!(packet.endpoints, addressing.interrupt_endpoints());
}

#[test]
fn close_releases_a_blocked_reader() {
    let device = Arc::new(make_device());
    let reader = {
        let device = device.clone();
        thread::spawn(move || {
            let mut buf = vec![0u8; TEST_MTU];
            device.read_packet(&mut buf).unwrap()
        })
    };
    thread::sleep(Duration::from_millis(20));
    device.close();
    assert_eq!(reader.join().unwrap(), 0);

    assert!(device.is_closed());
    assert!(!device.push_inbound(&[0x45; 20]));
    assert!(device.write_packet(&[1]).is_err());
    device.close();
}

#[cfg(unix)]
#[test]
fn fd_device_duplicates_the_host_fd() {
    use std::os::fd::{AsRawFd, FromRawFd};

    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let read_end = unsafe { std::fs::File::from_raw_fd(fds[0]) };
    let write_end = unsafe { std::fs::File::from_raw_fd(fds[1]) };

    let addressing = TunnelAddressing::default();
    let reader = FdTunDevice::from_host_fd(read_end.as_raw_fd(), &addressing).unwrap();
    let writer = FdTunDevice::from_host_fd(write_end.as_raw_fd(), &addressing).unwrap();
    writer.write_packet(&[0x45, 0, 0, 20]).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(reader.read_packet(&mut buf).unwrap(), 4);

    // the host's descriptors stay usable after ours are dropped
    drop(writer);
    assert_ne!(unsafe { libc::fcntl(write_end.as_raw_fd(), libc::F_GETFD) }, -1);
    reader.close();
    assert_eq!(reader.read_packet(&mut buf).unwrap(), 0);
    assert!(FdTunDevice::from_host_fd(-1, &addressing).is_err());
}
