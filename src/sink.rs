//! The outbound half of the transport abstraction: lets tests swap in an
//! in-memory transport instead of opening a real TUN device. Callers hand
//! `send_datagram` a complete IPv4 datagram (header already attached by
//! `Connection`/`Manager`); the sink's only job is getting those bytes
//! onto the wire.

use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::error::Error;

/// Fire-and-forget datagram transmission. No delivery guarantee is made or
/// assumed by the manager.
pub trait DatagramSink: Send + Sync {
    fn send_datagram(&self, bytes: &[u8]);
}

/// Wraps a `tidy_tuntap::Tun`. Shared with the I/O loop's read side via
/// the same `Arc<Mutex<_>>` rather than a second file descriptor.
pub struct TunSink {
    tun: Arc<Mutex<tidy_tuntap::Tun>>,
}

impl TunSink {
    /// Opens and configures the device, returning a sink plus the shared
    /// handle `run_io_loop` reads from.
    pub fn open(name: &str, addr: Ipv4Addr, mask: Ipv4Addr) -> Result<(Self, Arc<Mutex<tidy_tuntap::Tun>>), Error> {
        let tun = tidy_tuntap::Tun::new(name, false)?;
        tun.set_addr(addr)?;
        tun.set_netmask(mask)?;
        tun.bring_up()?;

        let tun = Arc::new(Mutex::new(tun));
        Ok((TunSink { tun: tun.clone() }, tun))
    }
}

impl DatagramSink for TunSink {
    fn send_datagram(&self, bytes: &[u8]) {
        let mut tun = self.tun.lock().unwrap();
        if let Err(e) = tun.write_all(bytes) {
            warn!("tun write failed: {e}");
        }
    }
}

/// An in-process transport used by tests: wraps an `mpsc::Sender<Vec<u8>>`
/// so two `Manager`s can be wired directly to each other's inbound queue
/// without a real interface.
pub struct ChannelSink {
    tx: Sender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Vec<u8>>) -> Self {
        ChannelSink { tx }
    }
}

impl DatagramSink for ChannelSink {
    fn send_datagram(&self, bytes: &[u8]) {
        let _ = self.tx.send(bytes.to_vec());
    }
}
