//! A user-space TCP/IP stack: parse and emit TCP segments over a `TUN`
//! device (or, in tests, an in-memory channel), driving every connection
//! through the eleven-state automaton in [`statem`]. See `DESIGN.md` for
//! how each module maps back onto its source material.

use std::net::Ipv4Addr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod quad;
pub mod segment;
pub mod sink;
pub mod socket;
pub mod statem;
pub mod timer;

pub use config::Config;
pub use error::Error;
pub use quad::{Dual, Quad};
pub use sink::{ChannelSink, DatagramSink, TunSink};
pub use socket::{TcpListener, TcpStream};

use manager::ManagerInner;

/// The stack as a whole: a `Manager` plus the background threads that keep
/// it moving, generalized over any `DatagramSink` rather than a hardcoded
/// `Tun`.
pub struct Stack {
    manager: Arc<ManagerInner>,
    io_thread: Option<thread::JoinHandle<()>>,
}

impl Stack {
    /// Opens a TUN device named `name`, assigns it `addr`/`mask`, and spins
    /// up the I/O loop thread.
    pub fn new(name: &str, addr: Ipv4Addr, mask: Ipv4Addr, config: Config) -> Result<Self, Error> {
        let (sink, tun) = TunSink::open(name, addr, mask)?;
        let manager = ManagerInner::new(addr, Arc::new(sink), config);

        let io_thread = {
            let manager = manager.clone();
            thread::spawn(move || manager::run_io_loop(manager, tun))
        };

        Ok(Stack { manager, io_thread: Some(io_thread) })
    }

    /// Wires two in-process `Stack`s together over `mpsc` channels instead
    /// of a real interface; backs the integration tests (`ChannelSink`).
    pub fn pair(a_ip: Ipv4Addr, b_ip: Ipv4Addr, config: Config) -> (Stack, Stack) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();

        let a_manager = ManagerInner::new(a_ip, Arc::new(ChannelSink::new(a_tx)), config.clone());
        let b_manager = ManagerInner::new(b_ip, Arc::new(ChannelSink::new(b_tx)), config);

        let a_thread = {
            let manager = a_manager.clone();
            thread::spawn(move || manager::run_channel_loop(manager, a_rx))
        };
        let b_thread = {
            let manager = b_manager.clone();
            thread::spawn(move || manager::run_channel_loop(manager, b_rx))
        };

        (
            Stack { manager: a_manager, io_thread: Some(a_thread) },
            Stack { manager: b_manager, io_thread: Some(b_thread) },
        )
    }

    pub fn bind(&self, port: u16) -> Result<TcpListener, Error> {
        self.manager.bind(port)
    }

    pub fn connect(&self, peer_ip: Ipv4Addr, peer_port: u16) -> Result<TcpStream, Error> {
        self.manager.connect(peer_ip, peer_port)
    }

    pub fn join(mut self) {
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
    }
}
