//! Thin application-facing handles over a `Connection`. All the actual
//! blocking/locking lives on `Connection`; these types exist to give `Drop`
//! semantics (closing on scope exit) and the `Read`/`Write` impls a stable
//! home.

use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};

use crate::connection::Connection;
use crate::error::Error;
use crate::manager::ManagerInner;
use crate::statem::State;

#[derive(Debug)]
pub struct TcpListener {
    conn: Arc<Connection>,
    manager: Weak<ManagerInner>,
}

impl TcpListener {
    pub(crate) fn new(conn: Arc<Connection>, manager: Weak<ManagerInner>) -> Self {
        TcpListener { conn, manager }
    }

    pub fn accept(&self) -> Result<TcpStream, Error> {
        let child = self.conn.accept()?;
        Ok(TcpStream::new(child, self.manager.clone()))
    }

    pub fn local_port(&self) -> u16 {
        self.conn.quad().host.port
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.conn.force_reset();
        if let Some(manager) = self.manager.upgrade() {
            manager.internal_unbind(self.conn.quad());
        }
    }
}

#[derive(Debug)]
pub struct TcpStream {
    conn: Arc<Connection>,
    manager: Weak<ManagerInner>,
    closed: bool,
}

impl TcpStream {
    pub(crate) fn new(conn: Arc<Connection>, manager: Weak<ManagerInner>) -> Self {
        TcpStream { conn, manager, closed: false }
    }

    pub fn connect(manager: &Arc<ManagerInner>, peer_ip: Ipv4Addr, peer_port: u16) -> Result<Self, Error> {
        manager.connect(peer_ip, peer_port)
    }

    pub fn send(&self, bytes: &[u8]) -> Result<usize, Error> {
        self.conn.send(bytes)
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.conn.recv(buf)
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.conn.close();
        if let Some(manager) = self.manager.upgrade() {
            if self.conn.state() != State::Closed {
                manager.internal_closing(self.conn.quad());
            } else {
                manager.internal_unbind(self.conn.quad());
            }
        }
    }

    pub fn peer(&self) -> (Ipv4Addr, u16) {
        let quad = self.conn.quad();
        (quad.peer.ip, quad.peer.port)
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.conn.recv(buf) {
            Ok(n) => Ok(n),
            // `std::io::Read` signals end-of-stream with Ok(0), not an error.
            Err(Error::ConnectionClosed) => Ok(0),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn
            .send(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.flush().map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.close();
    }
}
