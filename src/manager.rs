//! Four-tuple demultiplexing, port allocation and the background threads
//! that drive inbound dispatch and outbound flushing.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use etherparse::Ipv4HeaderSlice;
use log::{debug, trace, warn};
use nix::poll::{poll, PollFd, PollFlags};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::Error;
use crate::quad::{Dual, Quad};
use crate::segment::{self, Flags, Header, PseudoHeader};
use crate::sink::DatagramSink;
use crate::socket::{TcpListener, TcpStream};
use crate::statem::{HeaderEvent, HeaderKind};
use crate::timer::TimerService;

#[derive(Default)]
struct ManagerState {
    id_map: HashMap<Quad, Arc<Connection>>,
    /// Freshly `new_socket()`ed connections that aren't yet bound or
    /// connected; kept alive solely by this vector until `listen`/`connect`
    /// gives them a real quad and moves them into `id_map`.
    unused: Vec<Arc<Connection>>,
    /// Four-tuples whose app handle has already been dropped but whose
    /// connection is still draining (FinWait/Closing/LastAck/TimeWait).
    unreferenced: HashSet<Quad>,
    wait_send: HashSet<Quad>,
    /// Four-tuples reserved past removal from `id_map` until their
    /// TIME-WAIT timer actually fires, so a reused ephemeral port can't
    /// collide with a late-arriving segment of a prior incarnation.
    recently_used: HashSet<Quad>,
}

pub struct ManagerInner {
    host_ip: Ipv4Addr,
    sink: Arc<dyn DatagramSink>,
    config: Arc<Config>,
    timers: TimerService,
    state: Mutex<ManagerState>,
    rng: Mutex<StdRng>,
    self_weak: Weak<ManagerInner>,
}

impl ManagerInner {
    pub fn new(host_ip: Ipv4Addr, sink: Arc<dyn DatagramSink>, config: Config) -> Arc<ManagerInner> {
        let config = Arc::new(config);
        Arc::new_cyclic(|weak| ManagerInner {
            host_ip,
            sink,
            timers: TimerService::new(config.timer_workers),
            config,
            state: Mutex::new(ManagerState::default()),
            rng: Mutex::new(StdRng::from_entropy()),
            self_weak: weak.clone(),
        })
    }

    fn weak(&self) -> Weak<ManagerInner> {
        self.self_weak.clone()
    }

    fn draw_iss(&self) -> u32 {
        let mut rng = self.rng.lock().unwrap();
        rng.gen_range(self.config.isn_range.clone())
    }

    /// Creates a fresh, unbound connection kept alive by `unused` until it
    /// is given a quad via `listen`/`connect`.
    fn new_socket(self: &Arc<Self>) -> Arc<Connection> {
        let iss = self.draw_iss();
        let conn = Connection::new(
            Quad::listening(Ipv4Addr::UNSPECIFIED, 0),
            iss,
            self.weak(),
            self.sink.clone(),
            self.config.clone(),
        );
        self.state.lock().unwrap().unused.push(conn.clone());
        conn
    }

    pub fn bind(self: &Arc<Self>, port: u16) -> Result<TcpListener, Error> {
        let conn = self.new_socket();
        let quad = Quad::listening(self.host_ip, port);

        let mut state = self.state.lock().unwrap();
        if state.id_map.contains_key(&quad) {
            return Err(Error::PortInUse(port));
        }
        state.unused.retain(|c| !Arc::ptr_eq(c, &conn));
        *conn.quad.lock().unwrap() = quad;
        state.id_map.insert(quad, conn.clone());
        drop(state);

        conn.mark_listening();
        Ok(TcpListener::new(conn, self.weak()))
    }

    pub fn connect(self: &Arc<Self>, peer_ip: Ipv4Addr, peer_port: u16) -> Result<TcpStream, Error> {
        let conn = self.new_socket();
        let host_port = self.alloc_port(Dual { ip: peer_ip, port: peer_port })?;
        let quad = Quad {
            host: Dual { ip: self.host_ip, port: host_port },
            peer: Dual { ip: peer_ip, port: peer_port },
        };

        let mut state = self.state.lock().unwrap();
        state.unused.retain(|c| !Arc::ptr_eq(c, &conn));
        *conn.quad.lock().unwrap() = quad;
        state.id_map.insert(quad, conn.clone());
        drop(state);

        conn.connect(peer_ip, peer_port)?;
        Ok(TcpStream::new(conn, self.weak()))
    }

    /// Draws up to 65536 candidate ports before giving up.
    fn alloc_port(&self, peer: Dual) -> Result<u16, Error> {
        let mut rng = self.rng.lock().unwrap();
        let state = self.state.lock().unwrap();
        for _ in 0..65536u32 {
            let port: u16 = rng.gen_range(1..=65535);
            let quad = Quad {
                host: Dual { ip: self.host_ip, port },
                peer,
            };
            if !state.id_map.contains_key(&quad) && !state.recently_used.contains(&quad) {
                return Ok(port);
            }
        }
        Err(Error::PortExhausted)
    }

    /// Called by a Listen-state connection's `spawn_child` when a fresh
    /// SYN needs a new child connection registered under the full quad.
    pub(crate) fn internal_new_connection(self: &Arc<Self>, quad: Quad) -> Option<Arc<Connection>> {
        let mut state = self.state.lock().unwrap();
        if state.id_map.contains_key(&quad) {
            return None;
        }
        drop(state);

        let iss = self.draw_iss();
        let conn = Connection::new(quad, iss, self.weak(), self.sink.clone(), self.config.clone());

        let mut state = self.state.lock().unwrap();
        state.id_map.insert(quad, conn.clone());
        Some(conn)
    }

    pub(crate) fn mark_ready_to_send(&self, quad: Quad) {
        self.state.lock().unwrap().wait_send.insert(quad);
    }

    pub(crate) fn schedule_time_wait(self: &Arc<Self>, quad: Quad, delay: Duration) {
        self.state.lock().unwrap().recently_used.insert(quad);
        let manager = self.weak();
        self.timers.schedule(delay, move || {
            if let Some(manager) = manager.upgrade() {
                manager.expire_time_wait(quad);
            }
            false
        });
    }

    fn expire_time_wait(&self, quad: Quad) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.id_map.remove(&quad) {
            conn.reset_to_closed();
        }
        state.recently_used.remove(&quad);
        state.unreferenced.remove(&quad);
    }

    pub(crate) fn send_with_resend(self: &Arc<Self>, conn: Arc<Connection>, packet: segment::Packet, delay: Duration) {
        self.timers.schedule(delay, move || conn.resend_if_needed(&packet));
    }

    /// Marks a connection's handle as gone. If the connection is still
    /// draining (not yet `Closed`), it stays in `id_map` — tracked instead
    /// in `unreferenced` — so in-flight FIN/ACK exchanges complete.
    pub(crate) fn internal_closing(&self, quad: Quad) {
        self.state.lock().unwrap().unreferenced.insert(quad);
    }

    /// Reclaims a connection's quad once it reaches `Closed` directly (the
    /// passive-close `LastAck -> Closed` path, which never schedules a
    /// TIME-WAIT timer). A no-op unless the app handle was already dropped
    /// while the close was still in flight — otherwise the eventual
    /// `TcpStream::close`/`Drop` call does the unbind itself.
    pub(crate) fn internal_finalize(&self, quad: Quad) {
        let mut state = self.state.lock().unwrap();
        if state.unreferenced.remove(&quad) {
            state.id_map.remove(&quad);
        }
    }

    pub(crate) fn internal_unbind(&self, quad: Quad) {
        let mut state = self.state.lock().unwrap();
        state.id_map.remove(&quad);
    }

    /// The inbound entry point. Parses the IPv4 envelope, checks the
    /// checksum, resolves the owning connection (full four-tuple, falling
    /// back to the listening quad) and dispatches.
    pub fn receive_datagram(self: &Arc<Self>, raw: &[u8]) {
        let Ok(ip4h) = Ipv4HeaderSlice::from_slice(raw) else {
            return;
        };
        let ihl = ip4h.ihl() as usize * 4;
        if raw.len() < ihl + segment::HEADER_LEN {
            return;
        }

        let tcp_bytes = &raw[ihl..];
        let mut header_buf = [0u8; segment::HEADER_LEN];
        header_buf.copy_from_slice(&tcp_bytes[..segment::HEADER_LEN]);
        let header = Header::to_host(&header_buf);
        let payload = tcp_bytes[segment::HEADER_LEN..].to_vec();

        let Some(kind) = classify(header.flags) else {
            trace!("unclassifiable flags {:?}, dropping", header.flags);
            return;
        };

        let quad = Quad {
            host: Dual { ip: ip4h.destination_addr(), port: header.dst_port },
            peer: Dual { ip: ip4h.source_addr(), port: header.src_port },
        };

        let pseudo = PseudoHeader {
            src_ip: u32::from(ip4h.source_addr()),
            dst_ip: u32::from(ip4h.destination_addr()),
            protocol: PseudoHeader::PROTOCOL_TCP,
            tcp_len: tcp_bytes.len() as u16,
        };
        let checksum_ok = segment::verify_checksum(&pseudo, &header, &payload);

        let event = HeaderEvent {
            kind,
            seq: header.seq,
            ack: header.ack,
            window: header.window,
            payload,
        };

        let conn = {
            let state = self.state.lock().unwrap();
            state
                .id_map
                .get(&quad)
                .cloned()
                .or_else(|| state.id_map.get(&Quad::listening(quad.host.ip, quad.host.port)).cloned())
        };

        match conn {
            Some(conn) => conn.recv_header_event(quad, event, checksum_ok),
            None if checksum_ok && kind != HeaderKind::Rst => self.send_unmatched_rst(quad, &event),
            None => debug!("dropping segment for unknown quad {:?}", quad),
        }
    }

    /// No connection owns this four-tuple, so there is no `Connection` to
    /// build and send the reply — the manager does it directly instead.
    fn send_unmatched_rst(&self, quad: Quad, event: &HeaderEvent) {
        let (seq, ack) = if event.kind == HeaderKind::Ack {
            (event.ack, 0)
        } else {
            let mut len = event.payload.len() as u32;
            if event.kind == HeaderKind::Syn || event.kind == HeaderKind::SynAck {
                len += 1;
            }
            (0, event.seq.wrapping_add(len))
        };

        let mut header = Header {
            src_port: quad.host.port,
            dst_port: quad.peer.port,
            seq,
            ack,
            flags: Flags::RST | Flags::ACK,
            window: 0,
            checksum: 0,
            urgent_ptr: 0,
        };

        let pseudo = PseudoHeader {
            src_ip: u32::from(quad.host.ip),
            dst_ip: u32::from(quad.peer.ip),
            protocol: PseudoHeader::PROTOCOL_TCP,
            tcp_len: segment::HEADER_LEN as u16,
        };
        header.checksum = segment::checksum(&pseudo, &header, &[]);

        let packet = segment::make_packet(header, vec![]);
        let tcp_bytes = packet.to_wire();
        let ip_header = etherparse::Ipv4Header::new(
            tcp_bytes.len() as u16,
            64,
            PseudoHeader::PROTOCOL_TCP,
            quad.host.ip.octets(),
            quad.peer.ip.octets(),
        );
        let mut out = Vec::with_capacity(20 + tcp_bytes.len());
        ip_header.write(&mut out).unwrap();
        out.extend_from_slice(&tcp_bytes);
        self.sink.send_datagram(&out);
    }

    /// Drains `wait_send`, carving and transmitting whatever each
    /// connection has queued. Run both periodically and on demand.
    pub fn flush(&self) {
        let quads: Vec<Quad> = {
            let state = self.state.lock().unwrap();
            state.wait_send.iter().copied().collect()
        };

        for quad in quads {
            let conn = {
                let state = self.state.lock().unwrap();
                state.id_map.get(&quad).cloned()
            };
            let Some(conn) = conn else {
                self.state.lock().unwrap().wait_send.remove(&quad);
                continue;
            };

            let sent = conn.carve_and_transmit();
            if !sent {
                self.state.lock().unwrap().wait_send.remove(&quad);
            }
        }
    }
}

fn classify(flags: Flags) -> Option<HeaderKind> {
    if flags.contains(Flags::RST) {
        Some(HeaderKind::Rst)
    } else if flags.contains(Flags::SYN) && flags.contains(Flags::ACK) {
        Some(HeaderKind::SynAck)
    } else if flags.contains(Flags::SYN) {
        Some(HeaderKind::Syn)
    } else if flags.contains(Flags::FIN) {
        Some(HeaderKind::Fin)
    } else if flags.contains(Flags::ACK) {
        Some(HeaderKind::Ack)
    } else {
        None
    }
}

/// Background I/O thread: polls the TUN device's readable side and feeds
/// every datagram through `receive_datagram`, with a `flush()` pass each
/// iteration. Generalized past a single-owner `Tun` since `TunSink` now
/// writes through the same handle concurrently.
pub fn run_io_loop(manager: Arc<ManagerInner>, tun: Arc<Mutex<tidy_tuntap::Tun>>) -> ! {
    let mut buf = [0u8; 1500];
    let fd = tun.lock().unwrap().as_raw_fd();
    loop {
        manager.flush();

        let mut pfd = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut pfd[..], manager.config.flush_interval.as_millis() as i32) {
            Ok(0) | Err(_) => continue,
            Ok(_) => {}
        }

        let n = match tun.lock().unwrap().read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                warn!("read failed: {e}");
                continue;
            }
        };
        manager.receive_datagram(&buf[..n]);
    }
}

/// Drains a `std::sync::mpsc::Receiver<Vec<u8>>` instead of polling a file
/// descriptor; backs the `ChannelSink`-based integration tests with two
/// in-process managers wired directly to each other.
pub fn run_channel_loop(manager: Arc<ManagerInner>, rx: std::sync::mpsc::Receiver<Vec<u8>>) {
    loop {
        manager.flush();
        match rx.recv_timeout(manager.config.flush_interval) {
            Ok(bytes) => manager.receive_datagram(&bytes),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}
