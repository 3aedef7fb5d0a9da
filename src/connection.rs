//! A single connection's TCB, buffers and blocking surface. The
//! automaton in `statem` owns all state transitions; `Connection` owns
//! the lock, the buffers, the condvars, and the glue that turns a
//! `Reaction` into bytes on the wire.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use etherparse::Ipv4Header;
use log::{debug, trace, warn};

use crate::buffer::{RecvBuffer, SendBuffer};
use crate::config::Config;
use crate::error::Error;
use crate::manager::ManagerInner;
use crate::quad::Quad;
use crate::segment::{self, Flags, Header, PacketData, PseudoHeader};
use crate::sink::DatagramSink;
use crate::statem::{self, AppEvent, HeaderEvent, HeaderKind, Reaction, State, Tcb};

struct Inner {
    state: State,
    tcb: Tcb,
    send_buf: SendBuffer,
    recv_buf: RecvBuffer,
    /// Only populated while `state == State::Listen`.
    accept_queue: std::collections::VecDeque<Arc<Connection>>,
}

/// A single four-tuple's worth of TCP state. Guarded by its own lock,
/// distinct from the manager's — locking discipline is manager before
/// connection, never the reverse.
pub struct Connection {
    pub quad: Mutex<Quad>,
    manager: Weak<ManagerInner>,
    sink: Arc<dyn DatagramSink>,
    config: Arc<Config>,
    inner: Mutex<Inner>,
    connect_cv: Condvar,
    accept_cv: Condvar,
    recv_cv: Condvar,
    send_cv: Condvar,
    pub(crate) reset: AtomicBool,
    /// Set only on a child spawned by `spawn_child`, cleared once the
    /// three-way handshake completes and the child is handed to the
    /// listener's `accept_queue`, which only ever holds fully established
    /// connections.
    listener: Mutex<Option<Weak<Connection>>>,
}

impl Connection {
    pub fn new(
        quad: Quad,
        iss: u32,
        manager: Weak<ManagerInner>,
        sink: Arc<dyn DatagramSink>,
        config: Arc<Config>,
    ) -> Arc<Connection> {
        Arc::new(Connection {
            quad: Mutex::new(quad),
            manager,
            sink,
            config: config.clone(),
            inner: Mutex::new(Inner {
                state: State::Closed,
                tcb: Tcb {
                    iss,
                    una: iss,
                    nxt: iss,
                    wnd: config.initial_window,
                    rcv_nxt: 0,
                    rcv_wnd: config.initial_window,
                },
                send_buf: SendBuffer::new(),
                recv_buf: RecvBuffer::new(),
                accept_queue: std::collections::VecDeque::new(),
            }),
            connect_cv: Condvar::new(),
            accept_cv: Condvar::new(),
            recv_cv: Condvar::new(),
            send_cv: Condvar::new(),
            reset: AtomicBool::new(false),
            listener: Mutex::new(None),
        })
    }

    pub fn quad(&self) -> Quad {
        *self.quad.lock().unwrap()
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    // ---- application-facing operations (no manager lock held) ----

    /// Marks the connection as a rendezvous point for `listen(port)`.
    /// Called by the manager while it still holds its own lock, so this
    /// never itself touches `self.manager`.
    pub fn mark_listening(&self) {
        let mut inner = self.inner.lock().unwrap();
        let prev_state = inner.state;
        let (_, state) = statem::on_app_event(&mut inner.tcb, prev_state, AppEvent::Listen(0));
        inner.state = state;
    }

    /// Drives an active open. Blocks until `Estab` or the connection is
    /// reset.
    pub fn connect(self: &Arc<Self>, peer: Ipv4Addr, peer_port: u16) -> Result<(), Error> {
        let reactions = {
            let mut inner = self.inner.lock().unwrap();
            let prev_state = inner.state;
            let (reactions, state) =
                statem::on_app_event(&mut inner.tcb, prev_state, AppEvent::Connect(peer, peer_port));
            inner.state = state;
            reactions
        };
        self.apply_reactions(reactions);

        let mut inner = self.inner.lock().unwrap();
        while inner.state != State::Estab && !self.is_reset() {
            inner = self.connect_cv.wait(inner).unwrap();
        }
        drop(inner);

        if self.is_reset() {
            return Err(Error::ConnectionReset);
        }
        Ok(())
    }

    /// Blocks until a freshly `SynRcvd`-then-established child is queued,
    /// or the connection is reset (listener torn down).
    pub fn accept(self: &Arc<Self>) -> Result<Arc<Connection>, Error> {
        let mut inner = self.inner.lock().unwrap();
        while inner.accept_queue.is_empty() && !self.is_reset() {
            inner = self.accept_cv.wait(inner).unwrap();
        }
        if let Some(child) = inner.accept_queue.pop_front() {
            return Ok(child);
        }
        Err(Error::ConnectionReset)
    }

    /// Queues `bytes` for transmission and tells the manager this
    /// connection has data ready to carve. Rejects writes once the send
    /// side is no longer open.
    pub fn send(self: &Arc<Self>, bytes: &[u8]) -> Result<usize, Error> {
        if self.is_reset() {
            return Err(Error::ConnectionReset);
        }

        {
            let inner = self.inner.lock().unwrap();
            match inner.state {
                State::Estab | State::CloseWait => {}
                State::FinWait1 | State::FinWait2 | State::Closing | State::LastAck | State::TimeWait | State::Closed => {
                    return Err(Error::ConnectionClosed)
                }
                _ => return Err(Error::InvalidOperation("send is only valid while established")),
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.send_buf.push(bytes);
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.mark_ready_to_send(self.quad());
        }
        Ok(bytes.len())
    }

    /// Blocks until every byte handed to `send` so far has been
    /// acknowledged. `close()` fires its FIN immediately regardless of
    /// pending data, so a caller that needs the whole write delivered
    /// before closing must `flush()` first.
    pub fn flush(self: &Arc<Self>) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        while inner.send_buf.size() > 0 && !self.is_reset() {
            inner = self.send_cv.wait(inner).unwrap();
        }
        if self.is_reset() {
            return Err(Error::ConnectionReset);
        }
        Ok(())
    }

    /// Blocks until `buf.len()` bytes have accumulated, the peer's FIN has
    /// been seen, or the connection is reset — this stack never hands back
    /// a short read while the connection is still open.
    pub fn recv(self: &Arc<Self>, buf: &mut [u8]) -> Result<usize, Error> {
        let mut inner = self.inner.lock().unwrap();
        while inner.recv_buf.len() < buf.len()
            && !self.is_reset()
            && !matches!(
                inner.state,
                State::CloseWait | State::Closing | State::LastAck | State::Closed | State::TimeWait
            )
        {
            inner = self.recv_cv.wait(inner).unwrap();
        }

        if inner.recv_buf.is_empty() {
            if self.is_reset() {
                return Err(Error::ConnectionReset);
            }
            return Err(Error::ConnectionClosed);
        }

        let n = buf.len().min(inner.recv_buf.len());
        let bytes = inner.recv_buf.take(n);
        buf[..n].copy_from_slice(&bytes);
        Ok(n)
    }

    /// Drives the active-close half of the automaton. A second call on an
    /// already-closed connection is a documented no-op.
    pub fn close(self: &Arc<Self>) {
        let reactions = {
            let mut inner = self.inner.lock().unwrap();
            let prev_state = inner.state;
            let (reactions, state) = statem::on_app_event(&mut inner.tcb, prev_state, AppEvent::Close);
            inner.state = state;
            reactions
        };
        self.apply_reactions(reactions);
    }

    // ---- manager-facing operations ----

    /// Dispatches an inbound header through the automaton and performs its
    /// reactions. `checksum_ok` short-circuits straight to the fixed
    /// bad-checksum reaction (discard + reflect an ACK) before the
    /// automaton ever sees the event.
    pub fn recv_header_event(self: &Arc<Self>, packet_quad: Quad, event: HeaderEvent, checksum_ok: bool) {
        if !checksum_ok {
            warn!("checksum failure on {:?}, reflecting ack", packet_quad);
            let inner = self.inner.lock().unwrap();
            let tcb = inner.tcb;
            drop(inner);
            self.send_ack(&tcb);
            return;
        }

        let (reactions, prior_state, new_state, child_event) = {
            let mut inner = self.inner.lock().unwrap();
            let prior_state = inner.state;
            let was_listen = prior_state == State::Listen;
            let (reactions, state) = statem::on_header_event(&mut inner.tcb, prior_state, &event);
            inner.state = state;
            let child_event = if was_listen && reactions.contains(&Reaction::NewConnection) {
                Some(event.clone())
            } else {
                None
            };
            (reactions, prior_state, state, child_event)
        };

        trace!("{:?}: {:?} -> {:?} ({:?})", packet_quad, event.kind, new_state, reactions);

        if let Some(event) = child_event {
            self.spawn_child(packet_quad, event);
            return;
        }

        self.apply_reactions(reactions);

        // A peer RST aborts the connection outright: every blocked
        // connect/accept/send/recv waiter must see `ConnectionReset`, not
        // the graceful end-of-stream that a plain state-to-Closed gives.
        if event.kind == HeaderKind::Rst && new_state == State::Closed && prior_state != State::Closed {
            self.force_reset();
        }
    }

    /// Carves up to the peer's last-advertised window of unsent data,
    /// stamps it onto a fresh packet via a `Send` dispatch, and transmits it
    /// with a retransmit timer attached. Returns `true` if anything was
    /// sent.
    pub fn carve_and_transmit(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.state, State::Estab | State::CloseWait) {
            return false;
        }

        let max = inner.tcb.rcv_wnd as usize;
        let Some(payload) = inner.send_buf.carve(max) else {
            return false;
        };
        let len = payload.len() as u32;

        let prev_state = inner.state;
        let (_, state) = statem::on_app_event(&mut inner.tcb, prev_state, AppEvent::Send(len));
        inner.state = state;

        let seq = inner.tcb.nxt.wrapping_sub(len);
        let mut header = self.stamp(&inner.tcb, Flags::ACK | Flags::PSH, seq);
        drop(inner);

        let pseudo = self.pseudo_header(payload.len() as u16);
        header.checksum = segment::checksum(&pseudo, &header, &payload);
        self.transmit_with_resend(header, payload);
        true
    }

    /// Re-sends `packet` verbatim if it is still unacked and the connection
    /// hasn't moved on. Invoked from the retransmit timer; returns whether
    /// to keep rearming it.
    pub(crate) fn resend_if_needed(self: &Arc<Self>, packet: &segment::Packet) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.state == State::Closed {
            return false;
        }
        let acked = packet.seq_range().end <= inner.tcb.una;
        drop(inner);
        if acked {
            return false;
        }
        self.sink.send_datagram(&self.frame_packet(packet));
        true
    }

    /// Wipes state back to fresh-`Closed`. Used once a connection's
    /// TIME-WAIT timer fires and the manager reclaims its four-tuple.
    pub fn reset_to_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = State::Closed;
        inner.send_buf = SendBuffer::new();
        inner.recv_buf = RecvBuffer::new();
    }

    /// Forces the connection into a reset state and wakes every waiter.
    /// Used when a listener is torn down or the manager observes a hard
    /// failure that has no graceful close.
    pub fn force_reset(&self) {
        self.reset.store(true, Ordering::Release);
        self.connect_cv.notify_all();
        self.accept_cv.notify_all();
        self.recv_cv.notify_all();
        self.send_cv.notify_all();
    }

    // ---- internals ----

    /// Creates the child connection for a fresh SYN on a listener and
    /// replays the SYN into it, driving it `Closed -> SynRcvd`. The child is
    /// not queued for `accept()` yet — only once its own handshake-closing
    /// ACK arrives and it reaches `Estab` does `Reaction::Connected` publish
    /// it onto the listener's accept queue.
    fn spawn_child(self: &Arc<Self>, packet_quad: Quad, event: HeaderEvent) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let Some(child) = manager.internal_new_connection(packet_quad) else {
            return;
        };
        *child.listener.lock().unwrap() = Some(Arc::downgrade(self));
        child.recv_header_event(packet_quad, event, true);
    }

    fn apply_reactions(self: &Arc<Self>, reactions: Vec<Reaction>) {
        for reaction in reactions {
            self.apply_reaction(reaction);
        }
    }

    fn apply_reaction(self: &Arc<Self>, reaction: Reaction) {
        let tcb = self.inner.lock().unwrap().tcb;
        match reaction {
            Reaction::SendSyn => self.send_flags(&tcb, Flags::SYN, tcb.iss),
            Reaction::SendSynAck => self.send_flags(&tcb, Flags::SYN | Flags::ACK, tcb.iss),
            Reaction::SendAck => self.send_ack(&tcb),
            Reaction::SendFin => self.send_flags(&tcb, Flags::FIN | Flags::ACK, tcb.nxt.wrapping_sub(1)),
            Reaction::SendRst => self.send_rst(&tcb),
            Reaction::Accept(bytes) => {
                if !bytes.is_empty() {
                    let mut inner = self.inner.lock().unwrap();
                    inner.recv_buf.push(&bytes);
                    drop(inner);
                    self.recv_cv.notify_one();
                } else {
                    // Zero-length `Accept` still marks a state change the
                    // recv()/close() waiters care about (e.g. peer FIN).
                    self.recv_cv.notify_one();
                }
            }
            Reaction::RecvAck => {
                let mut inner = self.inner.lock().unwrap();
                inner.send_buf.ack(tcb.una);
                drop(inner);
                self.send_cv.notify_one();
            }
            Reaction::Connected => {
                let mut inner = self.inner.lock().unwrap();
                let una = inner.tcb.una;
                inner.send_buf.init_ack(una);
                drop(inner);

                let parent = self.listener.lock().unwrap().take();
                match parent.and_then(|weak| weak.upgrade()) {
                    Some(listener) => {
                        listener.inner.lock().unwrap().accept_queue.push_back(self.clone());
                        listener.accept_cv.notify_one();
                    }
                    None => self.connect_cv.notify_all(),
                }
            }
            Reaction::NewConnection => {
                // Handled in `recv_header_event` before reactions are
                // applied; a bare `NewConnection` here means the event was
                // not routed through a Listen dispatch.
                debug!("stray NewConnection reaction on {:?}", self.quad());
            }
            Reaction::Discard => {}
            Reaction::ScheduleTimeWait => {
                if let Some(manager) = self.manager.upgrade() {
                    manager.schedule_time_wait(self.quad(), self.config.time_wait_duration);
                }
            }
            Reaction::Close => {
                self.force_reset_gracefully();
                if let Some(manager) = self.manager.upgrade() {
                    manager.internal_finalize(self.quad());
                }
            }
            Reaction::InvalidOp(msg) => {
                debug!("invalid op on {:?}: {}", self.quad(), msg);
            }
        }
    }

    /// A graceful close (LastAck -> Closed) differs from `force_reset` in
    /// that pending `recv()`s should see end-of-stream, not an error.
    fn force_reset_gracefully(&self) {
        self.connect_cv.notify_all();
        self.accept_cv.notify_all();
        self.recv_cv.notify_all();
        self.send_cv.notify_all();
    }

    fn stamp(&self, tcb: &Tcb, flags: Flags, seq: u32) -> Header {
        let quad = self.quad();
        Header {
            src_port: quad.host.port,
            dst_port: quad.peer.port,
            seq,
            ack: tcb.rcv_nxt,
            flags,
            window: tcb.wnd,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    fn send_flags(self: &Arc<Self>, tcb: &Tcb, flags: Flags, seq: u32) {
        let mut header = self.stamp(tcb, flags, seq);
        let pseudo = self.pseudo_header(0);
        header.checksum = segment::checksum(&pseudo, &header, &[]);
        self.transmit_with_resend(header, vec![]);
    }

    fn send_ack(&self, tcb: &Tcb) {
        let mut header = self.stamp(tcb, Flags::ACK, tcb.nxt);
        let pseudo = self.pseudo_header(0);
        header.checksum = segment::checksum(&pseudo, &header, &[]);
        self.send_wire(&header, &[]);
    }

    /// Unlike the other control reactions, a RST is never retransmitted —
    /// there is no ACK to wait for.
    fn send_rst(&self, tcb: &Tcb) {
        let mut header = self.stamp(tcb, Flags::RST, tcb.una);
        let pseudo = self.pseudo_header(0);
        header.checksum = segment::checksum(&pseudo, &header, &[]);
        self.send_wire(&header, &[]);
    }

    fn pseudo_header(&self, payload_len: u16) -> PseudoHeader {
        let quad = self.quad();
        PseudoHeader {
            src_ip: u32::from(quad.host.ip),
            dst_ip: u32::from(quad.peer.ip),
            protocol: PseudoHeader::PROTOCOL_TCP,
            tcp_len: segment::HEADER_LEN as u16 + payload_len,
        }
    }

    /// Wraps a TCP segment in its IPv4 envelope for the sink, built with
    /// `etherparse::Ipv4Header`.
    fn frame_packet(&self, packet: &PacketData) -> Vec<u8> {
        let quad = self.quad();
        let tcp_bytes = packet.to_wire();
        let ip_header = Ipv4Header::new(
            tcp_bytes.len() as u16,
            64,
            PseudoHeader::PROTOCOL_TCP,
            quad.host.ip.octets(),
            quad.peer.ip.octets(),
        );

        let mut out = Vec::with_capacity(20 + tcp_bytes.len());
        ip_header.write(&mut out).unwrap();
        out.extend_from_slice(&tcp_bytes);
        out
    }

    fn send_wire(&self, header: &Header, payload: &[u8]) {
        let packet = PacketData {
            header: *header,
            payload: payload.to_vec(),
        };
        self.sink.send_datagram(&self.frame_packet(&packet));
    }

    /// Sends once, then asks the manager to arm a retransmit timer that
    /// resends this exact packet until it is acked or the connection is
    /// gone.
    fn transmit_with_resend(self: &Arc<Self>, header: Header, payload: Vec<u8>) {
        let packet = segment::make_packet(header, payload);
        self.sink.send_datagram(&self.frame_packet(&packet));
        if let Some(manager) = self.manager.upgrade() {
            manager.send_with_resend(self.clone(), packet, self.config.retransmit_timeout);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("quad", &self.quad())
            .field("state", &self.state())
            .finish()
    }
}
