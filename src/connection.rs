//! One endpoint of a reliable byte-stream connection. This is where the state
//!  machine, the two ring buffers, the retransmission machinery and the
//!  sequence accounting come together.
//!
//! Locking: a single async mutex guards all mutable connection state, and
//!  every inbound or outbound path holds it for the full duration of its
//!  effects, including handing response datagrams to the socket (the socket
//!  has its own internal synchronization, so this cannot deadlock). The state
//!  machine is additionally safe to *query* without the connection lock; all
//!  transitions happen under it. A single [`Notify`] is the connection's
//!  condition variable: it is broadcast on payload delivery, FIN receipt,
//!  acknowledgment progress, close and any transition to CLOSED, and every
//!  waiter re-checks its predicate after waking.

use crate::config::Config;
use crate::error::{Result, TransportError};
use crate::ring_buffer::RingBuffer;
use crate::rto::RtoEstimator;
use crate::segment::{Segment, SegmentFlags, SeqNum};
use crate::socket::DatagramSocket;
use crate::state_machine::{Event, State, StateMachine, Transition};
use crate::stats::{StatsSnapshot, TransferStats};
use bytes::{Bytes, BytesMut};
use rand::Rng;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

struct ConnectionInner {
    recv_buffer: RingBuffer,
    send_buffer: RingBuffer,

    /// our initial send sequence number
    iss: SeqNum,
    /// next sequence number to emit
    snd_next: SeqNum,
    /// next in-order sequence number expected from the peer
    rcv_next: SeqNum,
    /// the peer's most recently advertised window
    rcv_wnd: u16,

    /// payload bytes currently in flight, bounded by `rcv_wnd`
    in_flight_data: usize,
    /// segments awaiting cumulative acknowledgment, keyed by starting sequence
    unacked: FxHashMap<SeqNum, Segment>,
    /// out-of-order arrivals waiting for the gap to fill, keyed by starting sequence
    reassembly: FxHashMap<SeqNum, Segment>,
    /// last transmission timestamps for RTT sampling. Retransmission removes
    ///  the entry, so a retransmitted segment never yields a sample (Karn)
    send_times: FxHashMap<SeqNum, Instant>,
    rto: RtoEstimator,

    fin_received: bool,
    closed: bool,
}

pub struct Connection {
    config: Arc<Config>,
    socket: Arc<dyn DatagramSocket>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    state: Arc<StateMachine>,
    stats: Arc<TransferStats>,
    inner: Arc<Mutex<ConnectionInner>>,
    wakeup: Arc<Notify>,
}

impl Connection {
    pub fn new(
        socket: Arc<dyn DatagramSocket>,
        remote_addr: SocketAddr,
        config: Arc<Config>,
        stats: Arc<TransferStats>,
    ) -> Result<Arc<Connection>> {
        let iss = SeqNum::from_raw(rand::rng().random_range(1..=u32::MAX / 2));

        let inner = ConnectionInner {
            recv_buffer: RingBuffer::new(config.buffer_capacity)?,
            send_buffer: RingBuffer::new(config.buffer_capacity)?,
            iss,
            snd_next: iss,
            rcv_next: SeqNum::from_raw(0),
            rcv_wnd: u16::MAX,
            in_flight_data: 0,
            unacked: FxHashMap::default(),
            reassembly: FxHashMap::default(),
            send_times: FxHashMap::default(),
            rto: RtoEstimator::new(config.rto_initial, config.rto_min, config.rto_max),
            fin_received: false,
            closed: false,
        };

        let state = Arc::new(StateMachine::with_history_cap(config.history_cap));
        let wakeup = Arc::new(Notify::new());

        // handshake and teardown waiters are parked on the connection's
        //  condition variable, so reaching either terminal milestone must
        //  broadcast
        let wakeup_for_callback = wakeup.clone();
        state.set_transition_callback(move |_, to, _| {
            if matches!(to, State::Established | State::Closed) {
                wakeup_for_callback.notify_waiters();
            }
        });
        // inbound segments that the current state has no use for are dropped,
        //  not errors - but the refusals are still worth a trace
        state.set_refusal_callback(move |state, event, _| {
            trace!("ignoring {} in state {}", event, state);
        });

        let local_addr = socket.local_addr();
        let connection = Arc::new(Connection {
            config,
            socket,
            local_addr,
            remote_addr,
            state,
            stats,
            inner: Arc::new(Mutex::new(inner)),
            wakeup,
        });

        Self::spawn_retransmit_task(&connection);
        Ok(connection)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> State {
        self.state.state()
    }

    /// An independent copy of the state machine's transition history. After a
    ///  close this is the way to tell a graceful teardown from a peer reset.
    pub fn history(&self) -> Vec<Transition> {
        self.state.history()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn current_rto(&self) -> Duration {
        self.inner.lock().await.rto.rto()
    }

    /// Start the three-way handshake as the initiating side: CLOSED to
    ///  SYN_SENT, with a randomized initial sequence number.
    pub async fn open_active(&self) -> Result<()> {
        let iss = SeqNum::from_raw(rand::rng().random_range(1..=u32::MAX / 2));
        self.open_active_from(iss).await
    }

    /// Active open with a caller-chosen initial sequence number.
    pub async fn open_active_from(&self, iss: SeqNum) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.state.process_event(Event::ActiveOpen)?;
        debug!("active open towards {:?}, iss {}", self.remote_addr, iss);

        inner.iss = iss;
        inner.snd_next = iss;
        self.emit_control(&mut inner, SegmentFlags::SYN).await;
        Ok(())
    }

    /// Become the accepting side: CLOSED to LISTEN. The first SYN handed to
    ///  [`Connection::handle_segment`] continues the handshake.
    pub async fn open_passive(&self) -> Result<()> {
        self.state.process_event(Event::PassiveOpen)?;
        debug!("passive open for {:?}", self.remote_addr);
        Ok(())
    }

    /// Block until the handshake completes, failing with `HandshakeTimeout`
    ///  (and transitioning to CLOSED) when `budget` elapses first.
    pub async fn wait_established(&self, budget: Duration) -> Result<()> {
        let wait = async {
            loop {
                let mut notified = pin!(self.wakeup.notified());
                notified.as_mut().enable();

                if self.state.is_connected() {
                    return Ok(());
                }
                if self.state.is_closed() || self.inner.lock().await.closed {
                    return Err(TransportError::Closed);
                }

                notified.await;
            }
        };

        match tokio::time::timeout(budget, wait).await {
            Ok(result) => result,
            Err(_) => {
                let mut inner = self.inner.lock().await;
                let _ = self.state.process_event(Event::Timeout);
                self.stats.record_timeout();
                inner.closed = true;
                self.wakeup.notify_waiters();
                Err(TransportError::HandshakeTimeout)
            }
        }
    }

    /// Read available bytes into `out`, blocking while the stream is open but
    ///  has nothing buffered. Fails with `Closed` at the end of the stream -
    ///  after a FIN once the buffer is drained, or immediately on a closed
    ///  connection.
    pub async fn read(&self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        loop {
            let mut notified = pin!(self.wakeup.notified());
            notified.as_mut().enable();

            {
                let inner = self.inner.lock().await;
                if !inner.recv_buffer.is_empty() {
                    return inner.recv_buffer.read(out);
                }
                if inner.closed || inner.fin_received || self.state.is_closed() {
                    return Err(TransportError::Closed);
                }
            }

            notified.await;
        }
    }

    /// Write the whole of `data` to the stream. Bytes are staged in the send
    ///  buffer and emitted as segments no larger than `max_segment_payload`,
    ///  never exceeding the peer's advertised window in flight; when either
    ///  bound is hit the call blocks until acknowledgments free up room.
    ///  Fails with `Closed` once the connection can no longer accept data.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        loop {
            let mut notified = pin!(self.wakeup.notified());
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if inner.closed || self.state.is_closed() {
                    return Err(TransportError::Closed);
                }

                match self.state.state() {
                    State::Established | State::CloseWait => loop {
                        let staged_before = written;
                        while written < data.len() {
                            match inner.send_buffer.write(&data[written..]) {
                                Ok(n) => written += n,
                                Err(_) => break,
                            }
                        }
                        self.flush_send_buffer(&mut inner).await;
                        if written == data.len() {
                            return Ok(written);
                        }
                        if written == staged_before {
                            // buffer full and window closed - wait for acks
                            break;
                        }
                    },
                    // handshake still in progress - wait for it
                    State::Listen | State::SynSent | State::SynReceived => {}
                    // we have announced our FIN, no further data is accepted
                    _ => return Err(TransportError::Closed),
                }
            }

            notified.await;
        }
    }

    /// Start a graceful shutdown. Idempotent: closing an already-closing or
    ///  closed connection is a no-op. Staged bytes are flushed as far as the
    ///  peer's window allows before the FIN goes out; anything beyond that
    ///  may or may not reach the peer.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }

        // push out whatever is still staged before the FIN claims its
        //  sequence number
        self.flush_send_buffer(&mut inner).await;

        match self.state.process_event(Event::Close) {
            Ok(State::FinWait1 | State::LastAck) => {
                debug!("closing connection to {:?}, sending FIN", self.remote_addr);
                self.emit_control(&mut inner, SegmentFlags::FIN | SegmentFlags::ACK).await;
            }
            Ok(_) => {
                // LISTEN and SYN_SENT collapse straight to CLOSED
                inner.closed = true;
            }
            Err(_) => {
                // already in a closing state
            }
        }

        if self.state.is_closed() {
            inner.closed = true;
        }
        self.wakeup.notify_waiters();
        Ok(())
    }

    /// Deliver the externally scheduled TIMEOUT event, e.g. the 2·MSL expiry
    ///  that takes a connection out of TIME_WAIT. The transport does not
    ///  schedule that wait itself.
    pub async fn deliver_timeout(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.state.process_event(Event::Timeout)?;
        self.stats.record_timeout();

        if self.state.is_closed() {
            inner.closed = true;
        }
        self.wakeup.notify_waiters();
        Ok(())
    }

    /// The single entry point for inbound segments, normally driven by the
    ///  endpoint's receive loop.
    pub async fn handle_segment(&self, segment: Segment) {
        let mut inner = self.inner.lock().await;
        trace!(
            "segment from {:?}: seq {} ack {} flags {:?} window {} payload {}",
            self.remote_addr,
            segment.seq,
            segment.ack,
            segment.flags,
            segment.window,
            segment.payload.len()
        );

        // a reset aborts immediately, regardless of what else the segment carries
        if segment.flags.contains(SegmentFlags::RST) {
            debug!("received RST from {:?}", self.remote_addr);
            let _ = self.state.process_event(Event::Rst);
            inner.closed = true;
            self.stats.record_reset();
            self.wakeup.notify_waiters();
            return;
        }

        if segment.flags.contains(SegmentFlags::SYN) {
            self.handle_syn(&mut inner, &segment).await;
        }
        if segment.flags.contains(SegmentFlags::ACK) {
            self.handle_ack(&mut inner, &segment).await;
        }
        if segment.flags.contains(SegmentFlags::FIN) {
            self.handle_fin(&mut inner, &segment).await;
        }
        if !segment.payload.is_empty() {
            self.handle_payload(&mut inner, &segment).await;
        }

        inner.rcv_wnd = segment.window;
        // the advertised window may have opened
        self.flush_send_buffer(&mut inner).await;

        if self.state.is_closed() {
            inner.closed = true;
            self.wakeup.notify_waiters();
        }
    }

    async fn handle_syn(&self, inner: &mut ConnectionInner, segment: &Segment) {
        match self.state.state() {
            State::Listen => {
                if self.state.process_event(Event::Syn).is_ok() {
                    inner.rcv_next = segment.seq.advance(1);
                    self.emit_control(inner, SegmentFlags::SYN | SegmentFlags::ACK).await;
                }
            }
            State::SynSent if segment.flags.contains(SegmentFlags::ACK) => {
                if self.state.process_event(Event::SynAck).is_ok() {
                    inner.rcv_next = segment.seq.advance(1);
                    self.emit_control(inner, SegmentFlags::ACK).await;
                }
            }
            State::SynSent => {
                // simultaneous open: both sides sent a SYN
                if self.state.process_event(Event::Syn).is_ok() {
                    inner.rcv_next = segment.seq.advance(1);
                    // re-announce our SYN, this time acknowledging theirs
                    let syn_ack = Segment::control(
                        inner.iss,
                        inner.rcv_next,
                        SegmentFlags::SYN | SegmentFlags::ACK,
                        Self::advertised_window(inner),
                    );
                    self.emit_segment(inner, syn_ack).await;
                }
            }
            state => {
                trace!("ignoring SYN in state {}", state);
            }
        }
    }

    async fn handle_ack(&self, inner: &mut ConnectionInner, segment: &Segment) {
        // does this acknowledgment cover everything we have sent, including a
        //  pending SYN or FIN?
        let acks_everything = inner.snd_next.is_at_or_before(segment.ack);

        let advances_state = match self.state.state() {
            State::SynReceived | State::LastAck | State::Closing => acks_everything,
            // a segment that also carries FIN is the combined FIN_ACK case,
            //  handled as one event in handle_fin
            State::FinWait1 => acks_everything && !segment.flags.contains(SegmentFlags::FIN),
            _ => false,
        };
        if advances_state {
            let _ = self.state.process_event(Event::Ack);
        }

        // cumulative acknowledgment: every segment whose end falls at or
        //  before the acknowledged number is done
        let acked: Vec<SeqNum> = inner
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.end_seq().is_at_or_before(segment.ack))
            .map(|(seq, _)| *seq)
            .collect();

        if acked.is_empty() {
            return;
        }
        for seq in acked {
            if let Some(done) = inner.unacked.remove(&seq) {
                inner.in_flight_data -= done.payload.len();
            }
            if let Some(sent_at) = inner.send_times.remove(&seq) {
                inner.rto.on_sample(sent_at.elapsed());
            }
        }

        // in-flight volume shrank: blocked writers may proceed
        self.wakeup.notify_waiters();
    }

    async fn handle_fin(&self, inner: &mut ConnectionInner, segment: &Segment) {
        let acks_our_fin = segment.flags.contains(SegmentFlags::ACK)
            && inner.snd_next.is_at_or_before(segment.ack);
        let event = if self.state.state() == State::FinWait1 && acks_our_fin {
            Event::FinAck
        } else {
            Event::Fin
        };

        match self.state.process_event(event) {
            Ok(_) => {
                debug!("received FIN from {:?}", self.remote_addr);
                inner.fin_received = true;
                inner.rcv_next = inner.rcv_next.advance(1);
                self.emit_control(inner, SegmentFlags::ACK).await;
                // readers must observe the end of the stream
                self.wakeup.notify_waiters();
            }
            Err(_) => {
                // a retransmitted FIN: the transition is refused, but the
                //  peer is still waiting for its acknowledgment
                if inner.fin_received {
                    self.emit_control(inner, SegmentFlags::ACK).await;
                }
            }
        }
    }

    async fn handle_payload(&self, inner: &mut ConnectionInner, segment: &Segment) {
        if segment.seq == inner.rcv_next {
            if inner.recv_buffer.write_all(&segment.payload).is_err() {
                // no room: leave rcv_next where it is, the peer will
                //  retransmit once we re-advertise space
                debug!("receive buffer full, dropping in-order segment {}", segment.seq);
                self.emit_control(inner, SegmentFlags::ACK).await;
                return;
            }
            inner.rcv_next = inner.rcv_next.advance(segment.payload.len() as u32);

            // drain every contiguous follower that arrived out of order
            while let Some(follower) = inner.reassembly.remove(&inner.rcv_next) {
                if inner.recv_buffer.write_all(&follower.payload).is_err() {
                    inner.reassembly.insert(inner.rcv_next, follower);
                    break;
                }
                inner.rcv_next = inner.rcv_next.advance(follower.payload.len() as u32);
            }

            self.wakeup.notify_waiters();
            self.emit_control(inner, SegmentFlags::ACK).await;
        } else if inner.rcv_next.is_before(segment.seq) {
            if inner.rcv_next.distance_to(segment.seq) > inner.recv_buffer.capacity() as u32 {
                debug!(
                    "out-of-order segment {} is beyond the receive window (expecting {}) - discarding",
                    segment.seq, inner.rcv_next
                );
            } else {
                trace!(
                    "buffering out-of-order segment {} (expecting {})",
                    segment.seq,
                    inner.rcv_next
                );
                inner.reassembly.insert(segment.seq, segment.clone());
            }
            // a duplicate ACK tells the peer what we are still missing
            self.emit_control(inner, SegmentFlags::ACK).await;
        } else {
            trace!("segment {} already delivered - discarding", segment.seq);
            self.emit_control(inner, SegmentFlags::ACK).await;
        }
    }

    /// Move staged bytes from the send buffer onto the wire, as far as the
    ///  peer's advertised window allows.
    async fn flush_send_buffer(&self, inner: &mut ConnectionInner) {
        if !self.state.can_send_data() {
            return;
        }

        loop {
            let available = inner.send_buffer.available();
            if available == 0 {
                break;
            }
            let window = inner.rcv_wnd as usize;
            if inner.in_flight_data >= window {
                trace!(
                    "peer window exhausted ({} of {} bytes in flight)",
                    inner.in_flight_data,
                    window
                );
                break;
            }

            let budget = (window - inner.in_flight_data)
                .min(self.config.max_segment_payload)
                .min(available);
            let mut chunk = vec![0; budget];
            let Ok(n) = inner.send_buffer.read(&mut chunk) else {
                break;
            };
            chunk.truncate(n);

            let segment = Segment::data(
                inner.snd_next,
                inner.rcv_next,
                Self::advertised_window(inner),
                Bytes::from(chunk),
            );
            inner.snd_next = inner.snd_next.advance(n as u32);
            self.emit_segment(inner, segment).await;
        }
    }

    /// Emit a flags-only segment carrying the current acknowledgment and
    ///  window. SYN and FIN each consume one sequence number.
    async fn emit_control(&self, inner: &mut ConnectionInner, flags: SegmentFlags) {
        let segment = Segment::control(
            inner.snd_next,
            inner.rcv_next,
            flags,
            Self::advertised_window(inner),
        );
        if flags.intersects(SegmentFlags::SYN | SegmentFlags::FIN) {
            inner.snd_next = inner.snd_next.advance(1);
        }
        self.emit_segment(inner, segment).await;
    }

    /// Serialize and send, and - if the segment consumes sequence space -
    ///  track it for retransmission and RTT measurement.
    async fn emit_segment(&self, inner: &mut ConnectionInner, segment: Segment) {
        self.send_datagram(&segment).await;

        if segment.seq_len() > 0 {
            inner.send_times.insert(segment.seq, Instant::now());
            inner.in_flight_data += segment.payload.len();
            inner.unacked.insert(segment.seq, segment);
        }
    }

    async fn send_datagram(&self, segment: &Segment) {
        let mut buf = BytesMut::with_capacity(crate::wire::HEADER_LEN + segment.payload.len());
        segment.ser(&mut buf);
        self.socket.send_to(self.remote_addr, &buf).await;
        self.stats.record_segment_sent(buf.len());
    }

    fn advertised_window(inner: &ConnectionInner) -> u16 {
        inner.recv_buffer.free_space().min(u16::MAX as usize) as u16
    }

    /// The retransmission driver: every RTO interval, re-emit everything
    ///  still unacknowledged and back the timeout off. The task holds only a
    ///  weak handle, so it dies with the connection (or when it observes the
    ///  closed flag).
    fn spawn_retransmit_task(connection: &Arc<Connection>) {
        let weak = Arc::downgrade(connection);
        tokio::spawn(async move {
            loop {
                let interval = match weak.upgrade() {
                    Some(connection) => {
                        let inner = connection.inner.lock().await;
                        // NB: not the state machine's CLOSED - that is also
                        //  the initial state, before the connection opens
                        if inner.closed {
                            break;
                        }
                        inner.rto.rto()
                    }
                    None => break,
                };

                tokio::time::sleep(interval).await;

                let Some(connection) = weak.upgrade() else {
                    break;
                };
                connection.retransmit_tick().await;
            }
        });
    }

    async fn retransmit_tick(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed || inner.unacked.is_empty() {
            return;
        }

        debug!(
            "retransmitting {} segments to {:?}",
            inner.unacked.len(),
            self.remote_addr
        );

        let outstanding: Vec<Segment> = inner.unacked.values().cloned().collect();
        for segment in outstanding {
            // Karn: this segment must never yield an RTT sample anymore
            inner.send_times.remove(&segment.seq);
            self.send_datagram(&segment).await;
            self.stats.record_retransmission();
        }

        inner.rto.on_backoff();
    }
}
