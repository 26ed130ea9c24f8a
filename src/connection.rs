use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{watch, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::chunks::ChunkQueue;
use crate::config::RudpConfig;
use crate::data_window::DataWindow;
use crate::datagram::DatagramSender;
use crate::message::{FinReason, Role, RudpMessage};
use crate::multiplexor::{Multiplexor, UNASSIGNED_ID};
use crate::scheduler::{Scheduler, TimerEvent, TimerKind, TimerTarget};
use crate::seq::SequenceNumberExtender;
use crate::write_regulator::WriteRegulator;

/// a receiver window this small counts as nearly closed
const SMALL_SEND_WINDOW: i64 = 2;
/// writes without an intervening sleep before a minimal one is forced, so
///  message handling gets a chance to run
const MAX_WRITE_WITHOUT_SLEEP: u32 = 4;
/// minimum distance of an ack-timeout check from now
const MIN_ACK_WAIT: Duration = Duration::from_millis(5);
/// delay for handing a producer-side wakeup to the scheduler
const WRITE_WAKEUP_DELAY: Duration = Duration::from_millis(10);
/// fallback polling delay when there is nothing to write
const NOTHING_TO_DO_DELAY: Duration = Duration::from_secs(1);
/// delay between close and the final FIN retransmission
const SHUTDOWN_DELAY: Duration = Duration::from_millis(400);
/// delay between final cleanup and releasing the routing slot
const TEARDOWN_DELAY: Duration = Duration::from_secs(30);

/// truncation to the 16-bit wire representation of a sequence number
fn wire(seq: u64) -> u16 {
    (seq & 0xFFFF) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// freshly created, no connect attempt yet
    Preconnect,
    /// handshake in progress
    Connecting,
    Connected,
    /// closed, whether gracefully or not - terminal
    Fin,
}

/// One reliable connection over the unreliable datagram transport.
///
/// The connection is a state machine driven from two sides: inbound messages routed to
///  [Connection::handle_message] by the multiplexor, and timer callbacks from the shared
///  [Scheduler]. Both serialize on the inner lock. The producer-side [Connection::write]
///  deliberately does not: it works against the chunk queue and a few atomics, so an
///  application writing data never contends with protocol handling.
///
/// Both endpoints of a handshake actively send SYNs; the connection is ready once it has
///  seen an ack of its own SYN *and* learned the peer's connection id, in either order.
pub struct Connection {
    config: Arc<RudpConfig>,
    scheduler: Arc<Scheduler>,
    chunk_queue: Arc<ChunkQueue>,
    chunk_limit: Arc<AtomicUsize>,
    receiver_window_space: Arc<AtomicI64>,
    waiting_for_data_available: Arc<AtomicBool>,
    write_handled: AtomicBool,
    write_wakeup_event: Arc<StdMutex<Option<Arc<TimerEvent>>>>,
    peer_addr: StdMutex<Option<SocketAddr>>,
    state_tx: watch::Sender<ConnectionState>,
    inner: RwLock<ConnectionInner>,
}

struct ConnectionInner {
    weak_self: Weak<Connection>,
    config: Arc<RudpConfig>,
    scheduler: Arc<Scheduler>,
    sender: Arc<dyn DatagramSender>,
    state_tx: watch::Sender<ConnectionState>,
    role: Role,

    state: ConnectionState,
    local_connection_id: u8,
    peer_connection_id: u8,
    peer_addr: Option<SocketAddr>,
    multiplexor: Weak<Multiplexor>,

    /// sequence number of the next data block to send
    sequence_number: u64,
    fin_sequence_number: u64,
    receive_window: DataWindow,
    send_window: Option<DataWindow>,
    write_regulator: Option<WriteRegulator>,
    /// extends sequence numbers of local origin echoed back in ACKs
    local_extender: SequenceNumberExtender,
    /// extends sequence numbers originating at the peer
    peer_extender: SequenceNumberExtender,

    received_syn_ack: bool,
    waiting_for_fin_ack: bool,
    waiting_for_data_space: bool,
    /// skip one regular data write after a resend
    skip_a_data_write: bool,
    /// base the next ack-timeout on the resend time rather than the original send
    ack_resend_count: u32,
    close_reason: FinReason,

    started_connecting: Option<Instant>,
    last_send_time: Option<Instant>,
    last_data_send_time: Option<Instant>,
    last_received_time: Option<Instant>,
    last_data_or_ack_time: Option<Instant>,

    chunk_queue: Arc<ChunkQueue>,
    chunk_limit: Arc<AtomicUsize>,
    receiver_window_space: Arc<AtomicI64>,
    waiting_for_data_available: Arc<AtomicBool>,
    write_wakeup_event: Arc<StdMutex<Option<Arc<TimerEvent>>>>,

    connect_event: Option<Arc<TimerEvent>>,
    keepalive_event: Option<Arc<TimerEvent>>,
    write_data_event: Option<Arc<TimerEvent>>,
    ack_timeout_event: Option<Arc<TimerEvent>>,
    closed_cleanup_event: Option<Arc<TimerEvent>>,

    // ack-skipping state: arrival counts per measurement period
    periods: Vec<u32>,
    current_period_id: usize,
    packets_this_period: u32,
    enough_data: bool,
    last_period: Option<Instant>,
    skipped_acks: u32,
    skipped_acks_total: u64,
    total_data_packets: u64,
}

enum ResendDecision {
    Nothing,
    TooManyResends,
    Resend { seq: u64, payload: Bytes },
}

impl Connection {
    pub fn new(
        config: Arc<RudpConfig>,
        scheduler: Arc<Scheduler>,
        sender: Arc<dyn DatagramSender>,
        role: Role,
    ) -> Arc<Connection> {
        let (state_tx, _) = watch::channel(ConnectionState::Preconnect);
        let chunk_queue = Arc::new(ChunkQueue::new(config.data_chunk_size));
        let chunk_limit = Arc::new(AtomicUsize::new(config.data_window_size));
        let receiver_window_space = Arc::new(AtomicI64::new(config.data_window_size as i64));
        let waiting_for_data_available = Arc::new(AtomicBool::new(false));
        let write_wakeup_event = Arc::new(StdMutex::new(None));

        Arc::new_cyclic(|weak_self| Connection {
            config: config.clone(),
            scheduler: scheduler.clone(),
            chunk_queue: chunk_queue.clone(),
            chunk_limit: chunk_limit.clone(),
            receiver_window_space: receiver_window_space.clone(),
            waiting_for_data_available: waiting_for_data_available.clone(),
            write_handled: AtomicBool::new(false),
            write_wakeup_event: write_wakeup_event.clone(),
            peer_addr: StdMutex::new(None),
            state_tx: state_tx.clone(),
            inner: RwLock::new(ConnectionInner {
                weak_self: weak_self.clone(),
                config: config.clone(),
                scheduler,
                sender,
                state_tx,
                role,
                state: ConnectionState::Preconnect,
                local_connection_id: UNASSIGNED_ID,
                peer_connection_id: UNASSIGNED_ID,
                peer_addr: None,
                multiplexor: Weak::<Multiplexor>::new(),
                sequence_number: 0,
                fin_sequence_number: 0,
                receive_window: DataWindow::new(config.data_window_size, 1),
                send_window: None,
                write_regulator: None,
                local_extender: SequenceNumberExtender::default(),
                peer_extender: SequenceNumberExtender::default(),
                received_syn_ack: false,
                waiting_for_fin_ack: false,
                waiting_for_data_space: false,
                skip_a_data_write: false,
                ack_resend_count: 0,
                close_reason: FinReason::NormalClose,
                started_connecting: None,
                last_send_time: None,
                last_data_send_time: None,
                last_received_time: None,
                last_data_or_ack_time: None,
                chunk_queue,
                chunk_limit,
                receiver_window_space,
                waiting_for_data_available,
                write_wakeup_event,
                connect_event: None,
                keepalive_event: None,
                write_data_event: None,
                ack_timeout_event: None,
                closed_cleanup_event: None,
                periods: vec![0; config.skip_history],
                current_period_id: 0,
                packets_this_period: 0,
                enough_data: false,
                last_period: None,
                skipped_acks: 0,
                skipped_acks_total: 0,
                total_data_packets: 0,
            }),
        })
    }

    /// Starts connecting to the given address. The handshake proceeds in the background;
    ///  [Connection::finish_connect] tells when it completed.
    pub async fn connect(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.state {
            ConnectionState::Preconnect => {}
            ConnectionState::Connecting => bail!("connect already pending"),
            ConnectionState::Connected => bail!("already connected"),
            ConnectionState::Fin => bail!("connection is closed"),
        }
        inner.set_state(ConnectionState::Connecting);
        inner.peer_addr = Some(addr);
        *self.peer_addr.lock().unwrap() = Some(addr);
        inner.started_connecting = Some(Instant::now());
        inner.sequence_number = 0;

        debug!("connecting to {}", addr);
        inner.try_to_connect().await;
        Ok(())
    }

    /// Promotes the connection to connected once the handshake completed in both
    ///  directions, setting up the send-side machinery. Returns `false` while the
    ///  handshake is still incomplete.
    pub async fn finish_connect(&self) -> anyhow::Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.is_closed() {
            bail!("connection is closed");
        }
        if inner.is_connected() {
            return Ok(true);
        }
        if !inner.received_syn_ack || inner.peer_connection_id == UNASSIGNED_ID {
            return Ok(false);
        }

        inner.sequence_number = 1;

        let window_size = self.config.data_window_size;
        inner.send_window = Some(DataWindow::new(window_size, 1));
        inner.write_regulator = Some(WriteRegulator::new());
        inner.chunk_limit.store(window_size, Ordering::SeqCst);

        // pre-created so producer-side wakeups only ever re-arm an existing event; it must
        // be in place before the state flips so no accepted write can miss its wakeup
        let wakeup = TimerEvent::new(TimerKind::WriteWakeup, inner.timer_target(), None);
        inner.scheduler.register(wakeup.clone());
        *self.write_wakeup_event.lock().unwrap() = Some(wakeup);

        inner.set_state(ConnectionState::Connected);
        inner.schedule_keepalive();
        debug!("connection to {:?} established", inner.peer_addr);
        Ok(true)
    }

    /// Entry point for all inbound messages, called by the multiplexor.
    pub async fn handle_message(&self, msg: RudpMessage) {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        inner.last_received_time = Some(now);
        trace!("handling {:?}", msg);

        match msg {
            RudpMessage::Syn { sender_connection_id, sequence_number, role, .. } => {
                inner.handle_syn(sender_connection_id, sequence_number, role).await;
            }
            RudpMessage::Ack { sequence_number, window_start, window_space, .. } => {
                inner.last_data_or_ack_time = Some(now);
                inner.handle_ack(sequence_number, window_start, window_space).await;
            }
            RudpMessage::Data { sequence_number, payload, .. } => {
                inner.last_data_or_ack_time = Some(now);
                inner.handle_data(sequence_number, payload).await;
            }
            RudpMessage::KeepAlive { window_start, window_space, .. } => {
                inner.handle_keep_alive(window_start, window_space).await;
            }
            RudpMessage::Fin { sequence_number, reason, .. } => {
                inner.handle_fin(sequence_number, reason).await;
            }
        }
    }

    /// Copies data into the outbound chunk queue, without blocking on protocol state.
    ///  Returns how much was accepted, which is less than `src.len()` when the windows
    ///  are full - callers retry after more acks arrive. Fails until the connection is
    ///  established: before that there is no send window to drain the queue into.
    pub fn write(&self, src: &[u8]) -> anyhow::Result<usize> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Fin => bail!("connection is closed"),
            _ => bail!("connection is not established yet"),
        }

        // if there was no data before this, make sure a writer wakes up
        if self.chunk_queue.pending_chunks() == 0 {
            let first_ever = !self.write_handled.swap(true, Ordering::SeqCst);
            self.wakeup_write_event(first_ever);
        }

        Ok(self.chunk_queue.write(src, self.effective_chunk_limit()))
    }

    /// Reads contiguous received data. Returns zero when nothing is readable yet, and an
    ///  error once the connection is closed and drained.
    pub async fn read(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let mut inner = self.inner.write().await;
        let prior_space = inner.receive_window.free_slots();

        let mut read = 0;
        while read < buf.len() {
            let Some(rec) = inner.receive_window.first_readable_mut() else {
                break;
            };
            let n = (buf.len() - read).min(rec.payload.len() - rec.read_offset);
            buf[read..read + n].copy_from_slice(&rec.payload[rec.read_offset..rec.read_offset + n]);
            rec.read_offset += n;
            read += n;
            if rec.read_offset == rec.payload.len() {
                rec.read = true;
            }
        }

        let cleared = inner.receive_window.advance_over_read();

        // tell the peer right away when a previously full window reopens
        if cleared > 0 && prior_space == 0 {
            debug!("receive window reopened (cleared {}), sending keepalive", cleared);
            inner.send_keep_alive().await;
        }

        if read == 0 && inner.is_closed() {
            bail!("connection is closed");
        }
        Ok(read)
    }

    /// Gracefully closes the connection, notifying the peer with a FIN.
    pub async fn close(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner.do_close().await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// State transitions as they happen, for callers waiting on connect or close.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Fin
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.read().await.is_connected()
    }

    pub async fn is_connecting(&self) -> bool {
        self.inner.read().await.is_connecting()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock().unwrap()
    }

    /// Called by the multiplexor when it assigns this connection its routing slot.
    pub(crate) async fn attach(&self, connection_id: u8, multiplexor: Weak<Multiplexor>) {
        let mut inner = self.inner.write().await;
        inner.local_connection_id = connection_id;
        inner.multiplexor = multiplexor;
    }

    /// Whether an initial SYN (routed on connection id zero) belongs to this connection:
    ///  the sender address must match, the roles must be compatible, and the peer id must
    ///  be unassigned or unchanged.
    pub(crate) async fn is_for_me(&self, from: SocketAddr, sender_connection_id: u8, role: Role) -> bool {
        if self.peer_addr() != Some(from) {
            return false;
        }
        let inner = self.inner.read().await;
        if !inner.role.can_connect_to(role) {
            return false;
        }
        inner.peer_connection_id == UNASSIGNED_ID
            || inner.peer_connection_id == sender_connection_id
    }

    fn effective_chunk_limit(&self) -> usize {
        let space = self.receiver_window_space.load(Ordering::SeqCst).max(0) as usize;
        self.chunk_limit.load(Ordering::SeqCst).min(space)
    }

    /// Re-arms the parked write-wakeup event so the scheduler picks up newly available
    ///  data shortly. Never touches the connection lock.
    fn wakeup_write_event(&self, force: bool) {
        if force || self.waiting_for_data_available.load(Ordering::SeqCst) {
            let guard = self.write_wakeup_event.lock().unwrap();
            if let Some(event) = guard.as_ref() {
                if event.fire_at().is_none() {
                    self.scheduler.reschedule(event, Some(Instant::now() + WRITE_WAKEUP_DELAY));
                }
            }
        }
    }
}

#[async_trait]
impl TimerTarget for Connection {
    async fn on_timer(self: Arc<Self>, kind: TimerKind) {
        let mut inner = self.inner.write().await;
        match kind {
            TimerKind::ConnectSyn => inner.try_to_connect().await,
            TimerKind::Keepalive => inner.on_keepalive_timer().await,
            TimerKind::WriteData => inner.on_write_data_timer().await,
            TimerKind::AckTimeout => {
                if inner.is_connected() {
                    inner.validate_acked_data().await;
                }
            }
            TimerKind::WriteWakeup => {
                if inner.is_connected() {
                    inner.write_data_activation();
                }
            }
            TimerKind::ClosedCleanup => inner.final_close().await,
            TimerKind::Teardown => inner.teardown(),
        }
    }
}

impl ConnectionInner {
    fn set_state(&mut self, new_state: ConnectionState) {
        trace!("connection state {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
        self.state_tx.send_replace(new_state);
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.peer_connection_id != UNASSIGNED_ID
    }

    fn is_closed(&self) -> bool {
        self.state == ConnectionState::Fin
    }

    /// The handshake completes through two independent events - the ack of our SYN
    ///  advances the state, the peer's SYN supplies their connection id - so "connecting"
    ///  covers both still being outstanding.
    fn is_connecting(&self) -> bool {
        !self.is_closed()
            && (self.state == ConnectionState::Connecting
                || (self.state != ConnectionState::Preconnect
                    && self.peer_connection_id == UNASSIGNED_ID))
    }

    fn timer_target(&self) -> Weak<dyn TimerTarget> {
        self.weak_self.clone()
    }

    fn effective_chunk_limit(&self) -> usize {
        let space = self.receiver_window_space.load(Ordering::SeqCst).max(0) as usize;
        self.chunk_limit.load(Ordering::SeqCst).min(space)
    }

    // ---- sending ------------------------------------------------------------------

    async fn send_raw(&mut self, msg: RudpMessage) -> anyhow::Result<()> {
        let now = Instant::now();
        self.last_send_time = Some(now);
        if matches!(msg, RudpMessage::Data { .. } | RudpMessage::Ack { .. }) {
            self.last_data_or_ack_time = Some(now);
        }
        let Some(addr) = self.peer_addr else {
            bail!("no peer address");
        };
        trace!("sending {:?} to {}", msg, addr);
        self.sender.send(msg, addr).await
    }

    async fn safe_send_ack(&mut self, echo_wire_seq: u16) {
        let msg = RudpMessage::Ack {
            connection_id: self.peer_connection_id,
            sequence_number: echo_wire_seq,
            window_start: wire(self.receive_window.window_start()),
            window_space: self.receive_window.free_slots() as u32,
        };
        trace!("data packets {}, acks skipped {} total, {} this run",
               self.total_data_packets, self.skipped_acks_total, self.skipped_acks);
        self.skipped_acks = 0;
        if let Err(e) = self.send_raw(msg).await {
            warn!("failed to send ACK: {}", e);
            self.close_with_reason(FinReason::SendException).await;
        }
    }

    async fn safe_send_fin(&mut self) {
        // track this for ack monitoring; it should not increment anymore anyway
        self.fin_sequence_number = self.sequence_number;
        let msg = RudpMessage::Fin {
            connection_id: self.peer_connection_id,
            sequence_number: wire(self.sequence_number),
            reason: self.close_reason,
        };
        if let Err(e) = self.send_raw(msg).await {
            warn!("failed to send FIN: {}", e);
        }
    }

    async fn send_keep_alive(&mut self) {
        let msg = RudpMessage::KeepAlive {
            connection_id: self.peer_connection_id,
            window_start: wire(self.receive_window.window_start()),
            window_space: self.receive_window.free_slots() as u32,
        };
        if let Err(e) = self.send_raw(msg).await {
            warn!("failed to send KEEPALIVE: {}", e);
            self.close_with_reason(FinReason::SendException).await;
        }
    }

    async fn send_data(&mut self, chunk: Bytes) {
        let seq = self.sequence_number;
        let msg = RudpMessage::Data {
            connection_id: self.peer_connection_id,
            sequence_number: wire(seq),
            payload: chunk.clone(),
        };
        if let Err(e) = self.send_raw(msg).await {
            warn!("failed to send DATA: {}", e);
            self.close_with_reason(FinReason::SendException).await;
            return;
        }

        let sent_time = self.last_send_time;
        if let Some(send_window) = &mut self.send_window {
            let rec = send_window.add(seq, chunk);
            rec.sent_time = sent_time;
            rec.sends += 1;
            self.chunk_limit.store(send_window.free_slots(), Ordering::SeqCst);
        }
        self.last_data_send_time = sent_time;
        self.sequence_number += 1;

        if self.is_ack_timeout_update_required() {
            self.schedule_ack_timeout_if_needed();
        }

        // pre-decrement the peer's window space until the next advertisement, to avoid a
        // cascade of sends before an ack comes back
        let space = self.receiver_window_space.load(Ordering::SeqCst);
        if space > 0 {
            self.receiver_window_space.store(space - 1, Ordering::SeqCst);
        }
    }

    // ---- message handlers ---------------------------------------------------------

    /// All initial and duplicate SYNs are acked; a SYN carrying a different sender id
    ///  than the one already learned is ignored.
    async fn handle_syn(&mut self, sender_connection_id: u8, wire_seq: u16, _role: Role) {
        self.peer_extender.extend(wire_seq);

        if self.peer_connection_id == UNASSIGNED_ID {
            self.peer_connection_id = sender_connection_id;
        } else if self.peer_connection_id == sender_connection_id {
            // duplicate SYN, just ack it again
        } else {
            debug!("SYN with conflicting sender id {} (have {}) - ignoring",
                   sender_connection_id, self.peer_connection_id);
            return;
        }

        self.safe_send_ack(wire_seq).await;
    }

    async fn handle_ack(&mut self, wire_seq: u16, wire_window_start: u16, window_space: u32) {
        // both numbers are of local origin, so the local extender applies
        let seq = self.local_extender.extend(wire_seq);
        let peer_window_start = self.local_extender.extend(wire_window_start);

        let prior = self.receiver_window_space.load(Ordering::SeqCst);
        let space = self.adjusted_window_space(window_space, peer_window_start);
        self.receiver_window_space.store(space, Ordering::SeqCst);

        if (prior == 0 || self.waiting_for_data_space) && space > 0 {
            trace!("ack reopened the peer window");
            self.write_space_activation();
        }

        if seq == 0 && self.is_connecting() {
            // the ack of our SYN - the peer's own SYN may still be outstanding
            self.received_syn_ack = true;
        } else if self.waiting_for_fin_ack && seq == self.fin_sequence_number {
            self.waiting_for_fin_ack = false;
        } else if self.state == ConnectionState::Connected {
            if let (Some(send_window), Some(regulator)) =
                (&mut self.send_window, &mut self.write_regulator)
            {
                send_window.ack(seq, Instant::now());
                regulator.on_send_success();

                // everything below the peer's window start is implicitly acked
                send_window.pseudo_ack_to(peer_window_start);
                send_window.clear_acked_from_start(|chunk| {
                    trace!("releasing {} acked bytes", chunk.len());
                });
                self.chunk_limit.store(send_window.free_slots(), Ordering::SeqCst);
            }
        }
    }

    async fn handle_data(&mut self, wire_seq: u16, payload: Bytes) {
        let seq = self.peer_extender.extend(wire_seq);

        // oversized data is peer misbehavior, cut the connection before any damage is done
        if payload.len() > self.config.max_data_size {
            warn!("data block of {} bytes exceeds the limit, closing", payload.len());
            self.close_with_reason(FinReason::LargePacket).await;
            return;
        }

        let base = self.receive_window.window_start();
        let ahead_max = base + self.receive_window.window_size() as u64
            + self.config.receive_write_ahead_slack;
        if seq > ahead_max {
            debug!("block {} too far ahead of window start {} - dropping", seq, base);
            return;
        }

        let buffered = if seq >= base {
            self.receive_window.add(seq, payload);
            true
        } else {
            debug!("duplicate block {} below window start {}", seq, base);
            false
        };

        if self.last_period.is_none() {
            self.last_period = self.last_received_time;
        }
        self.packets_this_period += 1;
        self.total_data_packets += 1;

        if self.should_send_ack() {
            if buffered {
                if let Some(rec) = self.receive_window.get_mut(seq) {
                    rec.ack_time = Some(Instant::now());
                    rec.acks += 1;
                }
            }
            self.safe_send_ack(wire_seq).await;
        }

        // close of a measurement period
        if let (Some(received), Some(period_start)) = (self.last_received_time, self.last_period) {
            if received - period_start >= self.config.skip_period {
                self.last_period = Some(received);
                self.current_period_id += 1;
                if self.current_period_id >= self.config.skip_history {
                    self.current_period_id = 0;
                    self.enough_data = true;
                }
                self.periods[self.current_period_id] = self.packets_this_period;
                self.packets_this_period = 0;
            }
        }
    }

    /// An ack may be skipped while the arrival rate holds up; any sharp rate drop, or
    ///  reaching the consecutive-skip cap, forces one.
    fn should_send_ack(&mut self) -> bool {
        if self.config.skip_acks && self.enough_data
            && self.skipped_acks < self.config.max_skipped_acks
        {
            let average = self.periods.iter().sum::<u32>() as f32 / self.periods.len() as f32;
            if self.periods[self.current_period_id] as f32 > average / self.config.skip_deviation {
                self.skipped_acks += 1;
                self.skipped_acks_total += 1;
                return false;
            }
        }
        true
    }

    async fn handle_keep_alive(&mut self, wire_window_start: u16, window_space: u32) {
        let peer_window_start = self.local_extender.extend(wire_window_start);

        let prior = self.receiver_window_space.load(Ordering::SeqCst);
        let space = self.adjusted_window_space(window_space, peer_window_start);
        self.receiver_window_space.store(space, Ordering::SeqCst);

        // a closed connection answers keepalives with another FIN so the peer learns
        if self.is_closed() {
            self.safe_send_fin().await;
        }

        // pre-initialization (no send window yet) there is nothing else to do
        if let Some(send_window) = &mut self.send_window {
            send_window.pseudo_ack_to(peer_window_start);
            send_window.clear_acked_from_start(|chunk| {
                trace!("releasing {} acked bytes", chunk.len());
            });
            self.chunk_limit.store(send_window.free_slots(), Ordering::SeqCst);

            if (prior == 0 || self.waiting_for_data_space) && space > 0 {
                trace!("keepalive reopened the peer window");
                self.write_space_activation();
            }
        }
    }

    async fn handle_fin(&mut self, wire_seq: u16, reason: FinReason) {
        self.peer_extender.extend(wire_seq);

        // stop sending data
        self.receiver_window_space.store(0, Ordering::SeqCst);

        self.safe_send_ack(wire_seq).await;

        if !self.is_closed() {
            debug!("peer closed the connection: {:?}", reason);
            self.close_with_reason(FinReason::YouClosed).await;
        }
    }

    /// The advertised window space is stale by however many blocks we sent since the
    ///  advertisement; the adjusted value may run negative.
    fn adjusted_window_space(&self, advertised: u32, peer_window_start: u64) -> i64 {
        if self.sequence_number > peer_window_start {
            self.config.data_window_size as i64
                + (peer_window_start as i64 - self.sequence_number as i64)
        } else {
            advertised as i64
        }
    }

    // ---- connection establishment and teardown ------------------------------------

    /// Sends a SYN (once the multiplexor has assigned us an id) and reschedules itself
    ///  until the handshake completes or times out.
    async fn try_to_connect(&mut self) {
        if !self.is_connecting() {
            debug!("already connected");
            if let Some(event) = &self.connect_event {
                event.unregister();
            }
            return;
        }

        let now = Instant::now();
        let waited = self.started_connecting.map_or(Duration::ZERO, |t| now - t);
        if waited > self.config.max_connect_wait {
            debug!("connect timed out after {:?}", waited);
            self.set_state(ConnectionState::Fin);
            if let Some(event) = &self.connect_event {
                event.unregister();
            }
            return;
        }

        if self.local_connection_id != UNASSIGNED_ID {
            let msg = RudpMessage::Syn {
                connection_id: self.peer_connection_id,
                sender_connection_id: self.local_connection_id,
                sequence_number: 0,
                role: self.role,
            };
            if let Err(e) = self.send_raw(msg).await {
                warn!("failed to send SYN: {}", e);
            }
        }

        self.schedule_connect_event(now + self.config.syn_interval);
    }

    async fn close_with_reason(&mut self, reason: FinReason) {
        self.close_reason = reason;
        if let Err(e) = self.do_close().await {
            trace!("{}", e);
        }
    }

    async fn do_close(&mut self) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("already closed");
        }

        for event in [&self.connect_event, &self.keepalive_event, &self.write_data_event,
                      &self.ack_timeout_event].into_iter().flatten() {
            event.unregister();
        }
        if let Some(event) = self.write_wakeup_event.lock().unwrap().as_ref() {
            event.unregister();
        }

        let old_state = self.state;
        self.set_state(ConnectionState::Fin);

        // track incoming acks for an ack of the FIN
        self.waiting_for_fin_ack = true;

        if old_state != ConnectionState::Preconnect {
            self.safe_send_fin().await;

            if self.closed_cleanup_event.is_none() {
                let event = TimerEvent::new(
                    TimerKind::ClosedCleanup,
                    self.timer_target(),
                    Some(Instant::now() + SHUTDOWN_DELAY),
                );
                self.scheduler.register(event.clone());
                self.closed_cleanup_event = Some(event);
            }
        }
        Ok(())
    }

    /// Runs a little after close: one final FIN if the first went unacked, then the
    ///  routing slot release on a long delay.
    async fn final_close(&mut self) {
        if self.waiting_for_fin_ack {
            self.safe_send_fin().await;
        }
        if let Some(event) = &self.closed_cleanup_event {
            event.unregister();
        }
        let event = TimerEvent::new(
            TimerKind::Teardown,
            self.timer_target(),
            Some(Instant::now() + TEARDOWN_DELAY),
        );
        self.scheduler.register(event);
    }

    fn teardown(&mut self) {
        debug!("releasing connection slot {}", self.local_connection_id);
        if let Some(multiplexor) = self.multiplexor.upgrade() {
            multiplexor.deregister(self.local_connection_id);
        }
    }

    // ---- timers -------------------------------------------------------------------

    fn schedule_keepalive(&mut self) {
        let fire_at = self.last_send_time.unwrap_or_else(Instant::now)
            + self.config.keepalive_interval;
        let event = TimerEvent::new(TimerKind::Keepalive, self.timer_target(), Some(fire_at));
        self.scheduler.register(event.clone());
        self.keepalive_event = Some(event);
    }

    async fn on_keepalive_timer(&mut self) {
        let now = Instant::now();

        if self.is_closed() {
            if let Some(event) = &self.keepalive_event {
                event.unregister();
            }
            return;
        }

        if self.is_connected() {
            let worn_out = self.last_data_or_ack_time
                .map_or(false, |t| t + self.config.max_keepalive_lifetime < now)
                || self.last_received_time
                    .map_or(false, |t| t + self.config.max_silent_lifetime < now);
            if worn_out {
                debug!("connection timed out, closing");
                self.close_with_reason(FinReason::Timeout).await;
                return;
            }
        }

        // re-evaluate: a message sent in the meantime pushes the keepalive out
        let due = self.last_send_time.map_or(true, |t| {
            now + Duration::from_millis(1) >= t + self.config.keepalive_interval
        });
        if due {
            if self.is_connected() {
                self.send_keep_alive().await;
            } else {
                return;
            }
        }

        let next = self.last_send_time.unwrap_or(now) + self.config.keepalive_interval;
        if let Some(event) = &self.keepalive_event {
            self.scheduler.reschedule(event, Some(next));
        }
    }

    async fn on_write_data_timer(&mut self) {
        let now = Instant::now();
        if self.is_connected() {
            let silent_too_long = self.last_received_time
                .map_or(false, |t| t + self.config.max_silent_lifetime < now);
            if silent_too_long {
                debug!("nothing received for too long, closing");
                self.close_with_reason(FinReason::Timeout).await;
                return;
            }
            self.write_data().await;
        }
    }

    fn schedule_connect_event(&mut self, fire_at: Instant) {
        match &self.connect_event {
            Some(event) => self.scheduler.reschedule(event, Some(fire_at)),
            None => {
                let event = TimerEvent::new(TimerKind::ConnectSyn, self.timer_target(), Some(fire_at));
                self.scheduler.register(event.clone());
                self.connect_event = Some(event);
            }
        }
    }

    fn schedule_write_data_event(&mut self, fire_at: Instant) {
        if !self.is_connected() {
            return;
        }
        match &self.write_data_event {
            Some(event) => self.scheduler.reschedule(event, Some(fire_at)),
            None => {
                let event = TimerEvent::new(TimerKind::WriteData, self.timer_target(), Some(fire_at));
                self.scheduler.register(event.clone());
                self.write_data_event = Some(event);
            }
        }
    }

    fn schedule_ack_timeout_event(&mut self, fire_at: Instant) {
        if !self.is_connected() {
            return;
        }
        match &self.ack_timeout_event {
            Some(event) => self.scheduler.reschedule(event, Some(fire_at)),
            None => {
                let event = TimerEvent::new(TimerKind::AckTimeout, self.timer_target(), Some(fire_at));
                self.scheduler.register(event.clone());
                self.ack_timeout_event = Some(event);
            }
        }
    }

    fn unschedule_ack_timeout_event(&mut self) {
        if let Some(event) = &self.ack_timeout_event {
            self.scheduler.reschedule(event, None);
        }
    }

    fn is_ack_timeout_update_required(&self) -> bool {
        match &self.ack_timeout_event {
            None => true,
            Some(event) => event.fire_at().is_none(),
        }
    }

    /// Writing stalled on a full peer window; resume immediately.
    fn write_space_activation(&mut self) {
        if self.waiting_for_data_space {
            self.waiting_for_data_space = false;
            self.schedule_write_data_event(Instant::now());
        }
    }

    /// Writing stalled on an empty chunk queue; resume at a reasonable time.
    fn write_data_activation(&mut self) {
        let rto = self.send_window.as_ref().map(|w| w.rto() as u64).unwrap_or(0);
        let fire_at = self.last_data_send_time.unwrap_or_else(Instant::now)
            + Duration::from_millis(rto / 4);
        self.schedule_write_data_event(fire_at);
    }

    // ---- the write path -----------------------------------------------------------

    async fn write_data(&mut self) {
        // make sure we don't write without a break for too long
        let mut no_sleep_count = 0;

        loop {
            self.waiting_for_data_available.store(false, Ordering::SeqCst);
            self.waiting_for_data_space = false;

            if self.skip_a_data_write {
                self.skip_a_data_write = false;
            } else if self.effective_chunk_limit() > 0 {
                if let Some(chunk) = self.chunk_queue.next_chunk() {
                    self.send_data(chunk).await;
                    if self.is_closed() {
                        return;
                    }
                }
            } else {
                // no room to send, wait for the window to open (bounded, for sanity)
                self.schedule_write_data_event(Instant::now() + NOTHING_TO_DO_DELAY);
                self.waiting_for_data_space = true;
                trace!("write path stalled: chunk_limit={} receiver_window_space={}",
                       self.chunk_limit.load(Ordering::SeqCst),
                       self.receiver_window_space.load(Ordering::SeqCst));
                return;
            }

            // writes get rescheduled through the wakeup event once a chunk shows up
            if self.chunk_queue.pending_chunks() == 0 {
                self.schedule_write_data_event(Instant::now() + NOTHING_TO_DO_DELAY);
                self.waiting_for_data_available.store(true, Ordering::SeqCst);
                return;
            }

            let space = self.receiver_window_space.load(Ordering::SeqCst);
            let mut wait_millis = match (&self.send_window, &mut self.write_regulator) {
                (Some(send_window), Some(regulator)) => regulator.sleep_time(send_window, space),
                _ => return,
            };

            if space <= SMALL_SEND_WINDOW && space <= 1 {
                if let Some(regulator) = &mut self.write_regulator {
                    regulator.on_zero_window();
                }
            }

            // no RTT estimate yet early on, don't blast away
            if wait_millis == 0 && self.sequence_number < 10 {
                wait_millis = self.config.default_rto.as_millis() as u64;
            }

            if no_sleep_count >= MAX_WRITE_WITHOUT_SLEEP {
                wait_millis += 1;
            }

            if wait_millis > 0 {
                self.schedule_write_data_event(Instant::now() + Duration::from_millis(wait_millis));
                break;
            }
            no_sleep_count += 1;
        }
    }

    // ---- retransmission -----------------------------------------------------------

    fn schedule_ack_timeout_if_needed(&mut self) {
        let oldest = self.send_window.as_ref().and_then(|send_window| {
            let seq = send_window.oldest_unacked_seq()?;
            let sent = send_window.get(seq)?.sent_time?;
            Some((sent, send_window.rto() as u64))
        });

        match oldest {
            Some((sent, rto_millis)) => {
                let rto = if rto_millis == 0 {
                    self.config.default_rto
                } else {
                    Duration::from_millis(rto_millis)
                };

                let mut fire_at = sent + rto;
                // after a resend, base the wait off the resend time
                if self.ack_resend_count > 0 {
                    if let Some(last_send) = self.last_send_time {
                        fire_at = last_send + rto;
                    }
                    self.ack_resend_count = 0;
                }

                let min = Instant::now() + MIN_ACK_WAIT;
                self.schedule_ack_timeout_event(fire_at.max(min));
            }
            None => self.unschedule_ack_timeout_event(),
        }
    }

    /// Ensures sent data is getting acked, resending at most one block per invocation
    ///  with exponential backoff, and cutting the connection when a block exhausts its
    ///  retries.
    async fn validate_acked_data(&mut self) {
        let now = Instant::now();
        let decision = self.resend_decision(now);

        if let Some(decision) = decision {
            let mut resent = 0;
            match decision {
                ResendDecision::Nothing => {}
                ResendDecision::TooManyResends => {
                    warn!("block resent too often, giving up on the connection");
                    self.close_with_reason(FinReason::TooManyResends).await;
                    return;
                }
                ResendDecision::Resend { seq, payload } => {
                    debug!("soft resending block {}", seq);
                    let msg = RudpMessage::Data {
                        connection_id: self.peer_connection_id,
                        sequence_number: wire(seq),
                        payload,
                    };
                    if let Err(e) = self.send_raw(msg).await {
                        warn!("failed to resend DATA: {}", e);
                        self.close_with_reason(FinReason::SendException).await;
                        return;
                    }

                    // scale back the writing speed if we are hitting limits
                    if let Some(regulator) = &mut self.write_regulator {
                        regulator.on_send_failure();
                        regulator.on_resend_timeout();
                    }

                    let sent_time = self.last_send_time;
                    if let Some(send_window) = &mut self.send_window {
                        if let Some(rec) = send_window.get_mut(seq) {
                            rec.sent_time = sent_time;
                            rec.sends += 1;
                        }
                    }
                    resent = 1;
                }
            }

            // delay subsequent resends, and let the resend take the next write slot
            self.ack_resend_count = resent;
            if resent > 0 {
                self.skip_a_data_write = true;
            }
        }

        self.schedule_ack_timeout_if_needed();
    }

    /// `None` when no acks appear to be missing at all.
    fn resend_decision(&self, now: Instant) -> Option<ResendDecision> {
        let send_window = self.send_window.as_ref()?;
        if !send_window.appears_lost(now, 1) {
            return None;
        }

        let rto = send_window.rto() as u64;
        trace!("resend check: window_start={} rto={} used={} next_seq={}",
               send_window.window_start(), rto, send_window.used_slots(), self.sequence_number);

        let seq = match send_window.oldest_unacked_seq() {
            Some(seq) => seq,
            None => return Some(ResendDecision::Nothing),
        };
        let rec = match send_window.get(seq) {
            Some(rec) => rec,
            None => return Some(ResendDecision::Nothing),
        };

        // exponential backoff, relaxed when later blocks already got acked (a strong hint
        // this one is really lost)
        let mut exp_rto = rto.saturating_mul(1u64 << rec.sends.saturating_sub(1).min(30));
        if send_window.higher_acked_count() > 0 {
            exp_rto = exp_rto * 3 / 4;
        }

        if rec.sends > self.config.max_send_retries + 1 {
            return Some(ResendDecision::TooManyResends);
        }

        let waited = match rec.sent_time {
            Some(sent) => now - sent,
            None => return Some(ResendDecision::Nothing),
        };
        if waited > Duration::from_millis(exp_rto) {
            Some(ResendDecision::Resend { seq, payload: rec.payload.clone() })
        } else {
            Some(ResendDecision::Nothing)
        }
    }
}
