use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::error::StreamError;
use crate::frame::{nack_payload, parse_nack_payload, Frame, FrameFlags};
use crate::radio::{NodeId, RadioHandle};
use crate::retransmit::TimerQueue;
use crate::seq::SeqNr;
use crate::window::{Accepted, Admit, ReorderBuffer, SendWindow, Slot, TimeoutVerdict};

/// Stream lifecycle states. Active opens run Idle - SynSent - Established;
/// passive opens run Idle - SynRcvd - Established. Orderly close runs
/// through FinWait (initiator) or CloseWait / LastAck (responder).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StreamState {
    Idle,
    SynSent,
    SynRcvd,
    Established,
    FinWait,
    CloseWait,
    LastAck,
    Closed,
}

/// Why a stream reached Closed.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CloseCause {
    /// Both sides finished cleanly.
    Finished,
    /// RST was sent or received.
    Reset,
    /// A frame exhausted its retransmit budget.
    FatalLoss,
    /// No activity for longer than the stream timeout.
    IdleTimeout,
}

/// Per-stream counters, readable at any time and logged on close.
#[derive(Clone, Debug, Default)]
pub struct StreamStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub retransmits: u64,
    pub acks_sent: u64,
    pub nacks_sent: u64,
    pub rsts_sent: u64,
    pub duplicates: u64,
    pub peak_in_flight: u32,
}

/// State shared between the multiplexer and its streams: the timer heap,
/// the scheduler wakeup, and the global outbound depth used for
/// backpressure. Streams hold this instead of a reference to the
/// multiplexer itself.
pub(crate) struct MuxShared {
    pub(crate) config: Arc<TransportConfig>,
    pub(crate) radio: Arc<RadioHandle>,
    pub(crate) timers: Mutex<TimerQueue>,
    pub(crate) outbound_ready: Notify,
    pub(crate) outbound_depth: AtomicUsize,
}

impl MuxShared {
    pub(crate) fn new(config: Arc<TransportConfig>, radio: Arc<RadioHandle>) -> MuxShared {
        MuxShared {
            config,
            radio,
            timers: Mutex::new(TimerQueue::new()),
            outbound_ready: Notify::new(),
            outbound_depth: AtomicUsize::new(0),
        }
    }
}

struct StreamInner {
    state: StreamState,
    close_cause: Option<CloseCause>,
    send_window: SendWindow,
    reorder: ReorderBuffer,
    outbound: VecDeque<Frame>,
    fin_queued: bool,
    fin_sent: bool,
    peer_fin_seen: bool,
    last_activity: Instant,
    deliveries_unacked: u32,
    last_ack_sent_at: Instant,
    last_nack: Option<(SeqNr, Instant)>,
    delivered_tx: Option<mpsc::UnboundedSender<Bytes>>,
    stats: StreamStats,
}

/// A reliable, ordered, bidirectional byte channel to one peer node.
///
/// Streams are created through the multiplexer (`StreamMux::connect` or the
/// accept callback) and never outlive it. All methods are cancel-safe; a
/// cancelled `send` leaves already-admitted frames in flight, where they are
/// acknowledged and discarded.
pub struct Stream {
    id: u32,
    peer: NodeId,
    shared: Arc<MuxShared>,
    inner: RwLock<StreamInner>,
    delivered_rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    window_notify: Notify,
    established_notify: Notify,
}

impl Stream {
    pub(crate) fn new(id: u32, peer: NodeId, shared: Arc<MuxShared>) -> Arc<Stream> {
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        let window_size = shared.config.window_size;
        let max_retransmits = shared.config.max_retransmits;
        let now = Instant::now();

        Arc::new(Stream {
            id,
            peer,
            shared,
            inner: RwLock::new(StreamInner {
                state: StreamState::Idle,
                close_cause: None,
                send_window: SendWindow::new(window_size, max_retransmits),
                // the peer's SYN always consumes seq 0, data starts at 1
                reorder: ReorderBuffer::starting_at(SeqNr::from_raw(1), window_size),
                outbound: VecDeque::new(),
                fin_queued: false,
                fin_sent: false,
                peer_fin_seen: false,
                last_activity: now,
                deliveries_unacked: 0,
                last_ack_sent_at: now,
                last_nack: None,
                delivered_tx: Some(delivered_tx),
                stats: StreamStats::default(),
            }),
            delivered_rx: Mutex::new(delivered_rx),
            window_notify: Notify::new(),
            established_notify: Notify::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub async fn state(&self) -> StreamState {
        self.inner.read().await.state
    }

    pub async fn stats(&self) -> StreamStats {
        self.inner.read().await.stats.clone()
    }

    /// Active open: send SYN (optionally carrying an opaque open request,
    /// e.g. a CONNECT target) and move to SynSent.
    pub(crate) async fn start_open(&self, open_payload: Bytes) {
        let mut inner = self.inner.write().await;
        debug_assert_eq!(inner.state, StreamState::Idle);

        let syn = Frame::data(
            self.id,
            inner.send_window.next_seq(),
            SeqNr::ZERO,
            FrameFlags::SYN,
            open_payload,
        );
        inner.send_window.admit(syn.clone());
        inner.state = StreamState::SynSent;
        info!("stream {:#x} to {}: SYN sent", self.id, self.peer);
        self.enqueue(&mut inner, syn, true).await;
    }

    /// Passive open: an inbound SYN created this stream; answer SYN+ACK
    /// and move to SynRcvd.
    pub(crate) async fn start_accept(&self, syn_seq: SeqNr) {
        let mut inner = self.inner.write().await;
        debug_assert_eq!(inner.state, StreamState::Idle);

        let syn_ack = Frame::control(
            self.id,
            inner.send_window.next_seq(),
            syn_seq.next(),
            FrameFlags::SYN | FrameFlags::ACK,
        );
        inner.send_window.admit(syn_ack.clone());
        inner.state = StreamState::SynRcvd;
        info!("stream {:#x} from {}: SYN received, SYN+ACK sent", self.id, self.peer);
        self.enqueue(&mut inner, syn_ack, true).await;
    }

    /// Wait until the handshake completes (or the stream dies first).
    pub async fn established(&self) -> Result<(), StreamError> {
        loop {
            {
                let inner = self.inner.read().await;
                match inner.state {
                    StreamState::Established
                    | StreamState::FinWait
                    | StreamState::CloseWait
                    | StreamState::LastAck => return Ok(()),
                    StreamState::Closed => return Err(close_error(&inner)),
                    _ => {}
                }
            }
            tokio::select! {
                _ = self.established_notify.notified() => {}
                _ = sleep(self.shared.config.timer_tick) => {}
            }
        }
    }

    /// Send bytes over the stream. Chunks the data, admits chunks as window
    /// capacity and backpressure allow, and blocks in between. Returns once
    /// everything is admitted (not necessarily acknowledged).
    pub async fn send(&self, data: &[u8]) -> Result<(), StreamError> {
        let chunk_size = self.shared.config.chunk_payload_size;
        let chunks = data
            .chunks(chunk_size)
            .map(Bytes::copy_from_slice)
            .collect::<Vec<_>>();

        let mut index = 0;
        while index < chunks.len() {
            let notified = self.window_notify.notified();
            {
                let mut inner = self.inner.write().await;
                match inner.state {
                    StreamState::Closed => return Err(close_error(&inner)),
                    StreamState::FinWait | StreamState::LastAck => {
                        return Err(StreamError::Closed)
                    }
                    _ => {}
                }
                if inner.fin_queued {
                    return Err(StreamError::Closed);
                }
                if self.shared.radio.is_down() {
                    // latched until the adapter recovers; recoverable for
                    // the caller
                    return Err(StreamError::WouldBlock);
                }

                while index < chunks.len()
                    && inner.send_window.has_capacity()
                    && self.room_in_outbound()
                {
                    let frame = Frame::data(
                        self.id,
                        inner.send_window.next_seq(),
                        inner.reorder.next_expected(),
                        FrameFlags::ACK,
                        chunks[index].clone(),
                    );
                    let admitted = inner.send_window.admit(frame.clone());
                    debug_assert_eq!(admitted, Admit::Ready(frame.seq));

                    inner.stats.bytes_sent += chunks[index].len() as u64;
                    let in_flight = inner.send_window.in_flight();
                    if in_flight > inner.stats.peak_in_flight {
                        inner.stats.peak_in_flight = in_flight;
                    }
                    self.enqueue(&mut inner, frame, true).await;
                    index += 1;
                }

                if index >= chunks.len() {
                    return Ok(());
                }
                trace!(
                    "stream {:#x}: window full ({} in flight), parking sender",
                    self.id,
                    inner.send_window.in_flight()
                );
            }

            tokio::select! {
                _ = notified => {}
                _ = sleep(self.shared.config.timer_tick) => {}
            }
        }
        Ok(())
    }

    /// Receive the next chunk of delivered bytes. `Ok(None)` is clean EOF
    /// (the peer finished); errors report reset, loss, or timeout.
    pub async fn recv(&self) -> Result<Option<Bytes>, StreamError> {
        let mut rx = self.delivered_rx.lock().await;
        match rx.recv().await {
            Some(bytes) => Ok(Some(bytes)),
            None => {
                let inner = self.inner.read().await;
                match inner.close_cause {
                    None | Some(CloseCause::Finished) => Ok(None),
                    Some(CloseCause::Reset) => Err(StreamError::Reset),
                    Some(CloseCause::FatalLoss) => Err(StreamError::FatalLoss),
                    Some(CloseCause::IdleTimeout) => Err(StreamError::Timeout),
                }
            }
        }
    }

    /// Orderly close: queue a FIN behind any in-flight data. Idempotent.
    pub async fn close(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.write().await;
        match inner.state {
            StreamState::Closed | StreamState::FinWait | StreamState::LastAck => return Ok(()),
            StreamState::Idle => {
                inner.state = StreamState::Closed;
                inner.close_cause = Some(CloseCause::Finished);
                return Ok(());
            }
            _ => {}
        }
        if inner.fin_queued {
            return Ok(());
        }
        inner.fin_queued = true;
        self.try_send_fin(&mut inner).await;
        Ok(())
    }

    /// Abort: send RST and drop all state. Idempotent.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        if inner.state == StreamState::Closed {
            return;
        }
        self.abort(&mut inner, CloseCause::Reset, true).await;
    }

    pub(crate) async fn pop_outbound(&self) -> Option<Frame> {
        let mut inner = self.inner.write().await;
        let frame = inner.outbound.pop_front();
        if frame.is_some() {
            self.shared.outbound_depth.fetch_sub(1, Ordering::Relaxed);
        }
        frame
    }

    /// A closed stream whose outbound queue has drained can be dropped from
    /// the registry.
    pub(crate) async fn is_defunct(&self) -> bool {
        let inner = self.inner.read().await;
        inner.state == StreamState::Closed && inner.outbound.is_empty()
    }

    /// Route one inbound frame into the state machine.
    pub(crate) async fn on_frame(&self, frame: Frame) {
        let mut inner = self.inner.write().await;
        inner.last_activity = Instant::now();
        inner.stats.frames_received += 1;
        trace!(
            "stream {:#x}: received seq={} ack={} flags={} len={}",
            self.id,
            frame.seq,
            frame.ack,
            frame.flags,
            frame.payload.len()
        );

        if frame.is_rst() {
            info!("stream {:#x}: RST received", self.id);
            self.abort(&mut inner, CloseCause::Reset, false).await;
            return;
        }

        // handshake steps
        match inner.state {
            StreamState::SynSent => {
                if frame.is_syn() && frame.is_ack() {
                    let acked = inner.send_window.on_ack(frame.ack);
                    self.cancel_timers(&acked).await;
                    inner.state = StreamState::Established;
                    info!("stream {:#x} to {}: established", self.id, self.peer);
                    self.send_ack_now(&mut inner).await;
                    self.established_notify.notify_waiters();
                    self.window_notify.notify_waiters();
                } else {
                    // the peer is not answering our handshake on this id
                    debug!("stream {:#x}: non-handshake frame in SynSent", self.id);
                    self.abort(&mut inner, CloseCause::Reset, true).await;
                }
                return;
            }
            StreamState::SynRcvd => {
                if frame.is_syn() {
                    // duplicated SYN: answer with the same SYN+ACK, no retry charged
                    debug!("stream {:#x}: duplicate SYN, re-answering", self.id);
                    inner.stats.duplicates += 1;
                    if let Some(syn_ack) = inner.send_window.pending_frame(SeqNr::ZERO) {
                        self.enqueue(&mut inner, syn_ack, false).await;
                    }
                    return;
                }
                if frame.is_ack() && frame.ack.is_after(SeqNr::ZERO) {
                    let acked = inner.send_window.on_ack(frame.ack);
                    self.cancel_timers(&acked).await;
                    inner.state = StreamState::Established;
                    info!("stream {:#x} from {}: established", self.id, self.peer);
                    self.established_notify.notify_waiters();
                    self.window_notify.notify_waiters();
                    // fall through - the establishing frame may carry data
                }
            }
            _ => {}
        }

        if frame.is_ack() && inner.state != StreamState::SynSent {
            let acked = inner.send_window.on_ack(frame.ack);
            if !acked.is_empty() {
                self.cancel_timers(&acked).await;
                self.window_notify.notify_waiters();
                self.try_send_fin(&mut inner).await;
                self.maybe_finish(&mut inner);
            }
        }

        if frame.is_nack() {
            let seqs = parse_nack_payload(&frame.payload);
            let resends = inner.send_window.on_nack(&seqs);
            if !resends.is_empty() {
                debug!("stream {:#x}: NACK for {} frames", self.id, resends.len());
                inner.stats.retransmits += resends.len() as u64;
                for resend in resends {
                    self.enqueue(&mut inner, resend, false).await;
                }
            }
            return; // a NACK payload is control data, never stream data
        }

        let has_data = !frame.payload.is_empty() && !frame.is_syn();
        let has_fin = frame.is_fin();
        if !has_data && !has_fin {
            return;
        }

        match inner.state {
            StreamState::Idle | StreamState::Closed => {
                // data on a dead stream: tell the peer to stop
                debug!("stream {:#x}: data while {:?}, sending RST", self.id, inner.state);
                self.abort(&mut inner, CloseCause::Reset, true).await;
                return;
            }
            _ => {}
        }

        let slot = if has_data {
            if has_fin {
                // this implementation never packs data and FIN together; if a
                // peer does, honor the data and expect the FIN re-sent alone
                warn!("stream {:#x}: frame carries both data and FIN, ignoring FIN", self.id);
            }
            Slot::Data(frame.payload.clone())
        } else {
            Slot::Fin
        };

        match inner.reorder.accept(frame.seq, slot) {
            Accepted::Delivered(slots) => {
                for slot in slots {
                    match slot {
                        Slot::Data(bytes) => {
                            inner.stats.bytes_received += bytes.len() as u64;
                            if let Some(tx) = &inner.delivered_tx {
                                let _ = tx.send(bytes);
                            }
                        }
                        Slot::Fin => self.on_peer_fin(&mut inner).await,
                    }
                }
                if inner.state != StreamState::Closed {
                    inner.deliveries_unacked += 1;
                    if inner.deliveries_unacked >= self.shared.config.ack_every_n {
                        self.send_ack_now(&mut inner).await;
                    }
                }
            }
            Accepted::Buffered => {
                self.maybe_send_nack(&mut inner).await;
            }
            Accepted::Duplicate => {
                inner.stats.duplicates += 1;
                // the sender is missing an ack, refresh it right away
                self.send_ack_now(&mut inner).await;
            }
            Accepted::Discarded => {
                debug!("stream {:#x}: frame {} outside receive window", self.id, frame.seq);
            }
        }
    }

    /// The peer's FIN was delivered in order.
    async fn on_peer_fin(&self, inner: &mut StreamInner) {
        inner.peer_fin_seen = true;
        // EOF for the reader
        inner.delivered_tx = None;
        self.send_ack_now(inner).await;

        match inner.state {
            StreamState::Established | StreamState::SynRcvd => {
                inner.state = StreamState::CloseWait;
                info!("stream {:#x}: FIN received, waiting for local close", self.id);
            }
            StreamState::FinWait => {
                info!("stream {:#x}: FIN received while closing", self.id);
                self.finish(inner, CloseCause::Finished).await;
            }
            _ => {}
        }
    }

    /// Retransmit timer fired for `seq`.
    pub(crate) async fn on_retransmit_timeout(&self, seq: SeqNr) {
        let mut inner = self.inner.write().await;
        if inner.state == StreamState::Closed {
            return;
        }

        match inner.send_window.on_timeout(seq) {
            TimeoutVerdict::Resend(frame) => {
                debug!("stream {:#x}: retransmitting seq {}", self.id, seq);
                inner.stats.retransmits += 1;
                self.enqueue(&mut inner, frame, true).await;
            }
            TimeoutVerdict::FatalLoss => {
                warn!(
                    "stream {:#x}: seq {} exceeded {} retransmits - giving up",
                    self.id, seq, self.shared.config.max_retransmits
                );
                self.abort(&mut inner, CloseCause::FatalLoss, true).await;
            }
            TimeoutVerdict::Stale => {}
        }
    }

    /// Periodic upkeep from the multiplexer's timer task: delayed-ack
    /// flush, persistent-gap NACKs, pending FIN, idle timeout.
    pub(crate) async fn on_tick(&self, now: Instant) {
        let mut inner = self.inner.write().await;
        if inner.state == StreamState::Closed {
            return;
        }

        if now.duration_since(inner.last_activity) > self.shared.config.stream_timeout {
            warn!("stream {:#x}: idle timeout", self.id);
            self.abort(&mut inner, CloseCause::IdleTimeout, true).await;
            return;
        }

        if inner.deliveries_unacked > 0
            && now.duration_since(inner.last_ack_sent_at) >= self.shared.config.ack_flush_interval
        {
            self.send_ack_now(&mut inner).await;
        }

        self.maybe_send_nack(&mut inner).await;
        self.try_send_fin(&mut inner).await;
        self.maybe_finish(&mut inner);
    }

    fn room_in_outbound(&self) -> bool {
        self.shared.outbound_depth.load(Ordering::Relaxed) < self.shared.config.high_water_mark
    }

    /// Put a frame on the outbound queue. `track` arms a retransmit timer;
    /// untracked frames (acks, nacks, handshake replays, nack resends) are
    /// fire-and-forget.
    async fn enqueue(&self, inner: &mut StreamInner, frame: Frame, track: bool) {
        if track {
            let deadline = Instant::now() + self.shared.config.retransmit_timeout;
            self.shared
                .timers
                .lock()
                .await
                .schedule(self.id, frame.seq, deadline);
        }
        inner.stats.frames_sent += 1;
        inner.outbound.push_back(frame);
        self.shared.outbound_depth.fetch_add(1, Ordering::Relaxed);
        self.shared.outbound_ready.notify_one();
    }

    async fn cancel_timers(&self, seqs: &[SeqNr]) {
        if seqs.is_empty() {
            return;
        }
        let mut timers = self.shared.timers.lock().await;
        for seq in seqs {
            timers.cancel(self.id, *seq);
        }
    }

    async fn send_ack_now(&self, inner: &mut StreamInner) {
        let ack = Frame::control(
            self.id,
            inner.send_window.next_seq(),
            inner.reorder.next_expected(),
            FrameFlags::ACK,
        );
        inner.deliveries_unacked = 0;
        inner.last_ack_sent_at = Instant::now();
        inner.stats.acks_sent += 1;
        self.enqueue(inner, ack, false).await;
    }

    async fn maybe_send_nack(&self, inner: &mut StreamInner) {
        let missing = inner.reorder.missing(self.shared.config.max_nacks_per_frame);
        let Some(&first) = missing.first() else {
            return;
        };

        let now = Instant::now();
        if let Some((last_seq, at)) = inner.last_nack {
            if last_seq == first && now.duration_since(at) < self.shared.config.nack_debounce {
                return;
            }
        }
        inner.last_nack = Some((first, now));
        inner.stats.nacks_sent += 1;
        debug!("stream {:#x}: NACKing {} missing seqs", self.id, missing.len());

        let nack = Frame::data(
            self.id,
            inner.send_window.next_seq(),
            inner.reorder.next_expected(),
            FrameFlags::NACK | FrameFlags::ACK,
            nack_payload(&missing),
        );
        self.enqueue(inner, nack, false).await;
    }

    /// Admit the pending FIN once all data is in flight and the window has
    /// room.
    async fn try_send_fin(&self, inner: &mut StreamInner) {
        if !inner.fin_queued || inner.fin_sent || !inner.send_window.has_capacity() {
            return;
        }
        if !matches!(
            inner.state,
            StreamState::Established | StreamState::CloseWait | StreamState::SynSent
        ) {
            return;
        }

        let fin = Frame::control(
            self.id,
            inner.send_window.next_seq(),
            inner.reorder.next_expected(),
            FrameFlags::FIN | FrameFlags::ACK,
        );
        inner.send_window.admit(fin.clone());
        inner.fin_sent = true;
        inner.state = match inner.state {
            StreamState::CloseWait => StreamState::LastAck,
            _ => StreamState::FinWait,
        };
        info!("stream {:#x}: FIN sent, state={:?}", self.id, inner.state);
        self.enqueue(inner, fin, true).await;
    }

    /// Orderly completion once our FIN is acknowledged and the peer's FIN
    /// was seen (or we are in LastAck and everything drained).
    fn maybe_finish(&self, inner: &mut StreamInner) {
        let done = inner.fin_sent
            && inner.send_window.is_drained()
            && (inner.peer_fin_seen || inner.state == StreamState::LastAck);
        if done && inner.state != StreamState::Closed {
            // finish() only awaits the timer lock; do it inline
            inner.state = StreamState::Closed;
            inner.close_cause = Some(CloseCause::Finished);
            inner.delivered_tx = None;
            self.log_close(inner);
            self.established_notify.notify_waiters();
            self.window_notify.notify_waiters();
        }
    }

    async fn finish(&self, inner: &mut StreamInner, cause: CloseCause) {
        inner.state = StreamState::Closed;
        inner.close_cause = Some(cause);
        inner.delivered_tx = None;
        self.shared.timers.lock().await.cancel_stream(self.id);
        self.log_close(inner);
        self.established_notify.notify_waiters();
        self.window_notify.notify_waiters();
    }

    /// Hard stop: optionally send RST, drop buffers, cancel timers.
    async fn abort(&self, inner: &mut StreamInner, cause: CloseCause, send_rst: bool) {
        if inner.state == StreamState::Closed {
            return;
        }

        // stale frames are pointless after a reset
        let dropped = inner.outbound.len();
        inner.outbound.clear();
        self.shared.outbound_depth.fetch_sub(dropped, Ordering::Relaxed);

        inner.send_window.clear();
        inner.reorder.clear();

        if send_rst {
            let rst = Frame::control(
                self.id,
                inner.send_window.next_seq(),
                inner.reorder.next_expected(),
                FrameFlags::RST,
            );
            inner.stats.rsts_sent += 1;
            self.enqueue(inner, rst, false).await;
        }
        self.finish(inner, cause).await;
    }

    fn log_close(&self, inner: &StreamInner) {
        info!(
            "stream {:#x} closed ({:?}): sent={}B/{}f recv={}B/{}f retransmits={} peak_in_flight={}",
            self.id,
            inner.close_cause.expect("cause is set before logging"),
            inner.stats.bytes_sent,
            inner.stats.frames_sent,
            inner.stats.bytes_received,
            inner.stats.frames_received,
            inner.stats.retransmits,
            inner.stats.peak_in_flight,
        );
    }
}

fn close_error(inner: &StreamInner) -> StreamError {
    match inner.close_cause {
        Some(CloseCause::Reset) => StreamError::Reset,
        Some(CloseCause::FatalLoss) => StreamError::FatalLoss,
        Some(CloseCause::IdleTimeout) => StreamError::Timeout,
        _ => StreamError::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn shared() -> Arc<MuxShared> {
        shared_with(TransportConfig::default())
    }

    fn shared_with(config: TransportConfig) -> Arc<MuxShared> {
        // the radio is never driven in these tests; the scheduler that would
        // use it is not running
        let radio = Arc::new(RadioHandle::new(
            Arc::new(crate::radio::MockRadioSender::new()),
            5,
        ));
        Arc::new(MuxShared::new(Arc::new(config), radio))
    }

    fn seq(raw: u32) -> SeqNr {
        SeqNr::from_raw(raw)
    }

    fn peer() -> NodeId {
        NodeId::from_raw(0x42)
    }

    async fn drain_outbound(stream: &Arc<Stream>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = stream.pop_outbound().await {
            frames.push(frame);
        }
        frames
    }

    async fn established_pair_frames(stream: &Arc<Stream>) -> Vec<Frame> {
        stream.start_open(Bytes::new()).await;
        drain_outbound(stream).await;
        stream
            .on_frame(Frame::control(
                stream.id(),
                seq(0),
                seq(1),
                FrameFlags::SYN | FrameFlags::ACK,
            ))
            .await;
        drain_outbound(stream).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_handshake() {
        let stream = Stream::new(7, peer(), shared());
        stream.start_open(Bytes::from_static(b"CONNECT x:1")).await;
        assert_eq!(stream.state().await, StreamState::SynSent);

        let out = drain_outbound(&stream).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_syn());
        assert_eq!(out[0].seq, seq(0));
        assert_eq!(out[0].payload, Bytes::from_static(b"CONNECT x:1"));

        stream
            .on_frame(Frame::control(7, seq(0), seq(1), FrameFlags::SYN | FrameFlags::ACK))
            .await;
        assert_eq!(stream.state().await, StreamState::Established);

        // the handshake completion is acknowledged
        let out = drain_outbound(&stream).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_ack() && !out[0].is_syn());
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_handshake() {
        let stream = Stream::new(7, peer(), shared());
        stream.start_accept(seq(0)).await;
        assert_eq!(stream.state().await, StreamState::SynRcvd);

        let out = drain_outbound(&stream).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_syn() && out[0].is_ack());
        assert_eq!(out[0].ack, seq(1));

        stream
            .on_frame(Frame::control(7, seq(1), seq(1), FrameFlags::ACK))
            .await;
        assert_eq!(stream.state().await, StreamState::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_syn_is_answered_idempotently() {
        let stream = Stream::new(7, peer(), shared());
        stream.start_accept(seq(0)).await;
        let first = drain_outbound(&stream).await;

        stream
            .on_frame(Frame::control(7, seq(0), seq(0), FrameFlags::SYN))
            .await;
        let second = drain_outbound(&stream).await;
        assert_eq!(first, second);
        assert_eq!(stream.state().await, StreamState::SynRcvd);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_chunks_and_acks() {
        let stream = Stream::new(7, peer(), shared());
        established_pair_frames(&stream).await;

        stream.send(b"hello").await.unwrap();
        let out = drain_outbound(&stream).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].seq, seq(1));
        assert_eq!(out[0].payload, Bytes::from_static(b"hello"));
        assert!(out[0].is_ack());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_blocks_on_full_window_until_ack() {
        let config = TransportConfig {
            window_size: 2,
            chunk_payload_size: 1,
            ..TransportConfig::default()
        };
        let stream = Stream::new(7, peer(), shared_with(config));
        established_pair_frames(&stream).await;

        let sender = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.send(b"abcd").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!sender.is_finished());

        // ack the first two data frames (seq 1 and 2) - window opens
        stream
            .on_frame(Frame::control(7, seq(1), seq(3), FrameFlags::ACK))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // ack the rest
        stream
            .on_frame(Frame::control(7, seq(1), seq(5), FrameFlags::ACK))
            .await;
        sender.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_order_delivery_and_eof() {
        let stream = Stream::new(7, peer(), shared());
        established_pair_frames(&stream).await;

        stream
            .on_frame(Frame::data(7, seq(1), seq(1), FrameFlags::ACK, Bytes::from_static(b"he")))
            .await;
        stream
            .on_frame(Frame::data(7, seq(2), seq(1), FrameFlags::ACK, Bytes::from_static(b"llo")))
            .await;
        assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from_static(b"he")));
        assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from_static(b"llo")));

        stream
            .on_frame(Frame::control(7, seq(3), seq(1), FrameFlags::FIN | FrameFlags::ACK))
            .await;
        assert_eq!(stream.recv().await.unwrap(), None);
        assert_eq!(stream.state().await, StreamState::CloseWait);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_is_reordered_and_nacked_once() {
        let stream = Stream::new(7, peer(), shared());
        established_pair_frames(&stream).await;

        stream
            .on_frame(Frame::data(7, seq(2), seq(1), FrameFlags::ACK, Bytes::from_static(b"llo")))
            .await;
        // gap at seq 1 -> one NACK
        let out = drain_outbound(&stream).await;
        let nacks = out.iter().filter(|f| f.is_nack()).collect::<Vec<_>>();
        assert_eq!(nacks.len(), 1);
        assert_eq!(parse_nack_payload(&nacks[0].payload), vec![seq(1)]);

        // duplicate gap report is debounced
        stream
            .on_frame(Frame::data(7, seq(3), seq(1), FrameFlags::ACK, Bytes::from_static(b"!")))
            .await;
        let out = drain_outbound(&stream).await;
        assert!(out.iter().all(|f| !f.is_nack()));

        stream
            .on_frame(Frame::data(7, seq(1), seq(1), FrameFlags::ACK, Bytes::from_static(b"he")))
            .await;
        assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from_static(b"he")));
        assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from_static(b"llo")));
        assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from_static(b"!")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_triggers_resend_without_timer() {
        let stream = Stream::new(7, peer(), shared());
        established_pair_frames(&stream).await;

        stream.send(b"hello").await.unwrap();
        drain_outbound(&stream).await;

        let nack = Frame::data(
            7,
            seq(1),
            seq(1),
            FrameFlags::NACK | FrameFlags::ACK,
            nack_payload(&[seq(1)]),
        );
        stream.on_frame(nack).await;

        let out = drain_outbound(&stream).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, Bytes::from_static(b"hello"));
        assert_eq!(stream.stats().await.retransmits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_timeout_then_fatal_loss() {
        let config = TransportConfig {
            max_retransmits: 1,
            ..TransportConfig::default()
        };
        let stream = Stream::new(7, peer(), shared_with(config));
        established_pair_frames(&stream).await;

        stream.send(b"x").await.unwrap();
        drain_outbound(&stream).await;

        stream.on_retransmit_timeout(seq(1)).await;
        let out = drain_outbound(&stream).await;
        assert_eq!(out.len(), 1, "first timeout retransmits");

        stream.on_retransmit_timeout(seq(1)).await;
        assert_eq!(stream.state().await, StreamState::Closed);
        assert_eq!(stream.recv().await, Err(StreamError::FatalLoss));

        let out = drain_outbound(&stream).await;
        assert!(out.iter().any(|f| f.is_rst()), "fatal loss resets the peer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_orderly_close_handshake() {
        let stream = Stream::new(7, peer(), shared());
        established_pair_frames(&stream).await;

        stream.close().await.unwrap();
        assert_eq!(stream.state().await, StreamState::FinWait);
        let out = drain_outbound(&stream).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_fin());
        let fin_seq = out[0].seq;

        // peer acks our FIN and sends its own
        stream
            .on_frame(Frame::control(7, seq(1), fin_seq.next(), FrameFlags::ACK))
            .await;
        stream
            .on_frame(Frame::control(7, seq(1), fin_seq.next(), FrameFlags::FIN | FrameFlags::ACK))
            .await;
        assert_eq!(stream.state().await, StreamState::Closed);
        assert_eq!(stream.recv().await.unwrap(), None);
        assert_eq!(stream.stats().await.rsts_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let stream = Stream::new(7, peer(), shared());
        established_pair_frames(&stream).await;

        stream.close().await.unwrap();
        stream.close().await.unwrap();
        let out = drain_outbound(&stream).await;
        assert_eq!(out.iter().filter(|f| f.is_fin()).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_close_runs_through_last_ack() {
        let stream = Stream::new(7, peer(), shared());
        established_pair_frames(&stream).await;

        stream
            .on_frame(Frame::control(7, seq(1), seq(1), FrameFlags::FIN | FrameFlags::ACK))
            .await;
        assert_eq!(stream.state().await, StreamState::CloseWait);

        stream.close().await.unwrap();
        assert_eq!(stream.state().await, StreamState::LastAck);
        let out = drain_outbound(&stream).await;
        let fin = out.iter().find(|f| f.is_fin()).expect("FIN goes out");

        stream
            .on_frame(Frame::control(7, seq(2), fin.seq.next(), FrameFlags::ACK))
            .await;
        assert_eq!(stream.state().await, StreamState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rst_closes_and_second_rst_is_noop() {
        let stream = Stream::new(7, peer(), shared());
        established_pair_frames(&stream).await;

        stream
            .on_frame(Frame::control(7, seq(1), seq(1), FrameFlags::RST))
            .await;
        assert_eq!(stream.state().await, StreamState::Closed);
        assert_eq!(stream.recv().await, Err(StreamError::Reset));
        // no RST reply to a RST
        assert!(drain_outbound(&stream).await.is_empty());

        stream
            .on_frame(Frame::control(7, seq(2), seq(1), FrameFlags::RST))
            .await;
        assert!(drain_outbound(&stream).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_reset_sends_one_rst() {
        let stream = Stream::new(7, peer(), shared());
        established_pair_frames(&stream).await;

        stream.reset().await;
        stream.reset().await;
        let out = drain_outbound(&stream).await;
        assert_eq!(out.iter().filter(|f| f.is_rst()).count(), 1);
        assert_eq!(stream.send(b"x").await, Err(StreamError::Reset));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_resets_stream() {
        let config = TransportConfig {
            stream_timeout: std::time::Duration::from_secs(1),
            ..TransportConfig::default()
        };
        let stream = Stream::new(7, peer(), shared_with(config));
        established_pair_frames(&stream).await;

        tokio::time::advance(std::time::Duration::from_secs(2)).await;
        stream.on_tick(Instant::now()).await;

        assert_eq!(stream.state().await, StreamState::Closed);
        assert_eq!(stream.recv().await, Err(StreamError::Timeout));
        let out = drain_outbound(&stream).await;
        assert!(out.iter().any(|f| f.is_rst()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_ack_flush_on_tick() {
        let stream = Stream::new(7, peer(), shared());
        established_pair_frames(&stream).await;

        stream
            .on_frame(Frame::data(7, seq(1), seq(1), FrameFlags::ACK, Bytes::from_static(b"x")))
            .await;
        // below ack_every_n, nothing flushed yet
        assert!(drain_outbound(&stream).await.is_empty());

        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        stream.on_tick(Instant::now()).await;
        let out = drain_outbound(&stream).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_ack());
        assert_eq!(out[0].ack, seq(2));
    }

    #[rstest]
    #[case::established_data(4)]
    #[case::many(7)]
    fn test_ack_every_n_flushes(#[case] ack_every_n: u32) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async move {
            let config = TransportConfig {
                ack_every_n,
                ..TransportConfig::default()
            };
            let stream = Stream::new(7, peer(), shared_with(config));
            established_pair_frames(&stream).await;

            for i in 0..ack_every_n {
                stream
                    .on_frame(Frame::data(
                        7,
                        seq(1 + i),
                        seq(1),
                        FrameFlags::ACK,
                        Bytes::from_static(b"x"),
                    ))
                    .await;
            }
            let out = drain_outbound(&stream).await;
            let acks = out.iter().filter(|f| f.is_ack() && f.payload.is_empty()).count();
            assert_eq!(acks, 1);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_data_refreshes_ack() {
        let stream = Stream::new(7, peer(), shared());
        established_pair_frames(&stream).await;

        stream
            .on_frame(Frame::data(7, seq(1), seq(1), FrameFlags::ACK, Bytes::from_static(b"x")))
            .await;
        drain_outbound(&stream).await;

        stream
            .on_frame(Frame::data(7, seq(1), seq(1), FrameFlags::ACK, Bytes::from_static(b"x")))
            .await;
        let out = drain_outbound(&stream).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_ack());
        assert_eq!(out[0].ack, seq(2));
        assert_eq!(stream.stats().await.duplicates, 1);
    }
}
