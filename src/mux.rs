use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::frame::{Frame, FrameFlags};
use crate::qos::TokenBucket;
use crate::radio::{NodeId, RadioHandle};
use crate::seq::SeqNr;
use crate::stream::{MuxShared, Stream};

/// Live streams are kept well below the birthday bound of random 32-bit ids.
const MAX_LIVE_STREAMS: usize = 1 << 16;

/// Application hook for inbound streams. Invoked once per accepted SYN with
/// the opaque open request the peer put in it.
#[async_trait]
pub trait StreamAcceptor: Send + Sync + 'static {
    async fn on_stream(&self, stream: Arc<Stream>, open_payload: Bytes);
}

/// Multiplexer counters, exposed for diagnostics and tests.
#[derive(Default)]
struct MuxCounters {
    frames_in: AtomicU64,
    decode_errors: AtomicU64,
    rst_replies: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MuxCountersSnapshot {
    pub frames_in: u64,
    pub decode_errors: u64,
    pub rst_replies: u64,
}

/// Owns the stream registry and everything process-wide around it: inbound
/// demultiplexing, the round-robin outbound scheduler with its airtime
/// token bucket, and the retransmit / idle timer task.
pub struct StreamMux {
    config: Arc<TransportConfig>,
    radio: Arc<RadioHandle>,
    shared: Arc<MuxShared>,
    acceptor: Arc<dyn StreamAcceptor>,
    streams: RwLock<FxHashMap<u32, Arc<Stream>>>,
    counters: MuxCounters,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl StreamMux {
    pub fn new(
        config: TransportConfig,
        radio: Arc<RadioHandle>,
        acceptor: Arc<dyn StreamAcceptor>,
    ) -> anyhow::Result<Arc<StreamMux>> {
        config.validate()?;
        let config = Arc::new(config);

        Ok(Arc::new(StreamMux {
            shared: Arc::new(MuxShared::new(config.clone(), radio.clone())),
            config,
            radio,
            acceptor,
            streams: RwLock::new(FxHashMap::default()),
            counters: MuxCounters::default(),
            tasks: StdMutex::new(Vec::new()),
        }))
    }

    /// Spawn the outbound scheduler and the timer task.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("task list lock");
        if !tasks.is_empty() {
            warn!("multiplexer already started");
            return;
        }
        tasks.push(tokio::spawn(self.clone().scheduler_loop()));
        tasks.push(tokio::spawn(self.clone().timer_loop()));
        info!("multiplexer started on node {}", self.radio.local_node());
    }

    /// Abort the background tasks and reset every live stream.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().expect("task list lock").drain(..) {
            task.abort();
        }
        let streams = self
            .streams
            .write()
            .await
            .drain()
            .map(|(_, stream)| stream)
            .collect::<Vec<_>>();
        for stream in streams {
            stream.reset().await;
        }
        info!("multiplexer shut down");
    }

    pub fn local_node(&self) -> NodeId {
        self.radio.local_node()
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    pub fn counters(&self) -> MuxCountersSnapshot {
        MuxCountersSnapshot {
            frames_in: self.counters.frames_in.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            rst_replies: self.counters.rst_replies.load(Ordering::Relaxed),
        }
    }

    /// Open a stream to `peer`. The opaque `open_payload` travels in the
    /// SYN (a CONNECT target, for the proxy use case). Returns once the SYN
    /// is on its way; await [`Stream::established`] for the handshake.
    pub async fn connect(&self, peer: NodeId, open_payload: Bytes) -> anyhow::Result<Arc<Stream>> {
        if self.radio.is_down() {
            return Err(TransportError::RadioDown.into());
        }
        if open_payload.len() > self.config.chunk_payload_size {
            bail!(
                "open payload of {} bytes exceeds the {}-byte frame payload limit",
                open_payload.len(),
                self.config.chunk_payload_size
            );
        }

        let stream = {
            let mut streams = self.streams.write().await;
            if streams.len() >= MAX_LIVE_STREAMS {
                bail!("too many live streams ({})", streams.len());
            }
            let id = allocate_stream_id(&streams);
            let stream = Stream::new(id, peer, self.shared.clone());
            streams.insert(id, stream.clone());
            stream
        };

        stream.start_open(open_payload).await;
        Ok(stream)
    }

    /// Entry point for the radio driver: one datagram per call.
    pub async fn on_datagram(&self, src: NodeId, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!("dropping undecodable datagram from {}: {}", src, e);
                return;
            }
        };
        self.counters.frames_in.fetch_add(1, Ordering::Relaxed);
        trace!(
            "datagram from {}: stream {:#x} seq={} flags={}",
            src,
            frame.stream_id,
            frame.seq,
            frame.flags
        );

        let existing = self.streams.read().await.get(&frame.stream_id).cloned();
        match existing {
            Some(stream) => {
                if stream.peer() != src {
                    debug!(
                        "stream {:#x}: frame from {} but stream belongs to {} - dropping",
                        frame.stream_id,
                        src,
                        stream.peer()
                    );
                    return;
                }
                stream.on_frame(frame).await;
            }
            None => self.on_unknown_stream(src, frame).await,
        }
    }

    async fn on_unknown_stream(&self, src: NodeId, frame: Frame) {
        if frame.is_rst() {
            return; // RST for a stream we no longer know - nothing to do
        }

        if frame.is_syn() && !frame.is_ack() && frame.stream_id != 0 {
            let stream = {
                let mut streams = self.streams.write().await;
                if streams.len() >= MAX_LIVE_STREAMS {
                    warn!("rejecting inbound stream {:#x}: registry full", frame.stream_id);
                    None
                } else {
                    let stream = Stream::new(frame.stream_id, src, self.shared.clone());
                    streams.insert(frame.stream_id, stream.clone());
                    Some(stream)
                }
            };
            let Some(stream) = stream else {
                self.reply_rst(src, frame.stream_id).await;
                return;
            };

            stream.start_accept(frame.seq).await;
            self.acceptor.on_stream(stream, frame.payload).await;
            return;
        }

        // stream id 0 is reserved for the envelope tier and never valid here
        debug!(
            "frame for unknown stream {:#x} from {} (flags {}), replying RST",
            frame.stream_id, src, frame.flags
        );
        self.reply_rst(src, frame.stream_id).await;
    }

    /// Best-effort RST outside any stream context.
    async fn reply_rst(&self, dest: NodeId, stream_id: u32) {
        self.counters.rst_replies.fetch_add(1, Ordering::Relaxed);
        let rst = Frame::control(stream_id, SeqNr::ZERO, SeqNr::ZERO, FrameFlags::RST);
        let encoded = rst.encode().expect("control frames fit the payload limit");
        if let Err(e) = self.radio.send(dest, &encoded).await {
            debug!("failed to send RST reply to {}: {}", dest, e);
        }
    }

    /// Cooperative outbound scheduler: visits streams round-robin, drains at
    /// most one frame per stream per sweep, and paces sends through the
    /// token bucket.
    async fn scheduler_loop(self: Arc<Self>) {
        let mut bucket = TokenBucket::new(self.config.rate_per_sec, self.config.burst_capacity);

        loop {
            let streams = {
                let registry = self.streams.read().await;
                registry.values().cloned().collect::<Vec<_>>()
            };

            let mut sent_any = false;
            for stream in streams {
                let Some(frame) = stream.pop_outbound().await else {
                    continue;
                };
                sent_any = true;

                loop {
                    let wait = bucket.next_available();
                    if wait.is_zero() {
                        break;
                    }
                    sleep(wait).await;
                }
                bucket.allow();

                let encoded = frame.encode().expect("admitted frames fit the payload limit");
                if let Err(e) = self.radio.send(stream.peer(), &encoded).await {
                    // tracked frames come back via their retransmit timer
                    debug!(
                        "stream {:#x}: dropping frame after radio failure: {}",
                        stream.id(),
                        e
                    );
                    sleep(self.config.timer_tick).await;
                }
            }

            if !sent_any {
                tokio::select! {
                    _ = self.shared.outbound_ready.notified() => {}
                    _ = sleep(self.config.timer_tick) => {}
                }
            }
        }
    }

    /// Services the retransmit heap, runs per-stream upkeep, and sweeps
    /// defunct streams out of the registry.
    async fn timer_loop(self: Arc<Self>) {
        loop {
            let now = Instant::now();
            let expired = self.shared.timers.lock().await.pop_expired(now);
            for entry in expired {
                let stream = self.streams.read().await.get(&entry.stream_id).cloned();
                match stream {
                    Some(stream) => stream.on_retransmit_timeout(entry.seq).await,
                    None => trace!("timer fired for vanished stream {:#x}", entry.stream_id),
                }
            }

            let streams = {
                let registry = self.streams.read().await;
                registry
                    .iter()
                    .map(|(id, stream)| (*id, stream.clone()))
                    .collect::<Vec<_>>()
            };

            let mut defunct = Vec::new();
            for (id, stream) in streams {
                stream.on_tick(now).await;
                if stream.is_defunct().await {
                    defunct.push(id);
                }
            }
            if !defunct.is_empty() {
                let mut registry = self.streams.write().await;
                for id in defunct {
                    registry.remove(&id);
                    debug!("stream {:#x} removed from registry", id);
                }
            }

            let next_deadline = self.shared.timers.lock().await.next_deadline();
            let until_deadline = next_deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(self.config.timer_tick);
            sleep(until_deadline.min(self.config.timer_tick)).await;
        }
    }
}

/// Random non-zero stream id avoiding currently-live collisions.
fn allocate_stream_id(live: &FxHashMap<u32, Arc<Stream>>) -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let id: u32 = rng.gen();
        if id != 0 && !live.contains_key(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{MockRadioSender, SendOutcome};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    struct RecordingAcceptor {
        accepted: AtomicUsize,
        payloads: Mutex<Vec<Bytes>>,
    }

    impl RecordingAcceptor {
        fn new() -> Arc<RecordingAcceptor> {
            Arc::new(RecordingAcceptor {
                accepted: AtomicUsize::new(0),
                payloads: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StreamAcceptor for RecordingAcceptor {
        async fn on_stream(&self, _stream: Arc<Stream>, open_payload: Bytes) {
            self.accepted.fetch_add(1, Ordering::SeqCst);
            self.payloads.lock().await.push(open_payload);
        }
    }

    fn quiet_radio() -> Arc<RadioHandle> {
        let mut sender = MockRadioSender::new();
        sender.expect_local_node().return_const(NodeId::from_raw(1));
        sender
            .expect_send_datagram()
            .returning(|_, _| SendOutcome::Sent);
        Arc::new(RadioHandle::new(Arc::new(sender), 5))
    }

    fn mux_with(acceptor: Arc<RecordingAcceptor>) -> Arc<StreamMux> {
        StreamMux::new(TransportConfig::default(), quiet_radio(), acceptor).unwrap()
    }

    fn syn_frame(stream_id: u32, payload: &'static [u8]) -> Vec<u8> {
        Frame::data(
            stream_id,
            SeqNr::ZERO,
            SeqNr::ZERO,
            FrameFlags::SYN,
            Bytes::from_static(payload),
        )
        .encode()
        .unwrap()
        .to_vec()
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_syn_creates_one_passive_stream() {
        let acceptor = RecordingAcceptor::new();
        let mux = mux_with(acceptor.clone());
        let datagram = syn_frame(0x5555, b"CONNECT example.org:80");

        mux.on_datagram(NodeId::from_raw(9), &datagram).await;
        // a duplicated SYN must not allocate a second stream
        mux.on_datagram(NodeId::from_raw(9), &datagram).await;

        assert_eq!(mux.stream_count().await, 1);
        assert_eq!(acceptor.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(
            acceptor.payloads.lock().await.as_slice(),
            &[Bytes::from_static(b"CONNECT example.org:80")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_datagrams_are_counted_and_dropped() {
        let mux = mux_with(RecordingAcceptor::new());

        mux.on_datagram(NodeId::from_raw(9), b"garbage").await;
        let mut corrupted = syn_frame(0x5555, b"");
        corrupted[0] ^= 0xff;
        mux.on_datagram(NodeId::from_raw(9), &corrupted).await;

        let counters = mux.counters();
        assert_eq!(counters.decode_errors, 2);
        assert_eq!(counters.frames_in, 0);
        assert_eq!(mux.stream_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_stream_without_syn_gets_rst() {
        let mut sender = MockRadioSender::new();
        sender.expect_local_node().return_const(NodeId::from_raw(1));
        sender
            .expect_send_datagram()
            .times(1)
            .withf(|dest, bytes| {
                let frame = Frame::decode(bytes).unwrap();
                *dest == NodeId::from_raw(9) && frame.is_rst() && frame.stream_id == 0x7777
            })
            .returning(|_, _| SendOutcome::Sent);
        let radio = Arc::new(RadioHandle::new(Arc::new(sender), 5));
        let mux = StreamMux::new(TransportConfig::default(), radio, RecordingAcceptor::new()).unwrap();

        let data = Frame::data(
            0x7777,
            SeqNr::from_raw(3),
            SeqNr::ZERO,
            FrameFlags::ACK,
            Bytes::from_static(b"stray"),
        )
        .encode()
        .unwrap();
        mux.on_datagram(NodeId::from_raw(9), &data).await;

        assert_eq!(mux.counters().rst_replies, 1);
        assert_eq!(mux.stream_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_syn_for_reserved_stream_id_zero_is_rejected() {
        let mux = mux_with(RecordingAcceptor::new());
        let datagram = syn_frame(0, b"");
        mux.on_datagram(NodeId::from_raw(9), &datagram).await;

        assert_eq!(mux.stream_count().await, 0);
        assert_eq!(mux.counters().rst_replies, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rst_for_unknown_stream_is_ignored() {
        let mux = mux_with(RecordingAcceptor::new());
        let rst = Frame::control(0x1234, SeqNr::ZERO, SeqNr::ZERO, FrameFlags::RST)
            .encode()
            .unwrap();
        mux.on_datagram(NodeId::from_raw(9), &rst).await;

        assert_eq!(mux.counters().rst_replies, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_allocates_distinct_nonzero_ids() {
        let mux = mux_with(RecordingAcceptor::new());

        let a = mux.connect(NodeId::from_raw(9), Bytes::new()).await.unwrap();
        let b = mux.connect(NodeId::from_raw(9), Bytes::new()).await.unwrap();

        assert_ne!(a.id(), 0);
        assert_ne!(b.id(), 0);
        assert_ne!(a.id(), b.id());
        assert_eq!(mux.stream_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_rejects_oversized_open_payload() {
        let mux = mux_with(RecordingAcceptor::new());
        let oversized = Bytes::from(vec![0u8; crate::frame::MAX_PAYLOAD + 1]);
        assert!(mux.connect(NodeId::from_raw(9), oversized).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_from_wrong_node_are_dropped() {
        let acceptor = RecordingAcceptor::new();
        let mux = mux_with(acceptor.clone());
        mux.on_datagram(NodeId::from_raw(9), &syn_frame(0x5555, b"")).await;

        // an ACK for the same stream id from a different node must not reach
        // the stream
        let ack = Frame::control(0x5555, SeqNr::from_raw(1), SeqNr::from_raw(1), FrameFlags::ACK)
            .encode()
            .unwrap();
        mux.on_datagram(NodeId::from_raw(10), &ack).await;

        let stream = mux.streams.read().await.get(&0x5555).cloned().unwrap();
        assert_eq!(stream.state().await, crate::stream::StreamState::SynRcvd);
    }
}
