use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::{EnvelopeConfig, ReliabilityMode};
use crate::envelope::chunk::{
    encode_nack_sequences, parse_nack_sequences, ChunkHeader, CHUNK_HEADER_LEN,
};
use crate::envelope::reassembly::{parity_over, ChunkOutcome, ReassemblyBuffer, ReassemblyKey};
use crate::envelope::dedupe::DedupeCache;
use crate::envelope::{decode_envelope, dedupe_keys, encode_envelope, Envelope, EnvelopeKind};
use crate::error::EnvelopeError;
use crate::radio::{NodeId, RadioHandle};

/// One application command. Handlers are looked up by command name in a
/// typed registry; there is no string-keyed dispatch beyond this seam.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<Value>;
}

#[derive(Default)]
struct EnvelopeCounters {
    envelopes_delivered: AtomicU64,
    duplicates_suppressed: AtomicU64,
    reassembly_timeouts: AtomicU64,
    handler_failures: AtomicU64,
    chunk_decode_errors: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvelopeCountersSnapshot {
    pub envelopes_delivered: u64,
    pub duplicates_suppressed: u64,
    pub reassembly_timeouts: u64,
    pub handler_failures: u64,
    pub chunk_decode_errors: u64,
}

struct SentEnvelope {
    dest: NodeId,
    /// Encoded data-chunk datagrams, indexed by sequence - 1. Kept for
    /// NACK-driven resends in windowed mode.
    datagrams: Vec<Bytes>,
}

/// The request/response gateway over raw addressed datagrams: chunked,
/// compressed envelopes with burst pacing, per-deployment reliability, and
/// replay suppression.
pub struct EnvelopeService {
    config: Arc<EnvelopeConfig>,
    radio: Arc<RadioHandle>,
    handlers: RwLock<FxHashMap<String, Arc<dyn CommandHandler>>>,
    reassembly: Mutex<ReassemblyBuffer>,
    dedupe: Mutex<DedupeCache>,
    pending: Mutex<FxHashMap<String, oneshot::Sender<Envelope>>>,
    ack_progress: Mutex<FxHashMap<[u8; 8], watch::Sender<u16>>>,
    sent_cache: Mutex<FxHashMap<[u8; 8], SentEnvelope>>,
    counters: EnvelopeCounters,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl EnvelopeService {
    pub fn new(config: EnvelopeConfig, radio: Arc<RadioHandle>) -> anyhow::Result<Arc<EnvelopeService>> {
        config.validate()?;
        let reassembly = ReassemblyBuffer::new(config.reassembly_ttl, config.parity_window);
        let dedupe = DedupeCache::new(config.dedup_window, config.dedup_lease);

        Ok(Arc::new(EnvelopeService {
            config: Arc::new(config),
            radio,
            handlers: RwLock::new(FxHashMap::default()),
            reassembly: Mutex::new(reassembly),
            dedupe: Mutex::new(dedupe),
            pending: Mutex::new(FxHashMap::default()),
            ack_progress: Mutex::new(FxHashMap::default()),
            sent_cache: Mutex::new(FxHashMap::default()),
            counters: EnvelopeCounters::default(),
            tasks: StdMutex::new(Vec::new()),
        }))
    }

    /// Spawn the housekeeping task (reassembly TTL, windowed-mode NACKs).
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("task list lock");
        if !tasks.is_empty() {
            warn!("envelope service already started");
            return;
        }
        tasks.push(tokio::spawn(self.clone().housekeeping_loop()));
        info!(
            "envelope service started on node {} ({:?} reliability)",
            self.radio.local_node(),
            self.config.reliability
        );
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().expect("task list lock").drain(..) {
            task.abort();
        }
    }

    pub async fn register_handler(&self, command: &str, handler: Arc<dyn CommandHandler>) {
        self.handlers
            .write()
            .await
            .insert(command.to_string(), handler);
    }

    pub fn counters(&self) -> EnvelopeCountersSnapshot {
        EnvelopeCountersSnapshot {
            envelopes_delivered: self.counters.envelopes_delivered.load(Ordering::Relaxed),
            duplicates_suppressed: self.counters.duplicates_suppressed.load(Ordering::Relaxed),
            reassembly_timeouts: self.counters.reassembly_timeouts.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            chunk_decode_errors: self.counters.chunk_decode_errors.load(Ordering::Relaxed),
        }
    }

    /// Send a request and wait for the correlated response. Retries the
    /// whole exchange with jittered exponential backoff.
    pub async fn request(
        &self,
        gateway: NodeId,
        command: &str,
        data: Value,
    ) -> Result<Envelope, EnvelopeError> {
        let envelope = Envelope::request(command, data);
        info!(
            "request {}: command={} to {}",
            &envelope.id[..8],
            command,
            gateway
        );

        let mut delay = self.config.backoff_base;
        for attempt in 0..=self.config.request_retries {
            if attempt > 0 {
                let jittered = jitter(delay, self.config.backoff_jitter);
                debug!(
                    "request {}: retry {} after {:?}",
                    &envelope.id[..8],
                    attempt,
                    jittered
                );
                sleep(jittered).await;
                delay = (delay * 2).min(self.config.backoff_max);
            }

            let (tx, mut rx) = oneshot::channel();
            self.pending.lock().await.insert(envelope.id.clone(), tx);

            if let Err(e) = self.send_envelope(gateway, &envelope).await {
                debug!("request {}: send attempt failed: {}", &envelope.id[..8], e);
                continue;
            }

            match timeout(self.config.request_timeout, &mut rx).await {
                Ok(Ok(response)) => {
                    self.pending.lock().await.remove(&envelope.id);
                    if response.kind == EnvelopeKind::Error {
                        let message = response
                            .data
                            .get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string();
                        return Err(EnvelopeError::HandlerFailed(message));
                    }
                    return Ok(response);
                }
                Ok(Err(_)) | Err(_) => {
                    debug!("request {}: no response in time", &envelope.id[..8]);
                }
            }
        }

        self.pending.lock().await.remove(&envelope.id);
        Err(EnvelopeError::ReassemblyTimeout)
    }

    /// Chunk, pace, and transmit one envelope according to the configured
    /// reliability strategy. Returns once the peer acknowledged it.
    pub async fn send_envelope(&self, dest: NodeId, envelope: &Envelope) -> anyhow::Result<()> {
        let encoded = encode_envelope(envelope)?;
        let segments = encoded
            .chunks(self.config.segment_size)
            .map(Bytes::copy_from_slice)
            .collect::<Vec<_>>();
        if segments.len() > u16::MAX as usize {
            bail!(
                "envelope {} needs {} chunks, above the sequence space",
                envelope.id,
                segments.len()
            );
        }
        let total = segments.len() as u16;
        let prefix = envelope.id_prefix();

        let datagrams = segments
            .iter()
            .enumerate()
            .map(|(i, segment)| ChunkHeader::data(prefix, i as u16 + 1, total).encode_with(segment))
            .collect::<Vec<_>>();
        debug!(
            "envelope {}: {} bytes compressed, {} chunks to {}",
            &envelope.id[..8.min(envelope.id.len())],
            encoded.len(),
            total,
            dest
        );

        let (progress_tx, progress_rx) = watch::channel(0u16);
        self.ack_progress.lock().await.insert(prefix, progress_tx);

        let result = match self.config.reliability {
            ReliabilityMode::Simple => {
                self.send_datagrams(dest, &datagrams).await;
                self.wait_for_progress(progress_rx, total).await
            }
            ReliabilityMode::Parity => {
                let with_parity = self.interleave_parity(&segments, &datagrams, prefix, total);
                self.send_datagrams(dest, &with_parity).await;
                self.wait_for_progress(progress_rx, total).await
            }
            ReliabilityMode::Staged => self.send_staged(dest, &datagrams, progress_rx).await,
            ReliabilityMode::Windowed => {
                self.sent_cache.lock().await.insert(
                    prefix,
                    SentEnvelope {
                        dest,
                        datagrams: datagrams.clone(),
                    },
                );
                self.send_datagrams(dest, &datagrams).await;
                let result = self.wait_for_progress(progress_rx, total).await;
                self.sent_cache.lock().await.remove(&prefix);
                result
            }
        };

        self.ack_progress.lock().await.remove(&prefix);
        result
    }

    /// Burst-paced transmission; radio failures degrade to loss, which the
    /// reliability strategy covers.
    async fn send_datagrams(&self, dest: NodeId, datagrams: &[Bytes]) {
        for (i, datagram) in datagrams.iter().enumerate() {
            if i > 0 && i % self.config.burst_size == 0 {
                sleep(self.config.burst_delay).await;
            }
            if let Err(e) = self.radio.send(dest, datagram).await {
                debug!("chunk {} to {} not sent: {}", i + 1, dest, e);
            }
        }
    }

    /// Data chunks with an XOR parity chunk after every window (including a
    /// short final window).
    fn interleave_parity(
        &self,
        segments: &[Bytes],
        datagrams: &[Bytes],
        prefix: [u8; 8],
        total: u16,
    ) -> Vec<Bytes> {
        let k = self.config.parity_window;
        let mut out = Vec::with_capacity(datagrams.len() + datagrams.len() / k + 1);
        for (window_index, (segment_window, datagram_window)) in
            segments.chunks(k).zip(datagrams.chunks(k)).enumerate()
        {
            out.extend_from_slice(datagram_window);
            let parity = parity_over(segment_window);
            out.push(
                ChunkHeader::parity(prefix, window_index as u16 + 1, total).encode_with(&parity),
            );
        }
        out
    }

    async fn send_staged(
        &self,
        dest: NodeId,
        datagrams: &[Bytes],
        mut progress: watch::Receiver<u16>,
    ) -> anyhow::Result<()> {
        for (burst_index, burst) in datagrams.chunks(self.config.burst_size).enumerate() {
            if burst_index > 0 {
                sleep(self.config.burst_delay).await;
            }
            for datagram in burst {
                if let Err(e) = self.radio.send(dest, datagram).await {
                    debug!("staged chunk to {} not sent: {}", dest, e);
                }
            }
            let burst_end =
                (((burst_index + 1) * self.config.burst_size).min(datagrams.len())) as u16;
            self.await_progress(&mut progress, burst_end).await?;
        }
        Ok(())
    }

    async fn wait_for_progress(
        &self,
        mut progress: watch::Receiver<u16>,
        target: u16,
    ) -> anyhow::Result<()> {
        self.await_progress(&mut progress, target).await
    }

    async fn await_progress(
        &self,
        progress: &mut watch::Receiver<u16>,
        target: u16,
    ) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.config.ack_timeout;
        loop {
            if *progress.borrow() >= target {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("no acknowledgement up to chunk {} in time", target);
            }
            match timeout(remaining, progress.changed()).await {
                Err(_) => bail!("no acknowledgement up to chunk {} in time", target),
                Ok(Err(_)) => bail!("acknowledgement channel closed"),
                Ok(Ok(())) => {}
            }
        }
    }

    /// Entry point for the radio driver: one datagram per call.
    pub async fn on_datagram(self: &Arc<Self>, src: NodeId, bytes: &[u8]) {
        let (header, payload) = match ChunkHeader::decode(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.counters.chunk_decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!("dropping undecodable chunk from {}: {}", src, e);
                return;
            }
        };

        if header.is_ack() {
            self.on_ack(src, header).await;
        } else if header.is_nack() {
            self.on_nack(src, header, &payload).await;
        } else if header.is_parity() {
            self.on_parity(src, header, payload).await;
        } else {
            self.on_data(src, header, payload).await;
        }
    }

    async fn on_ack(&self, src: NodeId, header: ChunkHeader) {
        trace!(
            "ack from {} for {:?}: progress {}",
            src,
            header.id_prefix,
            header.sequence
        );
        if let Some(progress) = self.ack_progress.lock().await.get(&header.id_prefix) {
            progress.send_modify(|current| {
                if header.sequence > *current {
                    *current = header.sequence;
                }
            });
        }
    }

    async fn on_nack(&self, src: NodeId, header: ChunkHeader, payload: &[u8]) {
        let missing = parse_nack_sequences(payload);
        debug!("NACK from {} for {} chunks", src, missing.len());

        let resends = {
            let cache = self.sent_cache.lock().await;
            let Some(sent) = cache.get(&header.id_prefix) else {
                debug!("NACK for an envelope no longer cached");
                return;
            };
            if sent.dest != src {
                return;
            }
            missing
                .iter()
                .filter(|seq| **seq >= 1)
                .filter_map(|seq| sent.datagrams.get(*seq as usize - 1).cloned())
                .collect::<Vec<_>>()
        };
        self.send_datagrams(src, &resends).await;
    }

    async fn on_parity(self: &Arc<Self>, src: NodeId, header: ChunkHeader, payload: Bytes) {
        let key = ReassemblyKey {
            sender: src,
            id_prefix: header.id_prefix,
        };
        let outcome = self.reassembly.lock().await.insert_parity(
            key,
            header.sequence,
            header.total,
            payload,
            Instant::now(),
        );
        self.handle_outcome(src, header, key, outcome).await;
    }

    async fn on_data(self: &Arc<Self>, src: NodeId, header: ChunkHeader, payload: Bytes) {
        let key = ReassemblyKey {
            sender: src,
            id_prefix: header.id_prefix,
        };
        let outcome = self.reassembly.lock().await.insert_data(
            key,
            header.sequence,
            header.total,
            payload,
            Instant::now(),
        );
        self.handle_outcome(src, header, key, outcome).await;
    }

    async fn handle_outcome(
        self: &Arc<Self>,
        src: NodeId,
        header: ChunkHeader,
        key: ReassemblyKey,
        outcome: ChunkOutcome,
    ) {
        match outcome {
            ChunkOutcome::Complete(segments) => {
                self.send_completion_ack(src, header.id_prefix, header.total).await;
                self.deliver(src, segments).await;
            }
            ChunkOutcome::AlreadyComplete => {
                // the sender missed our ack; repeat it, nothing is re-delivered
                self.send_completion_ack(src, header.id_prefix, header.total).await;
            }
            ChunkOutcome::Pending => {
                if self.config.reliability == ReliabilityMode::Staged && header.is_data() {
                    let at_burst_boundary = header.sequence % self.config.burst_size as u16 == 0
                        || header.sequence == header.total;
                    if at_burst_boundary {
                        let contiguous = self.reassembly.lock().await.highest_contiguous(&key);
                        let ack = ChunkHeader::ack(header.id_prefix, contiguous, header.total);
                        if let Err(e) = self.radio.send(src, &ack.encode_with(&[])).await {
                            debug!("burst ack to {} not sent: {}", src, e);
                        }
                    }
                }
            }
        }
    }

    async fn send_completion_ack(&self, dest: NodeId, prefix: [u8; 8], total: u16) {
        let ack = ChunkHeader::ack(prefix, total, total);
        if let Err(e) = self.radio.send(dest, &ack.encode_with(&[])).await {
            debug!("completion ack to {} not sent: {}", dest, e);
        }
    }

    async fn deliver(self: &Arc<Self>, src: NodeId, segments: Vec<Bytes>) {
        let mut combined = Vec::with_capacity(segments.iter().map(Bytes::len).sum());
        for segment in &segments {
            combined.extend_from_slice(segment);
        }
        let envelope = match decode_envelope(&combined) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("reassembled envelope from {} does not decode: {}", src, e);
                return;
            }
        };

        let keys = dedupe_keys(src, &envelope);
        let duplicate = self
            .dedupe
            .lock()
            .await
            .check_and_record(&keys, Instant::now());
        if duplicate {
            self.counters.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(
                "envelope {} from {} suppressed as duplicate",
                &envelope.id[..8.min(envelope.id.len())],
                src
            );
            return;
        }
        self.counters.envelopes_delivered.fetch_add(1, Ordering::Relaxed);

        match envelope.kind {
            EnvelopeKind::Request => {
                // answering may itself wait for acks; never block the
                // inbound path on it
                let service = self.clone();
                tokio::spawn(async move {
                    service.answer_request(src, envelope).await;
                });
            }
            EnvelopeKind::Response | EnvelopeKind::Error => {
                if let Some(waiter) = self.pending.lock().await.remove(&envelope.id) {
                    let _ = waiter.send(envelope);
                } else {
                    debug!(
                        "unmatched response {} from {}",
                        &envelope.id[..8.min(envelope.id.len())],
                        src
                    );
                }
            }
        }
    }

    async fn answer_request(self: Arc<Self>, src: NodeId, request: Envelope) {
        info!(
            "request {} from {}: command={}",
            &request.id[..8.min(request.id.len())],
            src,
            request.command
        );

        let handler = self.handlers.read().await.get(&request.command).cloned();
        let response = match handler {
            None => {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                Envelope::error_to(&request, &format!("unknown command: {}", request.command))
            }
            Some(handler) => match handler.handle(&request).await {
                Ok(result) => Envelope::response_to(&request, result),
                Err(e) => {
                    self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "handler for {} failed: {:#}",
                        request.command, e
                    );
                    Envelope::error_to(&request, &format!("{:#}", e))
                }
            },
        };

        if let Err(e) = self.send_envelope(src, &response).await {
            warn!(
                "response {} to {} not delivered: {}",
                &response.id[..8.min(response.id.len())],
                src,
                e
            );
        }
    }

    async fn housekeeping_loop(self: Arc<Self>) {
        loop {
            sleep(self.config.housekeeping_tick).await;
            let now = Instant::now();

            let (timed_out, gaps) = {
                let mut reassembly = self.reassembly.lock().await;
                let timed_out = reassembly.purge(now);
                let gaps = if self.config.reliability == ReliabilityMode::Windowed {
                    reassembly.gaps(now, self.config.nack_quiet)
                } else {
                    Vec::new()
                };
                (timed_out, gaps)
            };

            if !timed_out.is_empty() {
                self.counters
                    .reassembly_timeouts
                    .fetch_add(timed_out.len() as u64, Ordering::Relaxed);
            }

            for (key, missing) in gaps {
                debug!(
                    "requesting {} missing chunks from {}",
                    missing.len(),
                    key.sender
                );
                let nack = ChunkHeader::nack(key.id_prefix);
                let payload = encode_nack_sequences(&missing);
                if let Err(e) = self.radio.send(key.sender, &nack.encode_with(&payload)).await {
                    debug!("NACK to {} not sent: {}", key.sender, e);
                }
            }
        }
    }

    /// Effective payload bytes per data chunk datagram.
    pub fn segment_size(&self) -> usize {
        self.config.segment_size
    }

    /// Datagram size of a full data chunk, for MTU budgeting.
    pub fn max_datagram_len(&self) -> usize {
        CHUNK_HEADER_LEN + self.config.segment_size
    }
}

fn jitter(base: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return base;
    }
    let factor = rand::thread_rng().gen_range(1.0 - fraction..=1.0 + fraction);
    base.mul_f64(factor.max(0.0))
}
