use anyhow::bail;
use std::time::Duration;

use crate::frame::MAX_PAYLOAD;

/// Configuration for the stream transport.
///
/// The defaults are tuned for a Meshtastic mesh on a mid-range modem preset:
/// single-digit frames per second of airtime, seconds of latency, and loss
/// rates that regularly reach double digits. Faster links can raise
/// `window_size` and `rate_per_sec` and lower `retransmit_timeout`.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Maximum bytes of payload per data frame. Bounded by the radio
    /// datagram MTU minus the 19 bytes of framing; never above
    /// [`MAX_PAYLOAD`].
    pub chunk_payload_size: usize,

    /// Maximum unacknowledged frames per stream and direction.
    pub window_size: u32,

    /// Per-frame retransmit deadline. Flat - LoRa airtime dominates RTT
    /// variance, so there is nothing to gain from an adaptive timer.
    pub retransmit_timeout: Duration,

    /// Retransmit attempts per frame before the stream is declared lost.
    pub max_retransmits: u32,

    /// Idle time after which a stream is reset and discarded.
    pub stream_timeout: Duration,

    /// Send one cumulative ACK per this many delivered data frames...
    pub ack_every_n: u32,

    /// ...or after this much time with deliveries pending acknowledgement,
    /// whichever comes first.
    pub ack_flush_interval: Duration,

    /// Minimum spacing between NACKs for the same leading gap. Gives
    /// ordinary out-of-order arrival a chance before requesting a re-send.
    pub nack_debounce: Duration,

    /// Upper bound of seqs listed in a single NACK frame.
    pub max_nacks_per_frame: usize,

    /// Token bucket refill rate for outbound frames, in frames per second.
    /// Sized to the mesh airtime budget, not to the serial link.
    pub rate_per_sec: f64,

    /// Token bucket burst capacity, in frames.
    pub burst_capacity: f64,

    /// Outbound queue depth across all streams above which admission blocks.
    pub high_water_mark: usize,

    /// Consecutive radio send failures before the radio is latched down.
    pub max_send_failures: u32,

    /// Granularity of the retransmit / idle-sweep timer task.
    pub timer_tick: Duration,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            chunk_payload_size: MAX_PAYLOAD,
            window_size: 4,
            retransmit_timeout: Duration::from_millis(5000),
            max_retransmits: 5,
            stream_timeout: Duration::from_secs(120),
            ack_every_n: 4,
            ack_flush_interval: Duration::from_millis(500),
            nack_debounce: Duration::from_millis(500),
            max_nacks_per_frame: 16,
            rate_per_sec: 8.0,
            burst_capacity: 8.0,
            high_water_mark: 64,
            max_send_failures: 5,
            timer_tick: Duration::from_millis(250),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_payload_size == 0 || self.chunk_payload_size > MAX_PAYLOAD {
            bail!(
                "chunk_payload_size must be in 1..={}, was {}",
                MAX_PAYLOAD,
                self.chunk_payload_size
            );
        }
        if self.window_size == 0 {
            bail!("window_size must be at least 1");
        }
        if self.window_size > i32::MAX as u32 / 2 {
            bail!("window_size must stay far below the seq number wrap distance");
        }
        if self.retransmit_timeout.is_zero() {
            bail!("retransmit_timeout must be non-zero");
        }
        if self.rate_per_sec <= 0.0 || self.burst_capacity < 1.0 {
            bail!("outbound rate limiter must allow at least one frame");
        }
        if self.high_water_mark == 0 {
            bail!("high_water_mark must be at least 1");
        }
        Ok(())
    }
}

/// Reliability strategy of the envelope tier, selected per deployment.
/// Both ends of a link must agree.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReliabilityMode {
    /// One ACK for the complete envelope; whole-envelope retransmit on
    /// timeout.
    Simple,
    /// The receiver acknowledges each burst before the next one goes out.
    Staged,
    /// The receiver NACKs missing sequences after a quiet interval; only
    /// those are resent.
    Windowed,
    /// Every window of `parity_window` data chunks is followed by an XOR
    /// parity chunk; a single loss per window is recovered locally.
    Parity,
}

/// Configuration for the envelope (request/response) tier.
#[derive(Clone, Debug)]
pub struct EnvelopeConfig {
    /// Bytes of compressed envelope per chunk, excluding the 16-byte chunk
    /// header.
    pub segment_size: usize,

    /// Chunks sent back-to-back before pausing.
    pub burst_size: usize,

    /// Pause between bursts, to keep radio duty-cycle contention down.
    pub burst_delay: Duration,

    /// Partial envelopes are discarded after this long.
    pub reassembly_ttl: Duration,

    pub reliability: ReliabilityMode,

    /// Data chunks per parity window (the `k` of parity mode).
    pub parity_window: usize,

    /// Capacity of the replay-suppression LRU.
    pub dedup_window: usize,

    /// How long a completed dedup key stays authoritative.
    pub dedup_lease: Duration,

    /// Quiet time on an incomplete envelope before missing chunks are
    /// NACKed (windowed mode).
    pub nack_quiet: Duration,

    /// Time to wait for the peer's acknowledgement of a sent envelope.
    pub ack_timeout: Duration,

    /// End-to-end deadline for a request/response exchange.
    pub request_timeout: Duration,

    /// Whole-request retries after a timeout.
    pub request_retries: u32,

    /// Backoff between request retries: base * 2^attempt, jittered, capped.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: f64,

    /// Granularity of the reassembly housekeeping task.
    pub housekeeping_tick: Duration,
}

impl Default for EnvelopeConfig {
    fn default() -> EnvelopeConfig {
        EnvelopeConfig {
            segment_size: 100,
            burst_size: 5,
            burst_delay: Duration::from_millis(50),
            reassembly_ttl: Duration::from_secs(120),
            reliability: ReliabilityMode::Simple,
            parity_window: 4,
            dedup_window: 1024,
            dedup_lease: Duration::from_secs(300),
            nack_quiet: Duration::from_millis(1000),
            ack_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            request_retries: 2,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            backoff_jitter: 0.2,
            housekeeping_tick: Duration::from_millis(500),
        }
    }
}

impl EnvelopeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.segment_size == 0 || self.segment_size > MAX_PAYLOAD {
            bail!(
                "segment_size must be in 1..={}, was {}",
                MAX_PAYLOAD,
                self.segment_size
            );
        }
        if self.burst_size == 0 {
            bail!("burst_size must be at least 1");
        }
        if self.parity_window == 0 {
            bail!("parity_window must be at least 1");
        }
        if self.dedup_window == 0 {
            bail!("dedup_window must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            bail!("backoff_jitter must be a fraction in 0..=1");
        }
        Ok(())
    }
}
