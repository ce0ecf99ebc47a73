use thiserror::Error;

/// Errors from decoding wire bytes - frames or envelope chunk headers.
///
/// These never propagate past the demultiplexer: a datagram that fails to
/// decode is dropped and counted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer is shorter than the minimum frame / chunk header size.
    #[error("buffer too short: {len} bytes")]
    TooShort { len: usize },

    /// Declared payload length is inconsistent with the buffer size.
    #[error("length mismatch: declared {declared}, buffer holds {actual}")]
    BadLength { declared: usize, actual: usize },

    /// CRC-32 over header and payload does not match the trailer.
    #[error("crc mismatch")]
    BadCrc,

    /// Chunk header does not start with the expected magic bytes.
    #[error("bad magic")]
    BadMagic,

    /// Chunk header carries an unsupported version.
    #[error("unsupported version {0}")]
    BadVersion(u8),
}

/// Errors surfaced to stream API callers. `WouldBlock` is recoverable, the
/// rest are terminal for the stream they refer to.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The send window or outbound queue is full; retry after acks drain it.
    #[error("operation would block")]
    WouldBlock,

    /// The stream has finished or was never opened.
    #[error("stream closed")]
    Closed,

    /// The peer (or the local side) reset the stream.
    #[error("stream reset")]
    Reset,

    /// A frame exceeded the retransmit budget; in-order delivery can no
    /// longer be guaranteed.
    #[error("fatal loss: retransmit budget exhausted")]
    FatalLoss,

    /// The stream was idle past the configured timeout, or a blocking
    /// operation ran past its deadline.
    #[error("timeout")]
    Timeout,
}

impl StreamError {
    /// Process exit code for a fatal protocol error.
    pub fn exit_code(&self) -> i32 {
        3
    }
}

/// Process-level transport errors. `RadioBusy` is recoverable; `RadioDown`
/// is latched until the adapter manages a successful send again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("radio is down")]
    RadioDown,

    #[error("radio is busy")]
    RadioBusy,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl TransportError {
    pub fn exit_code(&self) -> i32 {
        match self {
            TransportError::ConfigInvalid(_) => 1,
            TransportError::RadioDown | TransportError::RadioBusy => 2,
        }
    }
}

/// Errors from the request/response envelope tier. `DuplicateSuppressed` is
/// informational - the envelope was received intact but had been handled
/// before. The radio is never torn down for an envelope-level failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Not all chunks arrived before the reassembly TTL, or no response /
    /// acknowledgement arrived in time.
    #[error("reassembly timed out")]
    ReassemblyTimeout,

    /// The envelope matched a recently completed dedup key.
    #[error("duplicate suppressed")]
    DuplicateSuppressed,

    /// The command handler returned an error.
    #[error("handler failed: {0}")]
    HandlerFailed(String),
}
