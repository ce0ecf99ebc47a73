//! Reliable, multiplexed byte streams (and request/response envelopes) over
//! a lossy LoRa mesh.
//!
//! The underlying medium - a Meshtastic mesh - offers best-effort delivery
//! of small datagrams (about 200 usable bytes) with heavy loss, reordering,
//! and duplication, at single-digit frames per second. This crate builds two
//! transports on top of that:
//!
//! * a **stream tier**: connection-oriented, TCP-like byte streams with
//!   SYN/FIN/RST lifecycle, cumulative acks, NACK-driven and timer-driven
//!   retransmission, sliding-window flow control, and multiplexing of many
//!   streams over one radio. This is what the HTTP CONNECT proxy tunnels
//!   TCP through.
//! * an **envelope tier**: self-describing request/response records
//!   (MessagePack + zstd), chunked into addressed datagrams with burst
//!   pacing, selectable reliability (single-ack, per-burst acks, selective
//!   NACK, or XOR parity windows), reassembly with TTL, and replay
//!   suppression. This is what the command gateway speaks.
//!
//! A deployment picks ONE tier per link; they do not interoperate on the
//! same wire.
//!
//! ## Design notes
//!
//! * Frames never exceed one radio datagram - the protocol fragments,
//!   the radio must not.
//! * The default is cumulative acknowledgement; NACKs ask for specific
//!   retransmits so a single loss does not stall the window for a full
//!   retransmit timeout.
//! * Retransmit timeouts are flat. Airtime dominates RTT on LoRa, so an
//!   adaptive timer has nothing to adapt to.
//! * The mesh does the routing; this crate treats the radio as an opaque
//!   datagram port (`RadioSender`) and is driven entirely through it, which
//!   is also what makes the whole protocol testable in-process (see
//!   [`test_util`]).
//!
//! ## Stream frame wire format
//!
//! All integers little-endian:
//!
//! ```ascii
//! offset size field
//!   0    4   stream_id     u32 (0 is reserved)
//!   4    4   seq           u32, per stream per direction, wraps mod 2^32
//!   8    4   ack           u32, cumulative: all seq < ack are delivered
//!  12    1   flags         SYN 0x01 | FIN 0x02 | RST 0x04 | ACK 0x08 | NACK 0x10
//!  13    2   payload_len   u16
//!  15    N   payload
//! 15+N   4   crc32         IEEE 802.3, over bytes [0, 15+N)
//! ```
//!
//! SYN and FIN consume one sequence number each. A NACK frame's payload is
//! the list of missing seqs (u32 LE each). A SYN's payload is the opaque
//! open request (the proxy puts its CONNECT target there).
//!
//! ## Envelope chunk wire format
//!
//! ```ascii
//! offset size field
//!   0    2   magic     'M','B'
//!   2    1   version   1
//!   3    1   flags     ACK 0x01 | NACK 0x02 | PARITY 0x04
//!   4    8   id_prefix first 8 bytes of the envelope id, zero-padded
//!  12    2   sequence  u16 LE, 1-based (parity: window index)
//!  14    2   total     u16 LE
//!  16    N   chunk payload
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod mux;
pub mod qos;
pub mod radio;
pub mod retransmit;
pub mod seq;
pub mod stream;
pub mod test_util;
pub mod window;
