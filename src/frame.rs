use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use std::fmt::{Display, Formatter};
use std::ops::BitOr;
use thiserror::Error;

use crate::error::DecodeError;
use crate::seq::SeqNr;

/// Fixed frame header: stream_id + seq + ack + flags + payload_len.
pub const HEADER_LEN: usize = 15;
/// CRC-32 trailer.
pub const CRC_LEN: usize = 4;
/// Total per-frame overhead.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + CRC_LEN;

/// Maximum frame payload. Meshtastic datagrams top out around 230 usable
/// bytes depending on the modem preset; staying at 180 plus 19 bytes of
/// framing keeps every frame safely inside a single radio datagram.
pub const MAX_PAYLOAD: usize = 180;

const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Rejected at encode time: the frame would not fit one radio datagram.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("payload length {len} exceeds maximum {max}")]
pub struct PayloadTooLarge {
    pub len: usize,
    pub max: usize,
}

/// Frame control flags, one bit each.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0x00);
    /// Stream synchronization (open).
    pub const SYN: FrameFlags = FrameFlags(0x01);
    /// Stream finish (orderly close).
    pub const FIN: FrameFlags = FrameFlags(0x02);
    /// Stream reset (abort).
    pub const RST: FrameFlags = FrameFlags(0x04);
    /// Cumulative acknowledgement: all seq < `ack` are delivered.
    pub const ACK: FrameFlags = FrameFlags(0x08);
    /// Negative acknowledgement; payload lists the missing seqs.
    pub const NACK: FrameFlags = FrameFlags(0x10);

    pub fn from_bits(bits: u8) -> FrameFlags {
        FrameFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

impl Display for FrameFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let names = [
            (FrameFlags::SYN, "SYN"),
            (FrameFlags::FIN, "FIN"),
            (FrameFlags::RST, "RST"),
            (FrameFlags::ACK, "ACK"),
            (FrameFlags::NACK, "NACK"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

/// The unit of transmission: header, optional payload, CRC-32 trailer.
/// A frame always fits within a single radio datagram.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Frame {
    pub stream_id: u32,
    pub seq: SeqNr,
    pub ack: SeqNr,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    pub fn control(stream_id: u32, seq: SeqNr, ack: SeqNr, flags: FrameFlags) -> Frame {
        Frame {
            stream_id,
            seq,
            ack,
            flags,
            payload: Bytes::new(),
        }
    }

    pub fn data(stream_id: u32, seq: SeqNr, ack: SeqNr, flags: FrameFlags, payload: Bytes) -> Frame {
        Frame {
            stream_id,
            seq,
            ack,
            flags,
            payload,
        }
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(FrameFlags::SYN)
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(FrameFlags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.flags.contains(FrameFlags::RST)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(FrameFlags::ACK)
    }

    pub fn is_nack(&self) -> bool {
        self.flags.contains(FrameFlags::NACK)
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Serialize to wire bytes. Rejects payloads above [`MAX_PAYLOAD`] -
    /// oversized frames would be fragmented by the radio, which the protocol
    /// forbids.
    pub fn encode(&self) -> Result<Bytes, PayloadTooLarge> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(PayloadTooLarge {
                len: self.payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(self.stream_id);
        buf.put_u32_le(self.seq.to_raw());
        buf.put_u32_le(self.ack.to_raw());
        buf.put_u8(self.flags.bits());
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);

        let crc = FRAME_CRC.checksum(&buf);
        buf.put_u32_le(crc);
        Ok(buf.freeze())
    }

    /// Parse wire bytes. The CRC is checked before any header field is
    /// trusted, so a corrupted buffer never yields a different valid frame.
    pub fn decode(data: &[u8]) -> Result<Frame, DecodeError> {
        if data.len() < FRAME_OVERHEAD {
            return Err(DecodeError::TooShort { len: data.len() });
        }

        let (body, mut crc_bytes) = data.split_at(data.len() - CRC_LEN);
        let received_crc = crc_bytes.get_u32_le();
        if FRAME_CRC.checksum(body) != received_crc {
            return Err(DecodeError::BadCrc);
        }

        let mut header = &body[..HEADER_LEN];
        let stream_id = header.get_u32_le();
        let seq = SeqNr::from_raw(header.get_u32_le());
        let ack = SeqNr::from_raw(header.get_u32_le());
        let flags = FrameFlags::from_bits(header.get_u8());
        let payload_len = header.get_u16_le() as usize;

        if body.len() != HEADER_LEN + payload_len {
            return Err(DecodeError::BadLength {
                declared: payload_len,
                actual: body.len() - HEADER_LEN,
            });
        }

        Ok(Frame {
            stream_id,
            seq,
            ack,
            flags,
            payload: Bytes::copy_from_slice(&body[HEADER_LEN..]),
        })
    }
}

/// Serialize a list of missing seqs as a NACK payload: u32 LE each.
/// The list is capped so the frame stays within the payload limit.
pub fn nack_payload(seqs: &[SeqNr]) -> Bytes {
    let capped = &seqs[..seqs.len().min(MAX_PAYLOAD / 4)];
    let mut buf = BytesMut::with_capacity(capped.len() * 4);
    for seq in capped {
        buf.put_u32_le(seq.to_raw());
    }
    buf.freeze()
}

/// Parse a NACK payload back into the listed seqs. Trailing partial entries
/// are ignored.
pub fn parse_nack_payload(payload: &[u8]) -> Vec<SeqNr> {
    payload
        .chunks_exact(4)
        .map(|chunk| SeqNr::from_raw(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn frame(stream_id: u32, seq: u32, ack: u32, flags: FrameFlags, payload: &[u8]) -> Frame {
        Frame {
            stream_id,
            seq: SeqNr::from_raw(seq),
            ack: SeqNr::from_raw(ack),
            flags,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[rstest]
    #[case::control_syn(frame(7, 0, 0, FrameFlags::SYN, b""))]
    #[case::syn_with_payload(frame(0x1234_5678, 0, 0, FrameFlags::SYN, b"CONNECT example.org:443"))]
    #[case::data_ack(frame(99, 17, 4, FrameFlags::ACK, b"hello"))]
    #[case::fin(frame(99, 57, 58, FrameFlags::FIN | FrameFlags::ACK, b""))]
    #[case::rst(frame(1, 0, 0, FrameFlags::RST, b""))]
    #[case::max_payload(frame(2, 1, 0, FrameFlags::ACK, &[0xab; MAX_PAYLOAD]))]
    #[case::wrapping_seq(frame(2, u32::MAX, u32::MAX - 1, FrameFlags::ACK, b"x"))]
    fn test_roundtrip(#[case] original: Frame) {
        let encoded = original.encode().unwrap();
        assert_eq!(encoded.len(), original.encoded_len());
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let oversized = frame(1, 1, 0, FrameFlags::NONE, &[0u8; MAX_PAYLOAD + 1]);
        assert!(oversized.encode().is_err());
    }

    #[rstest]
    #[case::empty(&[])]
    #[case::truncated_header(&[1, 2, 3])]
    #[case::one_short(&[0u8; FRAME_OVERHEAD - 1])]
    fn test_decode_too_short(#[case] data: &[u8]) {
        assert_eq!(
            Frame::decode(data),
            Err(DecodeError::TooShort { len: data.len() })
        );
    }

    #[test]
    fn test_decode_every_single_byte_corruption_is_detected() {
        let encoded = frame(42, 3, 1, FrameFlags::ACK, b"payload").encode().unwrap();
        for i in 0..encoded.len() {
            for bit in 0..8 {
                let mut corrupted = encoded.to_vec();
                corrupted[i] ^= 1 << bit;
                assert!(
                    Frame::decode(&corrupted).is_err(),
                    "corruption at byte {} bit {} went undetected",
                    i,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_decode_truncated_payload_is_rejected() {
        // a frame whose declared payload_len exceeds the actual buffer fails
        // the CRC (the trailer moved); rebuilding the CRC over the truncated
        // buffer must then fail the length check
        let encoded = frame(42, 3, 1, FrameFlags::ACK, b"payload").encode().unwrap();
        let mut truncated = encoded[..encoded.len() - CRC_LEN - 2].to_vec();
        let crc = FRAME_CRC.checksum(&truncated);
        truncated.extend_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            Frame::decode(&truncated),
            Err(DecodeError::BadLength { .. })
        ));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::single(vec![5])]
    #[case::several(vec![5, 6, 9, u32::MAX])]
    fn test_nack_payload_roundtrip(#[case] raw: Vec<u32>) {
        let seqs = raw.iter().copied().map(SeqNr::from_raw).collect::<Vec<_>>();
        let payload = nack_payload(&seqs);
        assert_eq!(parse_nack_payload(&payload), seqs);
    }

    #[test]
    fn test_nack_payload_is_capped_to_frame_limit() {
        let seqs = (0..100u32).map(SeqNr::from_raw).collect::<Vec<_>>();
        let payload = nack_payload(&seqs);
        assert!(payload.len() <= MAX_PAYLOAD);
        assert_eq!(parse_nack_payload(&payload).len(), MAX_PAYLOAD / 4);
    }

    #[test]
    fn test_flags_display() {
        assert_eq!(format!("{}", FrameFlags::SYN | FrameFlags::ACK), "SYN|ACK");
        assert_eq!(format!("{}", FrameFlags::NONE), "-");
    }
}
