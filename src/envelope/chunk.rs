use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;

pub const CHUNK_MAGIC: [u8; 2] = *b"MB";
pub const CHUNK_VERSION: u8 = 1;
pub const CHUNK_HEADER_LEN: usize = 16;

pub const CHUNK_FLAG_ACK: u8 = 0x01;
pub const CHUNK_FLAG_NACK: u8 = 0x02;
/// XOR parity over one window of data chunks. `sequence` is the 1-based
/// window index; `total` mirrors the data chunk count so a parity chunk can
/// open reassembly state on its own.
pub const CHUNK_FLAG_PARITY: u8 = 0x04;

/// Fixed 16-byte header of the envelope tier's addressed-datagram format:
/// magic `MB`, version, flags, 8-byte envelope-id prefix, 1-based sequence,
/// total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub flags: u8,
    pub id_prefix: [u8; 8],
    pub sequence: u16,
    pub total: u16,
}

impl ChunkHeader {
    pub fn data(id_prefix: [u8; 8], sequence: u16, total: u16) -> ChunkHeader {
        ChunkHeader {
            flags: 0,
            id_prefix,
            sequence,
            total,
        }
    }

    pub fn ack(id_prefix: [u8; 8], sequence: u16, total: u16) -> ChunkHeader {
        ChunkHeader {
            flags: CHUNK_FLAG_ACK,
            id_prefix,
            sequence,
            total,
        }
    }

    pub fn nack(id_prefix: [u8; 8]) -> ChunkHeader {
        ChunkHeader {
            flags: CHUNK_FLAG_NACK,
            id_prefix,
            sequence: 1,
            total: 1,
        }
    }

    pub fn parity(id_prefix: [u8; 8], window: u16, total: u16) -> ChunkHeader {
        ChunkHeader {
            flags: CHUNK_FLAG_PARITY,
            id_prefix,
            sequence: window,
            total,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.flags & CHUNK_FLAG_ACK != 0
    }

    pub fn is_nack(&self) -> bool {
        self.flags & CHUNK_FLAG_NACK != 0
    }

    pub fn is_parity(&self) -> bool {
        self.flags & CHUNK_FLAG_PARITY != 0
    }

    pub fn is_data(&self) -> bool {
        self.flags & (CHUNK_FLAG_ACK | CHUNK_FLAG_NACK | CHUNK_FLAG_PARITY) == 0
    }

    pub fn encode_with(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + payload.len());
        buf.put_slice(&CHUNK_MAGIC);
        buf.put_u8(CHUNK_VERSION);
        buf.put_u8(self.flags);
        buf.put_slice(&self.id_prefix);
        buf.put_u16_le(self.sequence);
        buf.put_u16_le(self.total);
        buf.put_slice(payload);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<(ChunkHeader, Bytes), DecodeError> {
        if data.len() < CHUNK_HEADER_LEN {
            return Err(DecodeError::TooShort { len: data.len() });
        }
        let mut buf = data;
        let mut magic = [0u8; 2];
        buf.copy_to_slice(&mut magic);
        if magic != CHUNK_MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let version = buf.get_u8();
        if version != CHUNK_VERSION {
            return Err(DecodeError::BadVersion(version));
        }
        let flags = buf.get_u8();
        let mut id_prefix = [0u8; 8];
        buf.copy_to_slice(&mut id_prefix);
        let sequence = buf.get_u16_le();
        let total = buf.get_u16_le();

        Ok((
            ChunkHeader {
                flags,
                id_prefix,
                sequence,
                total,
            },
            Bytes::copy_from_slice(&data[CHUNK_HEADER_LEN..]),
        ))
    }
}

const RLE_SINGLE: u8 = 0x00;
const RLE_RANGE: u8 = 0x01;
const RLE_MAX_ENTRIES: usize = 127;

/// NACK payload: missing sequences, run-length encoded. Runs of three or
/// more become a 5-byte range entry, everything else 3-byte singles.
pub fn encode_nack_sequences(seqs: &[u16]) -> Bytes {
    let mut sorted = seqs.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut entries: Vec<Vec<u8>> = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let run_start = sorted[i];
        let mut run_end = run_start;
        let mut j = i + 1;
        while j < sorted.len() && sorted[j] == run_end.wrapping_add(1) {
            run_end = sorted[j];
            j += 1;
        }

        if run_end - run_start + 1 >= 3 {
            let mut entry = vec![RLE_RANGE];
            entry.extend_from_slice(&run_start.to_le_bytes());
            entry.extend_from_slice(&run_end.to_le_bytes());
            entries.push(entry);
            i = j;
        } else {
            let mut entry = vec![RLE_SINGLE];
            entry.extend_from_slice(&run_start.to_le_bytes());
            entries.push(entry);
            i += 1;
        }
    }

    let count = entries.len().min(RLE_MAX_ENTRIES);
    let mut buf = BytesMut::new();
    buf.put_u8(count as u8);
    for entry in &entries[..count] {
        buf.put_slice(entry);
    }
    buf.freeze()
}

pub fn parse_nack_sequences(payload: &[u8]) -> Vec<u16> {
    let Some((&count, mut rest)) = payload.split_first() else {
        return Vec::new();
    };

    let mut seqs = Vec::new();
    for _ in 0..(count & 0x7f) {
        match rest.split_first() {
            Some((&RLE_SINGLE, tail)) if tail.len() >= 2 => {
                seqs.push(u16::from_le_bytes([tail[0], tail[1]]));
                rest = &tail[2..];
            }
            Some((&RLE_RANGE, tail)) if tail.len() >= 4 => {
                let start = u16::from_le_bytes([tail[0], tail[1]]);
                let end = u16::from_le_bytes([tail[2], tail[3]]);
                if end >= start {
                    seqs.extend(start..=end);
                }
                rest = &tail[4..];
            }
            _ => break,
        }
    }
    seqs
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const PREFIX: [u8; 8] = *b"abc12\0\0\0";

    #[rstest]
    #[case::data(ChunkHeader::data(PREFIX, 1, 7), b"segment".as_slice())]
    #[case::ack(ChunkHeader::ack(PREFIX, 7, 7), b"".as_slice())]
    #[case::nack(ChunkHeader::nack(PREFIX), &[1, 0, 3, 0][..])]
    #[case::parity(ChunkHeader::parity(PREFIX, 2, 10), &[0xff; 32][..])]
    fn test_header_roundtrip(#[case] header: ChunkHeader, #[case] payload: &[u8]) {
        let encoded = header.encode_with(payload);
        assert_eq!(encoded.len(), CHUNK_HEADER_LEN + payload.len());
        let (decoded, decoded_payload) = ChunkHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded_payload.as_ref(), payload);
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(
            ChunkHeader::decode(b"MB"),
            Err(DecodeError::TooShort { len: 2 })
        );
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut encoded = ChunkHeader::data(PREFIX, 1, 1).encode_with(b"x").to_vec();
        encoded[0] = b'X';
        assert_eq!(ChunkHeader::decode(&encoded), Err(DecodeError::BadMagic));
    }

    #[test]
    fn test_decode_bad_version() {
        let mut encoded = ChunkHeader::data(PREFIX, 1, 1).encode_with(b"x").to_vec();
        encoded[2] = 9;
        assert_eq!(ChunkHeader::decode(&encoded), Err(DecodeError::BadVersion(9)));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::single(vec![5])]
    #[case::pair(vec![5, 6])]
    #[case::run(vec![5, 6, 7, 8, 9])]
    #[case::mixed(vec![5, 6, 7, 8, 9, 15, 16])]
    #[case::unsorted_dup(vec![9, 5, 7, 8, 6, 5])]
    fn test_nack_rle_roundtrip(#[case] seqs: Vec<u16>) {
        let mut expected = seqs.clone();
        expected.sort_unstable();
        expected.dedup();

        let payload = encode_nack_sequences(&seqs);
        assert_eq!(parse_nack_sequences(&payload), expected);
    }

    #[test]
    fn test_nack_rle_ranges_save_space() {
        let run = (5..=40).collect::<Vec<u16>>();
        let payload = encode_nack_sequences(&run);
        // one range entry instead of 36 singles
        assert_eq!(payload.len(), 1 + 5);
    }

    #[test]
    fn test_parse_nack_tolerates_truncation() {
        let payload = encode_nack_sequences(&[5, 9]);
        let truncated = &payload[..payload.len() - 1];
        // parses the intact prefix, drops the torn entry
        assert_eq!(parse_nack_sequences(truncated), vec![5]);
    }
}
