//! The request/response envelope tier: self-describing records chunked into
//! addressed datagrams, with burst pacing, selectable reliability, replay
//! suppression, and a typed command-handler registry.
//!
//! A deployment uses either this tier or the stream multiplexer on a given
//! link - the two reliability designs do not share a wire.

pub mod chunk;
pub mod dedupe;
pub mod reassembly;
pub mod service;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::radio::NodeId;

/// Field names are aliased to single letters on the wire; every byte of a
/// LoRa datagram counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "i")]
    pub id: String,

    #[serde(rename = "t")]
    pub kind: EnvelopeKind,

    #[serde(rename = "cmd")]
    pub command: String,

    /// Lower is more urgent; the default is omitted from the wire.
    #[serde(
        rename = "p",
        default = "default_priority",
        skip_serializing_if = "is_default_priority"
    )]
    pub priority: u8,

    #[serde(rename = "cid", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(rename = "d", default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    #[serde(rename = "m", default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Request,
    Response,
    Error,
}

pub const DEFAULT_PRIORITY: u8 = 10;

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_default_priority(priority: &u8) -> bool {
    *priority == DEFAULT_PRIORITY
}

impl Envelope {
    pub fn request(command: impl Into<String>, data: Value) -> Envelope {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(20);
        Envelope {
            id,
            kind: EnvelopeKind::Request,
            command: command.into(),
            priority: DEFAULT_PRIORITY,
            correlation_id: None,
            data,
            meta: Map::new(),
        }
    }

    /// Response carrying the request's id and correlation id, so the caller
    /// can match it without extra bookkeeping.
    pub fn response_to(request: &Envelope, data: Value) -> Envelope {
        Envelope {
            id: request.id.clone(),
            kind: EnvelopeKind::Response,
            command: request.command.clone(),
            priority: DEFAULT_PRIORITY,
            correlation_id: request.correlation_id.clone(),
            data,
            meta: Map::new(),
        }
    }

    pub fn error_to(request: &Envelope, message: &str) -> Envelope {
        Envelope {
            id: request.id.clone(),
            kind: EnvelopeKind::Error,
            command: request.command.clone(),
            priority: DEFAULT_PRIORITY,
            correlation_id: request.correlation_id.clone(),
            data: serde_json::json!({ "error": message }),
            meta: Map::new(),
        }
    }

    /// The 8 bytes of the id that travel in every chunk header.
    pub fn id_prefix(&self) -> [u8; 8] {
        id_prefix_of(&self.id)
    }
}

/// First 8 bytes of the envelope id, zero-padded.
pub fn id_prefix_of(id: &str) -> [u8; 8] {
    let mut prefix = [0u8; 8];
    let bytes = id.as_bytes();
    let n = bytes.len().min(8);
    prefix[..n].copy_from_slice(&bytes[..n]);
    prefix
}

const COMPRESS_LEVEL_FAST: i32 = 1;
const COMPRESS_LEVEL_DEFAULT: i32 = 3;
const COMPRESS_LEVEL_THOROUGH: i32 = 5;
const COMPRESS_THRESHOLD_FAST: usize = 200;
const COMPRESS_THRESHOLD_THOROUGH: usize = 1000;

/// Small payloads get fast compression (the overhead would eat the savings),
/// large ones are worth the CPU.
fn compression_level(payload_len: usize) -> i32 {
    if payload_len < COMPRESS_THRESHOLD_FAST {
        COMPRESS_LEVEL_FAST
    } else if payload_len > COMPRESS_THRESHOLD_THOROUGH {
        COMPRESS_LEVEL_THOROUGH
    } else {
        COMPRESS_LEVEL_DEFAULT
    }
}

/// MessagePack with aliased keys, then zstd.
pub fn encode_envelope(envelope: &Envelope) -> anyhow::Result<Vec<u8>> {
    let packed = rmp_serde::to_vec_named(envelope)?;
    let compressed = zstd::encode_all(packed.as_slice(), compression_level(packed.len()))?;
    Ok(compressed)
}

pub fn decode_envelope(bytes: &[u8]) -> anyhow::Result<Envelope> {
    let packed = zstd::decode_all(bytes)?;
    Ok(rmp_serde::from_slice(&packed)?)
}

/// Replay-suppression key. An envelope produces up to three: the message
/// key `(sender, command, id)`, a correlation key, and a semantic key taken
/// from `meta.dedupe_key` / `meta.semantic_key` when the application
/// provides one.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DedupeKey {
    pub sender: NodeId,
    pub command: String,
    pub discriminant: String,
}

pub fn dedupe_keys(sender: NodeId, envelope: &Envelope) -> Vec<DedupeKey> {
    let mut keys = vec![DedupeKey {
        sender,
        command: envelope.command.clone(),
        discriminant: envelope.id.clone(),
    }];

    if let Some(correlation_id) = &envelope.correlation_id {
        keys.push(DedupeKey {
            sender,
            command: envelope.command.clone(),
            discriminant: format!("corr:{}", correlation_id),
        });
    }

    let semantic_hint = envelope
        .meta
        .get("semantic_key")
        .or_else(|| envelope.meta.get("dedupe_key"));
    if let Some(hint) = semantic_hint {
        let hint = match hint {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        keys.push(DedupeKey {
            sender,
            command: envelope.command.clone(),
            discriminant: format!("semantic:{}", hint),
        });
    }

    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn sender() -> NodeId {
        NodeId::from_raw(0x77)
    }

    #[test]
    fn test_request_ids_are_short_and_unique() {
        let a = Envelope::request("echo", Value::Null);
        let b = Envelope::request("echo", Value::Null);
        assert_eq!(a.id.len(), 20);
        assert_ne!(a.id, b.id);
    }

    #[rstest]
    #[case::plain(Envelope::request("echo", json!({"message": "ping"})))]
    #[case::null_data(Envelope::request("health", Value::Null))]
    #[case::nested(Envelope::request("http_request", json!({
        "url": "http://example.org/",
        "headers": {"accept": "text/html"},
        "timeout": 20.0,
    })))]
    fn test_codec_roundtrip(#[case] original: Envelope) {
        let encoded = encode_envelope(&original).unwrap();
        let decoded = decode_envelope(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_codec_roundtrip_with_meta_and_correlation() {
        let mut envelope = Envelope::request("echo", json!({"message": "x"}));
        envelope.correlation_id = Some("corr-1".into());
        envelope.meta.insert("dedupe_key".into(), json!("k1"));
        envelope.priority = 0;

        let decoded = decode_envelope(&encode_envelope(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_response_carries_request_identity() {
        let mut request = Envelope::request("echo", json!({"a": 1}));
        request.correlation_id = Some("c".into());
        let response = Envelope::response_to(&request, json!({"ok": true}));
        assert_eq!(response.id, request.id);
        assert_eq!(response.correlation_id, request.correlation_id);
        assert_eq!(response.kind, EnvelopeKind::Response);
    }

    #[test]
    fn test_large_payload_compresses() {
        let blob = "x".repeat(4000);
        let envelope = Envelope::request("payload_digest", json!({ "payload": blob }));
        let encoded = encode_envelope(&envelope).unwrap();
        assert!(encoded.len() < 1000, "4KB of repetition should shrink, got {}", encoded.len());
    }

    #[rstest]
    #[case::exact("abcdefgh", *b"abcdefgh")]
    #[case::longer("abcdefghijkl", *b"abcdefgh")]
    #[case::shorter("abc", *b"abc\0\0\0\0\0")]
    fn test_id_prefix(#[case] id: &str, #[case] expected: [u8; 8]) {
        assert_eq!(id_prefix_of(id), expected);
    }

    #[test]
    fn test_dedupe_keys_message_only() {
        let envelope = Envelope::request("echo", Value::Null);
        let keys = dedupe_keys(sender(), &envelope);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].discriminant, envelope.id);
    }

    #[test]
    fn test_dedupe_keys_with_correlation_and_semantic() {
        let mut envelope = Envelope::request("echo", Value::Null);
        envelope.correlation_id = Some("c1".into());
        envelope.meta.insert("dedupe_key".into(), json!("stable"));

        let keys = dedupe_keys(sender(), &envelope);
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().any(|k| k.discriminant == "corr:c1"));
        assert!(keys.iter().any(|k| k.discriminant == "semantic:stable"));
    }

    #[test]
    fn test_semantic_key_prefers_explicit_semantic() {
        let mut envelope = Envelope::request("echo", Value::Null);
        envelope.meta.insert("semantic_key".into(), json!("s"));
        envelope.meta.insert("dedupe_key".into(), json!("d"));

        let keys = dedupe_keys(sender(), &envelope);
        assert!(keys.iter().any(|k| k.discriminant == "semantic:s"));
        assert!(!keys.iter().any(|k| k.discriminant == "semantic:d"));
    }
}
