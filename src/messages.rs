//! # Wire Protocol
//!
//! Everything exchanged over a peer link is a [`Frame`], serialized with
//! bincode and prefixed with its length as a big-endian `u32`:
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (BE)  | bincode(Frame), len bytes |
//! +----------------+---------------------------+
//! ```
//!
//! | Frame | Direction | Purpose |
//! |-------|-----------|---------|
//! | `Hello` | both, first frame | announces the sender identity |
//! | `Publish` | both | carries one [`GossipMessage`] |
//!
//! ## Message IDs
//!
//! A [`MessageId`] is the BLAKE3 fingerprint of
//! `topic_len (u32 BE) || topic || source || seqno (u64 BE) || data`.
//! Two messages with the same fingerprint are the same message; receivers
//! recompute it and drop messages whose advertised id does not match.
//!
//! ## Security Limits
//!
//! - Frames longer than [`MAX_FRAME_SIZE`] are refused before allocation
//! - All deserialization goes through [`deserialize_bounded`]

use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::identity::Identity;

pub type MessageId = [u8; 32];

/// Largest application payload a single publish may carry (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Largest topic name, in bytes.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Largest encoded frame accepted from a peer.
/// Payload plus topic plus fixed header fields, with headroom.
pub const MAX_FRAME_SIZE: usize = MAX_MESSAGE_SIZE + MAX_TOPIC_LENGTH + 1024;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

#[inline]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

/// One application payload published on a topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub topic: String,
    pub msg_id: MessageId,
    /// Identity of the node that originally published the message.
    pub source: Identity,
    pub seqno: u64,
    pub data: Vec<u8>,
}

impl GossipMessage {
    pub fn new(topic: &str, source: Identity, seqno: u64, data: Vec<u8>) -> Self {
        let msg_id = fingerprint(topic, &source, seqno, &data);
        Self {
            topic: topic.to_string(),
            msg_id,
            source,
            seqno,
            data,
        }
    }

    /// True when `msg_id` is the fingerprint of the carried fields.
    pub fn has_consistent_id(&self) -> bool {
        fingerprint(&self.topic, &self.source, self.seqno, &self.data) == self.msg_id
    }
}

pub fn fingerprint(topic: &str, source: &Identity, seqno: u64, data: &[u8]) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(topic.len() as u32).to_be_bytes());
    hasher.update(topic.as_bytes());
    hasher.update(source.as_bytes());
    hasher.update(&seqno.to_be_bytes());
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on every link. Must name the identity the transport
    /// authenticated, otherwise the link is dropped.
    Hello { identity: Identity },
    Publish(GossipMessage),
}

/// Serialize a frame including its length prefix, ready for a single write.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let body = serialize(frame).context("failed to serialize frame")?;
    if body.len() > MAX_FRAME_SIZE {
        anyhow::bail!("frame too large: {} bytes (max {})", body.len(), MAX_FRAME_SIZE);
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Read the next frame. `Ok(None)` means the remote closed the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame length"),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .context("failed to read frame body")?;

    let frame = deserialize_bounded(&body).context("failed to deserialize frame")?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn make_identity(seed: u8) -> Identity {
        Identity::from_bytes([seed; 32])
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = fingerprint("t", &make_identity(1), 7, b"hello");
        let b = fingerprint("t", &make_identity(1), 7, b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_covers_every_field() {
        let base = fingerprint("t", &make_identity(1), 7, b"hello");
        assert_ne!(base, fingerprint("u", &make_identity(1), 7, b"hello"));
        assert_ne!(base, fingerprint("t", &make_identity(2), 7, b"hello"));
        assert_ne!(base, fingerprint("t", &make_identity(1), 8, b"hello"));
        assert_ne!(base, fingerprint("t", &make_identity(1), 7, b"hellp"));
    }

    #[test]
    fn topic_length_prefix_prevents_ambiguity() {
        // Without the length prefix "ab" + "c..." and "a" + "bc..." could collide.
        let a = fingerprint("ab", &make_identity(0x63), 0, b"");
        let b = fingerprint("a", &make_identity(0x63), 0, b"");
        assert_ne!(a, b);
    }

    #[test]
    fn same_payload_different_publish_is_distinct() {
        let first = GossipMessage::new("news", make_identity(1), 1, b"same".to_vec());
        let second = GossipMessage::new("news", make_identity(1), 2, b"same".to_vec());
        assert_ne!(first.msg_id, second.msg_id);
    }

    #[test]
    fn tampered_message_is_detected() {
        let mut msg = GossipMessage::new("news", make_identity(1), 1, b"payload".to_vec());
        assert!(msg.has_consistent_id());
        msg.data = b"other".to_vec();
        assert!(!msg.has_consistent_id());
    }

    #[test]
    fn topic_validation() {
        assert!(is_valid_topic("test"));
        assert!(is_valid_topic("chat room/1"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("tab\there"));
        assert!(!is_valid_topic("naïve"));
        assert!(!is_valid_topic(&"x".repeat(MAX_TOPIC_LENGTH + 1)));
        assert!(is_valid_topic(&"x".repeat(MAX_TOPIC_LENGTH)));
    }

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let hello = Frame::Hello { identity: make_identity(9) };
        let publish = Frame::Publish(GossipMessage::new("t", make_identity(9), 1, vec![1, 2, 3]));

        client.write_all(&encode_frame(&hello).unwrap()).await.unwrap();
        client.write_all(&encode_frame(&publish).unwrap()).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap(), Some(hello));
        assert_eq!(read_frame(&mut server).await.unwrap(), Some(publish));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn garbage_body_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&4u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();

        assert!(read_frame(&mut server).await.is_err());
    }

    #[test]
    fn oversized_payload_cannot_be_encoded() {
        let msg = GossipMessage::new("t", make_identity(1), 1, vec![0u8; MAX_FRAME_SIZE]);
        assert!(encode_frame(&Frame::Publish(msg)).is_err());
    }
}
