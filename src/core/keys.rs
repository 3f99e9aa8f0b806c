//! Composite key encoding for the entry store.
//!
//! Layout: `[tag][topic_len][topic bytes][suffix]`. Ids are big-endian so the
//! store's byte order matches numeric order, and the length prefix keeps
//! `"ab"` from being a key prefix of `"abc"`.

use crate::core::{Error, Result};

pub const MAX_TOPIC_LEN: usize = u8::MAX as usize;
pub const ID_LEN: usize = 8;
pub const DEADLINE_LEN: usize = 8;
pub const DIGEST_LEN: usize = 32;

const TAG_READY: u8 = b'r';
const TAG_IN_FLIGHT: u8 = b'f';
const TAG_COUNTER: u8 = b'n';
const TAG_DEDUP: u8 = b'd';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyspace {
    Ready,
    InFlight,
    Counter,
    Dedup,
}

impl Keyspace {
    fn tag(self) -> u8 {
        match self {
            Keyspace::Ready => TAG_READY,
            Keyspace::InFlight => TAG_IN_FLIGHT,
            Keyspace::Counter => TAG_COUNTER,
            Keyspace::Dedup => TAG_DEDUP,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_READY => Some(Keyspace::Ready),
            TAG_IN_FLIGHT => Some(Keyspace::InFlight),
            TAG_COUNTER => Some(Keyspace::Counter),
            TAG_DEDUP => Some(Keyspace::Dedup),
            _ => None,
        }
    }
}

pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
        return Err(Error::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Prefix shared by every key of `space` belonging to `topic`.
pub fn prefix(space: Keyspace, topic: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + topic.len() + DIGEST_LEN);
    key.push(space.tag());
    // Topic names are validated to fit in one byte before reaching here.
    key.push(topic.len() as u8);
    key.extend_from_slice(topic.as_bytes());
    key
}

pub fn ready_key(topic: &str, id: u64) -> Vec<u8> {
    let mut key = prefix(Keyspace::Ready, topic);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub fn in_flight_key(topic: &str, id: u64) -> Vec<u8> {
    let mut key = prefix(Keyspace::InFlight, topic);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub fn counter_key(topic: &str) -> Vec<u8> {
    prefix(Keyspace::Counter, topic)
}

pub fn dedup_key(topic: &str, digest: &[u8; DIGEST_LEN]) -> Vec<u8> {
    let mut key = prefix(Keyspace::Dedup, topic);
    key.extend_from_slice(digest);
    key
}

/// A decoded ready or in-flight key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryKey {
    pub space: Keyspace,
    pub topic: String,
    pub id: u64,
}

pub fn decode(key: &[u8]) -> Result<EntryKey> {
    if key.len() < 2 {
        return Err(Error::Corrupt("key shorter than header"));
    }
    let space = Keyspace::from_tag(key[0]).ok_or(Error::Corrupt("unknown key tag"))?;
    if !matches!(space, Keyspace::Ready | Keyspace::InFlight) {
        return Err(Error::Corrupt("key is not an entry key"));
    }
    let topic_len = key[1] as usize;
    let topic_end = 2 + topic_len;
    if key.len() != topic_end + ID_LEN {
        return Err(Error::Corrupt("entry key length mismatch"));
    }
    let topic = std::str::from_utf8(&key[2..topic_end])
        .map_err(|_| Error::Corrupt("topic is not utf-8"))?
        .to_string();
    let id = decode_id(&key[topic_end..])?;
    Ok(EntryKey { space, topic, id })
}

/// Reads the trailing id of an entry key without decoding the topic.
pub fn id_suffix(key: &[u8]) -> Result<u64> {
    if key.len() < ID_LEN {
        return Err(Error::Corrupt("key shorter than id"));
    }
    decode_id(&key[key.len() - ID_LEN..])
}

pub fn encode_id(id: u64) -> [u8; ID_LEN] {
    id.to_be_bytes()
}

pub fn decode_id(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; ID_LEN] = bytes
        .try_into()
        .map_err(|_| Error::Corrupt("id is not 8 bytes"))?;
    Ok(u64::from_be_bytes(raw))
}

/// In-flight values carry the deadline in front of the untouched payload.
pub fn encode_in_flight(deadline_ns: u64, payload: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(DEADLINE_LEN + payload.len());
    value.extend_from_slice(&deadline_ns.to_be_bytes());
    value.extend_from_slice(payload);
    value
}

pub fn decode_in_flight(value: &[u8]) -> Result<(u64, &[u8])> {
    if value.len() < DEADLINE_LEN {
        return Err(Error::Corrupt("in-flight value shorter than deadline"));
    }
    let (deadline, payload) = value.split_at(DEADLINE_LEN);
    Ok((decode_id(deadline)?, payload))
}
