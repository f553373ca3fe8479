//! Messages and their binary encoding.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::{utf_size, Decoder, Encoder};
use crate::{Error, Result};

/// Fixed per-message overhead counted against an address's memory backlog.
pub const MESSAGE_OVERHEAD: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    fn tag(&self) -> u8 {
        match self {
            PropertyValue::Bool(_) => 1,
            PropertyValue::Int(_) => 2,
            PropertyValue::Long(_) => 3,
            PropertyValue::Double(_) => 4,
            PropertyValue::String(_) => 5,
            PropertyValue::Bytes(_) => 6,
        }
    }

    fn encoded_size(&self) -> usize {
        match self {
            PropertyValue::Bool(_) => 1,
            PropertyValue::Int(_) => 4,
            PropertyValue::Long(_) | PropertyValue::Double(_) => 8,
            PropertyValue::String(value) => 2 + utf_size(value),
            PropertyValue::Bytes(value) => 4 + value.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Assigned when the message is routed; zero before that.
    pub id: MessageId,
    pub address: String,
    pub body: Vec<u8>,
    pub properties: BTreeMap<String, PropertyValue>,
    pub durable: bool,
    pub timestamp_ns: u64,
}

impl Message {
    pub fn new(address: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: MessageId::default(),
            address: address.into(),
            body: body.into(),
            properties: BTreeMap::new(),
            durable: true,
            timestamp_ns: 0,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Bytes this message is charged against the address backlog.
    pub fn memory_size(&self) -> u64 {
        let properties: usize = self
            .properties
            .iter()
            .map(|(key, value)| key.len() + value.encoded_size())
            .sum();
        MESSAGE_OVERHEAD + (self.address.len() + self.body.len() + properties) as u64
    }

    /// Exact length of [`Message::encode`]'s output.
    pub fn encoded_len(&self) -> usize {
        let properties: usize = self
            .properties
            .iter()
            .map(|(key, value)| 2 + utf_size(key) + 1 + value.encoded_size())
            .sum();
        8 + 8 + 1 + 2 + utf_size(&self.address) + 2 + properties + 4 + self.body.len()
    }

    pub fn encode(&self, enc: &mut Encoder<'_>) -> Result<()> {
        enc.put_u64(self.id.0);
        enc.put_u64(self.timestamp_ns);
        enc.put_bool(self.durable);
        enc.put_utf(&self.address)?;
        let count = u16::try_from(self.properties.len())
            .map_err(|_| Error::Unsupported("too many message properties"))?;
        enc.put_u16(count);
        for (key, value) in &self.properties {
            enc.put_utf(key)?;
            enc.put_u8(value.tag());
            match value {
                PropertyValue::Bool(v) => enc.put_bool(*v),
                PropertyValue::Int(v) => enc.put_i32(*v),
                PropertyValue::Long(v) => enc.put_i64(*v),
                PropertyValue::Double(v) => enc.put_f64(*v),
                PropertyValue::String(v) => enc.put_utf(v)?,
                PropertyValue::Bytes(v) => enc.put_bytes(v)?,
            }
        }
        enc.put_bytes(&self.body)
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let id = MessageId(dec.get_u64()?);
        let timestamp_ns = dec.get_u64()?;
        let durable = dec.get_bool()?;
        let address = dec.get_utf()?;
        let count = dec.get_u16()?;
        let mut properties = BTreeMap::new();
        for _ in 0..count {
            let key = dec.get_utf()?;
            let value = match dec.get_u8()? {
                1 => PropertyValue::Bool(dec.get_bool()?),
                2 => PropertyValue::Int(dec.get_i32()?),
                3 => PropertyValue::Long(dec.get_i64()?),
                4 => PropertyValue::Double(dec.get_f64()?),
                5 => PropertyValue::String(dec.get_utf()?),
                6 => PropertyValue::Bytes(dec.get_bytes()?.to_vec()),
                _ => return Err(Error::Corrupt("unknown property type")),
            };
            properties.insert(key, value);
        }
        let body = dec.get_bytes()?.to_vec();
        Ok(Self {
            id,
            address,
            body,
            properties,
            durable,
            timestamp_ns,
        })
    }
}

/// Bytes charged against an address's in-memory backlog, released on drop.
#[derive(Debug)]
pub struct MemoryCharge {
    bytes: u64,
    counter: Arc<AtomicU64>,
}

impl MemoryCharge {
    pub fn new(counter: Arc<AtomicU64>, bytes: u64) -> Self {
        counter.fetch_add(bytes, Ordering::AcqRel);
        Self { bytes, counter }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for MemoryCharge {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// A message body held in memory on behalf of one or more queues.
///
/// Queue references share it through `Arc`; the address backlog is charged
/// until the last reference goes away.
#[derive(Debug)]
pub struct StoredMessage {
    message: Arc<Message>,
    _charge: MemoryCharge,
}

impl StoredMessage {
    pub fn new(message: Message, counter: Arc<AtomicU64>) -> Self {
        let charge = MemoryCharge::new(counter, message.memory_size());
        Self {
            message: Arc::new(message),
            _charge: charge,
        }
    }

    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip_with_properties() {
        let mut message = Message::new("orders", b"payload".to_vec())
            .with_property("count", PropertyValue::Int(-3))
            .with_property("total", PropertyValue::Long(1 << 40))
            .with_property("ratio", PropertyValue::Double(0.25))
            .with_property("flag", PropertyValue::Bool(true))
            .with_property("name", PropertyValue::String("naïve".to_string()))
            .with_property("raw", PropertyValue::Bytes(vec![0, 1, 2]));
        message.id = MessageId(42);
        message.timestamp_ns = 7;

        let mut out = Vec::new();
        message.encode(&mut Encoder::new(&mut out)).unwrap();
        assert_eq!(out.len(), message.encoded_len());
        let decoded = Message::decode(&mut Decoder::new(&out)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn unknown_property_tag_is_corrupt() {
        let message = Message::new("a", Vec::new()).with_property("k", PropertyValue::Bool(false));
        let mut out = Vec::new();
        message.encode(&mut Encoder::new(&mut out)).unwrap();
        // id, timestamp, durable, address (2 + 1), count (2), key (2 + 1), then the tag.
        let tag_offset = 8 + 8 + 1 + 3 + 2 + 3;
        out[tag_offset] = 99;
        assert!(matches!(
            Message::decode(&mut Decoder::new(&out)),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn stored_message_charges_until_dropped() {
        let counter = Arc::new(AtomicU64::new(0));
        let message = Message::new("orders", vec![0u8; 1000]);
        let size = message.memory_size();
        let stored = Arc::new(StoredMessage::new(message, Arc::clone(&counter)));
        let second_ref = Arc::clone(&stored);
        assert_eq!(counter.load(Ordering::Acquire), size);
        drop(stored);
        assert_eq!(counter.load(Ordering::Acquire), size);
        drop(second_ref);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }
}
