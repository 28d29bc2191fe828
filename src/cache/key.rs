use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::message::{Message, RecordClass};

/// Fixed 16-byte cache key: stable hash of the case-normalized question
/// name, then qtype, qclass, name length and label count, big-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MsgKey([u8; 16]);

impl MsgKey {
    /// Derive the key for a query. Multi-question and non-INET queries
    /// cannot be deterministically keyed and return `None`.
    pub fn from_query(msg: &Message) -> Option<MsgKey> {
        if msg.questions.len() != 1 {
            return None;
        }
        let q = &msg.questions[0];
        if q.qclass != RecordClass::IN {
            return None;
        }

        let name = q.name();
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);

        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&hasher.finish().to_be_bytes());
        key[8..10].copy_from_slice(&u16::from(q.qtype).to_be_bytes());
        key[10..12].copy_from_slice(&u16::from(q.qclass).to_be_bytes());
        key[12..14].copy_from_slice(&(name.len() as u16).to_be_bytes());
        key[14..16].copy_from_slice(&(q.labels.len() as u16).to_be_bytes());
        Some(MsgKey(key))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> MsgKey {
        MsgKey(bytes)
    }
}
