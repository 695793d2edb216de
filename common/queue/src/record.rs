use std::collections::BTreeMap;
use std::fmt;

use crate::topic::Topic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Header {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The wire-level unit handed to and received from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: Topic,
    pub payload: Vec<u8>,
    pub headers: Vec<Header>,
}

impl Record {
    pub fn new(topic: Topic, payload: Vec<u8>) -> Self {
        Record {
            topic,
            payload,
            headers: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    /// Value of the first header named `key`.
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_slice())
    }
}

/// Where a consumed record sits in its source stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Position {
    pub topic: Topic,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub record: Record,
    pub position: Position,
}

/// For every (topic, partition) in `records`, the position right after the
/// highest offset seen. Committing these marks all of `records` as processed.
pub fn committable_offsets(records: &[ConsumedRecord]) -> Vec<Position> {
    let mut next: BTreeMap<(&Topic, i32), i64> = BTreeMap::new();
    for consumed in records {
        let position = &consumed.position;
        let entry = next
            .entry((&position.topic, position.partition))
            .or_insert(position.offset + 1);
        *entry = (*entry).max(position.offset + 1);
    }
    next.into_iter()
        .map(|((topic, partition), offset)| Position {
            topic: topic.clone(),
            partition,
            offset,
        })
        .collect()
}

/// For every (topic, partition) in `records`, the lowest offset seen. Seeking
/// back to these makes a transport redeliver all of `records`.
pub fn earliest_positions(records: &[ConsumedRecord]) -> Vec<Position> {
    let mut first: BTreeMap<(&Topic, i32), i64> = BTreeMap::new();
    for consumed in records {
        let position = &consumed.position;
        let entry = first
            .entry((&position.topic, position.partition))
            .or_insert(position.offset);
        *entry = (*entry).min(position.offset);
    }
    first
        .into_iter()
        .map(|((topic, partition), offset)| Position {
            topic: topic.clone(),
            partition,
            offset,
        })
        .collect()
}
