//! Channel payloads exchanged between processes sharing a limiter.
//!
//! Payloads are plain strings: a type prefix, a colon, then colon-delimited
//! fields. An empty capacity field means unlimited.
//!
//! - `capacity:<n|>`
//! - `capacity-priority:<n|>:<client|>:<counter>`
//! - `message:<payload>`
//! - `blocked:`

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use crate::traits::StoreError;

/// A payload published on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMessage {
    /// Capacity changed; every process should try to drain.
    Capacity(Option<u64>),
    /// Capacity grew and `client` gets the first chance to use it. An empty
    /// client means the designated process already drained.
    CapacityPriority {
        capacity: Option<u64>,
        client: String,
        counter: u64,
    },
    Message(String),
    /// The limiter entered a BLOCK penalty window.
    Blocked,
}

fn parse_capacity(raw: &str) -> Result<Option<u64>, StoreError> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| StoreError::Backend(format!("Invalid capacity field: {}", raw)))
}

fn format_capacity(capacity: Option<u64>) -> String {
    capacity.map(|c| c.to_string()).unwrap_or_default()
}

impl FromStr for StoreMessage {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, data) = s.split_once(':').unwrap_or((s, ""));

        match kind {
            "capacity" => Ok(StoreMessage::Capacity(parse_capacity(data)?)),
            "capacity-priority" => {
                let mut fields = data.splitn(3, ':');
                let (capacity, client, counter) = match (fields.next(), fields.next(), fields.next())
                {
                    (Some(capacity), Some(client), Some(counter)) => (capacity, client, counter),
                    _ => {
                        return Err(StoreError::Backend(format!(
                            "Malformed capacity-priority message: {}",
                            s
                        )))
                    }
                };
                let counter = counter.parse().map_err(|_| {
                    StoreError::Backend(format!("Invalid capacity-priority counter: {}", counter))
                })?;
                Ok(StoreMessage::CapacityPriority {
                    capacity: parse_capacity(capacity)?,
                    client: client.to_string(),
                    counter,
                })
            }
            "message" => Ok(StoreMessage::Message(data.to_string())),
            "blocked" => Ok(StoreMessage::Blocked),
            _ => Err(StoreError::Backend(format!(
                "Unknown channel message type: {}",
                kind
            ))),
        }
    }
}

impl Display for StoreMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            StoreMessage::Capacity(capacity) => write!(f, "capacity:{}", format_capacity(*capacity)),
            StoreMessage::CapacityPriority {
                capacity,
                client,
                counter,
            } => write!(
                f,
                "capacity-priority:{}:{}:{}",
                format_capacity(*capacity),
                client,
                counter
            ),
            StoreMessage::Message(payload) => write!(f, "message:{}", payload),
            StoreMessage::Blocked => write!(f, "blocked:"),
        }
    }
}
