use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Policy applied when a submission finds the queue at its high-water mark.
///
/// The discriminants are the values exchanged with shared stores.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Evict the oldest waiter of the least urgent band at or below the incoming priority.
    #[default]
    Leak = 1,
    /// Reject the incoming job.
    Overflow = 2,
    /// Reject every submission until the penalty window has passed, dropping the queue.
    Block = 3,
    /// Evict from the band below the incoming job's priority.
    OverflowPriority = 4,
}

impl Strategy {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Strategy::Leak),
            2 => Some(Strategy::Overflow),
            3 => Some(Strategy::Block),
            4 => Some(Strategy::OverflowPriority),
            _ => None,
        }
    }
}

impl Display for Strategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Strategy::Leak => write!(f, "leak"),
            Strategy::Overflow => write!(f, "overflow"),
            Strategy::Block => write!(f, "block"),
            Strategy::OverflowPriority => write!(f, "overflow_priority"),
        }
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "leak" => Ok(Strategy::Leak),
            "overflow" => Ok(Strategy::Overflow),
            "block" => Ok(Strategy::Block),
            "overflow_priority" => Ok(Strategy::OverflowPriority),
            _ => Err(anyhow::anyhow!("Invalid strategy: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_match_discriminants() {
        for strategy in [
            Strategy::Leak,
            Strategy::Overflow,
            Strategy::Block,
            Strategy::OverflowPriority,
        ] {
            assert_eq!(Strategy::from_i32(strategy.as_i32()), Some(strategy));
        }
        assert_eq!(Strategy::from_i32(0), None);
    }

    #[test]
    fn parses_config_names() {
        assert_eq!("BLOCK".parse::<Strategy>().unwrap(), Strategy::Block);
        assert_eq!(
            "overflow_priority".parse::<Strategy>().unwrap(),
            Strategy::OverflowPriority
        );
        assert!("drop".parse::<Strategy>().is_err());
    }
}
