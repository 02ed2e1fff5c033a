use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One entry of a worker's bounded log ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// Append to a ring, evicting the oldest entries beyond `capacity`
pub fn push_bounded<T>(ring: &mut Vec<T>, entry: T, capacity: usize) {
    ring.push(entry);
    truncate_to_last(ring, capacity);
}

/// Keep only the last `capacity` entries
pub fn truncate_to_last<T>(ring: &mut Vec<T>, capacity: usize) {
    if ring.len() > capacity {
        let excess = ring.len() - capacity;
        ring.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_bounded_evicts_oldest() {
        let mut ring: Vec<u32> = (0..5).collect();
        push_bounded(&mut ring, 5, 5);
        assert_eq!(ring, vec![1, 2, 3, 4, 5]);
    }
}
