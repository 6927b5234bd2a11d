//! Type-safe ID wrappers.
//!
//! These newtypes keep session numbers and pool slot numbers from being mixed
//! up at compile time, and give every log line the same rendering.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifier of one relayed session, unique for the life of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a tunnel worker inside the agent's pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// Monotonic session number generator.
///
/// Cloning shares the underlying counter, so one instance can be handed to
/// several tasks. Numbering starts at 1 and restarts with the process.
#[derive(Debug, Clone, Default)]
pub struct SessionCounter {
    last: Arc<AtomicU64>,
}

impl SessionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> SessionId {
        SessionId(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Number of ids handed out so far
    pub fn issued(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}
