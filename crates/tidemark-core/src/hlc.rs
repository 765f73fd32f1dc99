//! Hybrid Logical Clock (HLC) implementation for causally ordered timestamps.
//!
//! HLC provides globally ordered timestamps that combine:
//! - Physical wall-clock time (milliseconds)
//! - Logical counter for events at the same physical time
//! - Node ID for deterministic tiebreaking
//!
//! Timestamps encode to a fixed-width string whose byte order is the same as
//! the structural order, so they can be stored in plain TEXT columns and
//! compared by the database.
//!
//! # References
//!
//! Kulkarni, Demirbas, et al. "Logical Physical Clocks and Consistent Snapshots
//! in Globally Distributed Databases" (2014)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const PHYSICAL_WIDTH: usize = 16;
const COUNTER_WIDTH: usize = 8;
const NODE_OFFSET: usize = PHYSICAL_WIDTH + 1 + COUNTER_WIDTH + 1;

/// Identifier of the node that issued a timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an existing node identifier.
    ///
    /// # Errors
    ///
    /// Returns error if the identifier is empty.
    pub fn new(id: impl Into<String>) -> Result<Self, TimestampError> {
        let id = id.into();
        if id.is_empty() {
            return Err(TimestampError::EmptyNodeId);
        }
        Ok(Self(id))
    }

    /// Generate a fresh random node identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeId {
    type Error = TimestampError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// A globally unique timestamp combining physical time, logical counter, and node ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp {
    /// Physical wall-clock time in milliseconds since UNIX epoch
    pub physical_ms: u64,
    /// Logical counter for events at the same physical time
    pub counter: u32,
    /// Node ID for deterministic tiebreaking
    pub node_id: NodeId,
}

impl Timestamp {
    /// Create a timestamp from its components.
    #[must_use]
    pub fn new(physical_ms: u64, counter: u32, node_id: NodeId) -> Self {
        Self {
            physical_ms,
            counter,
            node_id,
        }
    }

    /// Encode to the sortable string form.
    ///
    /// Layout: `{physical_ms:016x}-{counter:08x}-{node_id}`.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{:0pw$x}-{:0cw$x}-{}",
            self.physical_ms,
            self.counter,
            self.node_id,
            pw = PHYSICAL_WIDTH,
            cw = COUNTER_WIDTH
        )
    }

    /// Parse the sortable string form.
    ///
    /// # Errors
    ///
    /// Returns error if the string is not a well-formed encoded timestamp.
    pub fn parse(encoded: &str) -> Result<Self, TimestampError> {
        let malformed = || TimestampError::Malformed(encoded.to_string());

        let bytes = encoded.as_bytes();
        if bytes.len() <= NODE_OFFSET || !bytes[..NODE_OFFSET].is_ascii() {
            return Err(malformed());
        }
        if bytes[PHYSICAL_WIDTH] != b'-' || bytes[NODE_OFFSET - 1] != b'-' {
            return Err(malformed());
        }

        let physical_hex = &encoded[..PHYSICAL_WIDTH];
        let counter_hex = &encoded[PHYSICAL_WIDTH + 1..NODE_OFFSET - 1];
        if !is_lower_hex(physical_hex) || !is_lower_hex(counter_hex) {
            return Err(malformed());
        }

        let physical_ms = u64::from_str_radix(physical_hex, 16).map_err(|_| malformed())?;
        let counter = u32::from_str_radix(counter_hex, 16).map_err(|_| malformed())?;
        let node_id = NodeId::new(&encoded[NODE_OFFSET..])?;

        Ok(Self {
            physical_ms,
            counter,
            node_id,
        })
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        // First compare physical time
        match self.physical_ms.cmp(&other.physical_ms) {
            Ordering::Equal => {}
            ord => return ord,
        }
        // Then logical counter
        match self.counter.cmp(&other.counter) {
            Ordering::Equal => {}
            ord => return ord,
        }
        // Finally node ID for deterministic tiebreaking
        self.node_id.cmp(&other.node_id)
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = TimestampError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Timestamp> for String {
    fn from(ts: Timestamp) -> Self {
        ts.encode()
    }
}

/// Source of wall-clock milliseconds.
pub type TimeSource = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
struct ClockState {
    last_physical: u64,
    counter: u32,
}

impl ClockState {
    /// Bump the logical counter; on overflow borrow one millisecond instead.
    fn advance(&mut self) {
        if let Some(next) = self.counter.checked_add(1) {
            self.counter = next;
        } else {
            self.last_physical = self.last_physical.saturating_add(1);
            self.counter = 0;
        }
    }
}

/// Hybrid Logical Clock state machine.
///
/// Safe to share between threads and tasks: every state transition happens
/// under an internal lock, so monotonicity holds for any call interleaving.
pub struct CausalClock {
    node_id: NodeId,
    state: Mutex<ClockState>,
    time_source: TimeSource,
}

impl fmt::Debug for CausalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CausalClock")
            .field("node_id", &self.node_id)
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl CausalClock {
    /// Create a new clock reading the system wall clock.
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self::with_time_source(node_id, Arc::new(current_time_ms))
    }

    /// Create a clock driven by a custom wall-clock source.
    #[must_use]
    pub fn with_time_source(node_id: NodeId, time_source: TimeSource) -> Self {
        Self {
            node_id,
            state: Mutex::new(ClockState::default()),
            time_source,
        }
    }

    /// Get the node ID for this clock.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Read the wall-clock source without touching clock state.
    #[must_use]
    pub fn wall_ms(&self) -> u64 {
        (self.time_source)()
    }

    /// Generate a new timestamp for a local event.
    ///
    /// Guarantees the returned timestamp is greater than any previously
    /// generated or merged timestamp.
    pub fn now(&self) -> Timestamp {
        let wall = (self.time_source)();
        let mut state = self.lock();

        if wall > state.last_physical {
            // Wall clock advanced, reset logical counter
            state.last_physical = wall;
            state.counter = 0;
        } else {
            // Same millisecond or the wall clock stepped backwards
            state.advance();
        }

        self.stamp(*state)
    }

    /// Absorb a causally observed remote timestamp.
    ///
    /// Every subsequent [`now`](Self::now) dominates `remote`.
    pub fn merge(&self, remote: &Timestamp) {
        let wall = (self.time_source)();
        let mut state = self.lock();
        let local = state.last_physical;
        let physical = local.max(remote.physical_ms).max(wall);

        if physical == local && physical == remote.physical_ms {
            state.counter = state.counter.max(remote.counter);
            state.advance();
        } else if physical == local {
            state.advance();
        } else if physical == remote.physical_ms {
            state.last_physical = remote.physical_ms;
            state.counter = remote.counter;
            state.advance();
        } else {
            state.last_physical = wall;
            state.counter = 0;
        }
    }

    /// Total order over timestamps: physical time, then counter, then node ID.
    #[must_use]
    pub fn compare(a: &Timestamp, b: &Timestamp) -> Ordering {
        a.cmp(b)
    }

    /// Get the current timestamp without advancing the clock.
    #[must_use]
    pub fn current(&self) -> Timestamp {
        let state = *self.lock();
        self.stamp(state)
    }

    fn stamp(&self, state: ClockState) -> Timestamp {
        Timestamp {
            physical_ms: state.last_physical,
            counter: state.counter,
            node_id: self.node_id.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        // The state is two integers updated together; a panic elsewhere cannot tear it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Errors that can occur with timestamp operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimestampError {
    /// The encoded string does not follow the timestamp layout
    #[error("malformed timestamp: {0:?}")]
    Malformed(String),
    /// Node identifiers must be non-empty
    #[error("node id must not be empty")]
    EmptyNodeId,
}

/// Get current wall clock time in milliseconds since UNIX epoch.
fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
