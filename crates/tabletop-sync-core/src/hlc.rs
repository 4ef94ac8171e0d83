//! Hybrid Logical Clock used to order every register write on a table.
//!
//! A timestamp is `(physical_ms, logical, actor)`; comparison is
//! lexicographic over those three components so two actors can never
//! produce equal timestamps.

use crate::ids::ActorId;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Length of [`Timestamp::to_bytes`] output.
pub const TIMESTAMP_LEN: usize = 28;

/// A globally ordered write timestamp.
///
/// Field order matters: the derived `Ord` compares physical time first,
/// then the logical counter, then the actor as a tiebreaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Wall-clock milliseconds since the UNIX epoch
    pub physical_ms: u64,
    /// Counter for events within the same millisecond
    pub logical: u32,
    /// Writer identity
    pub actor: ActorId,
}

impl Timestamp {
    /// Wire encoding: big-endian `physical_ms`, `logical`, then the actor UUID.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(TIMESTAMP_LEN);
        bytes.extend_from_slice(&self.physical_ms.to_be_bytes());
        bytes.extend_from_slice(&self.logical.to_be_bytes());
        bytes.extend_from_slice(self.actor.0.as_bytes());
        bytes
    }

    /// Decode the wire encoding produced by [`Timestamp::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`TimestampError::InsufficientBytes`] when fewer than
    /// [`TIMESTAMP_LEN`] bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TimestampError> {
        let short = || TimestampError::InsufficientBytes {
            expected: TIMESTAMP_LEN,
            actual: bytes.len(),
        };

        let physical: [u8; 8] = bytes.get(0..8).ok_or_else(short)?.try_into().map_err(|_| short())?;
        let logical: [u8; 4] = bytes.get(8..12).ok_or_else(short)?.try_into().map_err(|_| short())?;
        let actor: [u8; 16] = bytes.get(12..28).ok_or_else(short)?.try_into().map_err(|_| short())?;

        Ok(Self {
            physical_ms: u64::from_be_bytes(physical),
            logical: u32::from_be_bytes(logical),
            actor: ActorId(Uuid::from_bytes(actor)),
        })
    }
}

/// Per-actor clock state.
#[derive(Debug, Clone)]
pub struct Hlc {
    last: Timestamp,
}

impl Hlc {
    /// Start a clock for `actor` at the current wall time.
    #[must_use]
    pub fn new(actor: ActorId) -> Self {
        Self {
            last: Timestamp {
                physical_ms: wall_clock_ms(),
                logical: 0,
                actor,
            },
        }
    }

    /// Owner of this clock.
    #[must_use]
    pub fn actor(&self) -> ActorId {
        self.last.actor
    }

    /// Timestamp for a local write, strictly greater than anything this
    /// clock has issued or observed.
    pub fn tick(&mut self) -> Timestamp {
        let now = wall_clock_ms();
        if now > self.last.physical_ms {
            self.last.physical_ms = now;
            self.last.logical = 0;
        } else {
            self.last.logical = self.last.logical.saturating_add(1);
        }
        self.last
    }

    /// Advance past a timestamp received from another replica.
    pub fn observe(&mut self, remote: Timestamp) {
        let now = wall_clock_ms();
        let local = self.last.physical_ms;

        if now > local && now > remote.physical_ms {
            self.last.physical_ms = now;
            self.last.logical = 0;
        } else if local == remote.physical_ms {
            self.last.logical = self.last.logical.max(remote.logical).saturating_add(1);
        } else if remote.physical_ms > local {
            self.last.physical_ms = remote.physical_ms;
            self.last.logical = remote.logical.saturating_add(1);
        } else {
            self.last.logical = self.last.logical.saturating_add(1);
        }
    }

    /// Last issued or observed timestamp.
    #[must_use]
    pub fn current(&self) -> Timestamp {
        self.last
    }
}

/// Timestamp decoding errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TimestampError {
    /// Input shorter than the fixed encoding
    #[error("insufficient bytes: expected {expected}, got {actual}")]
    InsufficientBytes {
        /// Required length
        expected: usize,
        /// Received length
        actual: usize,
    },
}

/// Milliseconds since the UNIX epoch; a clock set before 1970 reads as 0.
pub(crate) fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}
