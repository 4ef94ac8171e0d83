//! Staleness guard for asynchronous reloads.
//!
//! Each reload request gets a ticket with a strictly increasing sequence
//! number derived from wall time. When the work completes, only the ticket
//! of the most recent request may apply its result.

use crate::hlc::wall_clock_ms;

/// Identity of one reload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadTicket {
    /// Monotonic request sequence, milliseconds-based
    pub seq: u64,
    /// What the request asked for
    pub content_id: String,
}

/// Issues tickets and decides which completions are still wanted.
#[derive(Debug, Default)]
pub struct ReloadSequencer {
    latest: Option<ReloadTicket>,
    last_seq: u64,
}

impl ReloadSequencer {
    /// Create a sequencer with no request in flight.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new request, superseding any earlier one.
    pub fn begin(&mut self, content_id: impl Into<String>) -> ReloadTicket {
        // Completions clear `latest`, so the floor is tracked separately.
        let ticket = ReloadTicket {
            seq: wall_clock_ms().max(self.last_seq.saturating_add(1)),
            content_id: content_id.into(),
        };
        self.last_seq = ticket.seq;
        self.latest = Some(ticket.clone());
        ticket
    }

    /// Whether `ticket` still belongs to the latest request.
    #[must_use]
    pub fn is_current(&self, ticket: &ReloadTicket) -> bool {
        self.latest.as_ref() == Some(ticket)
    }

    /// Whether a completion tagged with `seq` answers the latest request.
    #[must_use]
    pub fn is_current_seq(&self, seq: u64) -> bool {
        self.latest.as_ref().is_some_and(|t| t.seq == seq)
    }

    /// Accept a completion if its ticket is current, consuming the request.
    ///
    /// Returns `false` (and logs) when the result is stale and must be
    /// discarded.
    pub fn complete(&mut self, ticket: &ReloadTicket) -> bool {
        if self.is_current(ticket) {
            self.latest = None;
            true
        } else {
            tracing::debug!(
                seq = ticket.seq,
                content_id = %ticket.content_id,
                "Discarding stale reload result"
            );
            false
        }
    }

    /// Ticket of the request in flight, if any.
    #[must_use]
    pub fn pending(&self) -> Option<&ReloadTicket> {
        self.latest.as_ref()
    }
}
