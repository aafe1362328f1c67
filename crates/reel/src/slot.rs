//! Prepared-slot scheduling.
//!
//! Owns the lifecycle of preparing the player for the item after the active one. At most one
//! prepare cycle is pending at a time. Each cycle carries a generation number; completions are
//! matched against it, so a completion for a superseded cycle is ignored.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::reporter::PlaybackEventReporter;

pub const PREPARED_MODE: &str = "prepared";

/// Identifies one prepare cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrepareTicket {
    pub index: usize,
    pub generation: u64,
}

#[derive(Debug)]
struct PendingSlot {
    ticket: PrepareTicket,
    id: String,
    started_at: Instant,
    preroll_requested: bool,
}

/// `Idle -> Preparing -> {Ready, Error, Cancelled}` for the next player.
pub struct PreparedSlotScheduler {
    enabled: bool,
    reporter: Arc<dyn PlaybackEventReporter>,
    pending: Option<PendingSlot>,
    generation: u64,
}

impl PreparedSlotScheduler {
    pub fn new(enabled: bool, reporter: Arc<dyn PlaybackEventReporter>) -> Self {
        Self {
            enabled,
            reporter,
            pending: None,
            generation: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn pending_index(&self) -> Option<usize> {
        self.pending.as_ref().map(|slot| slot.ticket.index)
    }

    /// Whether `ticket` belongs to the cycle that is still pending.
    pub fn accepts(&self, ticket: PrepareTicket) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|slot| slot.ticket == ticket)
    }

    /// Start a prepare cycle for the item after `active_index`.
    ///
    /// Returns `None` without side effects when disabled, when there is no next item, or when
    /// that item is already pending. A pending cycle for a different index is superseded and
    /// reported as cancelled.
    pub fn schedule<'a, I, F>(
        &mut self,
        active_index: usize,
        item_count: usize,
        id_at: I,
        prepare: F,
    ) -> Option<PrepareTicket>
    where
        I: Fn(usize) -> Option<&'a str>,
        F: FnOnce(PrepareTicket),
    {
        if !self.enabled {
            return None;
        }
        let index = active_index.checked_add(1).filter(|next| *next < item_count)?;
        let id = id_at(index)?;

        if self.pending_index() == Some(index) {
            return None;
        }
        self.reset("superseded");

        self.generation += 1;
        let ticket = PrepareTicket {
            index,
            generation: self.generation,
        };
        let distance = index as i64 - active_index as i64;
        self.pending = Some(PendingSlot {
            ticket,
            id: id.to_owned(),
            started_at: Instant::now(),
            preroll_requested: false,
        });

        debug!(id, index, generation = ticket.generation, "scheduling prepared slot");
        self.reporter
            .preload_scheduled(id, index, distance, PREPARED_MODE);
        prepare(ticket);
        Some(ticket)
    }

    /// The pending player is ready. Runs `on_preroll` once and completes the cycle.
    ///
    /// Returns `false` for stale or repeated signals.
    pub fn mark_ready<F>(&mut self, ticket: PrepareTicket, now: Instant, on_preroll: F) -> bool
    where
        F: FnOnce(),
    {
        if !self.accepts(ticket) {
            debug!(index = ticket.index, generation = ticket.generation, "ignoring stale ready");
            return false;
        }
        let Some(mut slot) = self.pending.take() else {
            return false;
        };
        if !slot.preroll_requested {
            slot.preroll_requested = true;
            on_preroll();
        }
        let elapsed = now.saturating_duration_since(slot.started_at).as_millis() as u64;
        self.reporter
            .preload_completed(&slot.id, slot.ticket.index, 0, elapsed, false);
        true
    }

    /// The pending prepare failed. Returns `false` for stale signals.
    pub fn mark_error(&mut self, ticket: PrepareTicket, reason: &str) -> bool {
        if !self.accepts(ticket) {
            return false;
        }
        self.cancel_pending(reason);
        true
    }

    /// Cancel whatever is pending, reporting `reason`.
    pub fn reset(&mut self, reason: &str) {
        self.cancel_pending(reason);
    }

    /// Forget the pending cycle without telemetry.
    ///
    /// Used when the prepared player rotates into the active role.
    pub fn clear_on_swap(&mut self) {
        if let Some(slot) = self.pending.take() {
            debug!(index = slot.ticket.index, "prepared slot swapped in while pending");
        }
    }

    fn cancel_pending(&mut self, reason: &str) {
        if let Some(slot) = self.pending.take() {
            debug!(id = %slot.id, index = slot.ticket.index, reason, "prepared slot cancelled");
            self.reporter
                .preload_canceled(&slot.id, slot.ticket.index, reason);
        }
    }
}
