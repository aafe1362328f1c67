//! Feed alignment planning.
//!
//! Feed mutations are compared by id sequence, never by index, because inserts and removals
//! shift identities under an unchanged index.

/// Outcome of comparing two id sequences. Consumed immediately by the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedAlignmentPlan {
    /// Tear down all playback state.
    pub clear_playback_state: bool,
    /// Index that needs (re)activation, if any.
    pub next_active_index: Option<usize>,
    /// Prepared slot index that now points at the wrong content.
    pub invalidate_prepared_index: Option<usize>,
}

impl FeedAlignmentPlan {
    /// Whether applying the plan changes anything.
    pub fn is_noop(&self) -> bool {
        !self.clear_playback_state
            && self.next_active_index.is_none()
            && self.invalidate_prepared_index.is_none()
    }
}

/// Diff `previous` against `current` for the given cursor state.
pub fn plan<S: AsRef<str>>(
    previous: &[S],
    current: &[S],
    active_index: Option<usize>,
    active_slot_index: Option<usize>,
    prepared_slot_index: Option<usize>,
) -> FeedAlignmentPlan {
    if current.is_empty() {
        return FeedAlignmentPlan {
            clear_playback_state: true,
            next_active_index: None,
            invalidate_prepared_index: prepared_slot_index,
        };
    }

    let id_changed = |index: usize| {
        previous.get(index).map(AsRef::<str>::as_ref)
            != current.get(index).map(AsRef::<str>::as_ref)
    };

    let invalidate_prepared_index =
        prepared_slot_index.filter(|&index| index >= current.len() || id_changed(index));

    let next_active_index = match active_index {
        // Nothing active yet: the first item starts the feed.
        None => Some(0),
        Some(index) if index >= current.len() => Some(current.len() - 1),
        Some(index) if id_changed(index) || active_slot_index != Some(index) => Some(index),
        Some(_) => None,
    };

    FeedAlignmentPlan {
        clear_playback_state: false,
        next_active_index,
        invalidate_prepared_index,
    }
}

/// Shape of a feed update relative to the list already tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMutation {
    Unchanged,
    /// `previous` is a strict prefix of `current`.
    Append { added: usize },
    /// Anything else: insert, delete, reorder or refresh.
    Replace,
}

impl FeedMutation {
    pub fn classify<S: AsRef<str>>(previous: &[S], current: &[S]) -> Self {
        let prefix_matches = current.len() >= previous.len()
            && previous
                .iter()
                .zip(current)
                .all(|(a, b)| AsRef::<str>::as_ref(a) == AsRef::<str>::as_ref(b));

        match (prefix_matches, current.len() - previous.len().min(current.len())) {
            (true, 0) => Self::Unchanged,
            (true, added) if !previous.is_empty() => Self::Append { added },
            _ => Self::Replace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: [&str; 0] = [];

    #[test]
    fn test_cold_start_is_not_a_wipe() {
        let plan = plan(&EMPTY, &["A", "B", "C"], None, None, None);
        assert!(!plan.clear_playback_state);
        assert_eq!(plan.next_active_index, Some(0));
        assert_eq!(plan.invalidate_prepared_index, None);
    }

    #[test]
    fn test_append_keeps_playback() {
        let plan = plan(&["A", "B", "C"], &["A", "B", "C", "D"], Some(1), Some(1), Some(2));
        assert!(plan.is_noop());
    }

    #[test]
    fn test_deletion_ahead_of_cursor_snaps_to_last() {
        let plan = plan(&["A", "B", "C"], &["B", "C"], Some(2), Some(2), None);
        assert!(!plan.clear_playback_state);
        assert_eq!(plan.next_active_index, Some(1));
    }

    #[test]
    fn test_empty_feed_tears_down() {
        let plan = plan(&["A", "B"], &EMPTY, Some(1), Some(1), Some(0));
        assert!(plan.clear_playback_state);
        assert_eq!(plan.next_active_index, None);
        assert_eq!(plan.invalidate_prepared_index, Some(0));
    }

    #[test]
    fn test_insert_before_cursor_reactivates_and_invalidates_prepared() {
        // X inserted at the head shifts everything one place down.
        let plan = plan(&["A", "B", "C"], &["X", "A", "B", "C"], Some(1), Some(1), Some(2));
        assert_eq!(plan.next_active_index, Some(1));
        assert_eq!(plan.invalidate_prepared_index, Some(2));
    }

    #[test]
    fn test_prepared_out_of_bounds_is_invalidated() {
        let plan = plan(&["A", "B", "C"], &["A", "B"], Some(0), Some(0), Some(2));
        assert_eq!(plan.invalidate_prepared_index, Some(2));
        assert_eq!(plan.next_active_index, None);
    }

    #[test]
    fn test_detached_surface_slot_requests_reactivation() {
        let plan = plan(&["A", "B"], &["A", "B"], Some(1), None, None);
        assert_eq!(plan.next_active_index, Some(1));
    }

    #[test]
    fn test_classify_mutations() {
        assert_eq!(
            FeedMutation::classify(&["A", "B"], &["A", "B", "C"]),
            FeedMutation::Append { added: 1 }
        );
        assert_eq!(
            FeedMutation::classify(&["A", "B"], &["A", "B"]),
            FeedMutation::Unchanged
        );
        assert_eq!(
            FeedMutation::classify(&["A", "B"], &["B", "A", "C"]),
            FeedMutation::Replace
        );
        assert_eq!(FeedMutation::classify(&["A", "B"], &["A"]), FeedMutation::Replace);
        assert_eq!(FeedMutation::classify(&EMPTY, &["A"]), FeedMutation::Replace);
    }
}
