// Disk-tier prefetch tracking.
//
// Tracks which feed items currently have a disk prefetch outstanding and diffs each new
// window against them, so only the items entering the window start a download and only the
// items leaving it are cancelled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::config::PreloadPolicy;
use crate::reporter::PlaybackEventReporter;
use crate::window::{PreloadWindow, compute_window};

pub const DISK_MODE: &str = "disk";

/// What moved the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchOrigin {
    /// The committed active index.
    Active,
    /// A scroll hint; never cancels anything.
    Hint,
    /// A feed reset; cancels everything outside the window, hinted or not.
    Reset,
}

/// One item with an outstanding disk prefetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskTarget {
    pub id: String,
    pub index: usize,
    /// Started by a scroll hint and not yet confirmed by the active window.
    pub hinted: bool,
}

/// Result of a window update.
#[derive(Debug, Default)]
pub struct PrefetchDelta {
    pub window: PreloadWindow,
    pub to_start: Vec<DiskTarget>,
    pub to_cancel: Vec<DiskTarget>,
}

/// Tracks outstanding disk prefetches by item id.
pub struct DiskPrefetchTracker {
    policy: PreloadPolicy,
    reporter: Arc<dyn PlaybackEventReporter>,
    /// Items with a download outstanding
    targets: HashMap<String, DiskTarget>,
    /// Items already warmed in this feed session
    completed: HashSet<String>,
    /// Primed items whose download is still running
    warming: HashMap<String, DiskTarget>,
}

impl DiskPrefetchTracker {
    pub fn new(policy: PreloadPolicy, reporter: Arc<dyn PlaybackEventReporter>) -> Self {
        Self {
            policy,
            reporter,
            targets: HashMap::new(),
            completed: HashSet::new(),
            warming: HashMap::new(),
        }
    }

    /// Recompute the disk window around `center`.
    ///
    /// Items entering the window are returned in `to_start` and reported as scheduled.
    /// Targets outside the window are returned in `to_cancel` and reported as cancelled:
    /// non-hinted ones for [`PrefetchOrigin::Active`], all of them for [`PrefetchOrigin::Reset`].
    /// A reset also returns primed downloads outside the window, without telemetry.
    pub fn update<'a, I>(
        &mut self,
        center: usize,
        item_count: usize,
        id_at: I,
        origin: PrefetchOrigin,
    ) -> PrefetchDelta
    where
        I: Fn(usize) -> Option<&'a str>,
    {
        let window = compute_window(center, item_count, &self.policy);
        let desired: HashMap<&str, usize> = window
            .disk
            .iter()
            .filter_map(|&index| id_at(index).map(|id| (id, index)))
            .collect();

        let mut to_cancel = Vec::new();
        if origin != PrefetchOrigin::Hint {
            let leaving: Vec<String> = self
                .targets
                .values()
                .filter(|target| origin == PrefetchOrigin::Reset || !target.hinted)
                .filter(|target| !desired.contains_key(target.id.as_str()))
                .map(|target| target.id.clone())
                .collect();
            for id in leaving {
                if let Some(target) = self.targets.remove(&id) {
                    self.reporter
                        .preload_canceled(&target.id, target.index, "window_shift");
                    to_cancel.push(target);
                }
            }
        }
        if origin == PrefetchOrigin::Reset {
            let leaving: Vec<String> = self
                .warming
                .keys()
                .filter(|id| !desired.contains_key(id.as_str()))
                .cloned()
                .collect();
            for id in leaving {
                self.completed.remove(&id);
                if let Some(target) = self.warming.remove(&id) {
                    to_cancel.push(target);
                }
            }
        }

        let mut to_start = Vec::new();
        for &index in &window.disk {
            let Some(id) = id_at(index) else {
                continue;
            };
            if self.completed.contains(id) {
                continue;
            }
            if let Some(existing) = self.targets.get_mut(id) {
                existing.index = index;
                if origin != PrefetchOrigin::Hint {
                    existing.hinted = false;
                }
                continue;
            }

            let target = DiskTarget {
                id: id.to_owned(),
                index,
                hinted: origin == PrefetchOrigin::Hint,
            };
            self.reporter
                .preload_scheduled(id, index, index as i64 - center as i64, DISK_MODE);
            self.targets.insert(target.id.clone(), target.clone());
            to_start.push(target);
        }

        if !to_start.is_empty() || !to_cancel.is_empty() {
            debug!(
                center,
                ?origin,
                start = to_start.len(),
                cancel = to_cancel.len(),
                "disk prefetch window updated"
            );
        }

        PrefetchDelta {
            window,
            to_start,
            to_cancel,
        }
    }

    /// The download for `id` finished and the item is warm.
    pub fn mark_completed(&mut self, id: &str) -> Option<DiskTarget> {
        self.warming.remove(id);
        let target = self.targets.remove(id);
        self.completed.insert(id.to_owned());
        target
    }

    /// Enough of `id` is on disk to count as warm, but its download keeps running.
    ///
    /// The download stays cancellable through [`reset`](Self::reset),
    /// [`retain_feed`](Self::retain_feed) and reset-origin updates until it finishes.
    pub fn mark_primed(&mut self, id: &str) -> Option<DiskTarget> {
        let target = self.targets.remove(id)?;
        self.completed.insert(id.to_owned());
        self.warming.insert(target.id.clone(), target.clone());
        Some(target)
    }

    /// The download for `id` failed; it may be scheduled again later.
    pub fn mark_failed(&mut self, id: &str) -> Option<DiskTarget> {
        self.warming.remove(id);
        self.targets.remove(id)
    }

    /// Allow `id` to be scheduled again, e.g. after its primed download later failed.
    pub fn forget(&mut self, id: &str) {
        self.targets.remove(id);
        self.warming.remove(id);
        self.completed.remove(id);
    }

    /// Whether a primed download for `id` is still running.
    pub fn is_warming(&self, id: &str) -> bool {
        self.warming.contains_key(id)
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.targets.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.targets.len()
    }

    pub fn target(&self, id: &str) -> Option<&DiskTarget> {
        self.targets.get(id)
    }

    /// Cancel every outstanding target, reporting `reason`, and forget completions.
    ///
    /// Primed downloads still running are returned too; they were already reported complete.
    pub fn reset(&mut self, reason: &str) -> Vec<DiskTarget> {
        let mut cancelled: Vec<DiskTarget> = self.targets.drain().map(|(_, target)| target).collect();
        cancelled.sort_by_key(|target| target.index);
        for target in &cancelled {
            self.reporter
                .preload_canceled(&target.id, target.index, reason);
        }
        cancelled.extend(self.warming.drain().map(|(_, target)| target));
        self.completed.clear();
        cancelled
    }

    /// Cancel targets whose id is no longer part of the feed, and re-index the rest.
    pub fn retain_feed<'a, I>(&mut self, ids: I, reason: &str) -> Vec<DiskTarget>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let positions: HashMap<&str, usize> = ids
            .into_iter()
            .enumerate()
            .map(|(index, id)| (id, index))
            .collect();

        self.completed.retain(|id| positions.contains_key(id.as_str()));

        let mut removed = Vec::new();
        self.targets.retain(|id, target| match positions.get(id.as_str()) {
            Some(&index) => {
                target.index = index;
                true
            }
            None => {
                removed.push(target.clone());
                false
            }
        });
        for target in &removed {
            self.reporter
                .preload_canceled(&target.id, target.index, reason);
        }
        self.warming.retain(|id, target| match positions.get(id.as_str()) {
            Some(&index) => {
                target.index = index;
                true
            }
            None => {
                removed.push(target.clone());
                false
            }
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::{ChannelReporter, PlaybackEvent};

    const IDS: [&str; 10] = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"];

    fn id_at(index: usize) -> Option<&'static str> {
        IDS.get(index).copied()
    }

    fn tracker() -> (DiskPrefetchTracker, ChannelReporter) {
        let policy = PreloadPolicy {
            prepared_next: 1,
            disk_prefetch_next: 3,
            ..PreloadPolicy::default()
        };
        let reporter = ChannelReporter::new(64);
        (
            DiskPrefetchTracker::new(policy, Arc::new(reporter.clone())),
            reporter,
        )
    }

    fn ids(targets: &[DiskTarget]) -> Vec<&str> {
        let mut ids: Vec<&str> = targets.iter().map(|target| target.id.as_str()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_initial_update_starts_disk_window() {
        let (mut tracker, reporter) = tracker();
        let mut rx = reporter.subscribe();
        let delta = tracker.update(0, IDS.len(), id_at, PrefetchOrigin::Active);
        // Index 1 is prepared, 2 and 3 are disk.
        assert_eq!(ids(&delta.to_start), vec!["c", "d"]);
        assert!(delta.to_cancel.is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            PlaybackEvent::PreloadScheduled { distance: 2, ref mode, .. } if mode == "disk"
        ));
    }

    #[test]
    fn test_window_shift_cancels_and_starts_difference() {
        let (mut tracker, _reporter) = tracker();
        tracker.update(0, IDS.len(), id_at, PrefetchOrigin::Active);
        let delta = tracker.update(3, IDS.len(), id_at, PrefetchOrigin::Active);
        assert_eq!(ids(&delta.to_cancel), vec!["c", "d"]);
        assert_eq!(ids(&delta.to_start), vec!["f", "g"]);
    }

    #[test]
    fn test_overlapping_update_starts_only_new_items() {
        let (mut tracker, _reporter) = tracker();
        tracker.update(0, IDS.len(), id_at, PrefetchOrigin::Active);
        let delta = tracker.update(1, IDS.len(), id_at, PrefetchOrigin::Active);
        // c moved into the prepared tier.
        assert_eq!(ids(&delta.to_cancel), vec!["c"]);
        assert_eq!(ids(&delta.to_start), vec!["e"]);
    }

    #[test]
    fn test_hinted_targets_survive_active_updates() {
        let (mut tracker, _reporter) = tracker();
        let hinted = tracker.update(5, IDS.len(), id_at, PrefetchOrigin::Hint);
        assert_eq!(ids(&hinted.to_start), vec!["h", "i"]);
        assert!(hinted.to_start.iter().all(|target| target.hinted));

        let delta = tracker.update(0, IDS.len(), id_at, PrefetchOrigin::Active);
        assert!(delta.to_cancel.is_empty());
        assert!(tracker.is_pending("h"));
    }

    #[test]
    fn test_reset_origin_cancels_hinted_targets() {
        let (mut tracker, _reporter) = tracker();
        tracker.update(5, IDS.len(), id_at, PrefetchOrigin::Hint);
        let delta = tracker.update(0, IDS.len(), id_at, PrefetchOrigin::Reset);
        assert_eq!(ids(&delta.to_cancel), vec!["h", "i"]);
        assert_eq!(ids(&delta.to_start), vec!["c", "d"]);
    }

    #[test]
    fn test_completed_items_are_not_rescheduled() {
        let (mut tracker, _reporter) = tracker();
        tracker.update(0, IDS.len(), id_at, PrefetchOrigin::Active);
        assert!(tracker.mark_completed("c").is_some());
        assert!(tracker.mark_failed("d").is_some());

        let delta = tracker.update(0, IDS.len(), id_at, PrefetchOrigin::Active);
        assert_eq!(ids(&delta.to_start), vec!["d"]);
    }

    #[test]
    fn test_reset_cancels_everything_with_reason() {
        let (mut tracker, reporter) = tracker();
        tracker.update(0, IDS.len(), id_at, PrefetchOrigin::Active);
        let mut rx = reporter.subscribe();
        let cancelled = tracker.reset("release");
        assert_eq!(ids(&cancelled), vec!["c", "d"]);
        assert_eq!(tracker.pending_count(), 0);
        for _ in 0..2 {
            assert!(matches!(
                rx.try_recv().unwrap(),
                PlaybackEvent::PreloadCanceled { ref reason, .. } if reason == "release"
            ));
        }
    }

    #[test]
    fn test_retain_feed_drops_removed_ids_and_reindexes() {
        let (mut tracker, _reporter) = tracker();
        tracker.update(0, IDS.len(), id_at, PrefetchOrigin::Active);
        let removed = tracker.retain_feed(["a", "b", "d"], "feed_update");
        assert_eq!(ids(&removed), vec!["c"]);
        assert_eq!(tracker.target("d").map(|target| target.index), Some(2));
    }

    #[test]
    fn test_primed_download_survives_active_moves() {
        let (mut tracker, _reporter) = tracker();
        tracker.update(0, IDS.len(), id_at, PrefetchOrigin::Active);
        assert!(tracker.mark_primed("c").is_some());
        assert!(tracker.is_warming("c"));
        assert!(!tracker.is_pending("c"));

        let delta = tracker.update(5, IDS.len(), id_at, PrefetchOrigin::Active);
        assert_eq!(ids(&delta.to_cancel), vec!["d"]);
        assert!(tracker.is_warming("c"));

        tracker.mark_completed("c");
        assert!(!tracker.is_warming("c"));
    }

    #[test]
    fn test_primed_download_is_cancelled_on_reset_without_telemetry() {
        let (mut tracker, reporter) = tracker();
        tracker.update(0, IDS.len(), id_at, PrefetchOrigin::Active);
        tracker.mark_primed("c");
        let mut rx = reporter.subscribe();

        let cancelled = tracker.reset("release");
        assert_eq!(ids(&cancelled), vec!["c", "d"]);
        assert!(!tracker.is_warming("c"));
        assert!(matches!(
            rx.try_recv().unwrap(),
            PlaybackEvent::PreloadCanceled { ref id, .. } if id == "d"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_primed_download_is_cancelled_when_feed_moves_away() {
        let (mut tracker, _reporter) = tracker();
        tracker.update(0, IDS.len(), id_at, PrefetchOrigin::Active);
        tracker.mark_primed("c");
        tracker.mark_primed("d");

        let removed = tracker.retain_feed(["a", "b", "d"], "feed_update");
        assert_eq!(ids(&removed), vec!["c"]);
        assert!(tracker.is_warming("d"));

        let shrunk = |index: usize| ["a", "b", "d"].get(index).copied();
        let delta = tracker.update(0, 3, shrunk, PrefetchOrigin::Reset);
        assert!(delta.to_cancel.is_empty());
        assert!(delta.to_start.is_empty());
        let delta = tracker.update(5, IDS.len(), id_at, PrefetchOrigin::Reset);
        assert_eq!(ids(&delta.to_cancel), vec!["d"]);
        assert!(!tracker.is_warming("d"));
    }
}
