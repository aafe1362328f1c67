//! Preload window calculation.
//!
//! Maps the active index onto the indices that should hold a prepared player and the indices
//! that should only have their bytes warmed on disk.

use std::collections::BTreeSet;

use crate::config::PreloadPolicy;

/// Indices to warm around a center, split by tier. The two sets are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadWindow {
    pub prepared: BTreeSet<usize>,
    pub disk: BTreeSet<usize>,
}

impl PreloadWindow {
    /// Union of both tiers.
    pub fn all(&self) -> BTreeSet<usize> {
        self.prepared.union(&self.disk).copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.prepared.is_empty() && self.disk.is_empty()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.prepared.contains(&index) || self.disk.contains(&index)
    }
}

/// Compute the window for `center` in a feed of `item_count` items.
pub fn compute_window(center: usize, item_count: usize, policy: &PreloadPolicy) -> PreloadWindow {
    if item_count == 0 {
        return PreloadWindow::default();
    }

    let mut prepared = BTreeSet::new();
    if policy.use_prepared_next_player {
        for distance in 1..=policy.prepared_prev {
            match center.checked_sub(distance) {
                Some(index) if index < item_count => {
                    prepared.insert(index);
                }
                Some(_) => {}
                None => break,
            }
        }
        prepared.extend(forward(center, policy.prepared_next, item_count));
    }

    let disk = forward(center, policy.disk_prefetch_next, item_count)
        .filter(|index| !prepared.contains(index))
        .collect();

    PreloadWindow { prepared, disk }
}

fn forward(center: usize, count: usize, item_count: usize) -> impl Iterator<Item = usize> {
    (1..=count)
        .filter_map(move |distance| center.checked_add(distance))
        .take_while(move |index| *index < item_count)
}
