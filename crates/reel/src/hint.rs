//! Scroll-hint derivation.
//!
//! A pager reports its continuous offset as a fraction of a page relative to the settled page:
//! positive while moving towards the next item, negative towards the previous one. Once the
//! fraction passes a threshold the neighbour in that direction is predicted to become active.

/// Predict the next active index from a page offset fraction.
///
/// Returns `None` while `offset` stays within `threshold`, or when scrolling backwards from the
/// first page. The caller checks the upper bound against its feed.
pub fn predicted_index_from_offset(current: usize, offset: f32, threshold: f32) -> Option<usize> {
    if !offset.is_finite() {
        return None;
    }
    let threshold = threshold.abs();
    if offset > threshold {
        current.checked_add(1)
    } else if offset < -threshold {
        current.checked_sub(1)
    } else {
        None
    }
}

/// Turns a stream of offset samples into distinct predictions.
#[derive(Debug, Clone)]
pub struct ScrollHintTracker {
    threshold: f32,
    last: Option<usize>,
}

impl ScrollHintTracker {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            last: None,
        }
    }

    /// Feed one offset sample. Yields a prediction only when it differs from the previous one.
    pub fn observe(&mut self, current: usize, offset: f32) -> Option<usize> {
        let predicted = predicted_index_from_offset(current, offset, self.threshold)?;
        if self.last == Some(predicted) {
            return None;
        }
        self.last = Some(predicted);
        Some(predicted)
    }

    /// Call when the pager settles on a page.
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn last_prediction(&self) -> Option<usize> {
        self.last
    }
}

impl Default for ScrollHintTracker {
    fn default() -> Self {
        Self::new(0.15)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prediction_needs_threshold() {
        assert_eq!(predicted_index_from_offset(3, 0.1, 0.15), None);
        assert_eq!(predicted_index_from_offset(3, -0.15, 0.15), None);
        assert_eq!(predicted_index_from_offset(3, 0.2, 0.15), Some(4));
        assert_eq!(predicted_index_from_offset(3, -0.5, 0.15), Some(2));
    }

    #[test]
    fn test_no_prediction_before_first_page() {
        assert_eq!(predicted_index_from_offset(0, -0.9, 0.15), None);
        assert_eq!(predicted_index_from_offset(0, f32::NAN, 0.15), None);
    }

    #[test]
    fn test_tracker_yields_distinct_predictions() {
        let mut tracker = ScrollHintTracker::default();
        assert_eq!(tracker.observe(0, 0.05), None);
        assert_eq!(tracker.observe(0, 0.2), Some(1));
        assert_eq!(tracker.observe(0, 0.4), None);
        assert_eq!(tracker.observe(1, -0.3), Some(0));

        tracker.reset();
        assert_eq!(tracker.last_prediction(), None);
        assert_eq!(tracker.observe(1, -0.3), Some(0));
    }
}
