//! Playback telemetry.
//!
//! The coordinator reports through [`PlaybackEventReporter`]. Every report is a
//! [`PlaybackEvent`]; the convenience methods build the event and hand it to
//! [`PlaybackEventReporter::report`], so an implementation only has to override that one
//! method. [`NoopReporter`] is the default.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// Point-in-time playback sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackProgress {
    pub id: String,
    pub index: usize,
    pub position_ms: u64,
    pub duration_ms: u64,
}

/// Every report the engine can emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Impression {
        id: String,
        index: usize,
    },
    PlayStartRequest {
        id: String,
        index: usize,
        reason: String,
    },
    FirstFrameRendered {
        id: String,
        index: usize,
    },
    TimeToFirstFrame {
        id: String,
        index: usize,
        ms: u64,
    },
    Progress(PlaybackProgress),
    RebufferStart {
        id: String,
        index: usize,
        reason: String,
    },
    RebufferEnd {
        id: String,
        index: usize,
        reason: String,
    },
    RebufferTotal {
        id: String,
        index: usize,
        ms: u64,
    },
    PlaybackError {
        id: String,
        index: usize,
        category: String,
        code: i64,
        message: Option<String>,
    },
    PlaybackEnded {
        id: String,
        index: usize,
    },
    PreloadScheduled {
        id: String,
        index: usize,
        distance: i64,
        mode: String,
    },
    PreloadCompleted {
        id: String,
        index: usize,
        bytes: u64,
        ms: u64,
        from_cache: bool,
    },
    PreloadCanceled {
        id: String,
        index: usize,
        reason: String,
    },
    CacheHit {
        id: String,
        bytes: u64,
    },
    CacheMiss {
        id: String,
    },
}

impl PlaybackEvent {
    /// Item id the event refers to.
    pub fn id(&self) -> &str {
        match self {
            Self::Impression { id, .. }
            | Self::PlayStartRequest { id, .. }
            | Self::FirstFrameRendered { id, .. }
            | Self::TimeToFirstFrame { id, .. }
            | Self::RebufferStart { id, .. }
            | Self::RebufferEnd { id, .. }
            | Self::RebufferTotal { id, .. }
            | Self::PlaybackError { id, .. }
            | Self::PlaybackEnded { id, .. }
            | Self::PreloadScheduled { id, .. }
            | Self::PreloadCompleted { id, .. }
            | Self::PreloadCanceled { id, .. }
            | Self::CacheHit { id, .. }
            | Self::CacheMiss { id } => id,
            Self::Progress(progress) => &progress.id,
        }
    }
}

/// Sink for playback telemetry. Implementations must not block.
pub trait PlaybackEventReporter: Send + Sync {
    fn report(&self, event: PlaybackEvent) {
        let _ = event;
    }

    fn impression(&self, id: &str, index: usize) {
        self.report(PlaybackEvent::Impression {
            id: id.to_owned(),
            index,
        });
    }

    fn play_start_request(&self, id: &str, index: usize, reason: &str) {
        self.report(PlaybackEvent::PlayStartRequest {
            id: id.to_owned(),
            index,
            reason: reason.to_owned(),
        });
    }

    fn first_frame_rendered(&self, id: &str, index: usize) {
        self.report(PlaybackEvent::FirstFrameRendered {
            id: id.to_owned(),
            index,
        });
    }

    fn time_to_first_frame(&self, id: &str, index: usize, ms: u64) {
        self.report(PlaybackEvent::TimeToFirstFrame {
            id: id.to_owned(),
            index,
            ms,
        });
    }

    fn playback_progress(&self, progress: PlaybackProgress) {
        self.report(PlaybackEvent::Progress(progress));
    }

    fn rebuffer_start(&self, id: &str, index: usize, reason: &str) {
        self.report(PlaybackEvent::RebufferStart {
            id: id.to_owned(),
            index,
            reason: reason.to_owned(),
        });
    }

    fn rebuffer_end(&self, id: &str, index: usize, reason: &str) {
        self.report(PlaybackEvent::RebufferEnd {
            id: id.to_owned(),
            index,
            reason: reason.to_owned(),
        });
    }

    fn rebuffer_total(&self, id: &str, index: usize, ms: u64) {
        self.report(PlaybackEvent::RebufferTotal {
            id: id.to_owned(),
            index,
            ms,
        });
    }

    fn playback_error(
        &self,
        id: &str,
        index: usize,
        category: &str,
        code: i64,
        message: Option<&str>,
    ) {
        self.report(PlaybackEvent::PlaybackError {
            id: id.to_owned(),
            index,
            category: category.to_owned(),
            code,
            message: message.map(str::to_owned),
        });
    }

    fn playback_ended(&self, id: &str, index: usize) {
        self.report(PlaybackEvent::PlaybackEnded {
            id: id.to_owned(),
            index,
        });
    }

    fn preload_scheduled(&self, id: &str, index: usize, distance: i64, mode: &str) {
        self.report(PlaybackEvent::PreloadScheduled {
            id: id.to_owned(),
            index,
            distance,
            mode: mode.to_owned(),
        });
    }

    fn preload_completed(&self, id: &str, index: usize, bytes: u64, ms: u64, from_cache: bool) {
        self.report(PlaybackEvent::PreloadCompleted {
            id: id.to_owned(),
            index,
            bytes,
            ms,
            from_cache,
        });
    }

    fn preload_canceled(&self, id: &str, index: usize, reason: &str) {
        self.report(PlaybackEvent::PreloadCanceled {
            id: id.to_owned(),
            index,
            reason: reason.to_owned(),
        });
    }

    fn cache_hit(&self, id: &str, bytes: u64) {
        self.report(PlaybackEvent::CacheHit {
            id: id.to_owned(),
            bytes,
        });
    }

    fn cache_miss(&self, id: &str) {
        self.report(PlaybackEvent::CacheMiss { id: id.to_owned() });
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl PlaybackEventReporter for NoopReporter {}

/// Logs every report with `tracing` before forwarding it.
///
/// Progress samples are logged at most once per whole second of position per item.
pub struct LoggingReporter<R> {
    inner: R,
    last_progress_second: Mutex<HashMap<(String, usize), u64>>,
}

impl<R: PlaybackEventReporter> LoggingReporter<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            last_progress_second: Mutex::new(HashMap::new()),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn should_log_progress(&self, progress: &PlaybackProgress) -> bool {
        if progress.duration_ms == 0 {
            return false;
        }
        let second = progress.position_ms / 1000;
        let mut last = self.last_progress_second.lock();
        let key = (progress.id.clone(), progress.index);
        if last.get(&key) == Some(&second) {
            return false;
        }
        last.insert(key, second);
        true
    }

    fn forget(&self, id: &str, index: usize) {
        self.last_progress_second
            .lock()
            .remove(&(id.to_owned(), index));
    }
}

impl<R: PlaybackEventReporter> PlaybackEventReporter for LoggingReporter<R> {
    fn report(&self, event: PlaybackEvent) {
        match &event {
            PlaybackEvent::Progress(progress) => {
                if self.should_log_progress(progress) {
                    debug!(
                        id = %progress.id,
                        index = progress.index,
                        position_ms = progress.position_ms,
                        duration_ms = progress.duration_ms,
                        "playback progress"
                    );
                }
            }
            PlaybackEvent::PlaybackError { id, index, .. }
            | PlaybackEvent::PlaybackEnded { id, index } => {
                debug!(event = ?event, "playback event");
                self.forget(id, *index);
            }
            _ => debug!(event = ?event, "playback event"),
        }
        self.inner.report(event);
    }
}

/// Publishes every report on a broadcast channel.
///
/// Slow subscribers lag and lose events; the engine never waits for them.
#[derive(Clone)]
pub struct ChannelReporter {
    event_tx: broadcast::Sender<PlaybackEvent>,
}

impl ChannelReporter {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for ChannelReporter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl PlaybackEventReporter for ChannelReporter {
    fn report(&self, event: PlaybackEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}

impl<R: PlaybackEventReporter + ?Sized> PlaybackEventReporter for Arc<R> {
    fn report(&self, event: PlaybackEvent) {
        (**self).report(event);
    }
}
