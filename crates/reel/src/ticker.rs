//! Periodic playback progress sampling.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::reporter::PlaybackProgress;

pub type ProgressError = Box<dyn std::error::Error + Send + Sync>;

/// Returns the sample for whatever is active, or `None` when nothing is playing.
pub type ProgressProvider =
    Arc<dyn Fn() -> Result<Option<PlaybackProgress>, ProgressError> + Send + Sync>;

pub type ProgressSink = Arc<dyn Fn(PlaybackProgress) + Send + Sync>;

struct RunningLoop {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// A single cancellable sampling loop.
///
/// A failing or panicking provider skips that tick only; the loop keeps running.
pub struct PlaybackProgressTicker {
    runtime: Handle,
    interval: Duration,
    provider: ProgressProvider,
    sink: ProgressSink,
    running: Mutex<Option<RunningLoop>>,
}

impl PlaybackProgressTicker {
    pub fn new(
        runtime: Handle,
        interval: Duration,
        provider: ProgressProvider,
        sink: ProgressSink,
    ) -> Self {
        Self {
            runtime,
            interval: interval.max(Duration::from_millis(1)),
            provider,
            sink,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Start sampling. No-op when already running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
        {
            return;
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let period = self.interval;
        let provider = self.provider.clone();
        let sink = self.sink.clone();

        let task = self.runtime.spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(interval_ms = period.as_millis() as u64, "progress ticker started");

            loop {
                tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => {
                        debug!("progress ticker stopped");
                        break;
                    }
                    _ = ticks.tick() => {
                        if let Some(progress) = sample(&provider) {
                            sink(progress);
                        }
                    }
                }
            }
        });

        *running = Some(RunningLoop { token, task });
    }

    /// Stop sampling. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.token.cancel();
        }
    }

    pub fn restart(&self) {
        self.stop();
        self.start();
    }
}

impl Drop for PlaybackProgressTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sample(provider: &ProgressProvider) -> Option<PlaybackProgress> {
    match catch_unwind(AssertUnwindSafe(|| provider())) {
        Ok(Ok(progress)) => progress,
        Ok(Err(e)) => {
            warn!(error = %e, "progress provider failed");
            None
        }
        Err(_) => {
            warn!("progress provider panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn progress(position_ms: u64) -> PlaybackProgress {
        PlaybackProgress {
            id: "a".into(),
            index: 0,
            position_ms,
            duration_ms: 10_000,
        }
    }

    fn counting_ticker(provider: ProgressProvider) -> (PlaybackProgressTicker, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let ticker = PlaybackProgressTicker::new(
            Handle::current(),
            Duration::from_millis(1000),
            provider,
            Arc::new(move |progress: PlaybackProgress| sink_seen.lock().push(progress.position_ms)),
        );
        (ticker, seen)
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_runs_one_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider_calls = calls.clone();
        let (ticker, seen) = counting_ticker(Arc::new(move || -> Result<Option<PlaybackProgress>, ProgressError> {
            let n = provider_calls.fetch_add(1, Ordering::SeqCst) as u64;
            Ok(Some(progress(n * 1000)))
        }));

        ticker.start();
        ticker.start();
        assert!(ticker.is_running());
        advance(3500).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*seen.lock(), vec![0, 1000, 2000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_halts_sampling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider_calls = calls.clone();
        let (ticker, _seen) = counting_ticker(Arc::new(move || -> Result<Option<PlaybackProgress>, ProgressError> {
            provider_calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }));

        ticker.stop();
        ticker.start();
        advance(1500).await;
        ticker.stop();
        ticker.stop();
        advance(5000).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!ticker.is_running());

        ticker.start();
        advance(1100).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_faulty_provider_does_not_kill_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider_calls = calls.clone();
        let (ticker, seen) = counting_ticker(Arc::new(move || -> Result<Option<PlaybackProgress>, ProgressError> {
            match provider_calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err("decoder gone".into()),
                1 => panic!("position query failed"),
                _ => Ok(Some(progress(42))),
            }
        }));

        ticker.start();
        advance(3500).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*seen.lock(), vec![42]);
        assert!(ticker.is_running());
    }
}
