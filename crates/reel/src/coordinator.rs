//! The playback coordinator.
//!
//! [`PlaybackCoordinator`] is the only stateful entry point the UI layer talks to. It owns the
//! feed list, the active cursor, up to two players (active and prepared-next), the surface
//! bindings and the disk prefetch bookkeeping, and turns feed mutations, scroll signals, surface
//! lifecycle and app lifecycle into player commands, cache downloads and telemetry.
//!
//! All public methods are synchronous and cheap: they update state under one lock and spawn
//! whatever asynchronous work follows on the runtime captured at construction. Results of that
//! work (player prepares, downloads, player events) re-enter through the same lock and are
//! discarded when they no longer match the state that requested them.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alignment::{self, FeedAlignmentPlan, FeedMutation};
use crate::cache::{AssetCache, AssetLease, FetchHandle, FetchedAsset};
use crate::config::{CoordinatorConfig, PreloadPolicy};
use crate::error::{Error, FetchError, Result};
use crate::hint::ScrollHintTracker;
use crate::media::MediaDescriptor;
use crate::player::{
    MediaPlayer, MediaSource, PlayerError, PlayerEvent, PlayerEventSink, PlayerId, PlayerPool,
};
use crate::prefetch::{DiskPrefetchTracker, DiskTarget, PrefetchOrigin};
use crate::reporter::{NoopReporter, PlaybackEventReporter, PlaybackProgress};
use crate::slot::{PrepareTicket, PreparedSlotScheduler};
use crate::surface::{RenderSurface, SurfaceRegistry};
use crate::ticker::{PlaybackProgressTicker, ProgressError, ProgressProvider, ProgressSink};
use crate::window::compute_window;

const ACTIVE_PLAYER: PlayerId = PlayerId(0);
const PREPARED_PLAYER: PlayerId = PlayerId(1);

/// External collaborators of a coordinator.
pub struct CoordinatorDeps {
    pub players: Arc<dyn PlayerPool>,
    pub cache: AssetCache,
    pub reporter: Arc<dyn PlaybackEventReporter>,
}

impl CoordinatorDeps {
    pub fn new(players: Arc<dyn PlayerPool>, cache: AssetCache) -> Self {
        Self {
            players,
            cache,
            reporter: Arc::new(NoopReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn PlaybackEventReporter>) -> Self {
        self.reporter = reporter;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    Loading,
    Ready,
    Failed,
}

/// What a player currently holds.
#[derive(Debug)]
struct SlotContent {
    index: usize,
    id: String,
    state: LoadState,
    first_frame: bool,
}

struct PlayerSlot {
    id: PlayerId,
    player: Arc<dyn MediaPlayer>,
    content: Option<SlotContent>,
    /// Bumped on every load; prepare results carry the value they were started with.
    load: u64,
    /// Feed index and surface id the player renders into.
    attached: Option<(usize, u64)>,
    ticket: Option<PrepareTicket>,
    lease: Option<AssetLease>,
}

impl PlayerSlot {
    fn new(id: PlayerId, player: Arc<dyn MediaPlayer>) -> Self {
        Self {
            id,
            player,
            content: None,
            load: 0,
            attached: None,
            ticket: None,
            lease: None,
        }
    }

    fn index(&self) -> Option<usize> {
        self.content.as_ref().map(|content| content.index)
    }

    fn holds(&self, index: usize, id: &str) -> bool {
        self.content
            .as_ref()
            .is_some_and(|content| content.index == index && content.id == id)
    }

    /// Holds `index` and has not failed.
    fn holds_usable(&self, index: usize, id: &str) -> bool {
        self.holds(index, id)
            && self
                .content
                .as_ref()
                .is_some_and(|content| content.state != LoadState::Failed)
    }

    fn is_ready(&self) -> bool {
        self.content
            .as_ref()
            .is_some_and(|content| content.state == LoadState::Ready)
    }

    fn attach(&mut self, index: usize, surface: Arc<dyn RenderSurface>) {
        let surface_id = surface.surface_id();
        if self.attached == Some((index, surface_id)) {
            return;
        }
        if self.attached.is_some() {
            self.player.detach_surface();
        }
        self.player.attach_surface(surface);
        self.attached = Some((index, surface_id));
    }

    /// Attach to the surface bound for the held index, if there is one.
    fn attach_bound(&mut self, surfaces: &mut SurfaceRegistry) {
        let Some(index) = self.index() else {
            return;
        };
        match surfaces.get(index) {
            Some(surface) => self.attach(index, surface),
            None => self.detach(),
        }
    }

    fn detach(&mut self) {
        if self.attached.take().is_some() {
            self.player.detach_surface();
        }
    }

    /// Stop the player and forget its content. Pending prepares become stale.
    fn unload(&mut self) {
        self.load += 1;
        self.detach();
        self.content = None;
        self.ticket = None;
        self.lease = None;
        self.player.stop();
    }
}

/// Per play-start telemetry of the active item.
#[derive(Debug)]
struct PlaySession {
    id: String,
    index: usize,
    requested_at: Instant,
    first_frame: bool,
    rebuffer_since: Option<Instant>,
    rebuffer_total: Duration,
}

impl PlaySession {
    fn new(item: &MediaDescriptor, index: usize) -> Self {
        Self {
            id: item.id.clone(),
            index,
            requested_at: Instant::now(),
            first_frame: false,
            rebuffer_since: None,
            rebuffer_total: Duration::ZERO,
        }
    }

    fn matches(&self, content: &SlotContent) -> bool {
        self.index == content.index && self.id == content.id
    }

    /// Reports first frame and time to first frame once per play start.
    fn first_frame(&mut self, reporter: &dyn PlaybackEventReporter) {
        if self.first_frame {
            return;
        }
        self.first_frame = true;
        let ttff = self.requested_at.elapsed().as_millis() as u64;
        debug!(id = %self.id, index = self.index, ttff_ms = ttff, "first frame rendered");
        reporter.first_frame_rendered(&self.id, self.index);
        reporter.time_to_first_frame(&self.id, self.index, ttff);
    }
}

struct State {
    feed: Vec<MediaDescriptor>,
    active_index: Option<usize>,
    last_hint: Option<usize>,
    scroll: ScrollHintTracker,
    active: PlayerSlot,
    prepared: Option<PlayerSlot>,
    scheduler: PreparedSlotScheduler,
    disk: DiskPrefetchTracker,
    surfaces: SurfaceRegistry,
    session: Option<PlaySession>,
    foreground: bool,
    released: bool,
}

impl State {
    fn feed_ids(&self) -> Vec<String> {
        self.feed.iter().map(|item| item.id.clone()).collect()
    }
}

struct Inner {
    this: Weak<Inner>,
    policy: PreloadPolicy,
    config: CoordinatorConfig,
    runtime: Handle,
    cache: AssetCache,
    reporter: Arc<dyn PlaybackEventReporter>,
    ticker: PlaybackProgressTicker,
    shutdown: CancellationToken,
    state: Mutex<State>,
}

/// Coordinates playback and prefetch for one feed screen.
///
/// Must be created inside a Tokio runtime. Dropping the coordinator releases it.
pub struct PlaybackCoordinator {
    inner: Arc<Inner>,
}

impl PlaybackCoordinator {
    pub fn new(
        policy: PreloadPolicy,
        config: CoordinatorConfig,
        deps: CoordinatorDeps,
    ) -> Result<Self> {
        policy.validate()?;
        if config.progress_interval.is_zero() {
            return Err(Error::configuration("progress_interval must be non-zero"));
        }
        let runtime = Handle::try_current().map_err(|_| {
            Error::configuration("PlaybackCoordinator must be created within a Tokio runtime")
        })?;

        let CoordinatorDeps {
            players,
            cache,
            reporter,
        } = deps;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let active = PlayerSlot::new(
            ACTIVE_PLAYER,
            players.create_player(
                ACTIVE_PLAYER,
                PlayerEventSink::new(ACTIVE_PLAYER, events_tx.clone()),
            ),
        );
        let prepared = policy.use_prepared_next_player.then(|| {
            PlayerSlot::new(
                PREPARED_PLAYER,
                players.create_player(
                    PREPARED_PLAYER,
                    PlayerEventSink::new(PREPARED_PLAYER, events_tx.clone()),
                ),
            )
        });

        let state = State {
            feed: Vec::new(),
            active_index: None,
            last_hint: None,
            scroll: ScrollHintTracker::new(config.scroll_hint_threshold),
            active,
            scheduler: PreparedSlotScheduler::new(
                prepared.is_some() && policy.prepared_next > 0,
                reporter.clone(),
            ),
            prepared,
            disk: DiskPrefetchTracker::new(policy.clone(), reporter.clone()),
            surfaces: SurfaceRegistry::new(),
            session: None,
            foreground: true,
            released: false,
        };

        let inner = Arc::new_cyclic(|this: &Weak<Inner>| {
            let source = this.clone();
            let provider: ProgressProvider = Arc::new(move || {
                Ok::<_, ProgressError>(source.upgrade().and_then(|inner| inner.sample_progress()))
            });
            let sink_reporter = reporter.clone();
            let sink: ProgressSink = Arc::new(move |progress: PlaybackProgress| {
                sink_reporter.playback_progress(progress)
            });

            Inner {
                this: this.clone(),
                ticker: PlaybackProgressTicker::new(
                    runtime.clone(),
                    config.progress_interval,
                    provider,
                    sink,
                ),
                policy,
                config,
                runtime,
                cache,
                reporter,
                shutdown: CancellationToken::new(),
                state: Mutex::new(state),
            }
        });
        inner.spawn_event_pump(events_rx);

        info!(
            prepared_player = inner.policy.use_prepared_next_player,
            disk_prefetch_next = inner.policy.disk_prefetch_next,
            "playback coordinator created"
        );
        Ok(Self { inner })
    }

    /// Replace the whole feed. Alignment treats this as a cold start.
    pub fn set_feed(&self, items: Vec<MediaDescriptor>) {
        self.inner.set_feed(items);
    }

    /// Append a page to the feed. Ids already present are dropped.
    pub fn append_feed(&self, items: Vec<MediaDescriptor>) {
        self.inner.append_feed(items);
    }

    /// Apply an arbitrary new version of the feed, diffed against the current one.
    pub fn update_feed(&self, items: Vec<MediaDescriptor>) {
        self.inner.update_feed(items);
    }

    /// Commit the page the pager settled on.
    pub fn set_active_index(&self, index: usize) {
        self.inner.set_active_index(index);
    }

    /// Warm the disk tier around a predicted index before the pager settles.
    pub fn set_scroll_hint(&self, predicted_index: usize, velocity: Option<f32>) {
        self.inner.set_scroll_hint(predicted_index, velocity);
    }

    /// Report the pager's offset from the active page as a fraction of a page.
    ///
    /// Crossing the configured threshold is turned into a scroll hint for the neighbour.
    pub fn on_scroll_offset(&self, offset: f32) {
        self.inner.on_scroll_offset(offset);
    }

    pub fn bind_surface(&self, index: usize, surface: Arc<dyn RenderSurface>) {
        self.inner.bind_surface(index, surface);
    }

    pub fn unbind_surface(&self, index: usize) {
        self.inner.unbind_surface(index);
    }

    pub fn on_app_foreground(&self) {
        self.inner.on_app_foreground();
    }

    pub fn on_app_background(&self) {
        self.inner.on_app_background();
    }

    /// Stop everything. Later calls are ignored.
    pub fn release(&self) {
        self.inner.release();
    }

    pub fn active_index(&self) -> Option<usize> {
        self.inner.state.lock().active_index
    }

    pub fn feed_len(&self) -> usize {
        self.inner.state.lock().feed.len()
    }

    /// Index held by the prepared player, if any.
    pub fn prepared_index(&self) -> Option<usize> {
        self.inner
            .state
            .lock()
            .prepared
            .as_ref()
            .and_then(PlayerSlot::index)
    }

    /// Index the active player holds.
    pub fn active_player_index(&self) -> Option<usize> {
        self.inner.state.lock().active.index()
    }

    pub fn pending_prefetch_count(&self) -> usize {
        self.inner.state.lock().disk.pending_count()
    }

    pub fn is_foreground(&self) -> bool {
        self.inner.state.lock().foreground
    }

    pub fn is_released(&self) -> bool {
        self.inner.state.lock().released
    }

    pub fn is_ticking(&self) -> bool {
        self.inner.ticker.is_running()
    }

    pub fn cache(&self) -> &AssetCache {
        &self.inner.cache
    }
}

impl Drop for PlaybackCoordinator {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl Inner {
    fn spawn_event_pump(&self, mut events: mpsc::UnboundedReceiver<(PlayerId, PlayerEvent)>) {
        let this = self.this.clone();
        let shutdown = self.shutdown.clone();
        self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => {
                        let Some((player, event)) = event else {
                            break;
                        };
                        let Some(inner) = this.upgrade() else {
                            break;
                        };
                        inner.on_player_event(player, event);
                    }
                }
            }
            debug!("player event pump stopped");
        });
    }

    fn set_feed(&self, items: Vec<MediaDescriptor>) {
        let items = dedupe(items);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.released {
            warn!("set_feed called after release");
            return;
        }
        info!(items = items.len(), "feed replaced");
        self.apply_feed(state, items, &[], PrefetchOrigin::Reset);
    }

    fn append_feed(&self, items: Vec<MediaDescriptor>) {
        if items.is_empty() {
            debug!("ignoring empty feed page");
            return;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.released {
            warn!("append_feed called after release");
            return;
        }

        let previous = state.feed_ids();
        let mut known: HashSet<String> = previous.iter().cloned().collect();
        let mut combined = state.feed.clone();
        for item in items {
            if known.insert(item.id.clone()) {
                combined.push(item);
            } else {
                warn!(id = %item.id, "dropping duplicate feed item");
            }
        }
        if combined.len() == previous.len() {
            return;
        }
        debug!(added = combined.len() - previous.len(), "feed page appended");
        self.apply_feed(state, combined, &previous, PrefetchOrigin::Active);
    }

    fn update_feed(&self, items: Vec<MediaDescriptor>) {
        let items = dedupe(items);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.released {
            warn!("update_feed called after release");
            return;
        }

        let previous = state.feed_ids();
        let current: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
        match FeedMutation::classify(&previous, &current) {
            FeedMutation::Unchanged => {
                state.feed = items;
            }
            FeedMutation::Append { added } => {
                debug!(added, "feed update is an append");
                self.apply_feed(state, items, &previous, PrefetchOrigin::Active);
            }
            FeedMutation::Replace => {
                info!(
                    previous = previous.len(),
                    current = current.len(),
                    "feed reshaped"
                );
                self.apply_feed(state, items, &previous, PrefetchOrigin::Reset);
            }
        }
    }

    fn apply_feed(
        &self,
        state: &mut State,
        items: Vec<MediaDescriptor>,
        previous: &[String],
        origin: PrefetchOrigin,
    ) {
        let current: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
        let plan = alignment::plan(
            previous,
            &current,
            state.active_index,
            state.active.index(),
            state.prepared.as_ref().and_then(PlayerSlot::index),
        );
        state.feed = items;

        for target in state
            .disk
            .retain_feed(current.iter().map(String::as_str), "feed_update")
        {
            self.cache.cancel(&target.id);
        }

        self.apply_plan(state, plan, origin);
    }

    fn apply_plan(&self, state: &mut State, plan: FeedAlignmentPlan, origin: PrefetchOrigin) {
        if plan.clear_playback_state {
            info!("feed emptied, clearing playback state");
            self.clear_playback(state, "feed_update");
            return;
        }

        if let Some(index) = plan.invalidate_prepared_index {
            debug!(index, "prepared player holds stale content");
            state.scheduler.reset("feed_update");
            if let Some(prepared) = state.prepared.as_mut() {
                prepared.unload();
            }
        }

        match plan.next_active_index {
            Some(index) => self.activate(state, index, "feed_update", origin),
            None => self.refresh_window(state, origin),
        }
    }

    fn clear_playback(&self, state: &mut State, reason: &str) {
        self.ticker.stop();
        state.scheduler.reset(reason);
        for target in state.disk.reset(reason) {
            self.cache.cancel(&target.id);
        }
        state.active.unload();
        if let Some(prepared) = state.prepared.as_mut() {
            prepared.unload();
        }
        state.active_index = None;
        state.last_hint = None;
        state.scroll.reset();
        state.session = None;
    }

    fn set_active_index(&self, index: usize) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.released {
            warn!(index, "set_active_index called after release");
            return;
        }
        if index >= state.feed.len() {
            warn!(index, items = state.feed.len(), "active index out of range");
            return;
        }
        if state.active_index == Some(index) {
            return;
        }
        self.activate(state, index, "scroll", PrefetchOrigin::Active);
    }

    /// Make `index` the active item and realign everything around it.
    ///
    /// If the active player already holds that item only surfaces and playback are re-asserted.
    fn activate(&self, state: &mut State, index: usize, reason: &str, origin: PrefetchOrigin) {
        let Some(item) = state.feed.get(index).cloned() else {
            return;
        };
        state.active_index = Some(index);
        state.last_hint = None;
        state.scroll.reset();

        let new_content = !state.active.holds_usable(index, &item.id);
        if new_content {
            info!(id = %item.id, index, reason, "activating feed item");
            self.reporter.impression(&item.id, index);
            self.reporter.play_start_request(&item.id, index, reason);
            state.session = Some(PlaySession::new(&item, index));
            self.rotate_in(state, index, &item);
        }

        state.active.attach_bound(&mut state.surfaces);
        if state.foreground && state.active.is_ready() {
            state.active.player.play();
        }
        if state.foreground && state.surfaces.is_bound(index) {
            if new_content {
                self.ticker.restart();
            } else {
                self.ticker.start();
            }
        } else {
            self.ticker.stop();
        }

        self.refresh_window(state, origin);
    }

    /// Put `item` into the active player, reusing the prepared player when it can.
    fn rotate_in(&self, state: &mut State, index: usize, item: &MediaDescriptor) {
        let Some(prepared) = state.prepared.as_mut() else {
            self.load_slot(&mut state.active, index, item, None);
            return;
        };

        if prepared.holds_usable(index, &item.id) {
            std::mem::swap(&mut state.active, prepared);
            state.scheduler.clear_on_swap();
            state.active.ticket = None;
            prepared.player.pause();
            prepared.detach();
            debug!(index, ready = state.active.is_ready(), "prepared player swapped in");

            let rendered = state
                .active
                .content
                .as_ref()
                .is_some_and(|content| content.first_frame);
            if rendered && let Some(session) = state.session.as_mut() {
                session.first_frame(self.reporter.as_ref());
            }
            return;
        }

        // Scrolling back: the active player already holds the new next item.
        let keeps_next = state
            .feed
            .get(index + 1)
            .is_some_and(|next| state.active.holds_usable(index + 1, &next.id));
        if keeps_next {
            state.scheduler.reset("superseded");
            std::mem::swap(&mut state.active, prepared);
            prepared.ticket = None;
            prepared.player.pause();
            debug!(index, "active player kept as prepared next");
        }
        self.load_slot(&mut state.active, index, item, None);
    }

    /// Recompute the window around the active index and realize both tiers.
    fn refresh_window(&self, state: &mut State, origin: PrefetchOrigin) {
        let Some(active) = state.active_index else {
            return;
        };
        let item_count = state.feed.len();
        let window = compute_window(active, item_count, &self.policy);
        let feed = &state.feed;
        let id_at = |index: usize| feed.get(index).map(|item| item.id.as_str());

        if let Some(prepared) = state.prepared.as_mut() {
            let next = active + 1;
            let wanted = window.prepared.contains(&next)
                && feed
                    .get(next)
                    .is_some_and(|item| !prepared.holds(next, &item.id));
            if wanted {
                state.scheduler.schedule(active, item_count, id_at, |ticket| {
                    if let Some(item) = feed.get(ticket.index) {
                        self.load_slot(prepared, ticket.index, item, Some(ticket));
                    }
                });
            } else if !window.prepared.contains(&next)
                && state.scheduler.pending_index().is_some()
            {
                state.scheduler.reset("window_shift");
                prepared.unload();
            }
        }

        let delta = state.disk.update(active, item_count, id_at, origin);
        for target in &delta.to_cancel {
            self.cache.cancel(&target.id);
        }
        self.start_disk_prefetches(feed, &mut state.disk, delta.to_start);
    }

    /// Load `item` into `slot` and spawn the prepare.
    fn load_slot(
        &self,
        slot: &mut PlayerSlot,
        index: usize,
        item: &MediaDescriptor,
        ticket: Option<PrepareTicket>,
    ) {
        slot.detach();
        slot.load += 1;
        slot.ticket = ticket;
        slot.content = Some(SlotContent {
            index,
            id: item.id.clone(),
            state: LoadState::Loading,
            first_frame: false,
        });

        let source = match self.cache.lease(&item.id) {
            Some(lease) => {
                self.reporter.cache_hit(&item.id, lease.bytes());
                let source = MediaSource::Local(lease.path().to_path_buf());
                slot.lease = Some(lease);
                source
            }
            None => {
                self.reporter.cache_miss(&item.id);
                slot.lease = None;
                MediaSource::Remote {
                    uri: item.uri.clone(),
                    headers: item.headers.clone(),
                }
            }
        };
        debug!(
            id = %item.id,
            index,
            player = slot.id.0,
            local = source.is_local(),
            "preparing player"
        );

        let this = self.this.clone();
        let player = slot.player.clone();
        let player_id = slot.id;
        let load = slot.load;
        let descriptor = item.clone();
        self.runtime.spawn(async move {
            let result = player.prepare(index, &descriptor, source).await;
            if let Some(inner) = this.upgrade() {
                inner.on_prepared(player_id, load, result);
            }
        });
    }

    fn on_prepared(&self, player_id: PlayerId, load: u64, result: std::result::Result<(), PlayerError>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.released {
            return;
        }

        let is_active = state.active.id == player_id;
        let slot = if is_active {
            &mut state.active
        } else {
            match state.prepared.as_mut() {
                Some(prepared) if prepared.id == player_id => prepared,
                _ => return,
            }
        };
        if slot.load != load {
            debug!(player = player_id.0, "discarding stale prepare result");
            return;
        }
        let Some(content) = slot.content.as_mut() else {
            return;
        };
        let (index, id) = (content.index, content.id.clone());

        match result {
            Ok(()) => {
                content.state = LoadState::Ready;
                debug!(%id, index, active = is_active, "player prepared");
                slot.attach_bound(&mut state.surfaces);
                if is_active {
                    if state.foreground {
                        slot.player.play();
                    }
                } else if let Some(ticket) = slot.ticket.take() {
                    let player = slot.player.clone();
                    state
                        .scheduler
                        .mark_ready(ticket, Instant::now(), || player.preroll());
                }
            }
            Err(error) => {
                content.state = LoadState::Failed;
                warn!(%id, index, active = is_active, %error, "player prepare failed");
                if is_active {
                    self.reporter.playback_error(
                        &id,
                        index,
                        &error.category,
                        error.code,
                        error.message.as_deref(),
                    );
                } else if let Some(ticket) = slot.ticket.take() {
                    state.scheduler.mark_error(ticket, "error");
                }
            }
        }
    }

    fn on_player_event(&self, player_id: PlayerId, event: PlayerEvent) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.released {
            return;
        }

        if state.active.id != player_id {
            let Some(prepared) = state.prepared.as_mut().filter(|slot| slot.id == player_id)
            else {
                return;
            };
            let Some(content) = prepared.content.as_mut() else {
                return;
            };
            match event {
                PlayerEvent::FirstFrameRendered => content.first_frame = true,
                PlayerEvent::Error(error) => {
                    content.state = LoadState::Failed;
                    warn!(id = %content.id, index = content.index, %error, "prepared player failed");
                    if let Some(ticket) = prepared.ticket.take() {
                        state.scheduler.mark_error(ticket, "error");
                    }
                }
                _ => {}
            }
            return;
        }

        let slot = &mut state.active;
        let Some(content) = slot.content.as_mut() else {
            return;
        };
        let session = state
            .session
            .as_mut()
            .filter(|session| session.matches(content));
        let (index, id) = (content.index, content.id.clone());
        let id = id.as_str();

        match event {
            PlayerEvent::Buffering => {
                if let Some(session) = session
                    && session.first_frame
                    && session.rebuffer_since.is_none()
                {
                    session.rebuffer_since = Some(Instant::now());
                    self.reporter.rebuffer_start(id, index, "buffering");
                }
            }
            PlayerEvent::Playing => {
                if let Some(session) = session
                    && let Some(since) = session.rebuffer_since.take()
                {
                    session.rebuffer_total += since.elapsed();
                    self.reporter.rebuffer_end(id, index, "resumed");
                    self.reporter.rebuffer_total(
                        id,
                        index,
                        session.rebuffer_total.as_millis() as u64,
                    );
                }
            }
            PlayerEvent::FirstFrameRendered => {
                content.first_frame = true;
                if let Some(session) = session {
                    session.first_frame(self.reporter.as_ref());
                }
            }
            PlayerEvent::Ended => {
                self.reporter.playback_ended(id, index);
                if self.config.loop_playback && state.foreground {
                    debug!(id, index, "looping playback");
                    slot.player.seek(0);
                    slot.player.play();
                }
            }
            PlayerEvent::Error(error) => {
                content.state = LoadState::Failed;
                if let Some(session) = session {
                    session.rebuffer_since = None;
                }
                warn!(id, index, %error, "playback error");
                self.reporter.playback_error(
                    id,
                    index,
                    &error.category,
                    error.code,
                    error.message.as_deref(),
                );
            }
        }
    }

    fn set_scroll_hint(&self, predicted_index: usize, velocity: Option<f32>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.released {
            return;
        }
        self.apply_hint(state, predicted_index, velocity);
    }

    fn on_scroll_offset(&self, offset: f32) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.released {
            return;
        }
        let Some(current) = state.active_index else {
            return;
        };
        if let Some(predicted) = state.scroll.observe(current, offset) {
            self.apply_hint(state, predicted, None);
        }
    }

    fn apply_hint(&self, state: &mut State, predicted_index: usize, velocity: Option<f32>) {
        if predicted_index >= state.feed.len() {
            return;
        }
        if state.last_hint == Some(predicted_index) {
            return;
        }
        state.last_hint = Some(predicted_index);
        debug!(predicted_index, ?velocity, "scroll hint");

        let feed = &state.feed;
        let delta = state.disk.update(
            predicted_index,
            feed.len(),
            |index| feed.get(index).map(|item| item.id.as_str()),
            PrefetchOrigin::Hint,
        );
        self.start_disk_prefetches(feed, &mut state.disk, delta.to_start);
    }

    fn start_disk_prefetches(
        &self,
        feed: &[MediaDescriptor],
        disk: &mut DiskPrefetchTracker,
        targets: Vec<DiskTarget>,
    ) {
        for target in targets {
            let Some(item) = feed.get(target.index) else {
                continue;
            };
            let handle = self.cache.begin(item);
            if handle.is_ready() {
                let bytes = self.cache.cached_size(&item.id).unwrap_or_default();
                self.reporter
                    .preload_completed(&item.id, target.index, bytes, 0, true);
                disk.mark_completed(&item.id);
                continue;
            }
            self.spawn_disk_watch(target, handle);
        }
    }

    /// Follow one download: report it once primed or finished, whichever comes first.
    fn spawn_disk_watch(&self, target: DiskTarget, handle: FetchHandle) {
        let this = self.this.clone();
        let shutdown = self.shutdown.clone();
        let primed_at = self.policy.preload_target_bytes;
        let mut progress = handle.progress();

        self.runtime.spawn(async move {
            let started = Instant::now();
            let wait = handle.wait();
            tokio::pin!(wait);
            let mut watching = progress.is_some();
            let mut reported = false;

            let result = loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    result = &mut wait => break result,
                    bytes = next_progress(&mut progress), if watching => match bytes {
                        Some(bytes) if bytes >= primed_at => {
                            watching = false;
                            if let Some(inner) = this.upgrade() {
                                reported = inner.on_disk_primed(&target, bytes, started.elapsed());
                            }
                        }
                        Some(_) => {}
                        None => watching = false,
                    },
                }
            };

            if let Some(inner) = this.upgrade() {
                inner.on_disk_finished(&target, result, reported, started.elapsed());
            }
        });
    }

    fn on_disk_primed(&self, target: &DiskTarget, bytes: u64, elapsed: Duration) -> bool {
        let mut state = self.state.lock();
        if state.released {
            return false;
        }
        let Some(current) = state.disk.mark_primed(&target.id) else {
            return false;
        };
        debug!(id = %current.id, index = current.index, bytes, "disk prefetch primed");
        self.reporter.preload_completed(
            &current.id,
            current.index,
            bytes,
            elapsed.as_millis() as u64,
            false,
        );
        true
    }

    fn on_disk_finished(
        &self,
        target: &DiskTarget,
        result: std::result::Result<FetchedAsset, FetchError>,
        reported: bool,
        elapsed: Duration,
    ) {
        let mut state = self.state.lock();
        if state.released {
            return;
        }

        match result {
            Ok(asset) => {
                if reported {
                    if state.disk.is_warming(&target.id) {
                        state.disk.mark_completed(&target.id);
                    }
                    return;
                }
                if let Some(current) = state.disk.mark_completed(&target.id) {
                    self.reporter.preload_completed(
                        &current.id,
                        current.index,
                        asset.bytes,
                        elapsed.as_millis() as u64,
                        asset.from_cache,
                    );
                }
            }
            Err(error) if error.is_cancelled() => {
                if reported {
                    state.disk.forget(&target.id);
                } else if let Some(current) = state.disk.mark_failed(&target.id) {
                    self.reporter
                        .preload_canceled(&current.id, current.index, "cancelled");
                }
            }
            Err(error) => {
                warn!(id = %target.id, %error, "disk prefetch failed");
                if reported {
                    state.disk.forget(&target.id);
                } else if let Some(current) = state.disk.mark_failed(&target.id) {
                    self.reporter
                        .preload_canceled(&current.id, current.index, "error");
                }
            }
        }
    }

    fn bind_surface(&self, index: usize, surface: Arc<dyn RenderSurface>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.released {
            return;
        }
        if !state.surfaces.bind(index, &surface) {
            return;
        }
        debug!(index, surface = surface.surface_id(), "surface bound");

        if state.active.index() == Some(index) {
            state.active.attach(index, surface.clone());
        }
        if let Some(prepared) = state.prepared.as_mut()
            && prepared.index() == Some(index)
        {
            prepared.attach(index, surface);
        }

        if state.active_index == Some(index) && state.foreground {
            if state.active.is_ready() {
                state.active.player.play();
            }
            self.ticker.start();
        }
    }

    fn unbind_surface(&self, index: usize) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.surfaces.unbind(index) {
            return;
        }
        debug!(index, "surface unbound");
        for slot in std::iter::once(&mut state.active).chain(state.prepared.as_mut()) {
            if slot.attached.is_some_and(|(attached, _)| attached == index) {
                slot.detach();
            }
        }
    }

    fn on_app_foreground(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.released || state.foreground {
            return;
        }
        state.foreground = true;
        info!("app foregrounded");

        let Some(index) = state.active_index else {
            return;
        };
        if state.active.is_ready() {
            state.active.player.play();
        }
        if state.surfaces.is_bound(index) {
            self.ticker.start();
        }
    }

    fn on_app_background(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.released || !state.foreground {
            return;
        }
        state.foreground = false;
        info!("app backgrounded");

        self.ticker.stop();
        state.active.player.pause();
        if let Some(prepared) = state.prepared.as_ref() {
            prepared.player.pause();
        }
    }

    fn release(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.released {
            return;
        }
        state.released = true;

        self.clear_playback(state, "release");
        state.surfaces.clear();
        state.feed.clear();
        self.shutdown.cancel();
        info!("playback coordinator released");
    }

    /// Progress of the active item, when it is visibly playing.
    fn sample_progress(&self) -> Option<PlaybackProgress> {
        let state = self.state.lock();
        if state.released || !state.foreground || !state.active.is_ready() {
            return None;
        }
        let content = state.active.content.as_ref()?;
        let position = state.active.player.current_position()?;
        if !position.is_playing {
            return None;
        }
        let duration_ms = position.duration_ms.filter(|duration| *duration > 0)?;
        Some(PlaybackProgress {
            id: content.id.clone(),
            index: content.index,
            position_ms: position.position_ms.min(duration_ms),
            duration_ms,
        })
    }
}

async fn next_progress(progress: &mut Option<watch::Receiver<u64>>) -> Option<u64> {
    let progress = progress.as_mut()?;
    progress.changed().await.ok()?;
    Some(*progress.borrow_and_update())
}

/// Drop repeated ids, keeping the first occurrence.
fn dedupe(items: Vec<MediaDescriptor>) -> Vec<MediaDescriptor> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| {
            let fresh = seen.insert(item.id.clone());
            if !fresh {
                warn!(id = %item.id, "dropping duplicate feed item");
            }
            fresh
        })
        .collect()
}
