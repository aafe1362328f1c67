//! Player collaborator interfaces.
//!
//! The coordinator never decodes anything itself. It drives up to two players obtained from a
//! [`PlayerPool`]: one in the active role and, when the policy allows, one holding the next
//! item. Players report asynchronous state changes through the [`PlayerEventSink`] they were
//! created with.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::media::MediaDescriptor;
use crate::surface::RenderSurface;

/// Identity of a player inside one coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlayerId(pub u32);

/// Where a player should read media from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// A complete file in the media cache.
    Local(PathBuf),
    Remote {
        uri: String,
        headers: BTreeMap<String, String>,
    },
}

impl MediaSource {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

/// Failure reported by a player.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{category} error {code}")]
pub struct PlayerError {
    pub category: String,
    pub code: i64,
    pub message: Option<String>,
}

impl PlayerError {
    pub fn new(category: impl Into<String>, code: i64) -> Self {
        Self {
            category: category.into(),
            code,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Asynchronous player state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// Playback stalled waiting for data.
    Buffering,
    /// Playback is progressing (again).
    Playing,
    FirstFrameRendered,
    Ended,
    Error(PlayerError),
}

/// Position snapshot of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerPosition {
    pub position_ms: u64,
    pub duration_ms: Option<u64>,
    pub is_playing: bool,
}

/// Channel a player uses to report [`PlayerEvent`]s back to its coordinator.
#[derive(Debug, Clone)]
pub struct PlayerEventSink {
    player: PlayerId,
    tx: mpsc::UnboundedSender<(PlayerId, PlayerEvent)>,
}

impl PlayerEventSink {
    pub(crate) fn new(player: PlayerId, tx: mpsc::UnboundedSender<(PlayerId, PlayerEvent)>) -> Self {
        Self { player, tx }
    }

    pub fn player(&self) -> PlayerId {
        self.player
    }

    /// Returns `false` once the coordinator has been released.
    pub fn emit(&self, event: PlayerEvent) -> bool {
        self.tx.send((self.player, event)).is_ok()
    }
}

#[async_trait]
pub trait MediaPlayer: Send + Sync {
    /// Load `source` for the item at `index` and resolve once the first frame can be shown.
    ///
    /// A later `prepare` or `stop` on the same player may resolve an earlier call either way;
    /// the coordinator discards results it no longer waits for.
    async fn prepare(
        &self,
        index: usize,
        descriptor: &MediaDescriptor,
        source: MediaSource,
    ) -> Result<(), PlayerError>;

    fn play(&self);

    fn pause(&self);

    fn stop(&self);

    fn seek(&self, position_ms: u64);

    fn current_position(&self) -> Option<PlayerPosition>;

    fn attach_surface(&self, surface: Arc<dyn RenderSurface>);

    fn detach_surface(&self);

    /// Prime a prepared, not yet visible player (mute, decode the first frame).
    fn preroll(&self) {}
}

/// Creates the players a coordinator drives.
pub trait PlayerPool: Send + Sync {
    fn create_player(&self, id: PlayerId, events: PlayerEventSink) -> Arc<dyn MediaPlayer>;
}
