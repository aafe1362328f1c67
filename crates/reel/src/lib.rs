//! # Reel Engine
//!
//! Playback coordination and media prefetch for vertically scrolling short-video feeds.
//!
//! The engine decides, as the user scrolls, which feed items get a prepared player, which only
//! get their bytes warmed in a bounded on-disk cache, and how stale prepared resources are
//! invalidated when the feed list mutates underneath the cursor.
//!
//! ## Features
//!
//! - Pure window and feed-alignment planning (`window`, `alignment`)
//! - Single pending prepare cycle with generation-checked completions (`slot`)
//! - Single-flight media downloads into a byte-budget LRU cache (`cache`)
//! - A cancellable progress sampler (`ticker`)
//! - The `PlaybackCoordinator` state machine driven by the UI layer
//!
//! Player, surface, transport and analytics concerns are consumed through narrow traits.
//!
//! ## Authors
//!
//! - hua0512
//!

pub mod alignment;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hint;
pub mod media;
pub mod player;
pub mod prefetch;
pub mod reporter;
pub mod slot;
pub mod surface;
pub mod ticker;
pub mod transport;
pub mod window;

pub use alignment::{FeedAlignmentPlan, FeedMutation};
pub use cache::{AssetCache, AssetLease, CacheStats, FetchHandle, FetchedAsset};
pub use config::{CacheConfig, CoordinatorConfig, FetchConfig, PreloadPolicy, RetryConfig};
pub use coordinator::{CoordinatorDeps, PlaybackCoordinator};
pub use error::{Error, FetchError, Result, TimeoutPhase};
pub use hint::{ScrollHintTracker, predicted_index_from_offset};
pub use media::{ContainerHint, MediaDescriptor};
pub use player::{
    MediaPlayer, MediaSource, PlayerError, PlayerEvent, PlayerEventSink, PlayerId, PlayerPool,
    PlayerPosition,
};
pub use reporter::{
    ChannelReporter, LoggingReporter, NoopReporter, PlaybackEvent, PlaybackEventReporter,
    PlaybackProgress,
};
pub use slot::{PrepareTicket, PreparedSlotScheduler};
pub use surface::{RenderSurface, SurfaceRegistry};
pub use ticker::PlaybackProgressTicker;
pub use transport::{HttpTransport, MediaResponse, MediaTransport};
pub use window::{PreloadWindow, compute_window};
