//! # Open Voice
//!
//! Supervised audio streaming core for Discord-style voice bots.
//!
//! The crate takes an already-resolved stream locator, decodes it to PCM
//! through a managed ffmpeg subprocess, encodes fixed-duration Opus frames
//! and paces them into a live voice transport, restarting transparently on
//! recoverable failures. A per-guild playback queue sequences items and
//! advances on its own.
//!
//! What this crate deliberately does NOT do: resolve user queries into
//! locators, parse chat commands, format user-facing messages or talk to a
//! concrete gateway. The voice channel lives behind the
//! [`transport::VoiceTransport`] trait and the resolver stays on the caller's
//! side of [`audio::queue::QueueItem`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use open_voice::{Config, GuildId, PlaybackDriver, QueueItem, SessionRegistry, UserId};
//!
//! # async fn example(provider: &dyn open_voice::TransportProvider) -> anyhow::Result<()> {
//! let config = Arc::new(Config::load()?);
//! let registry = Arc::new(SessionRegistry::new());
//! let driver = PlaybackDriver::new(config.clone(), registry.clone());
//!
//! // Barrido de sesiones inactivas en segundo plano
//! let (_reaper, _reaper_cancel) = registry.spawn_idle_reaper(config.clone());
//!
//! let item = QueueItem::new("https://cdn.example/audio.opus", "Mi canción", UserId(42));
//! driver.enqueue(GuildId(1), item, provider).await?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod ids;
pub mod registry;
pub mod transport;

pub use audio::encoder::FrameEncoder;
pub use audio::pipeline::{Stage, StreamPipeline};
pub use audio::player::PlaybackDriver;
pub use audio::queue::{QueueItem, QueuePage, QueueSnapshot, TrackMetadata};
pub use audio::session::{GuildSession, PlaybackPhase};
pub use config::Config;
pub use error::{QueueError, StreamError};
pub use ids::{GuildId, UserId};
pub use registry::SessionRegistry;
pub use transport::{
    ChannelTransport, FrameSendError, OpusFrame, TransportProvider, VoiceTransport,
};
