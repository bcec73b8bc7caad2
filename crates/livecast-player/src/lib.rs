//! Client playback core for livecast streams.
//!
//! Plays the `/stream` endpoint of a livecast server on a host platform
//! abstracted by [`MediaPlatform`]:
//!
//! - [`capability`]: decide between a decode buffer and native playback
//! - [`buffer`]: append into the decode buffer, recovering from quota errors
//!   and trimming played-back media
//! - [`fetch`]: read the long-lived stream response incrementally
//! - [`player`]: drive a session and publish its status
//!
//! ```no_run
//! use livecast_player::{MediaPlatform, Player, PlayerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn watch<P: MediaPlatform>(platform: P) {
//!     let player = Player::new(platform, PlayerConfig::new("http://localhost:8080/stream"));
//!     let status = player.run_with_retry(&CancellationToken::new()).await;
//!     println!("{}", status);
//! }
//! ```

pub mod buffer;
pub mod capability;
pub mod error;
pub mod fetch;
pub mod player;

#[cfg(test)]
mod testing;

pub use buffer::{BufferConfig, BufferManager, BufferStats, DecodeBuffer, TimeRange};
pub use capability::{
    default_codecs, select_path, Capabilities, CodecProfile, FallbackReason, PlaybackPath,
};
pub use error::{AppendError, PlayerError, Result};
pub use fetch::{ChunkSink, FetchOutcome, StreamFetch};
pub use player::{MediaPlatform, Player, PlayerConfig, PlayerStatus};
