//! Media Relay
//!
//! On-demand transcoding for a media file server: admission of transcode
//! requests, encoder process supervision, the lossless audio cache, video
//! thumbnails and cover art.

pub mod admission;
pub mod cache;
pub mod encode;
pub mod housekeeping;
pub mod policy;
pub mod relay;
pub mod server;
pub mod startup;
pub mod stream;
pub mod supervisor;
pub mod thumbnail;

#[cfg(all(test, unix))]
mod test_support;

pub use media_relay_config as config;
pub use media_relay_config::Config;
pub use admission::{
    admit, authorize, intent, AdmissionLimits, AdmissionRejection, ClientSignal, DisconnectFlag,
    Intent, TranscodeRequest,
};
pub use cache::{write_cache, CacheError, Validation};
pub use housekeeping::{extract_cover, CoverOutcome};
pub use policy::{audio_template, gradient_ladder, video_quality, GradientTier, MediaKind};
pub use relay::{new_shared_config, Outcome, Relay, RelayStatus, SharedConfig};
pub use server::{create_router, run_server, serve_listener, ServerError};
pub use startup::{parse_ffmpeg_version, run_startup_checks, EncoderInfo, StartupError};
pub use stream::ProcessStream;
pub use supervisor::{
    Invocation, ProcessKind, ProcessOutcome, ProcessTable, SpawnError, Supervisor,
};
pub use thumbnail::{generate_thumbnail, ThumbnailOutcome};
