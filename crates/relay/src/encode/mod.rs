//! Encoder invocation modules for media-relay

pub mod args;
pub mod ffmpeg;

pub use args::{split_quoted, EncoderArgs};
pub use ffmpeg::{
    audio_cache_args, audio_stream_args, cover_args, gif_args, jpg_thumbnail_args, palette_args,
    palette_path, video_stream_args, PALETTE_SAMPLE_SECS,
};
