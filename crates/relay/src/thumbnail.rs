//! Thumbnail gradient engine
//!
//! Produces `cache/videothumbnail/<base>.<jpg|gif>` for a video. JPG mode is a
//! single frame grab. GIF mode walks the gradient ladder, running the
//! palette stage then the paletted encode for each tier until one yields a
//! non-empty file. Encodes go to a claimed temp sibling that is renamed into
//! place, so the target only ever exists complete.

use crate::admission::extension_of;
use crate::config::Config;
use crate::encode::{gif_args, jpg_thumbnail_args, palette_args, palette_path};
use crate::housekeeping::{
    base_name, cache_dir, promote, remove_quietly, sweep_temp_files, sweep_zero_byte_gifs,
    temp_path_for, VIDEO_THUMBNAIL_DIR,
};
use crate::policy::{
    format_time_from_seconds, gradient_ladder, gradient_params, GradientParams, GradientTier,
    MediaKind,
};
use crate::supervisor::{Invocation, ProcessKind, Supervisor};
use std::path::{Path, PathBuf};
use tracing::debug;

const DEFAULT_STATIC_SECS: u64 = 5;

/// Thumbnail output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailFormat {
    /// Static frame
    Jpg,
    /// Animated preview built by the gradient ladder
    Gif,
}

impl ThumbnailFormat {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "gif" => ThumbnailFormat::Gif,
            _ => ThumbnailFormat::Jpg,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ThumbnailFormat::Jpg => "jpg",
            ThumbnailFormat::Gif => "gif",
        }
    }
}

/// Deterministic thumbnail path for a video source
pub fn thumbnail_path(src: &Path, format: ThumbnailFormat) -> PathBuf {
    cache_dir(src)
        .join(VIDEO_THUMBNAIL_DIR)
        .join(format!("{}.{}", base_name(src), format.extension()))
}

/// Timestamp for the static frame. Bare seconds are formatted as HH:MM:SS;
/// zero or unparsable values fall back to five seconds.
pub fn static_timestamp(cfg: &Config) -> String {
    let time = cfg.thumbnail.thumbnail_time.trim();
    if time.is_empty() {
        return format_time_from_seconds(DEFAULT_STATIC_SECS as f64);
    }
    if time.contains(':') {
        return time.to_string();
    }
    let digits: String = time.chars().take_while(|c| c.is_ascii_digit()).collect();
    let secs = digits
        .parse::<u64>()
        .ok()
        .filter(|&s| s > 0)
        .unwrap_or(DEFAULT_STATIC_SECS);
    format_time_from_seconds(secs as f64)
}

/// What a thumbnail request ended with
#[derive(Debug, Clone, PartialEq)]
pub enum ThumbnailOutcome {
    Disabled,
    NotVideo,
    /// A thumbnail already exists at the target path
    Exists(PathBuf),
    /// Zero-byte source, encoder not invoked
    EmptySource,
    /// `tier` is `None` for static JPG thumbnails
    Created {
        path: PathBuf,
        tier: Option<GradientTier>,
    },
    Failed,
}

/// Generate the thumbnail for one video, at most once.
pub async fn generate_thumbnail(
    supervisor: &Supervisor,
    cfg: &Config,
    src: &Path,
) -> ThumbnailOutcome {
    if !cfg.thumbnail.extract_video_thumbnails {
        return ThumbnailOutcome::Disabled;
    }
    if MediaKind::from_ext(&extension_of(src)) != MediaKind::Video {
        return ThumbnailOutcome::NotVideo;
    }

    let format = ThumbnailFormat::parse(&cfg.thumbnail.format);
    let target = thumbnail_path(src, format);
    let Some(dir) = target.parent() else {
        return ThumbnailOutcome::Failed;
    };
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        debug!(path = %dir.display(), error = %e, "Failed to create thumbnail directory");
        return ThumbnailOutcome::Failed;
    }
    sweep_zero_byte_gifs(dir).await;
    sweep_temp_files(dir, supervisor.temps()).await;

    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        return ThumbnailOutcome::Exists(target);
    }

    let size = match tokio::fs::metadata(src).await {
        Ok(m) => m.len(),
        Err(e) => {
            debug!(path = %src.display(), error = %e, "Cannot stat video");
            return ThumbnailOutcome::Failed;
        }
    };
    if size == 0 {
        debug!(path = %src.display(), "Skipping zero-byte video");
        return ThumbnailOutcome::EmptySource;
    }

    let Some(claim) = supervisor.temps().claim(&temp_path_for(&target)) else {
        return ThumbnailOutcome::Failed;
    };
    let temp = claim.path();
    let tier = match format {
        ThumbnailFormat::Jpg => static_thumbnail(supervisor, cfg, src, temp).await.then_some(None),
        ThumbnailFormat::Gif => gradient_thumbnail(supervisor, cfg, src, temp, size).await.map(Some),
    };

    let Some(tier) = tier else {
        remove_quietly(temp).await;
        return ThumbnailOutcome::Failed;
    };
    if !promote(temp, &target).await {
        debug!(path = %src.display(), "Thumbnail could not be moved into place");
        return ThumbnailOutcome::Failed;
    }
    debug!(path = %target.display(), "Thumbnail created");
    ThumbnailOutcome::Created { path: target, tier }
}

/// Grab one frame into `out`.
async fn static_thumbnail(supervisor: &Supervisor, cfg: &Config, src: &Path, out: &Path) -> bool {
    let args = jpg_thumbnail_args(src, out, &static_timestamp(cfg));
    let inv = Invocation::from_config(cfg, ProcessKind::Thumbnail, args);
    match supervisor.run(inv).await {
        Ok(outcome) if outcome.success() => true,
        Ok(outcome) => {
            debug!(path = %src.display(), code = ?outcome.code(), "JPG thumbnail failed");
            false
        }
        Err(e) => {
            debug!(path = %src.display(), error = %e, "JPG thumbnail error");
            false
        }
    }
}

/// Walk the ladder writing into `out`; returns the tier that produced a
/// non-empty GIF.
async fn gradient_thumbnail(
    supervisor: &Supervisor,
    cfg: &Config,
    src: &Path,
    out: &Path,
    size: u64,
) -> Option<GradientTier> {
    let ladder = gradient_ladder(size, cfg.thumbnail.video_size_threshold_mb);
    debug!(
        path = %src.display(),
        size_mb = size as f64 / (1024.0 * 1024.0),
        first = %ladder[0],
        "Generating GIF thumbnail"
    );

    for tier in ladder {
        let params = gradient_params(cfg, tier);
        if attempt_tier(supervisor, cfg, src, out, &params).await {
            debug!(path = %src.display(), tier = %tier, "GIF thumbnail encoded");
            return Some(tier);
        }
        debug!(path = %src.display(), tier = %tier, "Gradient tier failed");
    }

    debug!(path = %src.display(), "Every gradient tier failed");
    None
}

/// One tier: palette stage then paletted encode. The palette never outlives
/// the attempt and a failed or empty GIF is removed.
async fn attempt_tier(
    supervisor: &Supervisor,
    cfg: &Config,
    src: &Path,
    out: &Path,
    params: &GradientParams,
) -> bool {
    let Some(palette_claim) = supervisor.temps().claim(&palette_path(out)) else {
        return false;
    };
    let palette = palette_claim.path();
    debug!(
        tier = %params.tier,
        start = params.start_secs,
        duration = params.duration,
        fps = params.fps,
        width = params.width,
        "Palette stage"
    );

    let stage1 = Invocation::from_config(cfg, ProcessKind::Thumbnail, palette_args(src, &palette, params));
    let palette_ok = match supervisor.run(stage1).await {
        Ok(outcome) if outcome.success() => true,
        Ok(outcome) => {
            debug!(tier = %params.tier, code = ?outcome.code(), "Palette generation failed");
            false
        }
        Err(e) => {
            debug!(tier = %params.tier, error = %e, "Palette generation error");
            false
        }
    };
    if !palette_ok {
        remove_quietly(palette).await;
        return false;
    }

    let stage2 = Invocation::from_config(
        cfg,
        ProcessKind::Thumbnail,
        gif_args(src, palette, out, params),
    );
    let result = supervisor.run(stage2).await;
    remove_quietly(palette).await;

    let encoded = match result {
        Ok(outcome) if outcome.success() => true,
        Ok(outcome) => {
            debug!(tier = %params.tier, code = ?outcome.code(), "GIF encode failed");
            false
        }
        Err(e) => {
            debug!(tier = %params.tier, error = %e, "GIF encode error");
            false
        }
    };

    let non_empty = encoded && matches!(tokio::fs::metadata(out).await, Ok(m) if m.len() > 0);
    if !non_empty {
        if encoded {
            debug!(tier = %params.tier, "GIF encode produced an empty file");
        }
        remove_quietly(out).await;
    }
    non_empty
}

/// Detached thumbnail generation; never reports back to the caller.
pub fn spawn_thumbnail(
    supervisor: Supervisor,
    cfg: Config,
    src: PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = generate_thumbnail(&supervisor, &cfg, &src).await;
        debug!(path = %src.display(), outcome = ?outcome, "Thumbnail task finished");
    })
}
