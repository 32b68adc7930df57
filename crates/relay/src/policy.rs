//! Policy resolver
//!
//! Pure functions that turn the current configuration plus a file's extension
//! and size into concrete encoder choices: quality triples, audio templates,
//! DSD resampling parameters and GIF gradient tiers.

use crate::config::{Config, GradientTierConfig};
use serde::Serialize;

/// Audio extensions the relay knows how to decode
pub const AUDIO_EXTS: &[&str] = &[
    "mp3", "flac", "m4a", "ogg", "wma", "aiff", "aif", "alac", "dsd", "dsf", "dff", "ape", "wav",
];

/// Video extensions the relay knows how to decode
pub const VIDEO_EXTS: &[&str] = &[
    "webm", "avi", "mkv", "mp4", "mov", "mpg", "wmv", "ts", "rmvb", "rm", "dat", "vob", "flv",
];

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Broad class of a served file, derived from its extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Other,
}

impl MediaKind {
    pub fn from_ext(ext: &str) -> Self {
        if AUDIO_EXTS.contains(&ext) {
            MediaKind::Audio
        } else if VIDEO_EXTS.contains(&ext) {
            MediaKind::Video
        } else {
            MediaKind::Other
        }
    }
}

/// Parse `HH:MM:SS` (or bare seconds) into seconds.
///
/// Anything malformed yields 0: a colon form without exactly three segments,
/// or a bare value that is not a number.
pub fn parse_time_to_seconds(time: &str) -> f64 {
    let time = time.trim();
    if !time.contains(':') {
        return leading_float(time).unwrap_or(0.0);
    }

    let parts: Vec<&str> = time.split(':').collect();
    if parts.len() != 3 {
        return 0.0;
    }

    let hours = leading_int(parts[0]).unwrap_or(0) as f64;
    let minutes = leading_int(parts[1]).unwrap_or(0) as f64;
    let seconds = leading_float(parts[2]).unwrap_or(0.0);

    hours * 3600.0 + minutes * 60.0 + seconds
}

/// Format seconds as zero-padded `HH:MM:SS`, dropping fractions.
pub fn format_time_from_seconds(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    let hrs = total / 3600;
    let mins = (total % 3600) / 60;
    let secs = total % 60;
    format!("{:02}:{:02}:{:02}", hrs, mins, secs)
}

/// Longest numeric prefix parsed as an integer ("12abc" -> 12)
fn leading_int(s: &str) -> Option<i64> {
    let s = s.trim();
    let end = s
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s[..end].parse().ok()
}

/// Longest numeric prefix parsed as a float ("5.5s" -> 5.5)
fn leading_float(s: &str) -> Option<f64> {
    let s = s.trim();
    let mut seen_dot = false;
    let end = s
        .char_indices()
        .find(|&(i, c)| {
            if c == '.' && !seen_dot {
                seen_dot = true;
                false
            } else {
                !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+')))
            }
        })
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s[..end].parse().ok().filter(|v: &f64| v.is_finite())
}

/// {CRF, preset, tune} handed to libx264
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityTriple {
    pub crf: u32,
    pub preset: String,
    pub tune: String,
}

impl QualityTriple {
    fn new(crf: u32, preset: &str, tune: &str) -> Self {
        Self {
            crf,
            preset: preset.to_string(),
            tune: tune.to_string(),
        }
    }

    /// The fixed triple used by the backup gradient tier
    pub fn backup() -> Self {
        Self::new(26, "ultrafast", "fastdecode")
    }

    /// Apply per-tier overrides, keeping this triple's values for unset fields
    fn overridden_by(&self, tier: &GradientTierConfig) -> Self {
        Self {
            crf: tier.crf.unwrap_or(self.crf),
            preset: tier.preset.clone().unwrap_or_else(|| self.preset.clone()),
            tune: tier.tune.clone().unwrap_or_else(|| self.tune.clone()),
        }
    }
}

/// Transcoding quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Fast,
    Balanced,
    High,
}

impl QualityTier {
    /// Unknown strings fall back to `Balanced`
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "fast" => QualityTier::Fast,
            "high" => QualityTier::High,
            _ => QualityTier::Balanced,
        }
    }

    pub fn triple(self) -> QualityTriple {
        match self {
            QualityTier::Fast => QualityTriple::new(28, "ultrafast", "fastdecode"),
            QualityTier::Balanced => QualityTriple::new(23, "fast", "film"),
            QualityTier::High => QualityTriple::new(18, "medium", "film"),
        }
    }
}

/// Named step of the GIF fallback ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GradientTier {
    Short,
    Long,
    Backup,
}

impl std::fmt::Display for GradientTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GradientTier::Short => write!(f, "short"),
            GradientTier::Long => write!(f, "long"),
            GradientTier::Backup => write!(f, "backup"),
        }
    }
}

/// Timing and quality bundle for one gradient tier
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradientParams {
    pub tier: GradientTier,
    /// Start offset in seconds
    pub start_secs: f64,
    /// Clip duration in seconds
    pub duration: u32,
    pub fps: u32,
    /// Output width in pixels (height follows aspect ratio)
    pub width: u32,
    pub transcode: QualityTriple,
}

/// Built-in (start, duration, fps) per tier
fn tier_defaults(tier: GradientTier) -> (&'static str, u32, u32) {
    match tier {
        GradientTier::Short => ("00:03:00", 10, 5),
        GradientTier::Long => ("00:10:00", 12, 6),
        GradientTier::Backup => ("00:00:00", 6, 5),
    }
}

/// Resolve one tier from the current configuration.
///
/// Under the `balanced` quality tier the per-tier crf/preset/tune settings
/// override the balanced triple. The backup tier always uses the fixed
/// fastest triple.
pub fn gradient_params(cfg: &Config, tier: GradientTier) -> GradientParams {
    let thumb = &cfg.thumbnail;
    let tier_cfg = match tier {
        GradientTier::Short => &thumb.short,
        GradientTier::Long => &thumb.long,
        GradientTier::Backup => &thumb.backup,
    };
    let (default_start, default_duration, default_fps) = tier_defaults(tier);

    let quality = QualityTier::parse(&cfg.transcode.quality);
    let transcode = match (tier, quality) {
        (GradientTier::Backup, _) => QualityTriple::backup(),
        (_, QualityTier::Balanced) => quality.triple().overridden_by(tier_cfg),
        (_, other) => other.triple(),
    };

    let start = tier_cfg
        .start_time
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_start);

    GradientParams {
        tier,
        start_secs: parse_time_to_seconds(start),
        duration: tier_cfg.duration.filter(|&d| d > 0).unwrap_or(default_duration),
        fps: tier_cfg.fps.filter(|&f| f > 0).unwrap_or(default_fps),
        width: if thumb.gif_width > 0 { thumb.gif_width } else { 320 },
        transcode,
    }
}

/// True when the file is larger than the configured threshold
pub fn is_long_video(file_size_bytes: u64, threshold_mb: f64) -> bool {
    (file_size_bytes as f64 / BYTES_PER_MB) > threshold_mb
}

/// Ordered tiers to attempt for a video of the given size.
///
/// Large files try LONG, then SHORT, then BACKUP. Small files skip LONG.
pub fn gradient_ladder(file_size_bytes: u64, threshold_mb: f64) -> Vec<GradientTier> {
    if is_long_video(file_size_bytes, threshold_mb) {
        vec![GradientTier::Long, GradientTier::Short, GradientTier::Backup]
    } else {
        vec![GradientTier::Short, GradientTier::Backup]
    }
}

/// Resolved video transcode quality
#[derive(Debug, Clone, PartialEq)]
pub struct VideoQuality {
    pub tier: QualityTier,
    pub triple: QualityTriple,
    /// Encoder thread cap, set only for the fast tier
    pub threads: Option<u32>,
}

/// Quality for an on-demand video transcode.
///
/// `balanced` takes its triple from the gradient tier matching the file size;
/// when the size is unknown the plain balanced triple is used.
pub fn video_quality(cfg: &Config, file_size_bytes: Option<u64>) -> VideoQuality {
    let tier = QualityTier::parse(&cfg.transcode.quality);
    match tier {
        QualityTier::Fast => VideoQuality {
            tier,
            triple: tier.triple(),
            threads: Some(2),
        },
        QualityTier::High => VideoQuality {
            tier,
            triple: tier.triple(),
            threads: None,
        },
        QualityTier::Balanced => {
            let triple = match file_size_bytes {
                Some(size) => {
                    let gradient = if is_long_video(size, cfg.thumbnail.video_size_threshold_mb) {
                        GradientTier::Long
                    } else {
                        GradientTier::Short
                    };
                    gradient_params(cfg, gradient).transcode
                }
                None => tier.triple(),
            };
            VideoQuality {
                tier,
                triple,
                threads: None,
            }
        }
    }
}

/// Lossless output container for audio transcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputContainer {
    Wav,
    Flac,
}

impl OutputContainer {
    /// Unknown strings fall back to WAV, the configured default
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "flac" => OutputContainer::Flac,
            _ => OutputContainer::Wav,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputContainer::Wav => "wav",
            OutputContainer::Flac => "flac",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            OutputContainer::Wav => "audio/wav",
            OutputContainer::Flac => "audio/flac",
        }
    }

    /// Non-zero exit code tolerated for cache writes in this container
    pub fn acceptable_exit_code(self, cfg: &Config) -> i32 {
        match self {
            OutputContainer::Wav => cfg.audio.wav_acceptable_exit_code,
            OutputContainer::Flac => cfg.audio.flac_acceptable_exit_code,
        }
    }
}

/// Source family selecting the audio parameter template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceClass {
    Dsd,
    Aiff,
    Other,
}

impl SourceClass {
    pub fn from_ext(ext: &str) -> Self {
        match ext {
            "dsf" | "dff" | "dsd" => SourceClass::Dsd,
            "aiff" | "aif" => SourceClass::Aiff,
            _ => SourceClass::Other,
        }
    }
}

/// DSD to PCM conversion quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DsdMode {
    Standard,
    High,
    Ultra,
}

impl DsdMode {
    /// Unknown or missing modes fall back to `High`
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "standard" => DsdMode::Standard,
            "ultra" => DsdMode::Ultra,
            _ => DsdMode::High,
        }
    }

    pub fn params(self) -> DsdParams {
        let (sample_rate, precision) = match self {
            DsdMode::Standard => (44_100, 24),
            DsdMode::High => (88_200, 28),
            DsdMode::Ultra => (176_400, 33),
        };
        DsdParams {
            sample_rate,
            precision,
            filter: format!(
                "aresample=resampler=soxr:precision={}:osr={}",
                precision, sample_rate
            ),
        }
    }
}

/// Resampling parameters for one DSD mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsdParams {
    pub sample_rate: u32,
    pub precision: u32,
    pub filter: String,
}

/// Audio parameters resolved from container, source class and DSD mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTemplate {
    pub container: OutputContainer,
    pub codec: &'static str,
    /// Value for `-ar`; "0" keeps the source rate
    pub sample_rate: String,
    pub sample_fmt: Option<&'static str>,
    pub filter: Option<String>,
}

impl AudioTemplate {
    pub fn resolve(container: OutputContainer, class: SourceClass, dsd: DsdMode) -> Self {
        let hi_res = matches!(class, SourceClass::Dsd | SourceClass::Aiff);
        let codec = match (container, hi_res) {
            (OutputContainer::Wav, true) => "pcm_s24le",
            (OutputContainer::Wav, false) => "pcm_s16le",
            (OutputContainer::Flac, _) => "flac",
        };
        let sample_fmt = match (container, hi_res) {
            (_, false) => None,
            (OutputContainer::Wav, true) => Some("s32"),
            (OutputContainer::Flac, true) => Some("s16"),
        };

        let (sample_rate, filter) = match class {
            SourceClass::Dsd => {
                let params = dsd.params();
                (params.sample_rate.to_string(), Some(params.filter))
            }
            SourceClass::Aiff => ("0".to_string(), None),
            SourceClass::Other => ("48000".to_string(), None),
        };

        Self {
            container,
            codec,
            sample_rate,
            sample_fmt,
            filter,
        }
    }

    /// Container-specific integrity flags
    pub fn container_flags(&self) -> &'static [&'static str] {
        match self.container {
            OutputContainer::Wav => &["-fflags", "+bitexact", "-write_xing", "0"],
            OutputContainer::Flac => &["-compression_level", "5", "-lpc_type", "cholesky"],
        }
    }
}

/// Resolve the audio template for a source extension under the current config
pub fn audio_template(cfg: &Config, ext: &str) -> AudioTemplate {
    AudioTemplate::resolve(
        OutputContainer::parse(&cfg.audio.format),
        SourceClass::from_ext(ext),
        DsdMode::parse(&cfg.audio.dsd_conversion_mode),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_time_round_trip(secs in 0u64..360_000) {
            let formatted = format_time_from_seconds(secs as f64);
            prop_assert_eq!(parse_time_to_seconds(&formatted), secs as f64);
        }

        #[test]
        fn prop_wrong_segment_count_is_zero(parts in proptest::collection::vec(0u32..60, 2..6)) {
            prop_assume!(parts.len() != 3);
            let s = parts.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(":");
            prop_assert_eq!(parse_time_to_seconds(&s), 0.0);
        }

        #[test]
        fn prop_unknown_quality_falls_back_to_balanced(s in "[a-z]{0,12}") {
            prop_assume!(s != "fast" && s != "high");
            prop_assert_eq!(QualityTier::parse(&s).triple(), QualityTier::Balanced.triple());
        }

        #[test]
        fn prop_ladder_always_ends_with_backup(size in 0u64..u64::MAX / 2, threshold in 1.0f64..100000.0) {
            let ladder = gradient_ladder(size, threshold);
            prop_assert_eq!(ladder.last(), Some(&GradientTier::Backup));
            prop_assert_eq!(ladder.contains(&GradientTier::Long), is_long_video(size, threshold));
        }
    }

    #[test]
    fn test_parse_time_forms() {
        assert_eq!(parse_time_to_seconds("00:03:00"), 180.0);
        assert_eq!(parse_time_to_seconds("01:02:03.5"), 3723.5);
        assert_eq!(parse_time_to_seconds("42"), 42.0);
        assert_eq!(parse_time_to_seconds("7.25"), 7.25);
        assert_eq!(parse_time_to_seconds("garbage"), 0.0);
        assert_eq!(parse_time_to_seconds(""), 0.0);
        assert_eq!(parse_time_to_seconds("10:00"), 0.0);
        assert_eq!(parse_time_to_seconds("x:y:z"), 0.0);
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time_from_seconds(0.0), "00:00:00");
        assert_eq!(format_time_from_seconds(65.9), "00:01:05");
        assert_eq!(format_time_from_seconds(3723.0), "01:02:03");
        assert_eq!(format_time_from_seconds(-4.0), "00:00:00");
    }

    #[test]
    fn test_quality_table() {
        assert_eq!(
            QualityTier::Fast.triple(),
            QualityTriple::new(28, "ultrafast", "fastdecode")
        );
        assert_eq!(
            QualityTier::Balanced.triple(),
            QualityTriple::new(23, "fast", "film")
        );
        assert_eq!(
            QualityTier::High.triple(),
            QualityTriple::new(18, "medium", "film")
        );
        assert_eq!(QualityTier::parse("HIGH"), QualityTier::High);
    }

    #[test]
    fn test_gradient_defaults() {
        let cfg = Config::default();
        let short = gradient_params(&cfg, GradientTier::Short);
        assert_eq!(short.start_secs, 180.0);
        assert_eq!((short.duration, short.fps, short.width), (10, 5, 320));

        let long = gradient_params(&cfg, GradientTier::Long);
        assert_eq!(long.start_secs, 600.0);
        assert_eq!((long.duration, long.fps), (12, 6));

        let backup = gradient_params(&cfg, GradientTier::Backup);
        assert_eq!(backup.start_secs, 0.0);
        assert_eq!((backup.duration, backup.fps), (6, 5));
        assert_eq!(backup.transcode, QualityTriple::backup());
    }

    #[test]
    fn test_balanced_tier_overrides_and_backup_is_fixed() {
        let mut cfg = Config::default();
        cfg.thumbnail.long.crf = Some(20);
        cfg.thumbnail.long.preset = Some("slow".to_string());
        cfg.thumbnail.backup.crf = Some(10);

        let long = gradient_params(&cfg, GradientTier::Long);
        assert_eq!(long.transcode, QualityTriple::new(20, "slow", "film"));

        let backup = gradient_params(&cfg, GradientTier::Backup);
        assert_eq!(backup.transcode, QualityTriple::backup());

        cfg.transcode.quality = "high".to_string();
        let long = gradient_params(&cfg, GradientTier::Long);
        assert_eq!(long.transcode, QualityTier::High.triple());
    }

    #[test]
    fn test_ladder_by_size() {
        let mb = 1024 * 1024;
        assert_eq!(
            gradient_ladder(300 * mb, 250.0),
            vec![GradientTier::Long, GradientTier::Short, GradientTier::Backup]
        );
        assert_eq!(
            gradient_ladder(250 * mb, 250.0),
            vec![GradientTier::Short, GradientTier::Backup]
        );
    }

    #[test]
    fn test_video_quality_balanced_uses_size_tier() {
        let mut cfg = Config::default();
        cfg.thumbnail.long.crf = Some(21);
        let big = 500 * 1024 * 1024;

        let q = video_quality(&cfg, Some(big));
        assert_eq!(q.triple.crf, 21);
        assert_eq!(q.threads, None);

        let q = video_quality(&cfg, Some(1024));
        assert_eq!(q.triple, QualityTier::Balanced.triple());

        let q = video_quality(&cfg, None);
        assert_eq!(q.triple, QualityTier::Balanced.triple());

        cfg.transcode.quality = "fast".to_string();
        let q = video_quality(&cfg, Some(big));
        assert_eq!(q.triple, QualityTier::Fast.triple());
        assert_eq!(q.threads, Some(2));
    }

    #[test]
    fn test_dsd_modes() {
        assert_eq!(DsdMode::parse("standard").params().sample_rate, 44_100);
        assert_eq!(DsdMode::parse("ultra").params().precision, 33);
        assert_eq!(DsdMode::parse(""), DsdMode::High);
        assert_eq!(DsdMode::parse("bogus"), DsdMode::High);
        assert_eq!(
            DsdMode::High.params().filter,
            "aresample=resampler=soxr:precision=28:osr=88200"
        );
    }

    #[test]
    fn test_audio_templates() {
        let wav_dsd = AudioTemplate::resolve(OutputContainer::Wav, SourceClass::Dsd, DsdMode::Ultra);
        assert_eq!(wav_dsd.codec, "pcm_s24le");
        assert_eq!(wav_dsd.sample_rate, "176400");
        assert_eq!(wav_dsd.sample_fmt, Some("s32"));
        assert!(wav_dsd.filter.is_some());

        let flac_aiff =
            AudioTemplate::resolve(OutputContainer::Flac, SourceClass::Aiff, DsdMode::High);
        assert_eq!(flac_aiff.codec, "flac");
        assert_eq!(flac_aiff.sample_rate, "0");
        assert_eq!(flac_aiff.sample_fmt, Some("s16"));
        assert_eq!(flac_aiff.filter, None);

        let wav_other =
            AudioTemplate::resolve(OutputContainer::Wav, SourceClass::Other, DsdMode::High);
        assert_eq!(wav_other.codec, "pcm_s16le");
        assert_eq!(wav_other.sample_rate, "48000");
        assert_eq!(wav_other.sample_fmt, None);
    }

    #[test]
    fn test_media_kind() {
        assert_eq!(MediaKind::from_ext("dsf"), MediaKind::Audio);
        assert_eq!(MediaKind::from_ext("wmv"), MediaKind::Video);
        assert_eq!(MediaKind::from_ext("txt"), MediaKind::Other);
        assert_eq!(SourceClass::from_ext("aif"), SourceClass::Aiff);
        assert_eq!(OutputContainer::parse("FLAC"), OutputContainer::Flac);
    }
}
