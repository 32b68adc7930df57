//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Directory whose files are served
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Trusted request header carrying the authenticated account name
    #[serde(default = "default_account_header")]
    pub account_header: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_account_header() -> String {
    "x-remote-user".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            root: default_root(),
            account_header: default_account_header(),
        }
    }
}

/// A known account and the groups it belongs to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AccountEntry {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Path to the ffmpeg binary (empty = look up `ffmpeg` on PATH)
    #[serde(default)]
    pub ffmpeg_path: String,
    /// Extra arguments appended after the built-in templates (supports quotes)
    #[serde(default)]
    pub extra_parameters: String,
    /// Request hardware decoding for video transcodes
    #[serde(default)]
    pub enable_hwaccel: bool,
    /// Forward encoder stderr to debug logs
    #[serde(default)]
    pub debug: bool,
    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_cleanup_grace_ms")]
    pub cleanup_grace_ms: u64,
}

fn default_cleanup_grace_ms() -> u64 {
    5000
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: String::new(),
            extra_parameters: String::new(),
            enable_hwaccel: false,
            debug: false,
            cleanup_grace_ms: default_cleanup_grace_ms(),
        }
    }
}

impl EncoderConfig {
    /// Binary to invoke, falling back to PATH lookup
    pub fn program(&self) -> &str {
        if self.ffmpeg_path.trim().is_empty() {
            "ffmpeg"
        } else {
            self.ffmpeg_path.as_str()
        }
    }
}

/// Request admission configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionConfig {
    /// Maximum concurrent encoder processes across all accounts
    #[serde(default = "default_max_processes")]
    pub max_processes: u32,
    /// Allow requests without an authenticated account
    #[serde(default = "default_allow_anonymous")]
    pub allow_anonymous: bool,
    /// Maximum concurrent processes per account (only when anonymous access is off)
    #[serde(default = "default_max_processes_per_account")]
    pub max_processes_per_account: u32,
    /// Accounts or groups allowed to transcode (empty = every account)
    #[serde(default)]
    pub accounts: Vec<String>,
    /// Delay before evaluating capacity
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Interval between capacity polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Number of polls before giving up with 429
    #[serde(default = "default_wait_limit")]
    pub wait_limit: u32,
}

fn default_max_processes() -> u32 {
    3
}

fn default_allow_anonymous() -> bool {
    true
}

fn default_max_processes_per_account() -> u32 {
    1
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_wait_limit() -> u32 {
    10
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_processes: default_max_processes(),
            allow_anonymous: default_allow_anonymous(),
            max_processes_per_account: default_max_processes_per_account(),
            accounts: Vec::new(),
            debounce_ms: default_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            wait_limit: default_wait_limit(),
        }
    }
}

/// Transcoding selection and quality
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscodeConfig {
    /// Media extensions handled by the relay (comma separated)
    #[serde(default = "default_extensions")]
    pub extensions: String,
    /// Extensions that are always transcoded (comma separated)
    #[serde(default = "default_force_transcode_formats")]
    pub force_transcode_formats: String,
    /// `fast`, `balanced` or `high`
    #[serde(default = "default_quality")]
    pub quality: String,
}

fn default_extensions() -> String {
    "webm,avi,mkv,mp4,mov,mpg,rmvb,rm,dat,ts,vob,aiff,aif,alac,dsd,dsf,dff,ape,mp3,flac,m4a,ogg,wma,wmv"
        .to_string()
}

fn default_force_transcode_formats() -> String {
    "wmv,mpg,avi,ts,rmvb,vob,flv".to_string()
}

fn default_quality() -> String {
    "balanced".to_string()
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            force_transcode_formats: default_force_transcode_formats(),
            quality: default_quality(),
        }
    }
}

impl TranscodeConfig {
    /// Lower-cased, trimmed force-transcode list
    pub fn force_list(&self) -> Vec<String> {
        split_list(&self.force_transcode_formats)
    }

    /// Lower-cased, trimmed extension list
    pub fn extension_list(&self) -> Vec<String> {
        split_list(&self.extensions)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.to_lowercase()
        .split(',')
        .map(|x| x.trim().to_string())
        .filter(|x| !x.is_empty())
        .collect()
}

/// Audio output and lossless cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    /// `wav` or `flac`
    #[serde(default = "default_audio_format")]
    pub format: String,
    #[serde(default = "default_enable_lossless_cache")]
    pub enable_lossless_cache: bool,
    /// `standard`, `high` or `ultra`
    #[serde(default = "default_dsd_conversion_mode")]
    pub dsd_conversion_mode: String,
    #[serde(default)]
    pub extract_covers: bool,
    /// Non-zero exit code still accepted for WAV cache writes
    #[serde(default = "default_wav_acceptable_exit_code")]
    pub wav_acceptable_exit_code: i32,
    /// Non-zero exit code still accepted for FLAC cache writes
    #[serde(default = "default_flac_acceptable_exit_code")]
    pub flac_acceptable_exit_code: i32,
}

fn default_audio_format() -> String {
    "wav".to_string()
}

fn default_enable_lossless_cache() -> bool {
    true
}

fn default_dsd_conversion_mode() -> String {
    "ultra".to_string()
}

fn default_wav_acceptable_exit_code() -> i32 {
    255
}

fn default_flac_acceptable_exit_code() -> i32 {
    1
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            format: default_audio_format(),
            enable_lossless_cache: default_enable_lossless_cache(),
            dsd_conversion_mode: default_dsd_conversion_mode(),
            extract_covers: false,
            wav_acceptable_exit_code: default_wav_acceptable_exit_code(),
            flac_acceptable_exit_code: default_flac_acceptable_exit_code(),
        }
    }
}

/// Settings for one GIF gradient tier. Unset fields fall back to the tier's
/// built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GradientTierConfig {
    /// `HH:MM:SS` or bare seconds
    pub start_time: Option<String>,
    /// Clip duration in seconds
    pub duration: Option<u32>,
    pub fps: Option<u32>,
    /// CRF override, honored under the `balanced` quality tier
    pub crf: Option<u32>,
    pub preset: Option<String>,
    pub tune: Option<String>,
}

/// Video thumbnail configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThumbnailConfig {
    #[serde(default)]
    pub extract_video_thumbnails: bool,
    /// `jpg` (static) or `gif` (animated preview)
    #[serde(default = "default_thumbnail_format")]
    pub format: String,
    /// Timestamp of the static JPG frame
    #[serde(default = "default_thumbnail_time")]
    pub thumbnail_time: String,
    /// Videos above this size (MB) try the long tier first
    #[serde(default = "default_video_size_threshold_mb")]
    pub video_size_threshold_mb: f64,
    #[serde(default = "default_gif_width")]
    pub gif_width: u32,
    #[serde(default)]
    pub short: GradientTierConfig,
    #[serde(default)]
    pub long: GradientTierConfig,
    #[serde(default)]
    pub backup: GradientTierConfig,
}

fn default_thumbnail_format() -> String {
    "jpg".to_string()
}

fn default_thumbnail_time() -> String {
    "00:00:05".to_string()
}

fn default_video_size_threshold_mb() -> f64 {
    250.0
}

fn default_gif_width() -> u32 {
    320
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            extract_video_thumbnails: false,
            format: default_thumbnail_format(),
            thumbnail_time: default_thumbnail_time(),
            video_size_threshold_mb: default_video_size_threshold_mb(),
            gif_width: default_gif_width(),
            short: GradientTierConfig::default(),
            long: GradientTierConfig::default(),
            backup: GradientTierConfig::default(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub accounts: Vec<AccountEntry>,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub thumbnail: ThumbnailConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RELAY_BIND -> server.bind
    /// - RELAY_ROOT -> server.root
    /// - RELAY_FFMPEG_PATH -> encoder.ffmpeg_path
    /// - RELAY_MAX_PROCESSES -> admission.max_processes
    /// - RELAY_ALLOW_ANONYMOUS -> admission.allow_anonymous
    /// - RELAY_AUDIO_FORMAT -> audio.format
    /// - RELAY_TRANSCODE_QUALITY -> transcode.quality
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RELAY_BIND") {
            if !val.trim().is_empty() {
                self.server.bind = val;
            }
        }

        if let Ok(val) = env::var("RELAY_ROOT") {
            if !val.trim().is_empty() {
                self.server.root = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RELAY_FFMPEG_PATH") {
            self.encoder.ffmpeg_path = val;
        }

        if let Ok(val) = env::var("RELAY_MAX_PROCESSES") {
            if let Ok(max) = val.parse::<u32>() {
                self.admission.max_processes = max;
            }
        }

        if let Ok(val) = env::var("RELAY_ALLOW_ANONYMOUS") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.admission.allow_anonymous = true,
                "false" | "0" | "no" => self.admission.allow_anonymous = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("RELAY_AUDIO_FORMAT") {
            let val = val.to_lowercase();
            if val == "wav" || val == "flac" {
                self.audio.format = val;
            }
        }

        if let Ok(val) = env::var("RELAY_TRANSCODE_QUALITY") {
            let val = val.to_lowercase();
            if matches!(val.as_str(), "fast" | "balanced" | "high") {
                self.transcode.quality = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Groups of a known account, empty for unknown accounts
    pub fn groups_of(&self, account: &str) -> &[String] {
        self.accounts
            .iter()
            .find(|a| a.name == account)
            .map(|a| a.groups.as_slice())
            .unwrap_or(&[])
    }
}
