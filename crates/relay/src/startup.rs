//! Startup checks for media-relay
//!
//! Preflight run by the CLI before the server binds:
//! - the served root directory exists
//! - the configured encoder answers `-version`

use crate::config::Config;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("Served root is not a directory: {0}")]
    RootMissing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the encoder version check found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub program: String,
    /// Major version, when the banner could be parsed
    pub major: Option<u32>,
    /// First line of `-version` output
    pub banner: String,
}

/// Parse the major version out of `ffmpeg -version` output.
///
/// Handles plain (`ffmpeg version 6.1 ...`) and `n`-prefixed
/// (`ffmpeg version n6.1-...`) builds.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let line = version_output
        .lines()
        .map(str::to_lowercase)
        .find(|line| line.contains("ffmpeg version"))?;

    let version = line
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .trim_start_matches('n')
        .to_string();

    version.split(['.', '-']).next()?.parse().ok()
}

/// Run `<encoder> -version` and report what answered.
pub fn check_encoder(cfg: &Config) -> Result<EncoderInfo, StartupError> {
    let program = cfg.encoder.program().to_string();
    let output = Command::new(&program)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::EncoderUnavailable(format!(
                "{} -version failed; set encoder.ffmpeg_path or RELAY_FFMPEG_PATH. Error: {}",
                program, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} -version exited with {}",
            program, output.status
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    Ok(EncoderInfo {
        major: parse_ffmpeg_version(&text),
        banner: text.lines().next().unwrap_or("").to_string(),
        program,
    })
}

/// Verify the served root exists and is a directory
pub fn check_root(cfg: &Config) -> Result<(), StartupError> {
    if cfg.server.root.is_dir() {
        Ok(())
    } else {
        Err(StartupError::RootMissing(
            cfg.server.root.display().to_string(),
        ))
    }
}

/// Run all startup checks in order: served root, then encoder
pub fn run_startup_checks(cfg: &Config) -> Result<EncoderInfo, StartupError> {
    check_root(cfg)?;
    let info = check_encoder(cfg)?;
    info!(
        program = %info.program,
        major = ?info.major,
        banner = %info.banner,
        "Encoder available"
    );
    Ok(info)
}
