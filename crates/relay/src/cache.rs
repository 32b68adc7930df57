//! Lossless cache writer
//!
//! Re-encodes a lossless or DSD source into `cache/<base>.<wav|flac>` next to
//! it. The encoder writes to a `tmp_`-prefixed file; the result is sniffed and
//! only then renamed into place. Any failure deletes the temp file.

use crate::config::Config;
use crate::encode::{audio_cache_args, split_quoted};
use crate::housekeeping::{base_name, cache_dir, remove_quietly, sweep_temp_files, TEMP_PREFIX};
use crate::policy::{audio_template, MediaKind, OutputContainer};
use crate::supervisor::{Invocation, ProcessKind, ProcessOutcome, SpawnError, Supervisor};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Smallest cache file accepted in any container
pub const MIN_FILE_SIZE: u64 = 1024;
/// Smallest WAV accepted; shorter captures are treated as truncated
pub const WAV_MIN_SIZE: u64 = 1024 * 1024;
/// FLAC stream marker at offset 0
pub const FLAC_MAGIC: &[u8; 4] = b"fLaC";

/// Errors from a single cache write
#[derive(Debug, Error)]
pub enum CacheError {
    /// Could not create the cache directory
    #[error("Failed to prepare cache directory: {0}")]
    Prepare(std::io::Error),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Encoder exit code outside the accepted set
    #[error("Encoder exited with unacceptable code {0:?}")]
    ExitCode(Option<i32>),

    /// Output did not pass the format sniff
    #[error("Cache file failed validation: {0:?}")]
    Invalid(Validation),

    /// Another write for the same target is still running
    #[error("Cache write already in progress")]
    InProgress,

    /// Final rename failed
    #[error("Failed to move cache file into place: {0}")]
    Rename(std::io::Error),
}

/// Result of sniffing a written cache file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Validation {
    Valid,
    /// File is below the size floor for its container
    TooSmall { size: u64, min: u64 },
    /// FLAC output without the stream marker
    BadMagic,
    /// File could not be read
    Unreadable,
}

/// Sniff a cache file for its container.
pub async fn validate_audio_file(path: &Path, container: OutputContainer) -> Validation {
    let size = match tokio::fs::metadata(path).await {
        Ok(m) => m.len(),
        Err(_) => return Validation::Unreadable,
    };
    if size < MIN_FILE_SIZE {
        return Validation::TooSmall {
            size,
            min: MIN_FILE_SIZE,
        };
    }

    match container {
        OutputContainer::Wav if size < WAV_MIN_SIZE => Validation::TooSmall {
            size,
            min: WAV_MIN_SIZE,
        },
        OutputContainer::Wav => Validation::Valid,
        OutputContainer::Flac => {
            let mut header = [0u8; 4];
            let read = async {
                let mut file = tokio::fs::File::open(path).await?;
                file.read_exact(&mut header).await
            };
            match read.await {
                Ok(_) if &header == FLAC_MAGIC => Validation::Valid,
                Ok(_) => Validation::BadMagic,
                Err(_) => Validation::Unreadable,
            }
        }
    }
}

/// How an encoder exit code is treated for a cache write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitVerdict {
    Success,
    /// Known benign non-zero code for this container; still validated
    Tolerated,
    Rejected,
}

pub fn exit_verdict(outcome: &ProcessOutcome, container: OutputContainer, cfg: &Config) -> ExitVerdict {
    match outcome.code() {
        Some(0) => ExitVerdict::Success,
        Some(code) if code == container.acceptable_exit_code(cfg) => ExitVerdict::Tolerated,
        _ => ExitVerdict::Rejected,
    }
}

/// Temp and final locations of one cache artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub dir: PathBuf,
    pub temp: PathBuf,
    pub target: PathBuf,
}

impl CachePaths {
    pub fn for_source(src: &Path, container: OutputContainer) -> Self {
        let dir = cache_dir(src);
        let file = format!("{}.{}", base_name(src), container.extension());
        Self {
            temp: dir.join(format!("{}{}", TEMP_PREFIX, file)),
            target: dir.join(file),
            dir,
        }
    }
}

/// True when a streamed request for `ext` should also feed the cache
pub fn should_cache(cfg: &Config, ext: &str) -> bool {
    cfg.audio.enable_lossless_cache && MediaKind::from_ext(ext) == MediaKind::Audio
}

/// Produce the cache artifact for one source, or clean up and report why not.
pub async fn write_cache(
    supervisor: &Supervisor,
    cfg: &Config,
    src: &Path,
    ext: &str,
) -> Result<PathBuf, CacheError> {
    let container = OutputContainer::parse(&cfg.audio.format);
    let paths = CachePaths::for_source(src, container);

    let Some(_claim) = supervisor.temps().claim(&paths.temp) else {
        return Err(CacheError::InProgress);
    };

    tokio::fs::create_dir_all(&paths.dir)
        .await
        .map_err(CacheError::Prepare)?;
    sweep_temp_files(&paths.dir, supervisor.temps()).await;
    remove_quietly(&paths.temp).await;

    let template = audio_template(cfg, ext);
    let extra = split_quoted(&cfg.encoder.extra_parameters);
    let args = audio_cache_args(src, &paths.temp, &template, &extra);

    let outcome = match supervisor
        .run(Invocation::from_config(cfg, ProcessKind::Cache, args))
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            remove_quietly(&paths.temp).await;
            return Err(e.into());
        }
    };

    let verdict = exit_verdict(&outcome, container, cfg);
    if verdict == ExitVerdict::Rejected {
        remove_quietly(&paths.temp).await;
        return Err(CacheError::ExitCode(outcome.code()));
    }

    match validate_audio_file(&paths.temp, container).await {
        Validation::Valid => {}
        invalid => {
            remove_quietly(&paths.temp).await;
            return Err(CacheError::Invalid(invalid));
        }
    }

    if let Err(e) = tokio::fs::rename(&paths.temp, &paths.target).await {
        remove_quietly(&paths.temp).await;
        return Err(CacheError::Rename(e));
    }

    debug!(
        path = %paths.target.display(),
        tolerated_exit = verdict == ExitVerdict::Tolerated,
        "Lossless cache saved"
    );
    Ok(paths.target)
}

/// Fire-and-forget cache write; failures end up in debug logs only.
pub fn spawn_cache_write(
    supervisor: Supervisor,
    cfg: Config,
    src: PathBuf,
    ext: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = write_cache(&supervisor, &cfg, &src, &ext).await {
            debug!(path = %src.display(), error = %e, "Lossless cache write failed");
        }
    })
}
