//! Relay hook for media-relay
//!
//! The per-file middleware: fires detached cover/thumbnail work, decides
//! whether the request is transcoded, runs admission, spawns the encoder and
//! hands back its stdout as the response body. Also owns the unload hook.

use crate::admission::{admit, intent, ClientSignal, Intent, TranscodeRequest};
use crate::cache::{should_cache, spawn_cache_write};
use crate::config::Config;
use crate::encode::{audio_stream_args, split_quoted, video_stream_args};
use crate::housekeeping::extract_cover;
use crate::policy::{audio_template, video_quality, DsdMode, MediaKind, SourceClass};
use crate::stream::ProcessStream;
use crate::supervisor::{Invocation, ProcessKind, ProcessSnapshot, Supervisor};
use crate::thumbnail::spawn_thumbnail;
use axum::http::StatusCode;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::debug;

/// Configuration shared between the server and the reload task
pub type SharedConfig = Arc<RwLock<Config>>;

pub fn new_shared_config(cfg: Config) -> SharedConfig {
    Arc::new(RwLock::new(cfg))
}

/// Encoder output ready to be served
pub struct TranscodeStream {
    pub content_type: &'static str,
    pub body: ProcessStream,
}

/// Result of running the hook for one request
pub enum Outcome {
    /// Leave the response alone and serve the file as-is
    PassThrough,
    /// Admission turned the request away with this status
    Rejected(StatusCode),
    /// The client left before a process was started
    Disconnected,
    /// The encoder never produced output; the response ends with an empty
    /// body of this content type
    Ended(&'static str),
    Stream(TranscodeStream),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::PassThrough => write!(f, "PassThrough"),
            Outcome::Rejected(status) => write!(f, "Rejected({})", status),
            Outcome::Disconnected => write!(f, "Disconnected"),
            Outcome::Ended(content_type) => write!(f, "Ended({})", content_type),
            Outcome::Stream(s) => write!(f, "Stream({})", s.content_type),
        }
    }
}

/// Registry view served by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub timestamp_unix_ms: i64,
    pub max_processes: u32,
    pub running: usize,
    pub transcodes: Vec<ProcessSnapshot>,
    pub background: usize,
}

/// Long-lived relay state: current configuration plus the process supervisor
#[derive(Debug, Clone)]
pub struct Relay {
    config: SharedConfig,
    supervisor: Supervisor,
}

impl Relay {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            supervisor: Supervisor::new(),
        }
    }

    pub fn with_config(config: Config) -> Self {
        Self::new(new_shared_config(config))
    }

    pub fn shared_config(&self) -> SharedConfig {
        self.config.clone()
    }

    /// Snapshot of the configuration as of now
    pub async fn current_config(&self) -> Config {
        self.config.read().await.clone()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Run the hook for one served file.
    pub async fn handle(&self, req: TranscodeRequest, signal: &dyn ClientSignal) -> Outcome {
        let cfg = self.current_config().await;
        self.fire_background(&cfg, &req.source, &req.ext);

        match intent(&cfg, &req) {
            Intent::PassThrough => return Outcome::PassThrough,
            Intent::Transcode { forced } => {
                debug!(path = %req.source.display(), forced, explicit = req.explicit, "Transcode requested");
            }
        }

        if let Err(rejection) = admit(&cfg, self.supervisor.transcodes(), &req, signal).await {
            return match rejection.status() {
                Some(status) => Outcome::Rejected(status),
                None => Outcome::Disconnected,
            };
        }

        let kind = MediaKind::from_ext(&req.ext);
        let extra = split_quoted(&cfg.encoder.extra_parameters);
        let (args, content_type) = if kind == MediaKind::Audio {
            let template = audio_template(&cfg, &req.ext);
            (
                audio_stream_args(&req.source, &template, &extra),
                template.container.mime(),
            )
        } else {
            let size = tokio::fs::metadata(&req.source).await.ok().map(|m| m.len());
            let quality = video_quality(&cfg, size);
            (
                video_stream_args(&req.source, &quality, cfg.encoder.enable_hwaccel, &extra),
                "video/mp4",
            )
        };

        let inv = Invocation::from_config(&cfg, ProcessKind::Transcode, args)
            .owner(req.account.clone())
            .capture_stdout();
        let mut proc = match self.supervisor.spawn(inv) {
            Ok(proc) => proc,
            Err(e) => {
                debug!(path = %req.source.display(), error = %e, "Encoder failed to start");
                return Outcome::Ended(content_type);
            }
        };
        if SourceClass::from_ext(&req.ext) == SourceClass::Dsd {
            debug!(mode = ?DsdMode::parse(&cfg.audio.dsd_conversion_mode), "DSD conversion");
        }

        let Some(stdout) = proc.take_stdout() else {
            proc.handle().cleanup(true);
            return Outcome::Ended(content_type);
        };
        let body = ProcessStream::new(stdout, proc.handle());

        if should_cache(&cfg, &req.ext) {
            spawn_cache_write(
                self.supervisor.clone(),
                cfg.clone(),
                req.source.clone(),
                req.ext.clone(),
            );
        }

        Outcome::Stream(TranscodeStream { content_type, body })
    }

    /// Detached per-file enrichment; runs whatever the transcode decision is
    fn fire_background(&self, cfg: &Config, src: &Path, ext: &str) {
        match MediaKind::from_ext(ext) {
            MediaKind::Audio if cfg.audio.extract_covers => {
                let supervisor = self.supervisor.clone();
                let cfg = cfg.clone();
                let src = src.to_path_buf();
                tokio::spawn(async move {
                    let outcome = extract_cover(&supervisor, &cfg, &src).await;
                    debug!(path = %src.display(), outcome = ?outcome, "Cover task finished");
                });
            }
            MediaKind::Video if cfg.thumbnail.extract_video_thumbnails => {
                spawn_thumbnail(self.supervisor.clone(), cfg.clone(), src.to_path_buf());
            }
            _ => {}
        }
    }

    /// Unload hook: force-kill every tracked process
    pub fn unload(&self) -> usize {
        self.supervisor.unload()
    }

    pub async fn status(&self) -> RelayStatus {
        let max_processes = self.config.read().await.admission.max_processes;
        let transcodes = self.supervisor.transcodes().snapshot();
        RelayStatus {
            timestamp_unix_ms: unix_timestamp_ms(),
            max_processes,
            running: transcodes.len(),
            transcodes,
            background: self.supervisor.background().len(),
        }
    }
}

/// Get current timestamp in milliseconds
fn unix_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
