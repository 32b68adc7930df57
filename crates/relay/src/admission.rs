//! Admission controller for media-relay
//!
//! Decides whether a request is routed to the encoder at all, whether the
//! caller may transcode, and waits (bounded) for encoder capacity.

use crate::config::Config;
use crate::policy::MediaKind;
use crate::supervisor::ProcessTable;
use axum::http::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Why a transcode request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionRejection {
    /// Anonymous caller, or an account outside the allow-list
    #[error("Caller is not allowed to transcode")]
    Unauthorized,

    /// No capacity freed up within the wait bound
    #[error("Too many transcodes in progress")]
    RateLimited,

    /// The client went away while waiting
    #[error("Client disconnected before admission")]
    Disconnected,
}

impl AdmissionRejection {
    /// HTTP status for the rejection; a disconnected client gets no response
    pub fn status(self) -> Option<StatusCode> {
        match self {
            AdmissionRejection::Unauthorized => Some(StatusCode::UNAUTHORIZED),
            AdmissionRejection::RateLimited => Some(StatusCode::TOO_MANY_REQUESTS),
            AdmissionRejection::Disconnected => None,
        }
    }
}

/// Cooperative disconnect signal polled at admission checkpoints
pub trait ClientSignal: Send + Sync {
    fn is_disconnected(&self) -> bool;
}

/// Shared flag flipped once the client connection is gone
#[derive(Debug, Clone, Default)]
pub struct DisconnectFlag(Arc<AtomicBool>);

impl DisconnectFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Guard that marks the client disconnected when dropped
    pub fn guard(&self) -> DisconnectGuard {
        DisconnectGuard {
            flag: self.clone(),
            armed: true,
        }
    }
}

impl ClientSignal for DisconnectFlag {
    fn is_disconnected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sets its flag on drop unless disarmed
#[derive(Debug)]
pub struct DisconnectGuard {
    flag: DisconnectFlag,
    armed: bool,
}

impl DisconnectGuard {
    /// The request completed normally; dropping no longer means disconnect
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed {
            self.flag.set();
        }
    }
}

/// One incoming file fetch
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub source: PathBuf,
    /// Lower-cased extension without the dot
    pub ext: String,
    /// The caller asked for a transcode explicitly (`?ffmpeg`)
    pub explicit: bool,
    pub account: Option<String>,
    pub created_at: Instant,
}

impl TranscodeRequest {
    pub fn new(source: impl Into<PathBuf>, explicit: bool, account: Option<String>) -> Self {
        let source = source.into();
        let ext = extension_of(&source);
        Self {
            source,
            ext,
            explicit,
            account: account.filter(|a| !a.trim().is_empty()),
            created_at: Instant::now(),
        }
    }
}

/// Lower-cased extension of a path, empty when there is none
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Routing decision for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Serve the file unmodified
    PassThrough,
    /// Route through the encoder; `forced` when the extension alone decided it
    Transcode { forced: bool },
}

/// Decide whether a request goes to the encoder.
///
/// Transcoding happens on explicit request or when the extension is in the
/// force list. MP3 is always passed through, as is anything that is not a
/// handled audio or video extension.
pub fn intent(cfg: &Config, req: &TranscodeRequest) -> Intent {
    let forced = cfg.transcode.force_list().iter().any(|f| *f == req.ext);
    if !req.explicit && !forced {
        return Intent::PassThrough;
    }
    let handled = forced || cfg.transcode.extension_list().iter().any(|e| *e == req.ext);
    if req.ext == "mp3" || !handled || MediaKind::from_ext(&req.ext) == MediaKind::Other {
        return Intent::PassThrough;
    }
    Intent::Transcode { forced }
}

/// True when `account` matches an allow-list entry by name or by group
pub fn belongs_to(cfg: &Config, account: &str, allow_list: &[String]) -> bool {
    let groups = cfg.groups_of(account);
    allow_list
        .iter()
        .any(|entry| entry == account || groups.iter().any(|g| g == entry))
}

/// Authorization check, evaluated before any waiting.
///
/// With anonymous access allowed everyone passes. Otherwise the caller must
/// be authenticated and, if an allow-list is configured, be on it.
pub fn authorize(cfg: &Config, account: Option<&str>) -> Result<(), AdmissionRejection> {
    if cfg.admission.allow_anonymous {
        return Ok(());
    }
    let Some(account) = account else {
        return Err(AdmissionRejection::Unauthorized);
    };
    let allow = &cfg.admission.accounts;
    if allow.is_empty() || belongs_to(cfg, account, allow) {
        Ok(())
    } else {
        Err(AdmissionRejection::Unauthorized)
    }
}

/// Capacity limits derived from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionLimits {
    pub max_processes: usize,
    /// Per-account cap; only enforced when anonymous access is off
    pub per_account: Option<usize>,
    pub debounce: Duration,
    pub poll_interval: Duration,
    pub wait_limit: u32,
}

impl AdmissionLimits {
    pub fn derive(cfg: &Config) -> Self {
        let adm = &cfg.admission;
        let per_account = if !adm.allow_anonymous && adm.max_processes_per_account > 0 {
            Some(adm.max_processes_per_account as usize)
        } else {
            None
        };
        Self {
            max_processes: adm.max_processes as usize,
            per_account,
            debounce: Duration::from_millis(adm.debounce_ms),
            poll_interval: Duration::from_millis(adm.poll_interval_ms),
            wait_limit: adm.wait_limit,
        }
    }

    /// True when one more process may start for `account`
    pub fn has_capacity(&self, table: &ProcessTable, account: Option<&str>) -> bool {
        if table.len() >= self.max_processes {
            return false;
        }
        match self.per_account {
            Some(limit) => table.count_owner(account) < limit,
            None => true,
        }
    }
}

/// Run the full admission sequence for a transcode request.
///
/// Order: authorization, debounce, disconnect check, then capacity polling
/// with a disconnect check after every wait. Nothing is spawned here.
pub async fn admit(
    cfg: &Config,
    table: &ProcessTable,
    req: &TranscodeRequest,
    signal: &dyn ClientSignal,
) -> Result<(), AdmissionRejection> {
    let account = req.account.as_deref();
    if let Err(rejection) = authorize(cfg, account) {
        info!(account = ?account, path = %req.source.display(), "Transcode rejected: unauthorized");
        return Err(rejection);
    }

    let limits = AdmissionLimits::derive(cfg);

    tokio::time::sleep(limits.debounce).await;
    if signal.is_disconnected() {
        debug!(path = %req.source.display(), "Client left during debounce");
        return Err(AdmissionRejection::Disconnected);
    }

    let mut waited = 0u32;
    while !limits.has_capacity(table, account) {
        waited += 1;
        if waited > limits.wait_limit {
            info!(
                account = ?account,
                running = table.len(),
                path = %req.source.display(),
                "Transcode rejected: capacity wait exhausted"
            );
            return Err(AdmissionRejection::RateLimited);
        }
        tokio::time::sleep(limits.poll_interval).await;
        if signal.is_disconnected() {
            debug!(path = %req.source.display(), waited, "Client left while waiting for capacity");
            return Err(AdmissionRejection::Disconnected);
        }
    }

    Ok(())
}
