//! Cover extraction and cache directory housekeeping
//!
//! Everything here is best effort: failures are logged at debug level and
//! never returned to the request path.

use crate::admission::extension_of;
use crate::config::Config;
use crate::encode::cover_args;
use crate::policy::MediaKind;
use crate::supervisor::{Invocation, ProcessKind, Supervisor};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Cache directory name, created next to the source file
pub const CACHE_DIR: &str = "cache";
/// Cover art subdirectory of the cache
pub const COVERS_DIR: &str = "covers";
/// Video thumbnail subdirectory of the cache
pub const VIDEO_THUMBNAIL_DIR: &str = "videothumbnail";
/// Marker prefix of in-progress cache writes
pub const TEMP_PREFIX: &str = "tmp_";

/// `<dir of src>/cache`
pub fn cache_dir(src: &Path) -> PathBuf {
    src.parent()
        .unwrap_or_else(|| Path::new("."))
        .join(CACHE_DIR)
}

/// File name of `src` without its extension
pub fn base_name(src: &Path) -> String {
    src.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Unique in-progress sibling of `target`:
/// `<dir>/tmp_<stem>_<id>.<ext>`, keeping the extension so the encoder
/// still infers the output format from it.
pub fn temp_path_for(target: &Path) -> PathBuf {
    let id = Uuid::new_v4().simple().to_string();
    let name = match target.extension() {
        Some(ext) => format!(
            "{}{}_{}.{}",
            TEMP_PREFIX,
            base_name(target),
            &id[..8],
            ext.to_string_lossy()
        ),
        None => format!("{}{}_{}", TEMP_PREFIX, base_name(target), &id[..8]),
    };
    target.with_file_name(name)
}

/// Temp files owned by a write that is still in flight. Sweeps leave them
/// alone.
#[derive(Debug, Clone, Default)]
pub struct TempClaims {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl TempClaims {
    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `path` until the returned guard is dropped. `None` while
    /// another writer holds it.
    pub fn claim(&self, path: &Path) -> Option<TempClaim> {
        if !self.lock().insert(path.to_path_buf()) {
            return None;
        }
        Some(TempClaim {
            claims: self.clone(),
            path: path.to_path_buf(),
        })
    }

    pub fn is_claimed(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Releases its temp path claim on drop
#[derive(Debug)]
pub struct TempClaim {
    claims: TempClaims,
    path: PathBuf,
}

impl TempClaim {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempClaim {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.path);
    }
}

/// Move a finished temp file into place. A missing or empty temp, or a
/// failed rename, removes the temp and returns false.
pub async fn promote(temp: &Path, target: &Path) -> bool {
    let non_empty = matches!(tokio::fs::metadata(temp).await, Ok(m) if m.len() > 0);
    if !non_empty {
        remove_quietly(temp).await;
        return false;
    }
    match tokio::fs::rename(temp, target).await {
        Ok(()) => true,
        Err(e) => {
            debug!(path = %target.display(), error = %e, "Failed to move file into place");
            remove_quietly(temp).await;
            false
        }
    }
}

/// Delete a file, ignoring a missing file. Returns true if something was removed.
pub async fn remove_quietly(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Failed to remove file");
            false
        }
    }
}

/// Collect entries of `dir`; a missing directory is simply empty.
async fn list_dir(dir: &Path) -> Vec<(PathBuf, String)> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != ErrorKind::NotFound {
                debug!(dir = %dir.display(), error = %e, "Failed to list directory");
            }
            return out;
        }
    };
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let name = entry.file_name().to_string_lossy().into_owned();
                out.push((entry.path(), name));
            }
            Ok(None) => break,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Directory listing interrupted");
                break;
            }
        }
    }
    out
}

/// Remove leftover temp-prefixed files from a directory, skipping temps a
/// running write still owns.
pub async fn sweep_temp_files(dir: &Path, claims: &TempClaims) -> usize {
    let mut removed = 0;
    for (path, name) in list_dir(dir).await {
        if !name.starts_with(TEMP_PREFIX) || claims.is_claimed(&path) {
            continue;
        }
        if remove_quietly(&path).await {
            debug!(file = %name, "Cleaned temp file");
            removed += 1;
        }
    }
    removed
}

/// Remove zero-byte GIFs left behind by crashed thumbnail attempts.
/// Temp-prefixed files are left to [`sweep_temp_files`].
pub async fn sweep_zero_byte_gifs(dir: &Path) -> usize {
    let mut removed = 0;
    for (path, name) in list_dir(dir).await {
        if name.starts_with(TEMP_PREFIX) || !name.to_lowercase().ends_with(".gif") {
            continue;
        }
        let empty = matches!(tokio::fs::metadata(&path).await, Ok(m) if m.len() == 0);
        if empty && remove_quietly(&path).await {
            debug!(file = %name, "Cleaned zero-byte GIF");
            removed += 1;
        }
    }
    removed
}

/// Result of a cover extraction attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverOutcome {
    /// Cover extraction is turned off
    Disabled,
    /// Source is not an audio file
    NotAudio,
    /// A cover already exists at the target path
    Exists(PathBuf),
    Extracted(PathBuf),
    Failed,
}

/// Deterministic cover path for an audio source
pub fn cover_path(src: &Path) -> PathBuf {
    cache_dir(src)
        .join(COVERS_DIR)
        .join(format!("{}.jpg", base_name(src)))
}

/// Extract embedded cover art once per audio file.
pub async fn extract_cover(supervisor: &Supervisor, cfg: &Config, src: &Path) -> CoverOutcome {
    if !cfg.audio.extract_covers {
        return CoverOutcome::Disabled;
    }
    if MediaKind::from_ext(&extension_of(src)) != MediaKind::Audio {
        return CoverOutcome::NotAudio;
    }

    let target = cover_path(src);
    if let Some(dir) = target.parent() {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            debug!(path = %dir.display(), error = %e, "Failed to create covers directory");
            return CoverOutcome::Failed;
        }
        sweep_temp_files(dir, supervisor.temps()).await;
    }

    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        return CoverOutcome::Exists(target);
    }

    let Some(claim) = supervisor.temps().claim(&temp_path_for(&target)) else {
        return CoverOutcome::Failed;
    };
    let temp = claim.path();
    let inv = Invocation::from_config(cfg, ProcessKind::Cover, cover_args(src, temp));
    match supervisor.run(inv).await {
        Ok(outcome) if outcome.success() => {
            if promote(temp, &target).await {
                debug!(path = %target.display(), "Cover extracted");
                CoverOutcome::Extracted(target)
            } else {
                debug!(path = %src.display(), "Cover extraction produced no file");
                CoverOutcome::Failed
            }
        }
        Ok(outcome) => {
            remove_quietly(temp).await;
            debug!(path = %src.display(), code = ?outcome.code(), "Cover extraction failed");
            CoverOutcome::Failed
        }
        Err(e) => {
            remove_quietly(temp).await;
            debug!(path = %src.display(), error = %e, "Cover extraction error");
            CoverOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths() {
        let src = Path::new("/music/album/01 - Intro.flac");
        assert_eq!(cache_dir(src), Path::new("/music/album/cache"));
        assert_eq!(base_name(src), "01 - Intro");
        assert_eq!(
            cover_path(src),
            Path::new("/music/album/cache/covers/01 - Intro.jpg")
        );
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_temp_path_for_is_unique_sibling() {
        let target = Path::new("/v/cache/videothumbnail/clip.gif");
        let a = temp_path_for(target);
        let b = temp_path_for(target);
        assert_ne!(a, b);
        assert_eq!(a.parent(), target.parent());
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tmp_clip_"));
        assert!(name.ends_with(".gif"));
    }

    #[tokio::test]
    async fn test_sweep_temp_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tmp_a.flac"), b"x").unwrap();
        std::fs::write(dir.path().join("tmp_b.wav"), b"x").unwrap();
        std::fs::write(dir.path().join("keep.flac"), b"x").unwrap();

        assert_eq!(sweep_temp_files(dir.path(), &TempClaims::default()).await, 2);
        assert_eq!(entries(dir.path()), vec!["keep.flac"]);
    }

    #[tokio::test]
    async fn test_sweep_skips_claimed_temps() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("tmp_playing.flac");
        std::fs::write(&live, b"x").unwrap();
        std::fs::write(dir.path().join("tmp_crashed.flac"), b"x").unwrap();

        let claims = TempClaims::default();
        let claim = claims.claim(&live).unwrap();
        assert!(claims.claim(&live).is_none());
        assert_eq!(sweep_temp_files(dir.path(), &claims).await, 1);
        assert_eq!(entries(dir.path()), vec!["tmp_playing.flac"]);

        drop(claim);
        assert!(claims.is_empty());
        assert_eq!(sweep_temp_files(dir.path(), &claims).await, 1);
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_promote() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.jpg");

        let empty = dir.path().join("tmp_a_1.jpg");
        std::fs::write(&empty, b"").unwrap();
        assert!(!promote(&empty, &target).await);
        assert!(entries(dir.path()).is_empty());

        let full = dir.path().join("tmp_a_2.jpg");
        std::fs::write(&full, b"JFIF").unwrap();
        assert!(promote(&full, &target).await);
        assert_eq!(entries(dir.path()), vec!["a.jpg"]);

        assert!(!promote(&dir.path().join("tmp_missing.jpg"), &target).await);
    }

    #[tokio::test]
    async fn test_sweep_missing_dir_is_quiet() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            sweep_temp_files(&dir.path().join("nope"), &TempClaims::default()).await,
            0
        );
        assert_eq!(sweep_zero_byte_gifs(&dir.path().join("nope")).await, 0);
        assert!(!remove_quietly(&dir.path().join("nope.gif")).await);
    }

    #[tokio::test]
    async fn test_sweep_zero_byte_gifs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("empty.GIF"), b"").unwrap();
        std::fs::write(dir.path().join("good.gif"), b"GIF89a").unwrap();
        std::fs::write(dir.path().join("empty.jpg"), b"").unwrap();
        std::fs::write(dir.path().join("tmp_clip_1a2b3c4d.gif"), b"").unwrap();

        assert_eq!(sweep_zero_byte_gifs(dir.path()).await, 1);
        assert!(dir.path().join("tmp_clip_1a2b3c4d.gif").exists());
        assert!(dir.path().join("good.gif").exists());
        assert!(dir.path().join("empty.jpg").exists());
    }

    #[tokio::test]
    async fn test_cover_disabled_and_not_audio() {
        let supervisor = Supervisor::new();
        let mut cfg = Config::default();
        assert_eq!(
            extract_cover(&supervisor, &cfg, Path::new("/m/a.flac")).await,
            CoverOutcome::Disabled
        );
        cfg.audio.extract_covers = true;
        assert_eq!(
            extract_cover(&supervisor, &cfg, Path::new("/m/a.mkv")).await,
            CoverOutcome::NotAudio
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cover_extracted_once() {
        use crate::test_support::{fake_encoder, read_log};

        let dir = TempDir::new().unwrap();
        let log = dir.path().join("calls.log");
        let encoder = fake_encoder(
            dir.path(),
            "ffmpeg",
            &format!("echo cover >> '{}'\nprintf 'JFIF' > \"$last\"", log.display()),
        );
        let src = dir.path().join("song.flac");
        std::fs::write(&src, b"audio").unwrap();

        let mut cfg = Config::default();
        cfg.audio.extract_covers = true;
        cfg.encoder.ffmpeg_path = encoder.to_string_lossy().into_owned();
        let supervisor = Supervisor::new();

        let target = cover_path(&src);
        assert_eq!(
            extract_cover(&supervisor, &cfg, &src).await,
            CoverOutcome::Extracted(target.clone())
        );
        assert_eq!(std::fs::read(&target).unwrap(), b"JFIF");
        assert_eq!(
            extract_cover(&supervisor, &cfg, &src).await,
            CoverOutcome::Exists(target)
        );
        assert_eq!(read_log(&log).len(), 1);
        assert!(supervisor.background().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_cover_removes_partial() {
        use crate::test_support::fake_encoder;

        let dir = TempDir::new().unwrap();
        let encoder = fake_encoder(dir.path(), "ffmpeg", "printf 'part' > \"$last\"\nexit 1");
        let src = dir.path().join("song.ape");
        std::fs::write(&src, b"audio").unwrap();

        let mut cfg = Config::default();
        cfg.audio.extract_covers = true;
        cfg.encoder.ffmpeg_path = encoder.to_string_lossy().into_owned();

        let supervisor = Supervisor::new();
        let outcome = extract_cover(&supervisor, &cfg, &src).await;
        assert_eq!(outcome, CoverOutcome::Failed);
        assert!(entries(cover_path(&src).parent().unwrap()).is_empty());
        assert!(supervisor.temps().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_in_progress_cover_is_not_reported_as_existing() {
        use crate::test_support::fake_encoder;

        let dir = TempDir::new().unwrap();
        let encoder = fake_encoder(
            dir.path(),
            "ffmpeg",
            "printf 'JF' > \"$last\"\nsleep 1\nexit 1",
        );
        let src = dir.path().join("song.flac");
        std::fs::write(&src, b"audio").unwrap();

        let mut cfg = Config::default();
        cfg.audio.extract_covers = true;
        cfg.encoder.ffmpeg_path = encoder.to_string_lossy().into_owned();
        let supervisor = Supervisor::new();

        let first = {
            let (supervisor, cfg, src) = (supervisor.clone(), cfg.clone(), src.clone());
            tokio::spawn(async move { extract_cover(&supervisor, &cfg, &src).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(!cover_path(&src).exists());

        assert_eq!(first.await.unwrap(), CoverOutcome::Failed);
        assert!(entries(cover_path(&src).parent().unwrap()).is_empty());
    }
}
