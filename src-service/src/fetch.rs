//! Remote media fetching.
//!
//! Downloading is delegated to `yt-dlp`, which extracts audio straight
//! to the 16 kHz mono WAV the pipeline wants. Downloads land in the
//! shared cache directory and are swept by age like every other
//! artefact.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

/// Error type for media fetching.
#[derive(Debug)]
pub enum FetchError {
    /// `yt-dlp` is not installed or could not start.
    Unavailable(String),
    /// Metadata probe failed (bad URL, private video, network).
    Probe(String),
    /// The download itself failed.
    Download(String),
    /// The downloader reported success but no output file was found.
    MissingOutput(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Unavailable(msg) => write!(f, "Media downloader unavailable: {}", msg),
            FetchError::Probe(msg) => write!(f, "Could not read media info: {}", msg),
            FetchError::Download(msg) => write!(f, "Media download failed: {}", msg),
            FetchError::MissingOutput(id) => {
                write!(f, "Download finished but no file found for id {}", id)
            }
        }
    }
}

impl std::error::Error for FetchError {}

/// Whether a request source names remote media rather than a local
/// file.
pub fn is_media_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Facade over the media downloader.
pub trait MediaFetcher: Send + Sync {
    /// Download `url` into `dest_dir`; returns the audio path and the
    /// media title.
    fn fetch(&self, url: &str, dest_dir: &Path) -> Result<(PathBuf, String), FetchError>;
}

/// `yt-dlp`-backed fetcher.
pub struct YtDlpFetcher;

impl YtDlpFetcher {
    /// Probe id and title without downloading.
    fn probe(&self, url: &str) -> Result<(String, String), FetchError> {
        let output = Command::new("yt-dlp")
            .args(["--no-warnings", "--print", "id", "--print", "title", "--skip-download"])
            .arg(url)
            .output()
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(FetchError::Probe(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();
        let id = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| FetchError::Probe("no media id in probe output".to_string()))?;
        let title = lines.next().map(str::trim).unwrap_or("media").to_string();

        Ok((id.to_string(), title))
    }
}

/// Locate the downloaded file for `id` in `dest_dir`: the expected WAV
/// name first, then any file the id prefixes (the extractor may keep a
/// different extension).
fn find_output_file(dest_dir: &Path, id: &str) -> Option<PathBuf> {
    let expected = dest_dir.join(format!("{}.wav", id));
    if expected.exists() {
        return Some(expected);
    }

    std::fs::read_dir(dest_dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .find(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(id))
                .unwrap_or(false)
        })
}

impl MediaFetcher for YtDlpFetcher {
    fn fetch(&self, url: &str, dest_dir: &Path) -> Result<(PathBuf, String), FetchError> {
        let (id, title) = self.probe(url)?;
        info!("Fetching media {} ({})", id, title);

        std::fs::create_dir_all(dest_dir)
            .map_err(|e| FetchError::Download(e.to_string()))?;

        // Reuse a cached download when the sweep has not aged it out.
        if let Some(cached) = find_output_file(dest_dir, &id) {
            debug!("Using cached download {}", cached.display());
            return Ok((cached, title));
        }

        let template = dest_dir.join("%(id)s.%(ext)s");
        let output = Command::new("yt-dlp")
            .args([
                "--no-warnings",
                "-x",
                "--audio-format",
                "wav",
                "--postprocessor-args",
                "ffmpeg:-ar 16000 -ac 1",
                "-o",
            ])
            .arg(&template)
            .arg(url)
            .output()
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(FetchError::Download(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let path = find_output_file(dest_dir, &id).ok_or(FetchError::MissingOutput(id))?;
        info!("Media fetched to {}", path.display());
        Ok((path, title))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_detection() {
        assert!(is_media_url("https://www.youtube.com/watch?v=abc123def45"));
        assert!(is_media_url("http://example.com/talk.mp4"));
        assert!(!is_media_url("/data/audio/meeting.wav"));
        assert!(!is_media_url("meeting.wav"));
    }

    #[test]
    fn output_lookup_prefers_exact_wav() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc123.wav"), b"x").unwrap();
        std::fs::write(dir.path().join("abc123.m4a"), b"x").unwrap();

        let found = find_output_file(dir.path(), "abc123").unwrap();
        assert_eq!(found, dir.path().join("abc123.wav"));
    }

    #[test]
    fn output_lookup_falls_back_to_id_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc123.opus"), b"x").unwrap();

        let found = find_output_file(dir.path(), "abc123").unwrap();
        assert_eq!(found, dir.path().join("abc123.opus"));
    }

    #[test]
    fn output_lookup_misses_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_output_file(dir.path(), "missing").is_none());
    }
}
