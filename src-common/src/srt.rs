//! SRT (SubRip) subtitle rendering and parsing.
//!
//! Records are numbered from 1, timestamps are `HH:MM:SS,mmm`, the arrow
//! separator carries a single space on each side, records are separated
//! by one blank line, and the output ends with a trailing newline.

use crate::types::TextSegment;

/// A single parsed subtitle record.
#[derive(Debug, Clone, PartialEq)]
pub struct Subtitle {
    pub index: usize,
    pub start_s: f64,
    pub end_s: f64,
    pub text: String,
}

/// Error raised while parsing SRT content.
#[derive(Debug)]
pub enum SrtError {
    /// A timestamp did not match `HH:MM:SS,mmm`.
    BadTimestamp(String),
    /// A record block was structurally malformed.
    BadRecord(String),
}

impl std::fmt::Display for SrtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SrtError::BadTimestamp(t) => write!(f, "invalid SRT timestamp: {}", t),
            SrtError::BadRecord(r) => write!(f, "malformed SRT record: {}", r),
        }
    }
}

impl std::error::Error for SrtError {}

/// Format seconds as an SRT timestamp (`HH:MM:SS,mmm`).
pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1_000;
    let millis = total_ms % 1_000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}

/// Parse an SRT timestamp back to seconds. Accepts `,` or `.` before the
/// millisecond field.
pub fn parse_timestamp(timestamp: &str) -> Result<f64, SrtError> {
    let bad = || SrtError::BadTimestamp(timestamp.to_string());

    let (clock, millis) = timestamp
        .rsplit_once([',', '.'])
        .ok_or_else(bad)?;
    let mut parts = clock.split(':');
    let hours: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let minutes: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let seconds: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if parts.next().is_some() {
        return Err(bad());
    }
    let millis: u64 = millis.trim().parse().map_err(|_| bad())?;

    Ok((hours * 3600 + minutes * 60 + seconds) as f64 + millis as f64 / 1000.0)
}

/// Render segments as a complete SRT document.
///
/// An empty segment list renders to an empty string (an empty subtitle
/// set, not an error).
pub fn render(segments: &[TextSegment]) -> String {
    let mut out = String::new();
    for (i, seg) in segments.iter().enumerate() {
        out.push_str(&(i + 1).to_string());
        out.push('\n');
        out.push_str(&format_timestamp(seg.start_s));
        out.push_str(" --> ");
        out.push_str(&format_timestamp(seg.end_s));
        out.push('\n');
        out.push_str(seg.text.trim());
        out.push('\n');
        out.push('\n');
    }
    // Records are separated by exactly one blank line; the final record
    // keeps a single trailing newline.
    if out.ends_with("\n\n") {
        out.pop();
    }
    out
}

/// Parse SRT content into subtitle records.
///
/// Blocks that are structurally broken are skipped rather than failing
/// the whole document, matching how players treat damaged files.
pub fn parse(content: &str) -> Vec<Subtitle> {
    let mut subtitles = Vec::new();

    for block in content.split("\n\n") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        let mut lines = block.lines();
        let index = match lines.next().and_then(|l| l.trim().parse::<usize>().ok()) {
            Some(i) => i,
            None => continue,
        };
        let times = match lines.next() {
            Some(l) => l,
            None => continue,
        };
        let (start, end) = match times.split_once("-->") {
            Some((a, b)) => (a.trim(), b.trim()),
            None => continue,
        };
        let (start_s, end_s) = match (parse_timestamp(start), parse_timestamp(end)) {
            (Ok(s), Ok(e)) => (s, e),
            _ => continue,
        };
        let text = lines.collect::<Vec<_>>().join("\n");
        if text.is_empty() {
            continue;
        }
        subtitles.push(Subtitle {
            index,
            start_s,
            end_s,
            text,
        });
    }

    subtitles
}
