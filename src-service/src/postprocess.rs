//! Subtitle post-processing: merging short adjacent segments under a
//! per-line length cap, and optional Simplified-to-Traditional script
//! conversion for Chinese output.

use std::io::Write;
use std::process::{Command, Stdio};

use tracing::debug;

use subtext_common::types::TextSegment;

/// Segments further apart than this are never merged; a longer pause
/// reads as a deliberate subtitle break.
pub const MERGE_MAX_GAP_S: f64 = 1.0;

/// Merge adjacent segments while the combined text stays within
/// `max_chars` and the gap between them stays under
/// [`MERGE_MAX_GAP_S`]. Texts join with a single space; the merged
/// segment extends to the later end time. Language context is constant
/// within a session, so it never blocks a merge here.
pub fn merge_segments(segments: Vec<TextSegment>, max_chars: usize) -> Vec<TextSegment> {
    let mut iter = segments.into_iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };

    let mut merged = Vec::new();
    let mut current = TextSegment::new(first.start_s, first.end_s, first.text.trim());

    for seg in iter {
        let text = seg.text.trim();
        let gap = seg.start_s - current.end_s;
        // Count characters, not bytes: the cap is a reading-width cap
        // and CJK text is multi-byte throughout.
        let combined_chars = current.text.chars().count() + 1 + text.chars().count();

        if gap < MERGE_MAX_GAP_S && combined_chars <= max_chars {
            current.text.push(' ');
            current.text.push_str(text);
            current.end_s = seg.end_s;
        } else {
            merged.push(current);
            current = TextSegment::new(seg.start_s, seg.end_s, text);
        }
    }
    merged.push(current);
    merged
}

/// Error type for script conversion.
#[derive(Debug)]
pub enum ConvertError {
    /// The converter is not installed or could not start.
    Unavailable(String),
    /// The converter ran but failed.
    Failed(String),
}

impl std::fmt::Display for ConvertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConvertError::Unavailable(msg) => write!(f, "Script converter unavailable: {}", msg),
            ConvertError::Failed(msg) => write!(f, "Script conversion failed: {}", msg),
        }
    }
}

impl std::error::Error for ConvertError {}

/// Facade over the Simplified-to-Traditional converter. Fallible by
/// contract; callers preserve the input text on failure.
pub trait ScriptConverter: Send + Sync {
    fn convert(&self, text: &str) -> Result<String, ConvertError>;
}

/// Converter backed by the `opencc` command-line tool, using the Taiwan
/// standard profile.
pub struct OpenCcConverter {
    config: String,
}

impl OpenCcConverter {
    pub fn new() -> Self {
        Self {
            config: "s2tw".to_string(),
        }
    }
}

impl Default for OpenCcConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptConverter for OpenCcConverter {
    fn convert(&self, text: &str) -> Result<String, ConvertError> {
        let mut child = Command::new("opencc")
            .args(["-c", &self.config])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ConvertError::Unavailable(e.to_string()))?;

        child
            .stdin
            .take()
            .ok_or_else(|| ConvertError::Failed("stdin unavailable".to_string()))?
            .write_all(text.as_bytes())
            .map_err(|e| ConvertError::Failed(e.to_string()))?;

        let output = child
            .wait_with_output()
            .map_err(|e| ConvertError::Failed(e.to_string()))?;
        if !output.status.success() {
            return Err(ConvertError::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let converted = String::from_utf8_lossy(&output.stdout);
        Ok(converted.trim_end_matches('\n').to_string())
    }
}

/// Convert every segment's text in one converter pass. On any failure
/// the segments are left untouched and the error surfaces so the caller
/// can log a warning; conversion is never allowed to lose text.
pub fn convert_segments(
    segments: &mut [TextSegment],
    converter: &dyn ScriptConverter,
) -> Result<(), ConvertError> {
    if segments.is_empty() {
        return Ok(());
    }

    // One batched call instead of a process per segment; newline is the
    // join because segment text never contains one.
    let joined = segments
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let converted = converter.convert(&joined)?;

    let lines: Vec<&str> = converted.split('\n').collect();
    if lines.len() != segments.len() {
        return Err(ConvertError::Failed(format!(
            "converter returned {} line(s) for {} segment(s)",
            lines.len(),
            segments.len()
        )));
    }

    for (segment, line) in segments.iter_mut().zip(lines) {
        segment.text = line.to_string();
    }
    debug!("Converted {} segment(s) to traditional script", segments.len());
    Ok(())
}

/// Whether the requested language calls for script conversion.
pub fn is_chinese(language: Option<&str>) -> bool {
    language.map(|l| l.starts_with("zh")).unwrap_or(false)
}
