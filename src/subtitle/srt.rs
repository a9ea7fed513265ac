//! SRT parsing and emission.
//!
//! The parser tolerates CRLF line endings, a UTF-8 BOM and runs of blank
//! lines between cues. The emitter always produces the canonical form:
//! blank-line separated cues, `HH:MM:SS,mmm --> HH:MM:SS,mmm` timestamps,
//! UTF-8 without BOM.

use super::Segment;
use crate::error::{Result, VidsubError};
use std::time::Duration;

/// Emit segments in canonical SRT form. Cue numbers are 1-based.
pub fn emit(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|seg| {
            format!(
                "{}\n{} --> {}\n{}\n",
                seg.index + 1,
                format_timestamp(seg.start),
                format_timestamp(seg.end),
                seg.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse SRT content into segments. Indices are reassigned densely from 0
/// in cue order regardless of the numbers in the file.
pub fn parse(content: &str) -> Result<Vec<Segment>> {
    let content = content.trim_start_matches('\u{feff}').replace("\r\n", "\n");

    let mut segments = Vec::new();
    for block in content.split("\n\n").map(str::trim).filter(|b| !b.is_empty()) {
        let mut lines = block.lines().peekable();

        // Optional cue-number line
        if let Some(first) = lines.peek() {
            if first.trim().parse::<u64>().is_ok() {
                lines.next();
            }
        }

        let time_line = lines
            .next()
            .ok_or_else(|| VidsubError::InvalidInput("cue without a time line".to_string()))?;
        let (start, end) = parse_time_line(time_line)?;

        let text = lines.collect::<Vec<_>>().join("\n").trim().to_string();
        if text.is_empty() {
            continue;
        }

        let index = segments.len();
        segments.push(Segment {
            index,
            start,
            end,
            text,
        });
    }

    Ok(segments)
}

fn parse_time_line(line: &str) -> Result<(Duration, Duration)> {
    let mut parts = line.split("-->");
    let start = parts
        .next()
        .map(str::trim)
        .ok_or_else(|| VidsubError::InvalidInput(format!("bad time line: {line}")))?;
    let end = parts
        .next()
        .map(str::trim)
        .ok_or_else(|| VidsubError::InvalidInput(format!("bad time line: {line}")))?;
    Ok((parse_timestamp(start)?, parse_timestamp(end)?))
}

/// Parse `HH:MM:SS,mmm` (a `.` millisecond separator is also accepted).
pub fn parse_timestamp(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (clock, millis) = s
        .rsplit_once([',', '.'])
        .ok_or_else(|| VidsubError::InvalidInput(format!("bad timestamp: {s}")))?;

    let millis: u64 = millis
        .parse()
        .map_err(|_| VidsubError::InvalidInput(format!("bad timestamp: {s}")))?;

    let fields: Vec<&str> = clock.split(':').collect();
    if fields.len() != 3 {
        return Err(VidsubError::InvalidInput(format!("bad timestamp: {s}")));
    }
    let hours: u64 = fields[0]
        .parse()
        .map_err(|_| VidsubError::InvalidInput(format!("bad timestamp: {s}")))?;
    let minutes: u64 = fields[1]
        .parse()
        .map_err(|_| VidsubError::InvalidInput(format!("bad timestamp: {s}")))?;
    let seconds: u64 = fields[2]
        .parse()
        .map_err(|_| VidsubError::InvalidInput(format!("bad timestamp: {s}")))?;
    if minutes > 59 || seconds > 59 || millis > 999 {
        return Err(VidsubError::InvalidInput(format!("bad timestamp: {s}")));
    }

    Ok(Duration::from_millis(
        (hours * 3600 + minutes * 60 + seconds) * 1000 + millis,
    ))
}

pub fn format_timestamp(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = d.subsec_millis();
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, seconds, millis)
}
