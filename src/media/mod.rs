pub mod fetch;
pub mod toolkit;

pub use fetch::{FetchQuality, MediaFetcher, YtDlpFetcher};
pub use toolkit::Toolkit;

use crate::error::{Result, VidsubError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Metadata describing a media source, probed before download or taken
/// from the container of an uploaded file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: String,
    pub duration_ms: u64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub file_size_bytes: Option<u64>,
    pub view_count: Option<u64>,
    pub uploader: Option<String>,
    pub thumbnail_url: Option<String>,
    pub source_url: Option<String>,
}

impl MediaMetadata {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Corner for watermark placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkPosition {
    Tl,
    Tr,
    Bl,
    Br,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkSize {
    Small,
    Medium,
    Large,
}

impl WatermarkSize {
    /// Logo width in pixels.
    pub fn width_px(&self) -> u32 {
        match self {
            WatermarkSize::Small => 96,
            WatermarkSize::Medium => 160,
            WatermarkSize::Large => 240,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkSpec {
    #[serde(skip)]
    pub logo_bytes: Vec<u8>,
    pub position: WatermarkPosition,
    pub size: WatermarkSize,
    /// 0..=100
    pub opacity: u8,
}

/// Parse a user-supplied time string: `HH:MM:SS`, `MM:SS` or `SS`.
/// A fractional part on the seconds field is accepted.
pub fn parse_time_spec(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(VidsubError::InvalidInput("empty time string".to_string()));
    }

    let fields: Vec<&str> = s.split(':').collect();
    if fields.len() > 3 {
        return Err(VidsubError::InvalidInput(format!("bad time string: {s}")));
    }

    let bad = || VidsubError::InvalidInput(format!("bad time string: {s}"));

    let seconds: f64 = fields.last().unwrap().parse().map_err(|_| bad())?;
    if seconds < 0.0 || (fields.len() > 1 && seconds >= 60.0) {
        return Err(bad());
    }

    let mut total = seconds;
    if fields.len() >= 2 {
        let minutes: u64 = fields[fields.len() - 2].parse().map_err(|_| bad())?;
        if fields.len() == 3 && minutes > 59 {
            return Err(bad());
        }
        total += minutes as f64 * 60.0;
    }
    if fields.len() == 3 {
        let hours: u64 = fields[0].parse().map_err(|_| bad())?;
        total += hours as f64 * 3600.0;
    }

    Ok(Duration::from_secs_f64(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_spec_forms() {
        assert_eq!(parse_time_spec("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_time_spec("01:30").unwrap(), Duration::from_secs(90));
        assert_eq!(
            parse_time_spec("01:00:05").unwrap(),
            Duration::from_secs(3605)
        );
        assert_eq!(
            parse_time_spec("00:00:10.5").unwrap(),
            Duration::from_millis(10_500)
        );
    }

    #[test]
    fn test_parse_time_spec_rejects_out_of_range() {
        // 61 seconds is only valid as a bare seconds count
        assert!(parse_time_spec("59:61").is_err());
        assert!(parse_time_spec("01:61:00").is_err());
        assert!(parse_time_spec("").is_err());
        assert!(parse_time_spec("1:2:3:4").is_err());
        assert!(parse_time_spec("abc").is_err());
    }

    #[test]
    fn test_watermark_size_px() {
        assert!(WatermarkSize::Small.width_px() < WatermarkSize::Large.width_px());
    }
}
