pub mod srt;

pub use srt::{emit, parse};

use crate::error::{Result, VidsubError};
use std::time::Duration;

/// A single timed subtitle segment. `index` is dense from 0 within a list
/// and stable across translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub start: Duration,
    pub end: Duration,
    pub text: String,
}

impl Segment {
    pub fn new(index: usize, start: Duration, end: Duration, text: impl Into<String>) -> Self {
        Self {
            index,
            start,
            end,
            text: text.into(),
        }
    }

    pub fn start_ms(&self) -> u64 {
        self.start.as_millis() as u64
    }

    pub fn end_ms(&self) -> u64 {
        self.end.as_millis() as u64
    }

    /// Batch this segment belongs to for a given batch size.
    pub fn batch_id(&self, batch_size: usize) -> usize {
        self.index / batch_size
    }
}

/// Check the list invariants: positive duration per cue, chronological
/// non-overlapping cues, dense indices from 0.
pub fn validate(segments: &[Segment]) -> Result<()> {
    for (i, seg) in segments.iter().enumerate() {
        if seg.index != i {
            return Err(VidsubError::InvalidInput(format!(
                "segment index {} at position {i} is not dense",
                seg.index
            )));
        }
        if seg.start >= seg.end {
            return Err(VidsubError::InvalidInput(format!(
                "segment {i} has start >= end ({:?} >= {:?})",
                seg.start, seg.end
            )));
        }
        if i > 0 && segments[i - 1].end > seg.start {
            return Err(VidsubError::InvalidInput(format!(
                "segment {i} overlaps its predecessor"
            )));
        }
    }
    Ok(())
}

/// Repair a list so it satisfies the invariants: sort by start, pull back
/// overlapping end times, drop empty-duration cues, reindex densely.
pub fn normalize(mut segments: Vec<Segment>) -> Vec<Segment> {
    segments.sort_by_key(|s| s.start);

    let mut result: Vec<Segment> = Vec::with_capacity(segments.len());
    for seg in segments {
        if let Some(last) = result.last_mut() {
            if seg.start < last.end {
                last.end = seg.start;
            }
        }
        result.push(seg);
    }

    result.retain(|s| s.start < s.end && !s.text.trim().is_empty());
    for (i, seg) in result.iter_mut().enumerate() {
        seg.index = i;
    }
    result
}

/// Like [`normalize`] but never drops a cue: overlapping end times are
/// pulled back and indices reassigned, keeping the count intact so texts
/// paired by position stay paired.
pub fn clamp_overlaps(mut segments: Vec<Segment>) -> Vec<Segment> {
    segments.sort_by_key(|s| s.start);
    for i in 1..segments.len() {
        let start = segments[i].start;
        let prev = &mut segments[i - 1];
        if prev.end > start {
            prev.end = start;
        }
    }
    for (i, seg) in segments.iter_mut().enumerate() {
        seg.index = i;
    }
    segments
}

/// Replace the text of each segment by position, keeping timestamps and
/// indices. Lengths must match.
pub fn with_texts(segments: &[Segment], texts: &[String]) -> Result<Vec<Segment>> {
    if segments.len() != texts.len() {
        return Err(VidsubError::InvalidInput(format!(
            "text count {} does not match segment count {}",
            texts.len(),
            segments.len()
        )));
    }
    Ok(segments
        .iter()
        .zip(texts.iter())
        .map(|(seg, text)| Segment {
            index: seg.index,
            start: seg.start,
            end: seg.end,
            text: text.clone(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(index: usize, start_ms: u64, end_ms: u64, text: &str) -> Segment {
        Segment::new(
            index,
            Duration::from_millis(start_ms),
            Duration::from_millis(end_ms),
            text,
        )
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        let segments = vec![seg(0, 0, 1000, "a"), seg(1, 1000, 2000, "b")];
        assert!(validate(&segments).is_ok());
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let segments = vec![seg(0, 0, 1500, "a"), seg(1, 1000, 2000, "b")];
        assert!(validate(&segments).is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_cue() {
        let segments = vec![seg(0, 1000, 1000, "a")];
        assert!(validate(&segments).is_err());
    }

    #[test]
    fn test_validate_rejects_sparse_index() {
        let segments = vec![seg(0, 0, 500, "a"), seg(2, 500, 1000, "b")];
        assert!(validate(&segments).is_err());
    }

    #[test]
    fn test_normalize_fixes_overlap() {
        let segments = vec![seg(0, 0, 1500, "a"), seg(1, 1000, 2000, "b")];
        let fixed = normalize(segments);
        assert!(validate(&fixed).is_ok());
        assert_eq!(fixed[0].end, Duration::from_millis(1000));
    }

    #[test]
    fn test_normalize_drops_empty_text() {
        let segments = vec![seg(0, 0, 500, "  "), seg(1, 500, 1000, "b")];
        let fixed = normalize(segments);
        assert_eq!(fixed.len(), 1);
        assert_eq!(fixed[0].index, 0);
        assert_eq!(fixed[0].text, "b");
    }

    #[test]
    fn test_clamp_overlaps_keeps_count() {
        let segments = vec![seg(0, 0, 1500, "a"), seg(1, 1000, 2000, "b")];
        let clamped = clamp_overlaps(segments);
        assert_eq!(clamped.len(), 2);
        assert_eq!(clamped[0].end, Duration::from_millis(1000));
        assert!(validate(&clamped).is_ok());
    }

    #[test]
    fn test_batch_id() {
        assert_eq!(seg(0, 0, 1, "x").batch_id(20), 0);
        assert_eq!(seg(19, 0, 1, "x").batch_id(20), 0);
        assert_eq!(seg(20, 0, 1, "x").batch_id(20), 1);
        assert_eq!(seg(45, 0, 1, "x").batch_id(20), 2);
    }

    #[test]
    fn test_with_texts_preserves_timing() {
        let segments = vec![seg(0, 0, 1000, "hello"), seg(1, 1000, 2000, "world")];
        let texts = vec!["hola".to_string(), "mundo".to_string()];
        let replaced = with_texts(&segments, &texts).unwrap();
        assert_eq!(replaced[0].text, "hola");
        assert_eq!(replaced[0].start, segments[0].start);
        assert_eq!(replaced[1].end, segments[1].end);
        assert_eq!(replaced[1].index, 1);
    }

    #[test]
    fn test_with_texts_rejects_length_mismatch() {
        let segments = vec![seg(0, 0, 1000, "hello")];
        assert!(with_texts(&segments, &[]).is_err());
    }
}
