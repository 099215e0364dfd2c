//! Per-step progress ranges.
//!
//! Every step registered in a workflow owns a `[start, end]` slice of the
//! job's 0-100 progress scale. The executor reports `end` when the step
//! finishes and an interpolated value when the step reports sub-progress.

use serde::{Deserialize, Serialize};

use crate::error::ProgressRangeError;

/// Immutable `[start, end]` percentage slice, `0 <= start < end <= 100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRange", into = "RawRange")]
pub struct ProgressRange {
    start: u8,
    end: u8,
}

impl ProgressRange {
    /// Create a validated range.
    pub fn new(start: u8, end: u8) -> Result<Self, ProgressRangeError> {
        if end > 100 {
            return Err(ProgressRangeError::EndOutOfBounds(end));
        }
        if start >= end {
            return Err(ProgressRangeError::Empty { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u8 {
        self.start
    }

    pub fn end(&self) -> u8 {
        self.end
    }

    /// Proportional in-range value for a step that has finished `done` of
    /// `total` units of work. Clamped to the range; `total == 0` yields `start`.
    pub fn interpolate(&self, done: u64, total: u64) -> u8 {
        if total == 0 {
            return self.start;
        }
        let done = done.min(total);
        let span = u64::from(self.end - self.start);
        let offset = span * done / total;
        self.start + offset as u8
    }
}

#[derive(Serialize, Deserialize)]
struct RawRange {
    start: u8,
    end: u8,
}

impl TryFrom<RawRange> for ProgressRange {
    type Error = ProgressRangeError;

    fn try_from(raw: RawRange) -> Result<Self, Self::Error> {
        ProgressRange::new(raw.start, raw.end)
    }
}

impl From<ProgressRange> for RawRange {
    fn from(range: ProgressRange) -> Self {
        RawRange {
            start: range.start,
            end: range.end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_range() {
        let range = ProgressRange::new(0, 100).unwrap();
        assert_eq!(range.start(), 0);
        assert_eq!(range.end(), 100);
    }

    #[test]
    fn test_rejects_empty_and_inverted() {
        assert_eq!(
            ProgressRange::new(30, 30).unwrap_err(),
            ProgressRangeError::Empty { start: 30, end: 30 }
        );
        assert!(ProgressRange::new(50, 10).is_err());
    }

    #[test]
    fn test_rejects_end_above_100() {
        assert_eq!(
            ProgressRange::new(90, 101).unwrap_err(),
            ProgressRangeError::EndOutOfBounds(101)
        );
    }

    #[test]
    fn test_interpolate_per_page() {
        // OCR over 4 pages inside the 20-60 slice
        let range = ProgressRange::new(20, 60).unwrap();
        assert_eq!(range.interpolate(0, 4), 20);
        assert_eq!(range.interpolate(1, 4), 30);
        assert_eq!(range.interpolate(4, 4), 60);
        assert_eq!(range.interpolate(9, 4), 60, "over-reporting is clamped");
        assert_eq!(range.interpolate(3, 0), 20);
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: ProgressRange = serde_json::from_str(r#"{"start":10,"end":20}"#).unwrap();
        assert_eq!(ok.end(), 20);

        let bad = serde_json::from_str::<ProgressRange>(r#"{"start":20,"end":10}"#);
        assert!(bad.is_err());
    }
}
