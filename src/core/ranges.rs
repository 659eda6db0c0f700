use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Intervals closer than this are treated as contiguous.
fn adjacency() -> Duration {
    Duration::days(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(deserialize_with = "lenient_instant")]
    pub start: DateTime<Utc>,
    #[serde(deserialize_with = "lenient_instant")]
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// Build a range, swapping the bounds if they arrive reversed.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }

    fn touches(&self, other: &DateRange) -> bool {
        other.start <= self.end + adjacency() && self.start <= other.end + adjacency()
    }
}

/// Accepts RFC 3339 timestamps and bare `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.to_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn lenient_instant<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_instant(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid date: {raw}")))
}

/// Sort and coalesce overlapping or adjacent intervals.
pub fn merge_ranges(mut ranges: Vec<DateRange>) -> Vec<DateRange> {
    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<DateRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if last.touches(&range) => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Whether `instant` falls inside any recorded interval.
pub fn covers(ranges: &[DateRange], instant: DateTime<Utc>) -> bool {
    ranges.iter().any(|r| r.contains(instant))
}

/// Earliest instant any interval reaches back to.
pub fn earliest(ranges: &[DateRange]) -> Option<DateTime<Utc>> {
    ranges.iter().map(|r| r.start).min()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> DateTime<Utc> {
        parse_instant(s).unwrap()
    }

    fn range(a: &str, b: &str) -> DateRange {
        DateRange::new(day(a), day(b))
    }

    #[test]
    fn parses_dates_and_timestamps() {
        assert_eq!(day("2025-01-01"), day("2025-01-01T00:00:00Z"));
        assert!(parse_instant("yesterday").is_none());
    }

    #[test]
    fn deserializes_date_only_json() {
        let r: DateRange =
            serde_json::from_str(r#"{"start":"2025-01-01","end":"2025-01-31T12:00:00Z"}"#).unwrap();
        assert_eq!(r.start, day("2025-01-01"));
        assert!(r.contains(day("2025-01-31")));
    }

    #[test]
    fn merges_overlapping_and_adjacent() {
        let merged = merge_ranges(vec![
            range("2025-02-01", "2025-02-10"),
            range("2025-01-01", "2025-01-31"),
            range("2025-01-15", "2025-01-20"),
            range("2025-03-15", "2025-03-20"),
        ]);
        assert_eq!(
            merged,
            vec![range("2025-01-01", "2025-02-10"), range("2025-03-15", "2025-03-20")]
        );
    }

    #[test]
    fn merged_ranges_do_not_overlap() {
        let merged = merge_ranges(vec![
            range("2025-01-05", "2025-01-06"),
            range("2025-01-01", "2025-01-10"),
            range("2024-12-01", "2025-01-02"),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0], range("2024-12-01", "2025-01-10"));
    }
}
