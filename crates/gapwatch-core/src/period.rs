//! Interval algebra over observation periods.
//!
//! Every duration in this module is a signed count of microseconds
//! ([`Micros`]). Periods are accumulated as integers so that summing many
//! short intervals never drifts.
//!
//! # Sorted inputs
//!
//! [`total_covered_duration`], [`find_missing_periods`] and
//! [`duplicate_indicator`] expect their input sorted by start. Callers that
//! cannot prove ordering should go through [`sort_periods`] first; an unsorted
//! slice silently undercounts coverage.

use std::fmt;

use chrono::{DateTime, Duration, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Signed duration in microseconds.
pub type Micros = i64;

// ---------------------------------------------------------------------------
// Period
// ---------------------------------------------------------------------------

/// A closed time interval `[start, end]` at microsecond resolution.
///
/// Zero-length periods are valid and are used as boundary markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawPeriod")]
pub struct Period {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawPeriod {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<RawPeriod> for Period {
    type Error = InvalidPeriod;

    fn try_from(raw: RawPeriod) -> Result<Self, Self::Error> {
        Self::new(raw.start, raw.end)
    }
}

/// Bounds that do not form a period.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPeriod {
    #[error("period ends before it starts: start={start} end={end}")]
    Inverted {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("timestamp {0}us is outside the representable range")]
    OutOfRange(Micros),
}

impl Period {
    /// Build a period, truncating both bounds to whole microseconds.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPeriod::Inverted`] when `end < start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, InvalidPeriod> {
        let start = truncate_to_micros(start);
        let end = truncate_to_micros(end);
        if end < start {
            return Err(InvalidPeriod::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    /// Build a period from microseconds since the Unix epoch.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPeriod::Inverted`] when `end_us < start_us` and
    /// [`InvalidPeriod::OutOfRange`] when either bound has no UTC timestamp.
    pub fn from_micros(start_us: Micros, end_us: Micros) -> Result<Self, InvalidPeriod> {
        let at = |us: Micros| DateTime::from_timestamp_micros(us).ok_or(InvalidPeriod::OutOfRange(us));
        Self::new(at(start_us)?, at(end_us)?)
    }

    #[must_use]
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Length of the period in microseconds.
    #[must_use]
    pub fn duration_us(&self) -> Micros {
        span_us(self.start, self.end)
    }

    /// The same period moved by `delta_us` (negative moves it earlier).
    #[must_use]
    pub fn shifted(&self, delta_us: Micros) -> Self {
        Self {
            start: offset(self.start, delta_us),
            end: offset(self.end, delta_us),
        }
    }

    /// The smallest period containing both `self` and `other`.
    #[must_use]
    pub fn envelope(&self, other: &Self) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Returns the period with its end pushed out to at least
    /// `start + min_len_us`.
    #[must_use]
    pub fn with_min_length(&self, min_len_us: Micros) -> Self {
        let stretched = offset(self.start, min_len_us.max(0));
        Self {
            start: self.start,
            end: self.end.max(stretched),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}]",
            self.start.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.end.to_rfc3339_opts(SecondsFormat::Micros, true)
        )
    }
}

fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = ts.nanosecond();
    ts.with_nanosecond(nanos - nanos % 1_000).unwrap_or(ts)
}

/// `to - from` in microseconds, saturating on overflow.
fn span_us(from: DateTime<Utc>, to: DateTime<Utc>) -> Micros {
    (to - from)
        .num_microseconds()
        .unwrap_or(if to >= from { Micros::MAX } else { Micros::MIN })
}

/// `ts + delta_us`, clamped to the representable range.
fn offset(ts: DateTime<Utc>, delta_us: Micros) -> DateTime<Utc> {
    ts.checked_add_signed(Duration::microseconds(delta_us))
        .unwrap_or(if delta_us < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

// ---------------------------------------------------------------------------
// Algebra
// ---------------------------------------------------------------------------

/// Return a copy of `periods` ordered by start, then end.
#[must_use]
pub fn sort_periods(periods: &[Period]) -> Vec<Period> {
    let mut sorted = periods.to_vec();
    sorted.sort_unstable();
    sorted
}

/// Duration covered by the union of `periods`, which must be sorted by start.
///
/// Single pass: a period starting at or after the running end contributes
/// its full length, a period straddling it contributes only the extension,
/// and a fully contained period contributes nothing.
#[must_use]
pub fn total_covered_duration(periods: &[Period]) -> Micros {
    let mut total: Micros = 0;
    let mut last_end: Option<DateTime<Utc>> = None;

    for period in periods {
        match last_end {
            Some(end) if period.start < end => {
                if period.end > end {
                    total = total.saturating_add(span_us(end, period.end));
                    last_end = Some(period.end);
                }
            }
            _ => {
                total = total.saturating_add(period.duration_us());
                last_end = Some(period.end);
            }
        }
    }

    total
}

/// The `(min start, max end)` envelope, or `None` for an empty input.
#[must_use]
pub fn covering_period(periods: &[Period]) -> Option<Period> {
    let mut iter = periods.iter();
    let first = *iter.next()?;
    Some(iter.fold(first, |acc, p| acc.envelope(p)))
}

/// Merge periods whose tolerance-expanded bounds touch.
///
/// Each period is widened by `tolerance_us` on both sides for the comparison
/// only; a merged period spans from the first start to the furthest end, so
/// the gap it bridged stays counted as covered. The output is sorted,
/// non-overlapping and stable under a second pass with the same tolerance.
/// Output bounds are the real, unwidened bounds of the merged inputs.
#[must_use]
pub fn reduce_periods(periods: &[Period], tolerance_us: Micros) -> Vec<Period> {
    let tolerance = tolerance_us.max(0);
    let mut reduced: Vec<Period> = Vec::with_capacity(periods.len());

    for period in sort_periods(periods) {
        match reduced.last_mut() {
            Some(last) if offset(period.start, -tolerance) <= offset(last.end, tolerance) => {
                if period.end > last.end {
                    last.end = period.end;
                }
            }
            _ => reduced.push(period),
        }
    }

    reduced
}

/// Gaps of `window` not covered by `coverage`.
///
/// `coverage` must be sorted and non-overlapping (the output of
/// [`reduce_periods`]). A leading gap no longer than `max_start_offset_us`
/// is absorbed; once it exceeds the offset every gap is reported. The window
/// end is moved by `end_tolerance_us` before the trailing gap is computed, so
/// negative values absorb a short trailing shortfall.
#[must_use]
pub fn find_missing_periods(
    window: &Period,
    coverage: &[Period],
    max_start_offset_us: Micros,
    end_tolerance_us: Micros,
) -> Vec<Period> {
    let (Some(first), Some(last)) = (coverage.first(), coverage.last()) else {
        return vec![*window];
    };

    let mut missing = Vec::new();

    if first.start > window.start && span_us(window.start, first.start) > max_start_offset_us {
        missing.push(Period {
            start: window.start,
            end: first.start.min(window.end).max(window.start),
        });
    }

    for pair in coverage.windows(2) {
        if pair[1].start > pair[0].end {
            missing.push(Period {
                start: pair[0].end,
                end: pair[1].start,
            });
        }
    }

    let effective_end = offset(window.end, end_tolerance_us);
    if effective_end > last.end {
        missing.push(Period {
            start: last.end,
            end: effective_end,
        });
    }

    missing
}

// ---------------------------------------------------------------------------
// Duplicate indicator
// ---------------------------------------------------------------------------

/// Overlap statistics between consecutive deliveries.
///
/// Diagnostic only: it never feeds the completeness percentage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DuplicateIndicator {
    pub min_percentage: f64,
    pub avg_percentage: f64,
    pub max_percentage: f64,
    pub min_duration_us: Micros,
    pub avg_duration_us: Micros,
    pub max_duration_us: Micros,
}

impl DuplicateIndicator {
    /// True when no overlapping pair was found.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.max_duration_us == 0 && self.max_percentage == 0.0
    }
}

/// Summarise overlaps between consecutive periods (sorted by start).
///
/// For each pair where the second starts before the first ends, the overlap
/// is `min(first.end, second.end) - second.start`, expressed also as a
/// percentage of the first period's own length (0% for a zero-length first
/// period).
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn duplicate_indicator(periods: &[Period]) -> DuplicateIndicator {
    let overlaps: Vec<(f64, Micros)> = periods
        .windows(2)
        .filter(|pair| pair[1].start < pair[0].end)
        .map(|pair| {
            let (first, second) = (pair[0], pair[1]);
            let overlap = span_us(second.start, first.end.min(second.end));
            let base = first.duration_us();
            let pct = if base > 0 {
                overlap as f64 / base as f64 * 100.0
            } else {
                0.0
            };
            (pct, overlap)
        })
        .collect();

    if overlaps.is_empty() {
        return DuplicateIndicator::default();
    }

    let count = overlaps.len();
    let pct_sum: f64 = overlaps.iter().map(|(pct, _)| pct).sum();
    let dur_sum: i128 = overlaps.iter().map(|(_, dur)| i128::from(*dur)).sum();

    DuplicateIndicator {
        min_percentage: overlaps.iter().map(|(p, _)| *p).fold(f64::INFINITY, f64::min),
        avg_percentage: pct_sum / count as f64,
        max_percentage: overlaps.iter().map(|(p, _)| *p).fold(0.0, f64::max),
        min_duration_us: overlaps.iter().map(|(_, d)| *d).min().unwrap_or(0),
        avg_duration_us: Micros::try_from(dur_sum / count as i128).unwrap_or(Micros::MAX),
        max_duration_us: overlaps.iter().map(|(_, d)| *d).max().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Micros = 1_000_000;

    fn p(start_s: i64, end_s: i64) -> Period {
        Period::from_micros(start_s * SEC, end_s * SEC).expect("valid period")
    }

    #[test]
    fn new_rejects_inverted_bounds() {
        let err = Period::from_micros(10, 5).unwrap_err();
        assert!(err.to_string().contains("ends before it starts"));
    }

    #[test]
    fn unrepresentable_micros_are_rejected() {
        assert_eq!(
            Period::from_micros(i64::MIN, 0),
            Err(InvalidPeriod::OutOfRange(i64::MIN))
        );
        assert_eq!(
            Period::from_micros(0, i64::MAX),
            Err(InvalidPeriod::OutOfRange(i64::MAX))
        );
        assert!(Period::from_micros(i64::MIN, i64::MIN).is_err());
    }

    #[test]
    fn new_truncates_to_microseconds() {
        let start = DateTime::from_timestamp(100, 123_456_789).expect("ts");
        let period = Period::new(start, start).expect("zero-length");
        assert_eq!(period.start().nanosecond(), 123_456_000);
        assert_eq!(period.duration_us(), 0);
    }

    #[test]
    fn covered_duration_of_disjoint_periods_is_their_sum() {
        let periods = [p(0, 10), p(20, 25), p(30, 31)];
        assert_eq!(total_covered_duration(&periods), 16 * SEC);
    }

    #[test]
    fn covered_duration_ignores_contained_period() {
        let periods = [p(0, 60), p(10, 20)];
        assert_eq!(total_covered_duration(&periods), 60 * SEC);
    }

    #[test]
    fn covered_duration_counts_only_extension_of_straddling_period() {
        let periods = [p(0, 10), p(5, 15)];
        assert_eq!(total_covered_duration(&periods), 15 * SEC);
    }

    #[test]
    fn covered_duration_of_touching_periods() {
        let periods = [p(0, 10), p(10, 20)];
        assert_eq!(total_covered_duration(&periods), 20_000_000);
    }

    #[test]
    fn covering_period_envelope() {
        assert_eq!(covering_period(&[]), None);
        assert_eq!(covering_period(&[p(5, 8), p(1, 3), p(7, 12)]), Some(p(1, 12)));
    }

    #[test]
    fn reduce_merges_overlapping_and_touching() {
        let reduced = reduce_periods(&[p(10, 20), p(0, 10), p(15, 18), p(30, 40)], 0);
        assert_eq!(reduced, vec![p(0, 20), p(30, 40)]);
    }

    #[test]
    fn reduce_bridges_gap_within_tolerance() {
        // 4s gap, tolerance 2s on each side -> bridged.
        let reduced = reduce_periods(&[p(0, 10), p(14, 20)], 2 * SEC);
        assert_eq!(reduced, vec![p(0, 20)]);

        let kept_apart = reduce_periods(&[p(0, 10), p(15, 20)], 2 * SEC);
        assert_eq!(kept_apart, vec![p(0, 10), p(15, 20)]);
    }

    #[test]
    fn reduce_is_stable_on_second_pass() {
        let input = [p(0, 4), p(5, 9), p(12, 13), p(30, 31)];
        let once = reduce_periods(&input, SEC);
        assert_eq!(reduce_periods(&once, SEC), once);
    }

    #[test]
    fn missing_with_no_coverage_is_whole_window() {
        let window = p(0, 30);
        assert_eq!(find_missing_periods(&window, &[], 0, 0), vec![window]);
    }

    #[test]
    fn missing_trailing_gap() {
        let window = p(0, 30);
        let coverage = reduce_periods(&[p(0, 10), p(10, 20)], 0);
        assert_eq!(
            find_missing_periods(&window, &coverage, 0, 0),
            vec![p(20, 30)]
        );
    }

    #[test]
    fn missing_leading_gap_absorbed_within_offset() {
        let window = p(0, 30);
        let coverage = [p(2, 10), p(15, 30)];
        assert_eq!(
            find_missing_periods(&window, &coverage, 3 * SEC, 0),
            vec![p(10, 15)]
        );
        assert_eq!(
            find_missing_periods(&window, &coverage, SEC, 0),
            vec![p(0, 2), p(10, 15)]
        );
    }

    #[test]
    fn missing_trailing_gap_absorbed_by_negative_end_tolerance() {
        let window = p(0, 30);
        let coverage = [p(0, 28)];
        assert!(find_missing_periods(&window, &coverage, 0, -3 * SEC).is_empty());
        assert_eq!(
            find_missing_periods(&window, &coverage, 0, 0),
            vec![p(28, 30)]
        );
    }

    #[test]
    fn duplicate_indicator_needs_two_periods() {
        assert_eq!(duplicate_indicator(&[]), DuplicateIndicator::default());
        assert_eq!(duplicate_indicator(&[p(0, 10)]), DuplicateIndicator::default());
        assert!(duplicate_indicator(&[p(0, 10)]).is_clear());
    }

    #[test]
    fn duplicate_indicator_aggregates_overlaps() {
        // overlaps: 5s of a 10s period (50%), then 2s of a 10s period (20%)
        let periods = [p(0, 10), p(5, 15), p(13, 20)];
        let ind = duplicate_indicator(&periods);
        assert_eq!(ind.min_duration_us, 2 * SEC);
        assert_eq!(ind.max_duration_us, 5 * SEC);
        assert_eq!(ind.avg_duration_us, 3_500_000);
        assert!((ind.min_percentage - 20.0).abs() < 1e-9);
        assert!((ind.max_percentage - 50.0).abs() < 1e-9);
        assert!((ind.avg_percentage - 35.0).abs() < 1e-9);
    }

    #[test]
    fn duplicate_indicator_guards_zero_length_base() {
        let ind = duplicate_indicator(&[p(5, 5), p(5, 6)]);
        // second does not start before a zero-length first ends
        assert!(ind.is_clear());

        let contained = duplicate_indicator(&[p(0, 10), p(2, 4)]);
        assert_eq!(contained.max_duration_us, 2 * SEC);
    }

    #[test]
    fn serde_rejects_inverted_period() {
        let json = r#"{"start":"2024-01-01T00:00:10Z","end":"2024-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<Period>(json).is_err());

        let ok = r#"{"start":"2024-01-01T00:00:00Z","end":"2024-01-01T00:00:10Z"}"#;
        let period: Period = serde_json::from_str(ok).expect("valid period");
        assert_eq!(period.duration_us(), 10 * SEC);
    }
}
