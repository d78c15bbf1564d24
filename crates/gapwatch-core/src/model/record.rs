//! Completeness records: the per-key local record and the per-acquisition
//! global aggregate.
//!
//! Every derived field (`covered`, `adjusted`, `percentage`, `status`,
//! `missing_periods`, `duplicate`) is a pure function of the record's
//! contributions, window, expected duration and the [`RecomputeParams`], so
//! two records built from the same inputs compare equal field by field. The
//! engine relies on that for change detection.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::key::{ComputeKey, GlobalKey};
use crate::period::{
    DuplicateIndicator, Micros, Period, duplicate_indicator, find_missing_periods,
    reduce_periods, sort_periods, total_covered_duration,
};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Classification of delivered versus expected coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletenessStatus {
    Missing,
    Partial,
    Complete,
}

impl CompletenessStatus {
    /// `0 -> Missing`, `0 < p < 100 -> Partial`, `p >= 100 -> Complete`.
    #[must_use]
    pub fn classify(percentage: f64) -> Self {
        if percentage >= 100.0 {
            Self::Complete
        } else if percentage > 0.0 {
            Self::Partial
        } else {
            Self::Missing
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Partial => "partial",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for CompletenessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompletenessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing" => Ok(Self::Missing),
            "partial" => Ok(Self::Partial),
            "complete" => Ok(Self::Complete),
            other => Err(format!(
                "unknown completeness status '{other}': expected missing, partial or complete"
            )),
        }
    }
}

/// `adjusted / expected * 100`, 0 when nothing is expected, clamped to
/// `[0, 100]`.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn completeness_percentage(adjusted_us: Micros, expected_us: Micros) -> f64 {
    if expected_us <= 0 {
        return 0.0;
    }
    (adjusted_us as f64 / expected_us as f64 * 100.0).clamp(0.0, 100.0)
}

// ---------------------------------------------------------------------------
// CompletenessValue
// ---------------------------------------------------------------------------

/// Expected/covered/adjusted triple with its derived percentage and status.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletenessValue {
    pub expected_duration_us: Micros,
    pub covered_duration_us: Micros,
    pub adjusted_covered_duration_us: Micros,
    pub percentage: f64,
    pub status: CompletenessStatus,
}

impl CompletenessValue {
    /// `adjusted = min(covered, expected + tolerance)`, never negative.
    #[must_use]
    pub fn compute(expected_us: Micros, covered_us: Micros, tolerance_us: Micros) -> Self {
        let ceiling = expected_us.saturating_add(tolerance_us);
        let adjusted = covered_us.min(ceiling).max(0);
        let percentage = completeness_percentage(adjusted, expected_us);
        Self {
            expected_duration_us: expected_us,
            covered_duration_us: covered_us,
            adjusted_covered_duration_us: adjusted,
            percentage,
            status: CompletenessStatus::classify(percentage),
        }
    }
}

/// Read-only anomaly ticket reference attached by enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Mission knobs that feed a local recompute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecomputeParams {
    /// Signed adjustment from the tolerance table (local scope).
    pub tolerance_us: Micros,
    /// Gap bridged when reducing contributions.
    pub gap_tolerance_us: Micros,
    /// Leading gap absorbed before any gap is reported.
    pub missing_start_offset_us: Micros,
    /// Signed adjustment of the window end for the trailing gap.
    pub missing_end_tolerance_us: Micros,
}

// ---------------------------------------------------------------------------
// CompletenessRecord
// ---------------------------------------------------------------------------

/// Completeness of one `(acquisition, product type[, timeliness])`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletenessRecord {
    pub key: ComputeKey,
    pub mission: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument_mode: Option<String>,
    pub observation_window: Period,
    pub expected_duration_us: Micros,
    pub covered_duration_us: Micros,
    pub adjusted_covered_duration_us: Micros,
    pub percentage: f64,
    pub status: CompletenessStatus,
    #[serde(default)]
    pub missing_periods: Vec<Period>,
    #[serde(default)]
    pub duplicate: DuplicateIndicator,
    /// Delivered products keyed by product name.
    #[serde(default)]
    pub contributions: BTreeMap<String, Period>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<TicketRef>,
}

impl CompletenessRecord {
    /// A zero-coverage record: status `Missing`, whole window missing.
    #[must_use]
    pub fn placeholder(
        key: ComputeKey,
        mission: impl Into<String>,
        instrument_mode: Option<String>,
        observation_window: Period,
        expected_duration_us: Micros,
    ) -> Self {
        let value = CompletenessValue::compute(expected_duration_us, 0, 0);
        Self {
            key,
            mission: mission.into(),
            instrument_mode,
            observation_window,
            expected_duration_us,
            covered_duration_us: 0,
            adjusted_covered_duration_us: value.adjusted_covered_duration_us,
            percentage: value.percentage,
            status: value.status,
            missing_periods: vec![observation_window],
            duplicate: DuplicateIndicator::default(),
            contributions: BTreeMap::new(),
            ticket: None,
        }
    }

    /// True while no product has been delivered for this key.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.contributions.is_empty()
    }

    /// Contribution periods ordered by start.
    #[must_use]
    pub fn sorted_periods(&self) -> Vec<Period> {
        let periods: Vec<Period> = self.contributions.values().copied().collect();
        sort_periods(&periods)
    }

    /// Recompute every derived field from the current contributions.
    pub fn recompute(&mut self, params: &RecomputeParams) {
        let periods = self.sorted_periods();
        let coverage = reduce_periods(&periods, params.gap_tolerance_us);

        self.covered_duration_us = total_covered_duration(&coverage);
        self.missing_periods = find_missing_periods(
            &self.observation_window,
            &coverage,
            params.missing_start_offset_us,
            params.missing_end_tolerance_us,
        );
        self.duplicate = duplicate_indicator(&periods);

        let value = CompletenessValue::compute(
            self.expected_duration_us,
            self.covered_duration_us,
            params.tolerance_us,
        );
        self.adjusted_covered_duration_us = value.adjusted_covered_duration_us;
        self.percentage = value.percentage;
        self.status = value.status;
    }

    /// Current value triple, recomputed under another tolerance.
    #[must_use]
    pub fn value_with_tolerance(&self, tolerance_us: Micros) -> CompletenessValue {
        CompletenessValue::compute(
            self.expected_duration_us,
            self.covered_duration_us,
            tolerance_us,
        )
    }
}

// ---------------------------------------------------------------------------
// GlobalRecord
// ---------------------------------------------------------------------------

/// Totals returned by the aggregation formula.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalTotals {
    pub expected_duration_us: Micros,
    pub adjusted_covered_duration_us: Micros,
}

/// Per-acquisition aggregate over product types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalRecord {
    pub key: GlobalKey,
    pub mission: String,
    pub observation_window: Period,
    /// Per product type values, global tolerance applied.
    #[serde(default)]
    pub products: BTreeMap<String, CompletenessValue>,
    pub expected_duration_us: Micros,
    pub adjusted_covered_duration_us: Micros,
    pub percentage: f64,
    pub status: CompletenessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<TicketRef>,
}

impl GlobalRecord {
    #[must_use]
    pub fn empty(key: GlobalKey, mission: impl Into<String>, observation_window: Period) -> Self {
        Self {
            key,
            mission: mission.into(),
            observation_window,
            products: BTreeMap::new(),
            expected_duration_us: 0,
            adjusted_covered_duration_us: 0,
            percentage: 0.0,
            status: CompletenessStatus::Missing,
            ticket: None,
        }
    }

    /// Store aggregation totals and refresh percentage and status.
    pub fn apply_totals(&mut self, totals: GlobalTotals) {
        let adjusted = totals
            .adjusted_covered_duration_us
            .min(totals.expected_duration_us.max(0))
            .max(0);
        self.expected_duration_us = totals.expected_duration_us;
        self.adjusted_covered_duration_us = adjusted;
        self.percentage = completeness_percentage(adjusted, totals.expected_duration_us);
        self.status = CompletenessStatus::classify(self.percentage);
    }
}
