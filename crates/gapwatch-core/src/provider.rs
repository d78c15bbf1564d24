//! Collaborators the engine consumes but does not own.
//!
//! All traits are synchronous and `Send + Sync` so one instance can back
//! several engines running on different threads.

use std::collections::BTreeMap;

use crate::config::{EngineConfig, ExpectedDuration, ExpectedSource, MissionConfig};
use crate::error::ProviderError;
use crate::key::Direction;
use crate::model::{CompletenessRecord, CompletenessValue, GlobalTotals, TicketRef};
use crate::period::{Micros, Period};
use crate::tolerance::{Scope, ToleranceTable};

// ---------------------------------------------------------------------------
// Expected values
// ---------------------------------------------------------------------------

/// Arguments of an expected-duration lookup.
#[derive(Debug, Clone, Copy)]
pub struct ExpectedQuery<'a> {
    pub mission: &'a str,
    pub acquisition_id: &'a str,
    pub product_type: &'a str,
    pub instrument_mode: Option<&'a str>,
    /// Observation window the record will carry.
    pub window: &'a Period,
}

/// Result of [`ExpectedValueProvider::aggregate_global`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalAggregate {
    pub products: BTreeMap<String, CompletenessValue>,
    pub totals: GlobalTotals,
}

/// Source of expected durations and of the per-acquisition aggregation
/// formula.
pub trait ExpectedValueProvider: Send + Sync {
    /// Expected sensing or processing duration for one product type.
    ///
    /// # Errors
    ///
    /// Returns an error when no value is configured where one should be.
    /// The engine treats this as a configuration fault and aborts the batch.
    fn expected_duration(&self, query: &ExpectedQuery<'_>) -> Result<Micros, ProviderError>;

    /// Product types produced for an instrument mode; drives sibling
    /// materialization.
    fn product_types(&self, mission: &str, instrument_mode: Option<&str>) -> Vec<String>;

    /// Combine the settled local records of one acquisition.
    ///
    /// Every record counts once with the `global` tolerance of its product
    /// type; expected and adjusted durations are summed.
    fn aggregate_global(
        &self,
        mission: &str,
        locals: &[&CompletenessRecord],
        tolerance: &ToleranceTable,
    ) -> GlobalAggregate {
        let mut aggregate = GlobalAggregate::default();
        for record in locals {
            let product_type = record.key.product_type.as_str();
            let adjustment = tolerance.resolve(mission, Scope::Global, product_type);
            let value = record.value_with_tolerance(adjustment);

            aggregate.totals.expected_duration_us = aggregate
                .totals
                .expected_duration_us
                .saturating_add(value.expected_duration_us);
            aggregate.totals.adjusted_covered_duration_us = aggregate
                .totals
                .adjusted_covered_duration_us
                .saturating_add(value.adjusted_covered_duration_us);
            aggregate.products.insert(product_type.to_string(), value);
        }
        aggregate
    }
}

/// Expected-value table read from the `[missions.*]` configuration.
///
/// Stands in for the real per-mission tables; missions with irregular
/// weighting implement [`ExpectedValueProvider`] themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticExpectedTable {
    missions: BTreeMap<String, MissionConfig>,
}

impl StaticExpectedTable {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            missions: config.missions.clone(),
        }
    }
}

impl ExpectedValueProvider for StaticExpectedTable {
    fn expected_duration(&self, query: &ExpectedQuery<'_>) -> Result<Micros, ProviderError> {
        let mission = self
            .missions
            .get(query.mission)
            .ok_or_else(|| ProviderError::UnknownMission(query.mission.to_string()))?;

        match mission.expected.get(query.product_type) {
            Some(ExpectedDuration::Fixed(us)) => Ok(*us),
            Some(ExpectedDuration::Derived(ExpectedSource::Window)) => Ok(query.window.duration_us()),
            None => Err(ProviderError::NoExpectedValue {
                mission: query.mission.to_string(),
                product_type: query.product_type.to_string(),
            }),
        }
    }

    fn product_types(&self, mission: &str, instrument_mode: Option<&str>) -> Vec<String> {
        self.missions
            .get(mission)
            .map(|m| m.product_types_for(instrument_mode))
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Planning and tickets
// ---------------------------------------------------------------------------

/// Outcome of a planning lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedNeighbor {
    Known {
        acquisition_id: String,
        /// Planned sensing window, when the plan carries one.
        window: Option<Period>,
    },
    /// Planning data not available yet.
    Unknown,
}

/// Previous/next acquisition resolution for datatake-keyed missions.
pub trait AcquisitionPlanningLookup: Send + Sync {
    /// Must return [`PlannedNeighbor::Unknown`] instead of failing when the
    /// plan is not available.
    fn neighbor(&self, mission: &str, acquisition_id: &str, direction: Direction)
    -> PlannedNeighbor;
}

/// Planning lookup over an in-memory ordered list of acquisitions per
/// mission.
#[derive(Debug, Clone, Default)]
pub struct PlanningTable {
    plans: BTreeMap<String, Vec<(String, Period)>>,
}

impl PlanningTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a planned acquisition; entries are kept in window order.
    #[must_use]
    pub fn with(mut self, mission: &str, acquisition_id: &str, window: Period) -> Self {
        let plan = self.plans.entry(mission.to_string()).or_default();
        plan.push((acquisition_id.to_string(), window));
        plan.sort_by_key(|(_, window)| *window);
        self
    }
}

impl AcquisitionPlanningLookup for PlanningTable {
    fn neighbor(
        &self,
        mission: &str,
        acquisition_id: &str,
        direction: Direction,
    ) -> PlannedNeighbor {
        let Some(plan) = self.plans.get(mission) else {
            return PlannedNeighbor::Unknown;
        };
        let Some(idx) = plan.iter().position(|(id, _)| id == acquisition_id) else {
            return PlannedNeighbor::Unknown;
        };
        let target = match direction {
            Direction::Previous => idx.checked_sub(1),
            Direction::Next => Some(idx + 1),
        };
        target
            .and_then(|i| plan.get(i))
            .map_or(PlannedNeighbor::Unknown, |(id, window)| PlannedNeighbor::Known {
                acquisition_id: id.clone(),
                window: Some(*window),
            })
    }
}

/// Read-only anomaly ticket source. Tickets never affect percentages.
pub trait TicketEnrichment: Send + Sync {
    fn tickets(&self, mission: &str, acquisition_id: &str) -> Vec<TicketRef>;
}
