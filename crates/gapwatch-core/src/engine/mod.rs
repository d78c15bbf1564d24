//! Batch completeness engine.
//!
//! One call turns an unordered batch of [`RawEvent`]s into the ordered
//! [`PersistenceInstruction`]s for the records that actually changed.
//!
//! Phases, each timed under [`Phase`]:
//!
//! 1. **key**: derive a [`ComputeKey`] per event; events without one are
//!    domain skips.
//! 2. **load**: multi-get every distinct key into the [`BatchCache`].
//! 3. **materialize**: create records for unseen keys, plus placeholders
//!    for sibling product types and neighbor acquisitions.
//! 4. **recompute**: fold each key's events into its contributions once.
//! 5. **aggregate**: one global aggregation per touched acquisition, after
//!    all its local keys are settled.
//! 6. **diff**: emit instructions for entries that differ from their
//!    snapshot.
//!
//! Nothing is written before phase 6, so an error or a cancellation leaves
//! the store untouched.

pub mod cache;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

pub use cache::{BatchCache, CacheEntry, Origin};

use crate::config::{EngineConfig, MissionConfig};
use crate::error::EngineError;
use crate::event::RawEvent;
use crate::key::{ComputeKey, Direction, GlobalKey};
use crate::model::{CompletenessRecord, GlobalRecord, RecomputeParams, TicketRef};
use crate::period::{Micros, Period};
use crate::provider::{
    AcquisitionPlanningLookup, ExpectedQuery, ExpectedValueProvider, PlannedNeighbor,
    TicketEnrichment,
};
use crate::store::{PersistenceInstruction, RecordStore, UpsertReport};
use crate::timing::{Phase, timed};
use crate::tolerance::Scope;

/// Counters for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub events: usize,
    pub domain_skips: usize,
    pub distinct_keys: usize,
    pub loaded: usize,
    pub created: usize,
    pub placeholders: usize,
    pub globals: usize,
    pub unchanged: usize,
    /// Storage ids whose materialization or aggregation was deferred.
    pub deferred: Vec<String>,
}

/// Result of [`BatchEngine::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub instructions: Vec<PersistenceInstruction>,
    pub stats: BatchStats,
}

/// Result of [`BatchEngine::run_and_persist`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistedBatch {
    pub outcome: BatchOutcome,
    pub report: UpsertReport,
}

/// Events that map to one compute key.
#[derive(Debug)]
struct Work<'e> {
    mission: &'e str,
    instrument_mode: Option<&'e str>,
    seed: Period,
    events: Vec<&'e RawEvent>,
}

impl<'e> Work<'e> {
    fn new(event: &'e RawEvent) -> Self {
        Self {
            mission: &event.mission,
            instrument_mode: event.instrument_mode.as_deref(),
            seed: event.observation,
            events: Vec::new(),
        }
    }

    fn push(&mut self, event: &'e RawEvent) {
        if self.instrument_mode.is_none() {
            self.instrument_mode = event.instrument_mode.as_deref();
        }
        self.events.push(event);
    }

    fn has_planned_window(&self) -> bool {
        self.events.iter().any(|e| e.acquisition_window.is_some())
    }

    /// Envelope of the planned windows when any event carries one, else of
    /// the observations.
    fn window(&self) -> Period {
        envelope(self.events.iter().filter_map(|e| e.acquisition_window))
            .or_else(|| envelope(self.events.iter().map(|e| e.observation)))
            .unwrap_or(self.seed)
    }
}

#[derive(Debug)]
enum TicketUpdate {
    Keep,
    Set(Option<TicketRef>),
}

/// Stateless orchestrator; every call builds and drops its own cache.
pub struct BatchEngine<'a> {
    config: &'a EngineConfig,
    store: &'a dyn RecordStore,
    expected: &'a dyn ExpectedValueProvider,
    planning: Option<&'a dyn AcquisitionPlanningLookup>,
    tickets: Option<&'a dyn TicketEnrichment>,
}

impl<'a> BatchEngine<'a> {
    #[must_use]
    pub fn new(
        config: &'a EngineConfig,
        store: &'a dyn RecordStore,
        expected: &'a dyn ExpectedValueProvider,
    ) -> Self {
        Self {
            config,
            store,
            expected,
            planning: None,
            tickets: None,
        }
    }

    #[must_use]
    pub fn with_planning(mut self, planning: &'a dyn AcquisitionPlanningLookup) -> Self {
        self.planning = Some(planning);
        self
    }

    #[must_use]
    pub fn with_tickets(mut self, tickets: &'a dyn TicketEnrichment) -> Self {
        self.tickets = Some(tickets);
        self
    }

    /// Compute key of an event, `None` when it cannot be keyed.
    #[must_use]
    pub fn compute_key(&self, event: &RawEvent) -> Option<ComputeKey> {
        let mission = self.config.mission(&event.mission)?;
        if !mission.supports(&event.product_type) {
            return None;
        }
        let acquisition = mission.scheme.canonicalize(&event.acquisition_id)?;
        Some(ComputeKey::new(
            acquisition,
            event.product_type.clone(),
            mission.timeliness_key(event.timeliness.as_deref()),
        ))
    }

    /// Run one batch without persisting.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] when an expected duration is
    /// missing and [`EngineError::Store`] when the batch's own keys cannot
    /// be loaded.
    pub fn run(&self, events: &[RawEvent]) -> Result<BatchOutcome, EngineError> {
        self.run_cancellable(events, &AtomicBool::new(false))
    }

    /// Like [`run`](Self::run), checking `cancel` between phases and keys.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Cancelled`] once `cancel` is observed set, in
    /// addition to the errors of [`run`](Self::run).
    pub fn run_cancellable(
        &self,
        events: &[RawEvent],
        cancel: &AtomicBool,
    ) -> Result<BatchOutcome, EngineError> {
        let mut stats = BatchStats {
            events: events.len(),
            ..BatchStats::default()
        };
        let mut cache = BatchCache::new();

        let worklist = timed(Phase::Key, || self.partition(events, cancel, &mut stats))?;
        stats.distinct_keys = worklist.len();
        check_cancel(cancel)?;

        timed(Phase::Load, || self.load(&worklist, &mut cache, &mut stats))?;
        check_cancel(cancel)?;

        timed(Phase::Materialize, || {
            self.materialize(&worklist, &mut cache, cancel, &mut stats)
        })?;
        check_cancel(cancel)?;

        let mut tickets = BTreeMap::new();
        timed(Phase::Recompute, || {
            self.recompute(&worklist, &mut cache, &mut tickets, cancel)
        })?;
        check_cancel(cancel)?;

        timed(Phase::Aggregate, || {
            self.aggregate(&worklist, &mut cache, &mut tickets, cancel, &mut stats)
        })?;
        check_cancel(cancel)?;

        let instructions = timed(Phase::Diff, || {
            let (_, unchanged) = cache.change_counts();
            stats.unchanged = unchanged;
            cache.into_instructions()
        });

        tracing::info!(
            events = stats.events,
            skipped = stats.domain_skips,
            keys = stats.distinct_keys,
            loaded = stats.loaded,
            created = stats.created,
            placeholders = stats.placeholders,
            globals = stats.globals,
            unchanged = stats.unchanged,
            deferred = stats.deferred.len(),
            instructions = instructions.len(),
            "batch computed"
        );

        Ok(BatchOutcome {
            instructions,
            stats,
        })
    }

    /// Run one batch and apply its instructions.
    ///
    /// Version conflicts are returned in the report, not as errors.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`run`](Self::run), and [`EngineError::Store`]
    /// when the bulk write fails as a whole.
    pub fn run_and_persist(&self, events: &[RawEvent]) -> Result<PersistedBatch, EngineError> {
        let outcome = self.run(events)?;
        let report = timed(Phase::Persist, || self.store.bulk_upsert(&outcome.instructions))
            .map_err(|source| EngineError::Store {
                action: "persisting instructions",
                source,
            })?;

        for conflict in &report.conflicts {
            tracing::warn!(
                storage_id = %conflict.storage_id,
                family = conflict.family,
                expected = ?conflict.expected_version,
                actual = ?conflict.actual_version,
                "concurrent update; key left for a later batch"
            );
        }
        tracing::info!(
            applied = report.applied.len(),
            conflicts = report.conflicts.len(),
            "batch persisted"
        );

        Ok(PersistedBatch { outcome, report })
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    fn partition<'e>(
        &self,
        events: &'e [RawEvent],
        cancel: &AtomicBool,
        stats: &mut BatchStats,
    ) -> Result<BTreeMap<ComputeKey, Work<'e>>, EngineError> {
        let mut worklist: BTreeMap<ComputeKey, Work<'e>> = BTreeMap::new();
        for event in events {
            check_cancel(cancel)?;
            if let Some(key) = self.compute_key(event) {
                worklist
                    .entry(key)
                    .or_insert_with(|| Work::new(event))
                    .push(event);
            } else {
                stats.domain_skips += 1;
                tracing::debug!(
                    mission = %event.mission,
                    acquisition = %event.acquisition_id,
                    product_type = %event.product_type,
                    "event yields no compute key; skipped"
                );
            }
        }
        Ok(worklist)
    }

    fn load(
        &self,
        worklist: &BTreeMap<ComputeKey, Work<'_>>,
        cache: &mut BatchCache,
        stats: &mut BatchStats,
    ) -> Result<(), EngineError> {
        let keys: Vec<ComputeKey> = worklist.keys().cloned().collect();
        let found = self
            .store
            .get_locals(&keys)
            .map_err(|source| EngineError::Store {
                action: "loading batch records",
                source,
            })?;
        for (key, stored) in found {
            if cache.insert_local(key, CacheEntry::loaded(stored)) {
                stats.loaded += 1;
            }
        }
        Ok(())
    }

    fn materialize(
        &self,
        worklist: &BTreeMap<ComputeKey, Work<'_>>,
        cache: &mut BatchCache,
        cancel: &AtomicBool,
        stats: &mut BatchStats,
    ) -> Result<(), EngineError> {
        for (key, work) in worklist {
            check_cancel(cancel)?;
            let Some(mission) = self.config.mission(work.mission) else {
                continue;
            };

            let base = work.window();
            // Loaded keys re-check their siblings and neighbors so a key
            // deferred by an earlier batch is created once the store answers.
            let window = if let Some(loaded) = cache.local(key) {
                loaded.record.observation_window
            } else {
                let expected = self.expected_for(work.mission, key, work.instrument_mode, &base)?;
                let window = if work.has_planned_window() {
                    base
                } else {
                    base.with_min_length(expected)
                };

                let record = CompletenessRecord::placeholder(
                    key.clone(),
                    work.mission,
                    work.instrument_mode.map(str::to_string),
                    window,
                    expected,
                );
                cache.insert_local(key.clone(), CacheEntry::created(record, Origin::Event));
                stats.created += 1;
                tracing::debug!(key = %key, "created record");
                window
            };

            self.materialize_siblings(key, work, &window, worklist, cache, stats)?;
            // The threshold applies to the sensed span, not the window
            // stretched to the expected duration.
            if base.duration_us() > mission.min_sensing_duration_us {
                self.materialize_neighbors(key, work, mission, &window, worklist, cache, stats)?;
            }
        }
        Ok(())
    }

    fn materialize_siblings(
        &self,
        key: &ComputeKey,
        work: &Work<'_>,
        window: &Period,
        worklist: &BTreeMap<ComputeKey, Work<'_>>,
        cache: &mut BatchCache,
        stats: &mut BatchStats,
    ) -> Result<(), EngineError> {
        let candidates: Vec<ComputeKey> = self
            .expected
            .product_types(work.mission, work.instrument_mode)
            .into_iter()
            .filter(|pt| *pt != key.product_type)
            .map(|pt| key.with_product_type(pt))
            .filter(|k| !cache.contains_local(k) && !worklist.contains_key(k))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let found = match self.store.get_locals(&candidates) {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(
                    key = %key,
                    siblings = candidates.len(),
                    error = %err,
                    "sibling existence unknown; deferring"
                );
                stats
                    .deferred
                    .extend(candidates.iter().map(ComputeKey::storage_id));
                return Ok(());
            }
        };

        for sibling in candidates {
            if let Some(stored) = found.get(&sibling) {
                cache.insert_local(sibling, CacheEntry::loaded(stored.clone()));
                stats.loaded += 1;
                continue;
            }
            let expected = self.expected_for(work.mission, &sibling, work.instrument_mode, window)?;
            let record = CompletenessRecord::placeholder(
                sibling.clone(),
                work.mission,
                work.instrument_mode.map(str::to_string),
                *window,
                expected,
            );
            tracing::debug!(key = %sibling, "sibling placeholder");
            cache.insert_local(sibling, CacheEntry::created(record, Origin::Placeholder));
            stats.placeholders += 1;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn materialize_neighbors(
        &self,
        key: &ComputeKey,
        work: &Work<'_>,
        mission: &MissionConfig,
        window: &Period,
        worklist: &BTreeMap<ComputeKey, Work<'_>>,
        cache: &mut BatchCache,
        stats: &mut BatchStats,
    ) -> Result<(), EngineError> {
        for direction in Direction::BOTH {
            let Some((acquisition, neighbor_window)) =
                self.neighbor_of(work.mission, mission, &key.acquisition, window, direction)
            else {
                continue;
            };
            let neighbor = key.with_acquisition(acquisition);
            if cache.contains_local(&neighbor) || worklist.contains_key(&neighbor) {
                continue;
            }

            match self.store.get_local(&neighbor) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let expected = self.expected_for(
                        work.mission,
                        &neighbor,
                        work.instrument_mode,
                        &neighbor_window,
                    )?;
                    let record = CompletenessRecord::placeholder(
                        neighbor.clone(),
                        work.mission,
                        work.instrument_mode.map(str::to_string),
                        neighbor_window,
                        expected,
                    );
                    tracing::debug!(
                        key = %neighbor,
                        direction = direction.as_str(),
                        "neighbor placeholder"
                    );
                    cache.insert_local(neighbor, CacheEntry::created(record, Origin::Placeholder));
                    stats.placeholders += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        key = %neighbor,
                        direction = direction.as_str(),
                        error = %err,
                        "neighbor existence unknown; deferring"
                    );
                    stats.deferred.push(neighbor.storage_id());
                }
            }
        }
        Ok(())
    }

    /// Canonical neighbor id and its predicted window.
    fn neighbor_of(
        &self,
        mission_name: &str,
        mission: &MissionConfig,
        acquisition: &str,
        window: &Period,
        direction: Direction,
    ) -> Option<(String, Period)> {
        let shifted = window.shifted(direction.sign().saturating_mul(mission.orbital_period_us));

        if mission.scheme.is_orbit_based() {
            let parsed = mission.scheme.parse(acquisition)?;
            let neighbor = mission.scheme.neighbor(&parsed, direction)?;
            return Some((mission.scheme.render(&neighbor), shifted));
        }

        match self.planning?.neighbor(mission_name, acquisition, direction) {
            PlannedNeighbor::Known {
                acquisition_id,
                window: planned,
            } => {
                let canonical = mission.scheme.canonicalize(&acquisition_id)?;
                Some((canonical, planned.unwrap_or(shifted)))
            }
            PlannedNeighbor::Unknown => {
                tracing::debug!(
                    mission = mission_name,
                    acquisition,
                    direction = direction.as_str(),
                    "planning has no neighbor yet"
                );
                None
            }
        }
    }

    fn recompute(
        &self,
        worklist: &BTreeMap<ComputeKey, Work<'_>>,
        cache: &mut BatchCache,
        tickets: &mut BTreeMap<String, Option<TicketRef>>,
        cancel: &AtomicBool,
    ) -> Result<(), EngineError> {
        for (key, work) in worklist {
            check_cancel(cancel)?;
            let Some(mission) = self.config.mission(work.mission) else {
                continue;
            };
            let params = RecomputeParams {
                tolerance_us: self
                    .config
                    .tolerance
                    .resolve(work.mission, Scope::Local, &key.product_type),
                gap_tolerance_us: mission.gap_tolerance_us,
                missing_start_offset_us: mission.missing_start_offset_us,
                missing_end_tolerance_us: mission.missing_end_tolerance_us,
            };
            let ticket = self.ticket_for(work.mission, &key.acquisition, tickets);

            let Some(entry) = cache.local_mut(key) else {
                continue;
            };
            let record = &mut entry.record;
            let was_placeholder = record.is_placeholder();

            for event in &work.events {
                record
                    .contributions
                    .insert(event.product_name.clone(), event.observation);
            }
            if record.instrument_mode.is_none() {
                record.instrument_mode = work.instrument_mode.map(str::to_string);
            }

            let events_window = work.window();
            let window = if was_placeholder {
                events_window
            } else {
                record.observation_window.envelope(&events_window)
            };
            let expected = self.expected_for(work.mission, key, work.instrument_mode, &window)?;
            record.observation_window = if was_placeholder && !work.has_planned_window() {
                window.with_min_length(expected)
            } else {
                window
            };
            record.expected_duration_us = expected;
            if let TicketUpdate::Set(ticket) = ticket {
                record.ticket = ticket;
            }
            record.recompute(&params);

            tracing::debug!(
                key = %key,
                status = %record.status,
                percentage = record.percentage,
                "recomputed"
            );
        }
        Ok(())
    }

    /// Aggregates every acquisition with a changed local record, plus every
    /// batch acquisition whose aggregate is not stored yet.
    fn aggregate(
        &self,
        worklist: &BTreeMap<ComputeKey, Work<'_>>,
        cache: &mut BatchCache,
        tickets: &mut BTreeMap<String, Option<TicketRef>>,
        cancel: &AtomicBool,
        stats: &mut BatchStats,
    ) -> Result<(), EngineError> {
        let changed: BTreeMap<GlobalKey, String> = cache
            .locals()
            .filter(|(_, entry)| entry.is_changed())
            .map(|(key, entry)| (key.global_key(), entry.record.mission.clone()))
            .collect();
        let mut candidates = changed.clone();
        for (key, work) in worklist {
            if cache.contains_local(key) {
                candidates
                    .entry(key.global_key())
                    .or_insert_with(|| work.mission.to_string());
            }
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let keys: Vec<GlobalKey> = candidates.keys().cloned().collect();
        let stored = match self.store.get_globals(&keys) {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(
                    globals = keys.len(),
                    error = %err,
                    "aggregate records unavailable; deferring"
                );
                stats
                    .deferred
                    .extend(keys.iter().map(GlobalKey::storage_id));
                return Ok(());
            }
        };

        let touched: Vec<(GlobalKey, String)> = candidates
            .into_iter()
            .filter(|(key, _)| changed.contains_key(key) || !stored.contains_key(key))
            .collect();

        let mut acquisitions: BTreeMap<String, Option<Vec<CompletenessRecord>>> = BTreeMap::new();
        for (global_key, mission) in touched {
            check_cancel(cancel)?;

            let persisted = acquisitions
                .entry(global_key.acquisition.clone())
                .or_insert_with(|| match self.store.locals_for_acquisition(&global_key.acquisition) {
                    Ok(found) => Some(found.into_iter().map(|v| v.record).collect()),
                    Err(err) => {
                        tracing::warn!(
                            acquisition = %global_key.acquisition,
                            error = %err,
                            "acquisition records unavailable; deferring aggregate"
                        );
                        None
                    }
                });
            let Some(persisted) = persisted else {
                stats.deferred.push(global_key.storage_id());
                continue;
            };

            let mut locals: BTreeMap<&ComputeKey, &CompletenessRecord> = persisted
                .iter()
                .filter(|r| r.key.timeliness == global_key.timeliness)
                .map(|r| (&r.key, r))
                .collect();
            for record in cache.locals_of(&global_key) {
                locals.insert(&record.key, record);
            }
            let locals: Vec<&CompletenessRecord> = locals.into_values().collect();
            let Some(window) = envelope(locals.iter().map(|r| r.observation_window)) else {
                continue;
            };

            let aggregate = self
                .expected
                .aggregate_global(&mission, &locals, &self.config.tolerance);
            let ticket = self.ticket_for(&mission, &global_key.acquisition, tickets);

            if !cache.contains_global(&global_key) {
                let entry = match stored.get(&global_key) {
                    Some(found) => CacheEntry::loaded(found.clone()),
                    None => CacheEntry::created(
                        GlobalRecord::empty(global_key.clone(), mission.as_str(), window),
                        Origin::Aggregate,
                    ),
                };
                cache.insert_global(global_key.clone(), entry);
            }
            if let Some(entry) = cache.global_mut(&global_key) {
                let record = &mut entry.record;
                record.observation_window = window;
                record.products = aggregate.products;
                record.apply_totals(aggregate.totals);
                if let TicketUpdate::Set(ticket) = ticket {
                    record.ticket = ticket;
                }
                stats.globals += 1;
                tracing::debug!(
                    key = %global_key,
                    status = %record.status,
                    percentage = record.percentage,
                    "aggregated"
                );
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn expected_for(
        &self,
        mission: &str,
        key: &ComputeKey,
        instrument_mode: Option<&str>,
        window: &Period,
    ) -> Result<Micros, EngineError> {
        let query = ExpectedQuery {
            mission,
            acquisition_id: &key.acquisition,
            product_type: &key.product_type,
            instrument_mode,
            window,
        };
        self.expected.expected_duration(&query).map_err(|source| {
            tracing::error!(key = %key, error = %source, "expected duration lookup failed");
            EngineError::Configuration {
                key: key.storage_id(),
                source,
            }
        })
    }

    /// Ticket to store on a record. Without an enrichment the stored ticket
    /// is kept.
    fn ticket_for(
        &self,
        mission: &str,
        acquisition: &str,
        tickets: &mut BTreeMap<String, Option<TicketRef>>,
    ) -> TicketUpdate {
        let Some(source) = self.tickets else {
            return TicketUpdate::Keep;
        };
        let ticket = tickets
            .entry(acquisition.to_string())
            .or_insert_with(|| source.tickets(mission, acquisition).into_iter().next())
            .clone();
        TicketUpdate::Set(ticket)
    }
}

fn envelope(periods: impl Iterator<Item = Period>) -> Option<Period> {
    periods.reduce(|acc, p| acc.envelope(&p))
}

fn check_cancel(cancel: &AtomicBool) -> Result<(), EngineError> {
    if cancel.load(Ordering::Relaxed) {
        tracing::info!("batch cancelled; discarding cache");
        return Err(EngineError::Cancelled);
    }
    Ok(())
}
