//! End-to-end batches through the engine against the in-memory store.

use std::sync::atomic::AtomicBool;

use gapwatch_core::engine::BatchEngine;
use gapwatch_core::error::{EngineError, ErrorCode};
use gapwatch_core::event::RawEvent;
use gapwatch_core::model::{CompletenessRecord, CompletenessStatus, GlobalRecord, TicketRef};
use gapwatch_core::period::Period;
use gapwatch_core::provider::{PlanningTable, StaticExpectedTable, TicketEnrichment};
use gapwatch_core::store::{InMemoryStore, PersistenceInstruction, RecordStore};
use gapwatch_core::{ComputeKey, EngineConfig};
use proptest::prelude::*;


use generators::*;

const S1: &str = r#"
[missions.S1]
min_sensing_duration_us = 1000000

[missions.S1.expected]
IW_RAW__0S = 30000000
IW_SLC__1S = 30000000
IW_GRDH_1S = 30000000

[missions.S1.product_types]
IW = ["IW_RAW__0S", "IW_SLC__1S", "IW_GRDH_1S"]

[tolerance.S1.local]
"WV.*0." = 759000
default = 0
"#;

fn config() -> EngineConfig {
    EngineConfig::from_toml_str(S1).expect("parse config")
}

fn s(start_s: i64, end_s: i64) -> Period {
    period_at(BASE_US + start_s * SEC, (end_s - start_s) * SEC)
}

fn raw(name: &str, acquisition: &str, start_s: i64, end_s: i64) -> RawEvent {
    event(name, acquisition, "IW_RAW__0S", s(start_s, end_s))
}

fn local<'a>(
    instructions: &'a [PersistenceInstruction],
    storage_id: &str,
) -> Option<(&'a CompletenessRecord, Option<u64>)> {
    instructions.iter().find_map(|i| match i {
        PersistenceInstruction::Local {
            record,
            expected_version,
        } if record.key.storage_id() == storage_id => Some((record, *expected_version)),
        _ => None,
    })
}

fn global<'a>(
    instructions: &'a [PersistenceInstruction],
    storage_id: &str,
) -> Option<(&'a GlobalRecord, Option<u64>)> {
    instructions.iter().find_map(|i| match i {
        PersistenceInstruction::Global {
            record,
            expected_version,
        } if record.key.storage_id() == storage_id => Some((record, *expected_version)),
        _ => None,
    })
}

fn ids(instructions: &[PersistenceInstruction]) -> Vec<String> {
    instructions.iter().map(PersistenceInstruction::storage_id).collect()
}

// ---------------------------------------------------------------------------
// Create / update / no-op
// ---------------------------------------------------------------------------

#[test]
fn first_batch_creates_records_siblings_and_aggregate() {
    let cfg = config();
    let store = InMemoryStore::new();
    let provider = StaticExpectedTable::from_config(&cfg);
    let engine = BatchEngine::new(&cfg, &store, &provider);

    let batch = engine
        .run_and_persist(&[raw("a", "DT1", 0, 10), raw("b", "DT1", 10, 20)])
        .expect("batch");

    assert_eq!(
        ids(&batch.outcome.instructions),
        vec![
            "DT1:IW_GRDH_1S:NRT".to_string(),
            "DT1:IW_RAW__0S:NRT".to_string(),
            "DT1:IW_SLC__1S:NRT".to_string(),
            "DT1:NRT".to_string(),
        ]
    );
    assert!(batch.outcome.instructions.iter().all(PersistenceInstruction::is_create));
    assert!(batch.report.is_clean());
    assert_eq!(store.counts().expect("counts"), (3, 1));

    let (record, _) = local(&batch.outcome.instructions, "DT1:IW_RAW__0S:NRT").expect("raw");
    assert_eq!(record.covered_duration_us, 20 * SEC);
    assert_eq!(record.observation_window, s(0, 30));
    assert_eq!(record.missing_periods, vec![s(20, 30)]);
    assert_eq!(record.status, CompletenessStatus::Partial);

    let (sibling, _) = local(&batch.outcome.instructions, "DT1:IW_SLC__1S:NRT").expect("slc");
    assert!(sibling.is_placeholder());
    assert_eq!(sibling.status, CompletenessStatus::Missing);
    assert_eq!(sibling.missing_periods, vec![s(0, 30)]);

    let (aggregate, _) = global(&batch.outcome.instructions, "DT1:NRT").expect("global");
    assert_eq!(aggregate.expected_duration_us, 90 * SEC);
    assert_eq!(aggregate.adjusted_covered_duration_us, 20 * SEC);
    assert_eq!(aggregate.products.len(), 3);
}

#[test]
fn replaying_a_batch_emits_nothing() {
    let cfg = config();
    let store = InMemoryStore::new();
    let provider = StaticExpectedTable::from_config(&cfg);
    let engine = BatchEngine::new(&cfg, &store, &provider);
    let events = [raw("a", "DT1", 0, 10), raw("b", "DT2", 40, 75)];

    let first = engine.run_and_persist(&events).expect("first batch");
    assert!(!first.outcome.instructions.is_empty());

    let second = engine.run_and_persist(&events).expect("second batch");
    assert!(second.outcome.instructions.is_empty());
    assert!(second.report.applied.is_empty());
    assert_eq!(second.outcome.stats.loaded, 2);
    assert_eq!(second.outcome.stats.created, 0);
}

#[test]
fn late_product_updates_existing_records() {
    let cfg = config();
    let store = InMemoryStore::new();
    let provider = StaticExpectedTable::from_config(&cfg);
    let engine = BatchEngine::new(&cfg, &store, &provider);

    engine
        .run_and_persist(&[raw("a", "DT1", 0, 10)])
        .expect("first batch");
    let second = engine
        .run_and_persist(&[raw("b", "DT1", 10, 30)])
        .expect("second batch");

    assert_eq!(
        ids(&second.outcome.instructions),
        vec!["DT1:IW_RAW__0S:NRT".to_string(), "DT1:NRT".to_string()]
    );

    let (record, version) =
        local(&second.outcome.instructions, "DT1:IW_RAW__0S:NRT").expect("raw");
    assert_eq!(version, Some(1));
    assert_eq!(record.contributions.len(), 2);
    assert_eq!(record.covered_duration_us, 30 * SEC);
    assert!(record.missing_periods.is_empty());
    assert_eq!(record.status, CompletenessStatus::Complete);

    let (aggregate, version) = global(&second.outcome.instructions, "DT1:NRT").expect("global");
    assert_eq!(version, Some(1));
    assert_eq!(aggregate.adjusted_covered_duration_us, 30 * SEC);
    assert_eq!(aggregate.status, CompletenessStatus::Partial);
}

#[test]
fn timeliness_classes_are_tracked_separately() {
    let cfg = config();
    let store = InMemoryStore::new();
    let provider = StaticExpectedTable::from_config(&cfg);
    let engine = BatchEngine::new(&cfg, &store, &provider);

    let mut ntc = raw("a-ntc", "DT1", 0, 30);
    ntc.timeliness = Some("NTC".into());
    let outcome = engine.run(&[raw("a", "DT1", 0, 30), ntc]).expect("run");

    let globals: Vec<String> = outcome
        .instructions
        .iter()
        .filter(|i| i.family() == "global")
        .map(PersistenceInstruction::storage_id)
        .collect();
    assert_eq!(globals, vec!["DT1:NRT".to_string(), "DT1:NTC".to_string()]);
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(64))]

    #[test]
    fn any_batch_is_idempotent(batch in arb_batch()) {
        let cfg = config();
        let store = InMemoryStore::new();
        let provider = StaticExpectedTable::from_config(&cfg);
        let engine = BatchEngine::new(&cfg, &store, &provider);

        let first = engine.run_and_persist(&batch).expect("first batch");
        prop_assert!(!first.outcome.instructions.is_empty());
        prop_assert!(first.report.is_clean());

        let second = engine.run(&batch).expect("second batch");
        prop_assert!(second.instructions.is_empty());
    }

    #[test]
    fn instruction_order_is_locals_then_globals(batch in arb_batch()) {
        let cfg = config();
        let store = InMemoryStore::new();
        let provider = StaticExpectedTable::from_config(&cfg);
        let engine = BatchEngine::new(&cfg, &store, &provider);

        let outcome = engine.run(&batch).expect("run");
        let families: Vec<&str> = outcome.instructions.iter().map(PersistenceInstruction::family).collect();
        let first_global = families.iter().position(|f| *f == "global").unwrap_or(families.len());
        prop_assert!(families[first_global..].iter().all(|f| *f == "global"));

        let local_ids: Vec<String> = ids(&outcome.instructions[..first_global]);
        let mut sorted = local_ids.clone();
        sorted.sort();
        sorted.dedup();
        prop_assert_eq!(local_ids, sorted);
    }
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

#[test]
fn unreadable_sibling_is_deferred() {
    let cfg = config();
    let store = InMemoryStore::new();
    store
        .fail_reads_for("DT1:IW_SLC__1S:NRT")
        .expect("inject failure");
    let provider = StaticExpectedTable::from_config(&cfg);
    let engine = BatchEngine::new(&cfg, &store, &provider);

    let outcome = engine.run(&[raw("a", "DT1", 0, 30)]).expect("run");

    assert!(outcome
        .stats
        .deferred
        .contains(&"DT1:IW_SLC__1S:NRT".to_string()));
    assert_eq!(
        ids(&outcome.instructions),
        vec!["DT1:IW_RAW__0S:NRT".to_string(), "DT1:NRT".to_string()]
    );
}

#[test]
fn deferred_keys_are_created_once_the_store_recovers() {
    let cfg = config();
    let store = InMemoryStore::new();
    store.fail_reads_for("DT1:NRT").expect("inject failure");
    store
        .fail_reads_for("DT1:IW_SLC__1S:NRT")
        .expect("inject failure");
    let provider = StaticExpectedTable::from_config(&cfg);
    let engine = BatchEngine::new(&cfg, &store, &provider);
    let events = [raw("a", "DT1", 0, 30)];

    let first = engine.run_and_persist(&events).expect("first batch");
    let deferred = &first.outcome.stats.deferred;
    assert!(deferred.contains(&"DT1:IW_SLC__1S:NRT".to_string()));
    assert!(deferred.contains(&"DT1:NRT".to_string()));
    assert_eq!(ids(&first.outcome.instructions), vec!["DT1:IW_RAW__0S:NRT".to_string()]);
    assert_eq!(store.counts().expect("counts"), (1, 0));

    store.heal().expect("heal");
    let retry = engine.run_and_persist(&events).expect("retry batch");
    assert_eq!(
        ids(&retry.outcome.instructions),
        vec![
            "DT1:IW_GRDH_1S:NRT".to_string(),
            "DT1:IW_SLC__1S:NRT".to_string(),
            "DT1:NRT".to_string(),
        ]
    );
    assert!(retry.outcome.instructions.iter().all(PersistenceInstruction::is_create));
    assert!(retry.outcome.stats.deferred.is_empty());
    assert!(retry.report.is_clean());
    assert_eq!(store.counts().expect("counts"), (3, 1));

    let (aggregate, _) = global(&retry.outcome.instructions, "DT1:NRT").expect("global");
    assert_eq!(aggregate.products.len(), 3);
    assert_eq!(aggregate.adjusted_covered_duration_us, 30 * SEC);

    let settled = engine.run_and_persist(&events).expect("settled batch");
    assert!(settled.outcome.instructions.is_empty());
}

#[test]
fn unreadable_batch_key_aborts_without_writes() {
    let cfg = config();
    let store = InMemoryStore::new();
    store
        .fail_reads_for("DT1:IW_RAW__0S:NRT")
        .expect("inject failure");
    let provider = StaticExpectedTable::from_config(&cfg);
    let engine = BatchEngine::new(&cfg, &store, &provider);

    let err = engine
        .run_and_persist(&[raw("a", "DT1", 0, 30)])
        .expect_err("store failure");
    assert_eq!(err.code(), ErrorCode::StoreUnavailable);
    assert_eq!(store.counts().expect("counts"), (0, 0));
}

#[test]
fn missing_expected_duration_is_a_configuration_fault() {
    let cfg = EngineConfig::from_toml_str(
        r#"
[missions.S1.expected]
IW_RAW__0S = 30000000

[missions.S1.product_types]
IW = ["IW_RAW__0S", "IW_OCN__2S"]
"#,
    )
    .expect("parse config");
    let store = InMemoryStore::new();
    let provider = StaticExpectedTable::from_config(&cfg);
    let engine = BatchEngine::new(&cfg, &store, &provider);

    let err = engine
        .run_and_persist(&[raw("a", "DT1", 0, 30)])
        .expect_err("configuration fault");
    assert!(matches!(err, EngineError::Configuration { ref key, .. } if key == "DT1:IW_OCN__2S:NRT"));
    assert_eq!(err.code(), ErrorCode::ConfigurationFault);
    assert_eq!(store.counts().expect("counts"), (0, 0));
}

#[test]
fn cancelled_batch_leaves_store_untouched() {
    let cfg = config();
    let store = InMemoryStore::new();
    let provider = StaticExpectedTable::from_config(&cfg);
    let engine = BatchEngine::new(&cfg, &store, &provider);

    let err = engine
        .run_cancellable(&[raw("a", "DT1", 0, 30)], &AtomicBool::new(true))
        .expect_err("cancelled");
    assert_eq!(err.code(), ErrorCode::Cancelled);
    assert_eq!(store.counts().expect("counts"), (0, 0));
}

#[test]
fn concurrent_batches_conflict_instead_of_overwriting() {
    let cfg = config();
    let store = InMemoryStore::new();
    let provider = StaticExpectedTable::from_config(&cfg);
    let first = BatchEngine::new(&cfg, &store, &provider);
    let second = BatchEngine::new(&cfg, &store, &provider);

    let losing = second.run(&[raw("b", "DT1", 10, 30)]).expect("second run");
    first
        .run_and_persist(&[raw("a", "DT1", 0, 10)])
        .expect("first batch");

    let report = store.bulk_upsert(&losing.instructions).expect("upsert");
    assert_eq!(report.conflicts.len(), losing.instructions.len());
    assert!(report.applied.is_empty());
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.expected_version, None);
    assert_eq!(conflict.actual_version, Some(1));

    let stored = store
        .get_local(&ComputeKey::new("DT1", "IW_RAW__0S", Some("NRT".into())))
        .expect("read")
        .expect("stored record");
    assert_eq!(stored.version, 1);
    assert_eq!(stored.record.contributions.keys().collect::<Vec<_>>(), vec!["a"]);

    let retried = second
        .run_and_persist(&[raw("b", "DT1", 10, 30)])
        .expect("retry");
    assert!(retried.report.is_clean());
    let (record, version) =
        local(&retried.outcome.instructions, "DT1:IW_RAW__0S:NRT").expect("raw");
    assert_eq!(version, Some(1));
    assert_eq!(record.contributions.len(), 2);
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

#[test]
fn planning_lookup_materializes_datatake_neighbors() {
    let cfg = EngineConfig::from_toml_str(
        r#"
[missions.S1]
min_sensing_duration_us = 1000000

[missions.S1.expected]
IW_RAW__0S = 30000000
"#,
    )
    .expect("parse config");
    let store = InMemoryStore::new();
    let provider = StaticExpectedTable::from_config(&cfg);
    let planning = PlanningTable::new()
        .with("S1", "DT0", s(-100, -70))
        .with("S1", "DT1", s(0, 30))
        .with("S1", "DT2", s(100, 130));
    let engine = BatchEngine::new(&cfg, &store, &provider).with_planning(&planning);

    let first = engine
        .run_and_persist(&[raw("a", "DT1", 0, 30)])
        .expect("first batch");
    let (previous, _) =
        local(&first.outcome.instructions, "DT0:IW_RAW__0S:NRT").expect("previous neighbor");
    assert!(previous.is_placeholder());
    assert_eq!(previous.observation_window, s(-100, -70));
    let (next, _) = local(&first.outcome.instructions, "DT2:IW_RAW__0S:NRT").expect("next");
    assert_eq!(next.observation_window, s(100, 130));
    assert_eq!(first.outcome.stats.placeholders, 2);

    // DT2 now loads as an existing record, so no neighbor lookup runs.
    let second = engine
        .run_and_persist(&[raw("c", "DT2", 100, 130)])
        .expect("second batch");
    assert_eq!(second.outcome.stats.placeholders, 0);
    let (record, version) =
        local(&second.outcome.instructions, "DT2:IW_RAW__0S:NRT").expect("filled neighbor");
    assert_eq!(version, Some(1));
    assert_eq!(record.status, CompletenessStatus::Complete);
}

struct FixedTickets;

impl TicketEnrichment for FixedTickets {
    fn tickets(&self, _mission: &str, acquisition_id: &str) -> Vec<TicketRef> {
        if acquisition_id == "DT1" {
            vec![TicketRef {
                id: "ANOM-7".into(),
                url: None,
            }]
        } else {
            Vec::new()
        }
    }
}

#[test]
fn tickets_are_attached_without_changing_percentages() {
    let cfg = config();
    let provider = StaticExpectedTable::from_config(&cfg);
    let events = [raw("a", "DT1", 0, 15)];

    let plain_store = InMemoryStore::new();
    let plain = BatchEngine::new(&cfg, &plain_store, &provider)
        .run(&events)
        .expect("plain run");

    let store = InMemoryStore::new();
    let tickets = FixedTickets;
    let enriched = BatchEngine::new(&cfg, &store, &provider)
        .with_tickets(&tickets)
        .run(&events)
        .expect("enriched run");

    let (with_ticket, _) = local(&enriched.instructions, "DT1:IW_RAW__0S:NRT").expect("raw");
    let (without, _) = local(&plain.instructions, "DT1:IW_RAW__0S:NRT").expect("raw");
    assert_eq!(with_ticket.ticket.as_ref().map(|t| t.id.as_str()), Some("ANOM-7"));
    assert!((with_ticket.percentage - without.percentage).abs() < f64::EPSILON);

    let (aggregate, _) = global(&enriched.instructions, "DT1:NRT").expect("global");
    assert_eq!(aggregate.ticket.as_ref().map(|t| t.id.as_str()), Some("ANOM-7"));
}

#[test]
fn batch_without_enrichment_keeps_stored_tickets() {
    let cfg = config();
    let provider = StaticExpectedTable::from_config(&cfg);
    let store = InMemoryStore::new();
    let tickets = FixedTickets;
    BatchEngine::new(&cfg, &store, &provider)
        .with_tickets(&tickets)
        .run_and_persist(&[raw("a", "DT1", 0, 15)])
        .expect("enriched batch");

    let plain = BatchEngine::new(&cfg, &store, &provider);
    let replay = plain.run(&[raw("a", "DT1", 0, 15)]).expect("replay");
    assert!(replay.instructions.is_empty());

    let late = plain
        .run_and_persist(&[raw("b", "DT1", 15, 30)])
        .expect("late batch");
    let (record, version) = local(&late.outcome.instructions, "DT1:IW_RAW__0S:NRT").expect("raw");
    assert_eq!(version, Some(1));
    assert_eq!(record.status, CompletenessStatus::Complete);
    assert_eq!(record.ticket.as_ref().map(|t| t.id.as_str()), Some("ANOM-7"));
    let (aggregate, _) = global(&late.outcome.instructions, "DT1:NRT").expect("global");
    assert_eq!(aggregate.ticket.as_ref().map(|t| t.id.as_str()), Some("ANOM-7"));
}

#[test]
fn local_tolerance_pattern_adjusts_wave_products() {
    let mut cfg = config();
    if let Some(s1) = cfg.missions.get_mut("S1") {
        s1.expected.insert(
            "WV_RAW__0A".into(),
            gapwatch_core::config::ExpectedDuration::Fixed(30 * SEC),
        );
        s1.product_types.clear();
    }
    let store = InMemoryStore::new();
    let provider = StaticExpectedTable::from_config(&cfg);
    let engine = BatchEngine::new(&cfg, &store, &provider);

    // 30.5s delivered against 30s expected: capped at expected + 0.759s
    // for WV, at expected for IW.
    let outcome = engine
        .run(&[
            event("wv", "DT1", "WV_RAW__0A", period_at(BASE_US, 30_500_000)),
            event("iw", "DT1", "IW_RAW__0S", period_at(BASE_US, 30_500_000)),
        ])
        .expect("run");

    let (wave, _) = local(&outcome.instructions, "DT1:WV_RAW__0A:NRT").expect("wv");
    assert_eq!(wave.adjusted_covered_duration_us, 30_500_000);
    assert!((wave.percentage - 100.0).abs() < f64::EPSILON);

    let (iw, _) = local(&outcome.instructions, "DT1:IW_RAW__0S:NRT").expect("iw");
    assert_eq!(iw.adjusted_covered_duration_us, 30 * SEC);
    assert_eq!(iw.status, CompletenessStatus::Complete);
}
