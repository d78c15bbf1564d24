//! Per-phase timing of batch runs.
//!
//! Samples are kept per thread, which matches the engine's one thread per
//! batch model. Collection is off unless [`set_timing_enabled`] turned it on.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;

/// Environment switch read by [`timing_enabled_from_env`].
pub const TIMING_ENV: &str = "GAPWATCH_TIMING";

/// Engine phases that are timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Key,
    Load,
    Materialize,
    Recompute,
    Aggregate,
    Diff,
    Persist,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Load => "load",
            Self::Materialize => "materialize",
            Self::Recompute => "recompute",
            Self::Aggregate => "aggregate",
            Self::Diff => "diff",
            Self::Persist => "persist",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated timings of one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub count: usize,
    pub total: Duration,
    pub max: Duration,
}

/// Timings drained from the current thread, in phase order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimingReport {
    pub phases: Vec<PhaseTiming>,
}

thread_local! {
    static SAMPLES: RefCell<Vec<(Phase, Duration)>> = const { RefCell::new(Vec::new()) };
}

static TIMING_ENABLED: AtomicBool = AtomicBool::new(false);

/// True when `GAPWATCH_TIMING` holds `1`, `true`, `yes` or `on`.
#[must_use]
pub fn timing_enabled_from_env() -> bool {
    std::env::var(TIMING_ENV)
        .ok()
        .is_some_and(|value| is_truthy(value.as_str()))
}

pub fn set_timing_enabled(enabled: bool) {
    TIMING_ENABLED.store(enabled, Ordering::Relaxed);
    if !enabled {
        clear_timings();
    }
}

#[must_use]
pub fn is_timing_enabled() -> bool {
    TIMING_ENABLED.load(Ordering::Relaxed)
}

pub fn clear_timings() {
    SAMPLES.with(|samples| samples.borrow_mut().clear());
}

/// Run `f`, recording its duration under `phase` when timing is enabled.
pub fn timed<R>(phase: Phase, f: impl FnOnce() -> R) -> R {
    if !is_timing_enabled() {
        return f();
    }

    let started = Instant::now();
    let result = f();
    record_sample(phase, started.elapsed());
    result
}

/// Drain this thread's samples into a report.
#[must_use]
pub fn collect_report() -> TimingReport {
    let samples = SAMPLES.with(|samples| std::mem::take(&mut *samples.borrow_mut()));

    let mut grouped: BTreeMap<Phase, PhaseTiming> = BTreeMap::new();
    for (phase, elapsed) in samples {
        let entry = grouped.entry(phase).or_insert(PhaseTiming {
            phase,
            count: 0,
            total: Duration::ZERO,
            max: Duration::ZERO,
        });
        entry.count += 1;
        entry.total = entry.total.saturating_add(elapsed);
        entry.max = entry.max.max(elapsed);
    }

    TimingReport {
        phases: grouped.into_values().collect(),
    }
}

impl TimingReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Sum of all phase totals.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.phases
            .iter()
            .fold(Duration::ZERO, |acc, p| acc.saturating_add(p.total))
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let phases = self
            .phases
            .iter()
            .map(|p| {
                json!({
                    "phase": p.phase.as_str(),
                    "count": p.count,
                    "total_us": p.total.as_micros(),
                    "max_us": p.max.as_micros(),
                })
            })
            .collect::<Vec<_>>();

        json!({ "phases": phases, "total_us": self.total().as_micros() })
    }

    /// Terminal table with each phase's share of the total.
    #[must_use]
    pub fn display_table(&self) -> String {
        use std::fmt::Write as _;

        if self.phases.is_empty() {
            return "No timing samples recorded.".to_string();
        }

        let total_us = self.total().as_micros().max(1);
        let mut out = String::new();
        out.push_str("phase          count      total        max   share\n");
        out.push_str("--------------------------------------------------\n");

        for p in &self.phases {
            let share = p.total.as_micros() * 100 / total_us;
            let _ = writeln!(
                out,
                "{:<12} {:>7} {:>10} {:>10} {:>6}%",
                p.phase.as_str(),
                p.count,
                format_duration(p.total),
                format_duration(p.max),
                share
            );
        }

        out
    }
}

fn record_sample(phase: Phase, elapsed: Duration) {
    SAMPLES.with(|samples| samples.borrow_mut().push((phase, elapsed)));
}

fn format_duration(duration: Duration) -> String {
    let micros = duration.as_micros();

    if micros >= 1_000_000 {
        format!("{}.{:03}s", micros / 1_000_000, (micros % 1_000_000) / 1_000)
    } else if micros >= 1_000 {
        format!("{}.{:03}ms", micros / 1_000, micros % 1_000)
    } else {
        format!("{micros}µs")
    }
}

fn is_truthy(value: &str) -> bool {
    ["1", "true", "yes", "on"]
        .iter()
        .any(|t| value.trim().eq_ignore_ascii_case(t))
}
