//! Tolerance resolution from operator configuration.
//!
//! The table is shaped `mission -> scope -> value`, where a value is either a
//! flat adjustment or an ordered list of `pattern -> adjustment` rules with an
//! optional `default` entry:
//!
//! ```toml
//! [tolerance.S1.local]
//! "WV.*0." = 759000
//! default = 0
//!
//! [tolerance.S3]
//! global = 120000000
//! ```
//!
//! Patterns are regular expressions anchored at the start of the product
//! type and are tried in declaration order. A pattern that fails to compile
//! is kept so the lookup that reaches it can log and return 0.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::period::Micros;

/// Which record family a tolerance applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Per product-type records.
    Local,
    /// Per-acquisition aggregates.
    Global,
}

impl Scope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "global" => Ok(Self::Global),
            other => Err(format!("unknown tolerance scope '{other}': expected local or global")),
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// One `pattern -> adjustment` entry.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pattern: String,
    compiled: Result<Regex, String>,
    adjustment: Micros,
}

impl PatternRule {
    #[must_use]
    pub fn new(pattern: impl Into<String>, adjustment: Micros) -> Self {
        let pattern = pattern.into();
        let compiled = Regex::new(&format!("^(?:{pattern})")).map_err(|err| err.to_string());
        Self {
            pattern,
            compiled,
            adjustment,
        }
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[must_use]
    pub const fn adjustment(&self) -> Micros {
        self.adjustment
    }
}

impl PartialEq for PatternRule {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.adjustment == other.adjustment
    }
}

/// Tolerance value configured for one `(mission, scope)`.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeTolerance {
    /// Same adjustment for every product type.
    Flat(Micros),
    /// Ordered rules plus an optional fallback.
    Patterns {
        rules: Vec<PatternRule>,
        default: Option<Micros>,
    },
}

impl ScopeTolerance {
    fn resolve(&self, mission: &str, scope: Scope, product_type: &str) -> Micros {
        let (rules, default) = match self {
            Self::Flat(value) => return *value,
            Self::Patterns { rules, default } => (rules, default),
        };

        for rule in rules {
            match &rule.compiled {
                Ok(re) if re.is_match(product_type) => return rule.adjustment,
                Ok(_) => {}
                Err(reason) => {
                    tracing::warn!(
                        mission,
                        scope = %scope,
                        product_type,
                        pattern = %rule.pattern,
                        error = %reason,
                        "malformed tolerance pattern; using 0 for this lookup"
                    );
                    return 0;
                }
            }
        }

        default.unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// ToleranceTable
// ---------------------------------------------------------------------------

/// Resolver over `mission -> scope -> tolerance`.
///
/// Immutable once built and `Send + Sync`, so one table can be shared by
/// concurrent engine instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToleranceTable {
    missions: BTreeMap<String, BTreeMap<Scope, ScopeTolerance>>,
}

impl ToleranceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert used by tests and programmatic configuration.
    #[must_use]
    pub fn with(mut self, mission: &str, scope: Scope, value: ScopeTolerance) -> Self {
        self.missions
            .entry(mission.to_string())
            .or_default()
            .insert(scope, value);
        self
    }

    /// Signed adjustment for `(mission, scope, product_type)`.
    ///
    /// Returns 0 when the mission or scope is not configured, when no rule
    /// matches and there is no `default`, or when a malformed pattern is
    /// reached.
    #[must_use]
    pub fn resolve(&self, mission: &str, scope: Scope, product_type: &str) -> Micros {
        self.missions
            .get(mission)
            .and_then(|scopes| scopes.get(&scope))
            .map_or(0, |value| value.resolve(mission, scope, product_type))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.missions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Serde
// ---------------------------------------------------------------------------

const DEFAULT_KEY: &str = "default";

impl Serialize for ScopeTolerance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        match self {
            Self::Flat(value) => serializer.serialize_i64(*value),
            Self::Patterns { rules, default } => {
                let len = rules.len() + usize::from(default.is_some());
                let mut map = serializer.serialize_map(Some(len))?;
                for rule in rules {
                    map.serialize_entry(&rule.pattern, &rule.adjustment)?;
                }
                if let Some(value) = default {
                    map.serialize_entry(DEFAULT_KEY, value)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ScopeTolerance {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ScopeToleranceVisitor)
    }
}

struct ScopeToleranceVisitor;

impl<'de> Visitor<'de> for ScopeToleranceVisitor {
    type Value = ScopeTolerance;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an integer tolerance or a map of pattern -> integer tolerance")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(ScopeTolerance::Flat(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        i64::try_from(v)
            .map(ScopeTolerance::Flat)
            .map_err(|_| E::custom(format!("tolerance {v} out of range")))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        if v.fract() == 0.0 && v.abs() < 9.0e15 {
            Ok(ScopeTolerance::Flat(v as i64))
        } else {
            Err(E::custom(format!("tolerance {v} is not a whole number of microseconds")))
        }
    }

    // Entries are collected in document order; rule order is significant.
    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut rules = Vec::new();
        let mut default = None;

        while let Some((key, value)) = access.next_entry::<String, Micros>()? {
            if key == DEFAULT_KEY {
                default = Some(value);
            } else {
                rules.push(PatternRule::new(key, value));
            }
        }

        Ok(ScopeTolerance::Patterns { rules, default })
    }
}
