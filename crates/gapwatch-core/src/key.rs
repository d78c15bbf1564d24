//! Compute keys and orbit/datatake neighbor arithmetic.
//!
//! Missions address acquisitions in one of three ways, selected per mission
//! by [`KeyScheme`]:
//!
//! - **Datatake**: an opaque mission-planning identifier. Neighbors can only
//!   be found through an external planning lookup.
//! - **Relative orbit**: `<platform>_<cycle>_<orbit>` on a ring of
//!   `orbits_per_cycle` orbits. Stepping back from orbit 1 lands on the last
//!   orbit of the previous cycle; stepping forward from the last orbit lands
//!   on orbit 1 of the next cycle.
//! - **Absolute orbit**: `<platform>_<orbit>` on a flat counter.
//!
//! Numeric segments render zero-padded to the scheme's widths and
//! `scheme.parse(&scheme.render(&key)) == Some(key)` holds for every key the
//! scheme accepts.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Relative orbits per repeat cycle used when a mission does not override it.
pub const DEFAULT_ORBITS_PER_CYCLE: u32 = 385;

// ---------------------------------------------------------------------------
// Scheme
// ---------------------------------------------------------------------------

/// How a mission identifies acquisitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyScheme {
    Datatake,
    RelativeOrbit {
        #[serde(default = "default_orbits_per_cycle")]
        orbits_per_cycle: u32,
        #[serde(default = "default_cycle_width")]
        cycle_width: usize,
        #[serde(default = "default_relative_orbit_width")]
        orbit_width: usize,
    },
    AbsoluteOrbit {
        #[serde(default = "default_absolute_orbit_width")]
        width: usize,
    },
}

impl Default for KeyScheme {
    fn default() -> Self {
        Self::Datatake
    }
}

const fn default_orbits_per_cycle() -> u32 {
    DEFAULT_ORBITS_PER_CYCLE
}

const fn default_cycle_width() -> usize {
    3
}

const fn default_relative_orbit_width() -> usize {
    3
}

const fn default_absolute_orbit_width() -> usize {
    5
}

/// A parsed acquisition identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AcquisitionKey {
    Datatake(String),
    RelativeOrbit {
        platform: String,
        cycle: u32,
        orbit: u32,
    },
    AbsoluteOrbit {
        platform: String,
        orbit: u64,
    },
}

/// Direction of a neighbor lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Previous,
    Next,
}

impl Direction {
    pub const BOTH: [Self; 2] = [Self::Previous, Self::Next];

    /// `-1` for previous, `+1` for next.
    #[must_use]
    pub const fn sign(self) -> i64 {
        match self {
            Self::Previous => -1,
            Self::Next => 1,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Previous => "previous",
            Self::Next => "next",
        }
    }
}

impl KeyScheme {
    /// Convenience constructor for the ring scheme with default widths.
    #[must_use]
    pub const fn relative_orbit(orbits_per_cycle: u32) -> Self {
        Self::RelativeOrbit {
            orbits_per_cycle,
            cycle_width: default_cycle_width(),
            orbit_width: default_relative_orbit_width(),
        }
    }

    /// Convenience constructor for the flat scheme.
    #[must_use]
    pub const fn absolute_orbit(width: usize) -> Self {
        Self::AbsoluteOrbit { width }
    }

    /// True when neighbors can be derived arithmetically.
    #[must_use]
    pub const fn is_orbit_based(&self) -> bool {
        !matches!(self, Self::Datatake)
    }

    /// Parse a raw acquisition identifier; `None` when malformed.
    #[must_use]
    pub fn parse(&self, raw: &str) -> Option<AcquisitionKey> {
        let raw = raw.trim();
        if raw.is_empty() || raw.chars().any(char::is_whitespace) {
            return None;
        }

        match *self {
            Self::Datatake => Some(AcquisitionKey::Datatake(raw.to_string())),
            Self::RelativeOrbit {
                orbits_per_cycle, ..
            } => {
                let mut parts = raw.rsplitn(3, '_');
                let orbit = parse_number::<u32>(parts.next()?)?;
                let cycle = parse_number::<u32>(parts.next()?)?;
                let platform = parts.next().filter(|p| !p.is_empty())?;
                if orbit == 0 || orbit > orbits_per_cycle {
                    return None;
                }
                Some(AcquisitionKey::RelativeOrbit {
                    platform: platform.to_string(),
                    cycle,
                    orbit,
                })
            }
            Self::AbsoluteOrbit { .. } => {
                let (platform, orbit) = raw.rsplit_once('_')?;
                if platform.is_empty() {
                    return None;
                }
                Some(AcquisitionKey::AbsoluteOrbit {
                    platform: platform.to_string(),
                    orbit: parse_number::<u64>(orbit)?,
                })
            }
        }
    }

    /// Canonical string form of `key` under this scheme.
    #[must_use]
    pub fn render(&self, key: &AcquisitionKey) -> String {
        match (self, key) {
            (
                Self::RelativeOrbit {
                    cycle_width,
                    orbit_width,
                    ..
                },
                AcquisitionKey::RelativeOrbit {
                    platform,
                    cycle,
                    orbit,
                },
            ) => format!(
                "{platform}_{cycle:0cw$}_{orbit:0ow$}",
                cw = *cycle_width,
                ow = *orbit_width
            ),
            (Self::AbsoluteOrbit { width }, AcquisitionKey::AbsoluteOrbit { platform, orbit }) => {
                format!("{platform}_{orbit:0w$}", w = *width)
            }
            (_, other) => other.to_string(),
        }
    }

    /// Parse then re-render, normalising padding. `None` when malformed.
    #[must_use]
    pub fn canonicalize(&self, raw: &str) -> Option<String> {
        self.parse(raw).map(|key| self.render(&key))
    }

    /// Arithmetic neighbor of `key`, or `None` for datatake keys and when
    /// the step would leave the counter's range.
    #[must_use]
    pub fn neighbor(&self, key: &AcquisitionKey, direction: Direction) -> Option<AcquisitionKey> {
        match (self, key) {
            (
                Self::RelativeOrbit {
                    orbits_per_cycle, ..
                },
                AcquisitionKey::RelativeOrbit {
                    platform,
                    cycle,
                    orbit,
                },
            ) => {
                let last = *orbits_per_cycle;
                let (cycle, orbit) = match direction {
                    Direction::Previous if *orbit <= 1 => (cycle.checked_sub(1)?, last),
                    Direction::Previous => (*cycle, orbit - 1),
                    Direction::Next if *orbit >= last => (cycle.checked_add(1)?, 1),
                    Direction::Next => (*cycle, orbit + 1),
                };
                Some(AcquisitionKey::RelativeOrbit {
                    platform: platform.clone(),
                    cycle,
                    orbit,
                })
            }
            (Self::AbsoluteOrbit { .. }, AcquisitionKey::AbsoluteOrbit { platform, orbit }) => {
                let orbit = match direction {
                    Direction::Previous => orbit.checked_sub(1)?,
                    Direction::Next => orbit.checked_add(1)?,
                };
                Some(AcquisitionKey::AbsoluteOrbit {
                    platform: platform.clone(),
                    orbit,
                })
            }
            _ => None,
        }
    }
}

fn parse_number<T: std::str::FromStr>(segment: &str) -> Option<T> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

impl fmt::Display for AcquisitionKey {
    /// Unpadded form; use [`KeyScheme::render`] for the canonical one.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datatake(id) => f.write_str(id),
            Self::RelativeOrbit {
                platform,
                cycle,
                orbit,
            } => write!(f, "{platform}_{cycle}_{orbit}"),
            Self::AbsoluteOrbit { platform, orbit } => write!(f, "{platform}_{orbit}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Compute keys
// ---------------------------------------------------------------------------

/// Addresses exactly one local completeness record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputeKey {
    /// Canonical acquisition identifier (rendered by the mission's scheme).
    pub acquisition: String,
    pub product_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeliness: Option<String>,
}

impl ComputeKey {
    #[must_use]
    pub fn new(
        acquisition: impl Into<String>,
        product_type: impl Into<String>,
        timeliness: Option<String>,
    ) -> Self {
        Self {
            acquisition: acquisition.into(),
            product_type: product_type.into(),
            timeliness,
        }
    }

    /// The aggregate this key contributes to.
    #[must_use]
    pub fn global_key(&self) -> GlobalKey {
        GlobalKey {
            acquisition: self.acquisition.clone(),
            timeliness: self.timeliness.clone(),
        }
    }

    /// Same product type and timeliness on another acquisition.
    #[must_use]
    pub fn with_acquisition(&self, acquisition: impl Into<String>) -> Self {
        Self {
            acquisition: acquisition.into(),
            product_type: self.product_type.clone(),
            timeliness: self.timeliness.clone(),
        }
    }

    /// Same acquisition and timeliness for another product type.
    #[must_use]
    pub fn with_product_type(&self, product_type: impl Into<String>) -> Self {
        Self {
            acquisition: self.acquisition.clone(),
            product_type: product_type.into(),
            timeliness: self.timeliness.clone(),
        }
    }

    /// Stable identifier used by store adapters.
    #[must_use]
    pub fn storage_id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.acquisition,
            self.product_type,
            self.timeliness.as_deref().unwrap_or("-")
        )
    }
}

impl fmt::Display for ComputeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_id())
    }
}

/// Addresses one per-acquisition aggregate record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalKey {
    pub acquisition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeliness: Option<String>,
}

impl GlobalKey {
    #[must_use]
    pub fn storage_id(&self) -> String {
        format!(
            "{}:{}",
            self.acquisition,
            self.timeliness.as_deref().unwrap_or("-")
        )
    }
}

impl fmt::Display for GlobalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_id())
    }
}
