use std::collections::BTreeMap;
use std::env;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::key::KeyScheme;
use crate::period::Micros;
use crate::tolerance::ToleranceTable;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "GAPWATCH_CONFIG";

/// Instrument-mode entry used when an event carries no mode.
pub const DEFAULT_MODE: &str = "default";

/// Configuration bundle passed to every engine invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Preferred output mode for the CLI (`pretty`, `text`, `json`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub missions: BTreeMap<String, MissionConfig>,
    #[serde(default)]
    pub tolerance: ToleranceTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionConfig {
    #[serde(default)]
    pub scheme: KeyScheme,
    /// Shift applied to predicted neighbor windows.
    #[serde(default = "default_orbital_period_us")]
    pub orbital_period_us: Micros,
    /// Acquisitions at or below this sensing duration get no neighbors.
    #[serde(default)]
    pub min_sensing_duration_us: Micros,
    #[serde(default = "default_true")]
    pub split_by_timeliness: bool,
    #[serde(default)]
    pub gap_tolerance_us: Micros,
    #[serde(default)]
    pub missing_start_offset_us: Micros,
    #[serde(default)]
    pub missing_end_tolerance_us: Micros,
    #[serde(default)]
    pub expected: BTreeMap<String, ExpectedDuration>,
    /// Instrument mode -> product types produced for it.
    #[serde(default)]
    pub product_types: BTreeMap<String, Vec<String>>,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            scheme: KeyScheme::default(),
            orbital_period_us: default_orbital_period_us(),
            min_sensing_duration_us: 0,
            split_by_timeliness: default_true(),
            gap_tolerance_us: 0,
            missing_start_offset_us: 0,
            missing_end_tolerance_us: 0,
            expected: BTreeMap::new(),
            product_types: BTreeMap::new(),
        }
    }
}

/// Expected duration of one product type: a constant, or the length of the
/// acquisition's observation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpectedDuration {
    Fixed(Micros),
    Derived(ExpectedSource),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedSource {
    Window,
}

impl MissionConfig {
    /// Product types expected for an instrument mode, falling back to the
    /// `default` entry.
    #[must_use]
    pub fn product_types_for(&self, instrument_mode: Option<&str>) -> Vec<String> {
        instrument_mode
            .and_then(|mode| self.product_types.get(mode))
            .or_else(|| self.product_types.get(DEFAULT_MODE))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether events of this product type produce a record.
    ///
    /// A mission that lists neither product types nor expected durations
    /// accepts everything.
    #[must_use]
    pub fn supports(&self, product_type: &str) -> bool {
        if self.product_types.is_empty() && self.expected.is_empty() {
            return true;
        }
        self.expected.contains_key(product_type)
            || self
                .product_types
                .values()
                .any(|types| types.iter().any(|t| t == product_type))
    }

    /// Timeliness part of a compute key under this mission's policy.
    #[must_use]
    pub fn timeliness_key(&self, timeliness: Option<&str>) -> Option<String> {
        if self.split_by_timeliness {
            timeliness.map(str::to_string)
        } else {
            None
        }
    }

    fn validate(&self, mission: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidMission {
            mission: mission.to_string(),
            reason,
        };

        if self.orbital_period_us <= 0 {
            return Err(invalid(format!(
                "orbital_period_us must be positive, got {}",
                self.orbital_period_us
            )));
        }
        for (name, value) in [
            ("min_sensing_duration_us", self.min_sensing_duration_us),
            ("gap_tolerance_us", self.gap_tolerance_us),
            ("missing_start_offset_us", self.missing_start_offset_us),
        ] {
            if value < 0 {
                return Err(invalid(format!("{name} must not be negative, got {value}")));
            }
        }
        match self.scheme {
            KeyScheme::RelativeOrbit {
                orbits_per_cycle: 0,
                ..
            } => return Err(invalid("orbits_per_cycle must be at least 1".into())),
            KeyScheme::RelativeOrbit {
                cycle_width: 0, ..
            }
            | KeyScheme::RelativeOrbit {
                orbit_width: 0, ..
            }
            | KeyScheme::AbsoluteOrbit { width: 0 } => {
                return Err(invalid("numeric widths must be at least 1".into()));
            }
            _ => {}
        }
        for (product_type, expected) in &self.expected {
            match expected {
                ExpectedDuration::Fixed(us) if *us < 0 => {
                    return Err(invalid(format!(
                        "expected duration for {product_type} is negative ({us})"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl EngineConfig {
    #[must_use]
    pub fn mission(&self, name: &str) -> Option<&MissionConfig> {
        self.missions.get(name)
    }

    /// Builder-style insert used by tests and embedders.
    #[must_use]
    pub fn with_mission(mut self, name: &str, mission: MissionConfig) -> Self {
        self.missions.insert(name.to_string(), mission);
        self
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance: ToleranceTable) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Check the semantic constraints toml cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first mission whose settings cannot drive the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.missions
            .iter()
            .try_for_each(|(name, mission)| mission.validate(name))
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML for this schema
    /// or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse gapwatch config")?;
        config.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a config file that must exist.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    EngineConfig::from_toml_str(&content)
        .with_context(|| format!("Failed to load {}", path.display()))
}

fn load_optional(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    load_config(path)
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSource {
    pub path: Option<PathBuf>,
    pub exists: bool,
}

/// Resolve the configuration: explicit path, then `GAPWATCH_CONFIG`, then
/// `<config dir>/gapwatch/config.toml`.
///
/// # Errors
///
/// Returns an error if the selected file exists but is invalid, or if an
/// explicit path does not exist.
pub fn discover_config(explicit: Option<&Path>) -> Result<(EngineConfig, ConfigSource)> {
    let env_path = env::var_os(CONFIG_ENV).map(PathBuf::from);
    let user_path = dirs::config_dir().map(|dir| dir.join("gapwatch/config.toml"));
    discover_from(explicit, env_path, user_path)
}

fn discover_from(
    explicit: Option<&Path>,
    env_path: Option<PathBuf>,
    user_path: Option<PathBuf>,
) -> Result<(EngineConfig, ConfigSource)> {
    if let Some(path) = explicit {
        let config = load_config(path)?;
        return Ok((
            config,
            ConfigSource {
                path: Some(path.to_path_buf()),
                exists: true,
            },
        ));
    }

    let Some(path) = env_path.or(user_path) else {
        return Ok((
            EngineConfig::default(),
            ConfigSource {
                path: None,
                exists: false,
            },
        ));
    };

    let exists = path.exists();
    let config = load_optional(&path)?;
    Ok((
        config,
        ConfigSource {
            path: Some(path),
            exists,
        },
    ))
}

/// Pick the CLI output mode from flag, `GAPWATCH_FORMAT`, config and tty.
///
/// # Errors
///
/// Currently infallible; kept fallible so new sources can report errors.
pub fn resolve_output(cli_json: bool, configured: Option<&str>) -> Result<String> {
    let env_format = env::var("GAPWATCH_FORMAT").ok();
    resolve_output_from(cli_json, configured, env_format.as_deref())
}

fn resolve_output_from(
    cli_json: bool,
    configured: Option<&str>,
    env_format: Option<&str>,
) -> Result<String> {
    fn normalize_output_mode(raw: &str) -> Option<&'static str> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" | "human" => Some("pretty"),
            "text" | "table" => Some("text"),
            "json" => Some("json"),
            _ => None,
        }
    }

    if cli_json {
        return Ok("json".to_string());
    }

    if let Some(mode) = env_format.and_then(normalize_output_mode) {
        return Ok(mode.to_string());
    }

    if let Some(mode) = configured.and_then(normalize_output_mode) {
        return Ok(mode.to_string());
    }

    if std::io::stdout().is_terminal() {
        Ok("pretty".to_string())
    } else {
        Ok("text".to_string())
    }
}

const fn default_true() -> bool {
    true
}

const fn default_orbital_period_us() -> Micros {
    // Sun-synchronous LEO, ~98.6 minutes.
    5_916_000_000
}
