use std::fmt;

/// Machine-readable error codes for operators and the scheduler that
/// re-enqueues failed keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    UnknownMission,
    ConfigurationFault,
    DomainSkip,
    StalenessConflict,
    ConcurrencyConflict,
    StoreUnavailable,
    CorruptRecord,
    Cancelled,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`G####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "G1001",
            Self::UnknownMission => "G1002",
            Self::ConfigurationFault => "G1003",
            Self::DomainSkip => "G2001",
            Self::StalenessConflict => "G3001",
            Self::ConcurrencyConflict => "G3002",
            Self::StoreUnavailable => "G5001",
            Self::CorruptRecord => "G5002",
            Self::Cancelled => "G8001",
            Self::InternalUnexpected => "G9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::UnknownMission => "Mission not configured",
            Self::ConfigurationFault => "Expected duration unavailable",
            Self::DomainSkip => "Event yields no compute key",
            Self::StalenessConflict => "Neighbor or sibling deferred",
            Self::ConcurrencyConflict => "Record changed concurrently",
            Self::StoreUnavailable => "Record store unavailable",
            Self::CorruptRecord => "Stored record is corrupt",
            Self::Cancelled => "Batch cancelled",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in the gapwatch config.toml and retry."),
            Self::UnknownMission => Some("Add a [missions.<name>] section to the config."),
            Self::ConfigurationFault => {
                Some("Add the product type to [missions.<name>.expected] and rerun the batch.")
            }
            Self::DomainSkip => None,
            Self::StalenessConflict => Some("The key is retried by the next batch that touches it."),
            Self::ConcurrencyConflict => Some("Re-enqueue the conflicting keys in a new batch."),
            Self::StoreUnavailable => Some("Check the database path and permissions."),
            Self::CorruptRecord => {
                Some("Inspect the record with `gw show` and remove it if unrecoverable.")
            }
            Self::Cancelled => None,
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures raised by a [`crate::store::RecordStore`] adapter.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("stored record {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Unavailable(_) | Self::Sqlite(_) => ErrorCode::StoreUnavailable,
            Self::Corrupt { .. } => ErrorCode::CorruptRecord,
        }
    }
}

/// Failures raised by an [`crate::provider::ExpectedValueProvider`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("mission '{0}' is not configured")]
    UnknownMission(String),

    #[error("no expected duration for mission {mission} product type {product_type}")]
    NoExpectedValue {
        mission: String,
        product_type: String,
    },
}

/// Errors that abort a batch.
///
/// Domain skips and deferred neighbors are recovered inside the engine and
/// only show up in [`crate::engine::BatchStats`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration fault for {key}: {source}")]
    Configuration {
        key: String,
        #[source]
        source: ProviderError,
    },

    #[error("record store failed while {action}: {source}")]
    Store {
        action: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("batch cancelled before persistence")]
    Cancelled,
}

impl EngineError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Configuration {
                source: ProviderError::UnknownMission(_),
                ..
            } => ErrorCode::UnknownMission,
            Self::Configuration { .. } => ErrorCode::ConfigurationFault,
            Self::Store { source, .. } => source.code(),
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }
}

/// A configuration file that parsed but cannot drive the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("mission {mission}: {reason}")]
    InvalidMission { mission: String, reason: String },
}

impl ConfigError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::ConfigParseError
    }
}
