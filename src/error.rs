use thiserror::Error;

/// Fatal errors for a sync run. Source-side problems never surface here; the
/// loader downgrades them to warnings and empty datasets.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("target table not found: {0}")]
    TargetMissing(String),

    #[error("target table error: {0}")]
    Target(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("no student name in any source")]
    MissingName,

    #[error("placement day count {0} exceeds {max}", max = crate::rows::MAX_PLACEMENT_DAYS)]
    PlacementDaysOutOfRange(u32),
}
