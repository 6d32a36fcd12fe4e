use serde::Serialize;

/// Classification for everything that can go wrong during a migration run.
///
/// Only [`MigrationError::Configuration`] aborts a run. Every other variant is
/// attached to a single record and the run moves on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    /// Bad or missing input file, argument, or filter.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An expected related record is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Zero or several candidates where exactly one was expected.
    #[error("ambiguous: {0}")]
    Ambiguous(String),

    /// The storage layer rejected a write.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// A remote resource was unreachable or answered with a non-200 status.
    #[error("external fetch failure: {0}")]
    ExternalFetchFailure(String),
}

impl MigrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Ambiguous(_) => ErrorKind::Ambiguous,
            Self::PersistenceFailure(_) => ErrorKind::PersistenceFailure,
            Self::ExternalFetchFailure(_) => ErrorKind::ExternalFetchFailure,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::Configuration(detail)
            | Self::NotFound(detail)
            | Self::Ambiguous(detail)
            | Self::PersistenceFailure(detail)
            | Self::ExternalFetchFailure(detail) => detail,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    NotFound,
    Ambiguous,
    PersistenceFailure,
    ExternalFetchFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::NotFound => "not_found",
            Self::Ambiguous => "ambiguous",
            Self::PersistenceFailure => "persistence_failure",
            Self::ExternalFetchFailure => "external_fetch_failure",
        }
    }
}

/// Shorthand for a fatal configuration failure wrapped in `anyhow`.
pub fn configuration(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(MigrationError::Configuration(message.into()))
}

/// Returns the configuration error carried by `error`, if any.
pub fn as_configuration(error: &anyhow::Error) -> Option<&MigrationError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<MigrationError>())
        .filter(|error| error.is_fatal())
}
