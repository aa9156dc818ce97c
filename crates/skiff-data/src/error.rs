//! Error types for the data access layer.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// Result alias for data layer operations.
pub type Result<T> = std::result::Result<T, DataError>;

/// Errors raised by the data access layer.
#[derive(Debug)]
pub enum DataError {
    /// Migration execution failed.
    MigrationFailed {
        /// Underlying migration error.
        source: sqlx::migrate::MigrateError,
    },
    /// A database operation failed.
    QueryFailed {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying SQL error.
        source: sqlx::Error,
    },
    /// A stored value did not decode into the expected domain type.
    Corrupt {
        /// Column or field that failed to decode.
        field: &'static str,
        /// Offending value.
        value: String,
    },
}

impl DataError {
    pub(crate) fn query(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::QueryFailed { operation, source }
    }
}

impl Display for DataError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::MigrationFailed { .. } => formatter.write_str("migration failed"),
            Self::QueryFailed { operation, .. } => {
                write!(formatter, "database operation {operation} failed")
            }
            Self::Corrupt { field, value } => {
                write!(formatter, "stored value for {field} is corrupt: {value:?}")
            }
        }
    }
}

impl Error for DataError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::MigrationFailed { source } => Some(source),
            Self::QueryFailed { source, .. } => Some(source),
            Self::Corrupt { .. } => None,
        }
    }
}

impl From<sqlx::Error> for DataError {
    fn from(source: sqlx::Error) -> Self {
        Self::QueryFailed {
            operation: "sqlx operation",
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_error_display_and_source() {
        let query = DataError::QueryFailed {
            operation: "torrents.get",
            source: sqlx::Error::RowNotFound,
        };
        assert!(query.to_string().contains("torrents.get"));
        assert!(query.source().is_some());

        let corrupt = DataError::Corrupt {
            field: "torrents.status",
            value: "limbo".to_string(),
        };
        assert!(corrupt.to_string().contains("limbo"));
        assert!(corrupt.source().is_none());
    }
}
