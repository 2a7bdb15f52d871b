//! Error types for the PostgreSQL engine.

use refdata_core::config::ConfigError;
use refdata_core::dsl::DslError;
use thiserror::Error;

use crate::migrations::MigrationError;

/// Top-level error surfaced by the [`crate::RefData`] facade.
///
/// Database constraint violations keep their original error code reachable
/// through the source chain; use [`RefDataError::database_error_code`] to
/// discriminate (`23505` unique violation, `23503` foreign key, ...).
#[derive(Debug, Error)]
pub enum RefDataError {
    /// The connection pool could not be acquired at `init`.
    #[error("failed to connect to database: {0}")]
    Connection(#[source] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Dsl(#[from] DslError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("notification dispatcher is already running")]
    DispatcherAlreadyStarted,
}

impl RefDataError {
    /// The database error code buried in this error, if any.
    pub fn database_error_code(&self) -> Option<String> {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = current {
            if let Some(sqlx::Error::Database(db)) = err.downcast_ref::<sqlx::Error>() {
                return db.code().map(|code| code.to_string());
            }
            current = err.source();
        }
        None
    }

    /// Whether this error is a database integrity violation (unique,
    /// not-null, foreign key, check).
    pub fn is_integrity_violation(&self) -> bool {
        self.database_error_code()
            .map(|code| code.starts_with("23"))
            .unwrap_or(false)
    }
}
