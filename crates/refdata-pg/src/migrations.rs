//! Migration runner.
//!
//! Scans a directory for files named `NNN.<slug>.sql` or `NNN.<slug>.yaml`
//! (zero-padded integer prefix) and applies them in ascending numeric order,
//! each inside its own transaction. Provenance is recorded in
//! `fby_migration` as `(number, name, checksum, applied_at)`:
//!
//! - a file whose `(number, checksum)` is already recorded is skipped, so
//!   re-running the full set is a no-op;
//! - a recorded file whose checksum no longer matches is fatal - history is
//!   immutable, write a new migration instead;
//! - two files with the same number are fatal.
//!
//! SQL files execute verbatim; YAML files go through the DSL compiler.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use refdata_core::dsl::DslError;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compiler;

/// Errors raised while discovering or applying migrations. All are fatal;
/// the offending file's transaction rolls back.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migrations directory not found: {path}")]
    DirectoryNotFound { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("duplicate migration number {number}: '{first}' and '{second}'")]
    DuplicateNumber {
        number: i32,
        first: String,
        second: String,
    },

    #[error(
        "checksum mismatch for migration {number:03}.{name}: the file changed after it was applied"
    )]
    ChecksumMismatch { number: i32, name: String },

    #[error("migration {number:03}.{name} is invalid: {source}")]
    Dsl {
        number: i32,
        name: String,
        #[source]
        source: DslError,
    },

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<DslError> for MigrationError {
    fn from(source: DslError) -> Self {
        // Number and name are attached by the runner; the compiler only
        // knows the document.
        MigrationError::Dsl {
            number: 0,
            name: String::new(),
            source,
        }
    }
}

/// How a migration file is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    Sql,
    Yaml,
}

/// A discovered migration file, ordered by `number`.
#[derive(Debug, Clone)]
pub struct MigrationFile {
    pub number: i32,
    pub name: String,
    pub kind: MigrationKind,
    pub path: PathBuf,
}

/// A `fby_migration` bookkeeping row.
#[derive(Debug, Clone, FromRow)]
pub struct AppliedMigration {
    pub number: i32,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

/// Applies the migration files of one directory to one database.
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    directory: PathBuf,
}

impl MigrationRunner {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// List the migration files in apply order. Files that do not match the
    /// `NNN.<slug>.{sql,yaml}` pattern are ignored with a warning.
    pub fn discover(&self) -> Result<Vec<MigrationFile>, MigrationError> {
        if !self.directory.is_dir() {
            return Err(MigrationError::DirectoryNotFound {
                path: self.directory.clone(),
            });
        }

        let entries = std::fs::read_dir(&self.directory).map_err(|source| MigrationError::Io {
            path: self.directory.clone(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| MigrationError::Io {
                path: self.directory.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match parse_file_name(file_name) {
                Some((number, name, kind)) => files.push(MigrationFile {
                    number,
                    name,
                    kind,
                    path,
                }),
                None => warn!(file = file_name, "ignoring non-migration file"),
            }
        }

        files.sort_by(|a, b| a.number.cmp(&b.number));
        for pair in files.windows(2) {
            if pair[0].number == pair[1].number {
                return Err(MigrationError::DuplicateNumber {
                    number: pair[0].number,
                    first: pair[0].name.clone(),
                    second: pair[1].name.clone(),
                });
            }
        }

        Ok(files)
    }

    /// Apply every pending migration, returning how many were newly applied.
    pub async fn apply_all(&self, pool: &PgPool) -> Result<usize, MigrationError> {
        let files = self.discover()?;
        let applied = self.history(pool).await?;
        let applied: HashMap<i32, AppliedMigration> =
            applied.into_iter().map(|m| (m.number, m)).collect();

        let mut newly_applied = 0;
        for file in &files {
            let content =
                std::fs::read_to_string(&file.path).map_err(|source| MigrationError::Io {
                    path: file.path.clone(),
                    source,
                })?;
            let checksum = checksum_hex(&content);

            if let Some(record) = applied.get(&file.number) {
                if record.checksum.trim() != checksum {
                    return Err(MigrationError::ChecksumMismatch {
                        number: file.number,
                        name: file.name.clone(),
                    });
                }
                debug!(number = file.number, name = %file.name, "migration already applied");
                continue;
            }

            self.apply_file(pool, file, &content, &checksum).await?;
            newly_applied += 1;
        }

        Ok(newly_applied)
    }

    /// The recorded provenance of applied migrations, oldest first.
    pub async fn history(&self, pool: &PgPool) -> Result<Vec<AppliedMigration>, MigrationError> {
        let rows = sqlx::query_as::<_, AppliedMigration>(
            "SELECT number, name, checksum, applied_at FROM fby_migration ORDER BY number",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    async fn apply_file(
        &self,
        pool: &PgPool,
        file: &MigrationFile,
        content: &str,
        checksum: &str,
    ) -> Result<(), MigrationError> {
        let start = std::time::Instant::now();
        let mut tx = pool.begin().await?;

        let result = match file.kind {
            MigrationKind::Sql => sqlx::raw_sql(content)
                .execute(&mut *tx)
                .await
                .map(|_| ())
                .map_err(MigrationError::from),
            MigrationKind::Yaml => compiler::apply_document(&mut *tx, content).await,
        };

        if let Err(err) = result {
            tx.rollback().await.ok();
            return Err(attach_context(err, file));
        }

        sqlx::query("INSERT INTO fby_migration (number, name, checksum) VALUES ($1, $2, $3)")
            .bind(file.number)
            .bind(&file.name)
            .bind(checksum)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(
            number = file.number,
            name = %file.name,
            duration_ms = start.elapsed().as_millis() as u64,
            "migration applied"
        );
        Ok(())
    }
}

fn attach_context(err: MigrationError, file: &MigrationFile) -> MigrationError {
    match err {
        MigrationError::Dsl { source, .. } => MigrationError::Dsl {
            number: file.number,
            name: file.name.clone(),
            source,
        },
        other => other,
    }
}

/// SHA-256 of the file content, lowercase hex.
fn checksum_hex(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse `NNN.<slug>.{sql,yaml}` into its parts. Anything else is not a
/// migration file.
fn parse_file_name(file_name: &str) -> Option<(i32, String, MigrationKind)> {
    let (prefix, rest) = file_name.split_once('.')?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number = prefix.parse().ok()?;
    let (slug, extension) = rest.rsplit_once('.')?;
    if slug.is_empty() {
        return None;
    }
    let kind = match extension {
        "sql" => MigrationKind::Sql,
        "yaml" => MigrationKind::Yaml,
        _ => return None,
    };
    Some((number, slug.to_string(), kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn parses_well_formed_file_names() {
        assert_eq!(
            parse_file_name("001.create-vat-rate.yaml"),
            Some((1, "create-vat-rate".to_string(), MigrationKind::Yaml))
        );
        assert_eq!(
            parse_file_name("042.indexes.sql"),
            Some((42, "indexes".to_string(), MigrationKind::Sql))
        );
        assert_eq!(
            parse_file_name("0010.two-part.slug.sql"),
            Some((10, "two-part.slug".to_string(), MigrationKind::Sql))
        );
    }

    #[test]
    fn rejects_malformed_file_names() {
        assert_eq!(parse_file_name("README.md"), None);
        assert_eq!(parse_file_name("create.sql"), None);
        assert_eq!(parse_file_name("001.sql"), None);
        assert_eq!(parse_file_name("001..sql"), None);
        assert_eq!(parse_file_name("1x.slug.sql"), None);
        assert_eq!(parse_file_name("001.slug.txt"), None);
    }

    #[test]
    fn discovery_orders_by_number() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("010.later.sql"), "SELECT 1").unwrap();
        fs::write(dir.path().join("002.second.yaml"), "").unwrap();
        fs::write(dir.path().join("001.first.sql"), "SELECT 1").unwrap();
        fs::write(dir.path().join("notes.txt"), "not a migration").unwrap();

        let files = MigrationRunner::new(dir.path()).discover().unwrap();
        let numbers: Vec<i32> = files.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2, 10]);
        assert_eq!(files[0].name, "first");
        assert_eq!(files[1].kind, MigrationKind::Yaml);
    }

    #[test]
    fn duplicate_numbers_are_fatal() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("001.one.sql"), "SELECT 1").unwrap();
        fs::write(dir.path().join("001.other.sql"), "SELECT 1").unwrap();

        let err = MigrationRunner::new(dir.path()).discover().unwrap_err();
        match err {
            MigrationError::DuplicateNumber { number, .. } => assert_eq!(number, 1),
            other => panic!("expected DuplicateNumber, got {other:?}"),
        }
    }

    #[test]
    fn missing_directory_is_fatal() {
        let err = MigrationRunner::new("/does/not/exist").discover().unwrap_err();
        assert!(matches!(err, MigrationError::DirectoryNotFound { .. }));
    }

    #[test]
    fn checksums_are_stable_and_content_sensitive() {
        let a = checksum_hex("SELECT 1");
        assert_eq!(a.len(), 64);
        assert_eq!(a, checksum_hex("SELECT 1"));
        assert_ne!(a, checksum_hex("SELECT 2"));
    }
}
