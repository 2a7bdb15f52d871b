//! Scoped transaction helpers.
//!
//! Every read and write in the framework goes through [`with_transaction`]
//! so callers always see a consistent snapshot. The closure receives the
//! transaction's connection; commit happens on `Ok`, rollback on `Err`.
//! If the future is cancelled mid-body, dropping the sqlx transaction rolls
//! it back.

use futures::future::BoxFuture;
use sqlx::postgres::PgPool;
use sqlx::PgConnection;

/// Advisory lock key taken by [`with_exclusive_transaction`]; spells
/// `refdata1` in ASCII.
const EXCLUSIVE_LOCK_KEY: i64 = 0x7265_6664_6174_6131;

/// Run `f` inside a transaction, committing on success and rolling back on
/// any error.
pub async fn with_transaction<T, E, F>(pool: &PgPool, f: F) -> Result<T, E>
where
    E: From<sqlx::Error>,
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>,
{
    let mut tx = pool.begin().await?;
    match f(&mut *tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            tx.rollback().await?;
            Err(err)
        }
    }
}

/// Like [`with_transaction`] but serialised against every other exclusive
/// caller by a transaction-scoped advisory lock taken before the body runs.
/// Used by tests and admin scripts; the lock releases with the transaction.
pub async fn with_exclusive_transaction<T, E, F>(pool: &PgPool, f: F) -> Result<T, E>
where
    E: From<sqlx::Error>,
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>,
{
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(EXCLUSIVE_LOCK_KEY)
        .execute(&mut *tx)
        .await?;
    match f(&mut *tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            tx.rollback().await?;
            Err(err)
        }
    }
}
