//! # refdata-pg
//!
//! PostgreSQL engine for the reference data framework. The [`RefData`]
//! facade owns the connection pool, the framework schema, the migration
//! runner, the read API and the notification dispatcher:
//!
//! ```ignore
//! use refdata_core::RefDataConfig;
//! use refdata_pg::RefData;
//!
//! let refdata = RefData::init(RefDataConfig::from_env(None)?).await?;
//! refdata.subscribe("VAT Rates Changed", handler);
//! refdata.start_notifications()?;
//!
//! let projection = refdata.get_projection("VAT Rates", 1).await?.unwrap();
//! let current = refdata.get_current_change_set(&projection).await?;
//!
//! refdata.stop().await?;
//! ```

mod compiler;
pub mod dispatcher;
pub mod error;
pub mod migrations;
mod query;
mod schema;
pub mod transaction;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use refdata_core::config::RefDataConfig;
use refdata_core::event_bus::{EventBus, HookHandler};
use refdata_core::model::{ChangeSet, Projection};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgConnection;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use dispatcher::NotificationDispatcher;
pub use error::RefDataError;
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
pub use transaction::{with_exclusive_transaction, with_transaction};

/// How long [`RefData::stop`] waits for the dispatcher's in-flight poll
/// before abandoning it. Abandoned work stays PENDING and is redelivered.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Caller-supplied routine invoked by [`RefData::reset`] to drop the side
/// tables and aggregate functions its migrations created, before the
/// framework tables go.
pub type NukeCustomObjects = Arc<
    dyn for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<(), sqlx::Error>> + Send + Sync,
>;

fn bootstrap_boxed(conn: &mut PgConnection) -> BoxFuture<'_, Result<(), sqlx::Error>> {
    Box::pin(schema::bootstrap(conn))
}

fn reset_boxed(
    conn: &mut PgConnection,
    nuke: Option<NukeCustomObjects>,
) -> BoxFuture<'_, Result<(), sqlx::Error>> {
    Box::pin(async move {
        if let Some(nuke) = nuke {
            nuke(&mut *conn).await?;
        }
        schema::drop_framework_objects(conn).await
    })
}

struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A handle to one reference-data store. Cheap to share behind an `Arc`;
/// each handle has its own event bus, so subscriptions never leak between
/// instances.
pub struct RefData {
    pool: PgPool,
    config: RefDataConfig,
    bus: Arc<EventBus>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
    nuke_custom_objects: Option<NukeCustomObjects>,
}

impl RefData {
    /// Acquire the pool, bootstrap the framework schema and run every
    /// pending migration. Re-running over an unchanged migration set is a
    /// no-op.
    pub async fn init(config: RefDataConfig) -> Result<Self, RefDataError> {
        config.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(config.database.connection_timeout)
            .connect(&config.database.url())
            .await
            .map_err(RefDataError::Connection)?;
        Self::init_with_pool(pool, config).await
    }

    /// Like [`Self::init`] with an externally constructed pool. Used by
    /// tests that manage their own databases.
    pub async fn init_with_pool(pool: PgPool, config: RefDataConfig) -> Result<Self, RefDataError> {
        config.validate()?;
        let refdata = Self {
            pool,
            config,
            bus: Arc::new(EventBus::new()),
            dispatcher: Mutex::new(None),
            nuke_custom_objects: None,
        };
        refdata.bootstrap_and_migrate().await?;
        Ok(refdata)
    }

    /// Install the routine [`Self::reset`] uses to drop user-created
    /// objects.
    pub fn with_nuke_custom_objects(mut self, nuke: NukeCustomObjects) -> Self {
        self.nuke_custom_objects = Some(nuke);
        self
    }

    async fn bootstrap_and_migrate(&self) -> Result<(), RefDataError> {
        with_transaction(&self.pool, bootstrap_boxed).await?;
        let applied = MigrationRunner::new(&self.config.migrations)
            .apply_all(&self.pool)
            .await?;
        info!(applied, "store initialised");
        Ok(())
    }

    /// The underlying pool, for ad-hoc SQL such as calling the per-entity
    /// `get_<entity>_v<version>_aggregate` functions.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Register a handler for hook events. Delegates to this instance's bus.
    pub fn subscribe(&self, event: impl Into<String>, handler: HookHandler) {
        self.bus.subscribe(event, handler);
    }

    /// Launch the notification dispatcher as a background task. Read-only
    /// consumers never need this.
    pub fn start_notifications(&self) -> Result<(), RefDataError> {
        let mut slot = self.dispatcher.lock().expect("dispatcher slot poisoned");
        if slot.is_some() {
            return Err(RefDataError::DispatcherAlreadyStarted);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = NotificationDispatcher::new(
            self.pool.clone(),
            Arc::clone(&self.bus),
            self.config.notifications.clone(),
            shutdown_rx,
        );
        let task = tokio::spawn(dispatcher.run());
        *slot = Some(DispatcherHandle {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Signal the dispatcher, wait for its in-flight poll to finish, and
    /// close the pool. Work that outlives the drain timeout is abandoned;
    /// its notification stays PENDING (at-least-once delivery).
    pub async fn stop(&self) -> Result<(), RefDataError> {
        let handle = self
            .dispatcher
            .lock()
            .expect("dispatcher slot poisoned")
            .take();
        if let Some(DispatcherHandle { shutdown, mut task }) = handle {
            let _ = shutdown.send(true);
            if tokio::time::timeout(STOP_DRAIN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                warn!("dispatcher drain timed out; abandoning in-flight delivery");
                task.abort();
            }
        }
        self.pool.close().await;
        Ok(())
    }

    /// Drop everything - user objects via the `nuke_custom_objects` hook,
    /// then the framework schema - and re-initialise from the migration
    /// directory. Intended for tests.
    pub async fn reset(&self) -> Result<(), RefDataError> {
        let nuke = self.nuke_custom_objects.clone();
        with_transaction(&self.pool, move |conn| reset_boxed(conn, nuke)).await?;
        self.bootstrap_and_migrate().await
    }

    /// Run `f` in a transaction: commit on `Ok`, rollback on `Err` or
    /// cancellation.
    pub async fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<sqlx::Error>,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>,
    {
        transaction::with_transaction(&self.pool, f).await
    }

    /// Like [`Self::with_transaction`], serialised against every other
    /// exclusive caller by an advisory lock.
    pub async fn with_exclusive_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<sqlx::Error>,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>,
    {
        transaction::with_exclusive_transaction(&self.pool, f).await
    }

    /// Every projection, ordered by `(name, version)`.
    pub async fn get_projections(&self) -> Result<Vec<Projection>, RefDataError> {
        self.with_transaction(|conn| Box::pin(async move { Ok(query::get_projections(conn).await?) }))
            .await
    }

    /// One projection by name and version.
    pub async fn get_projection(
        &self,
        name: &str,
        version: i32,
    ) -> Result<Option<Projection>, RefDataError> {
        let name = name.to_string();
        self.with_transaction(move |conn| {
            Box::pin(async move { Ok(query::get_projection(conn, &name, version).await?) })
        })
        .await
    }

    /// The change sets affecting a projection, oldest first.
    pub async fn get_change_log(
        &self,
        projection: &Projection,
    ) -> Result<Vec<ChangeSet>, RefDataError> {
        let projection = projection.clone();
        self.with_transaction(move |conn| {
            Box::pin(async move { Ok(query::get_change_log(conn, &projection).await?) })
        })
        .await
    }

    /// One change set by id.
    pub async fn get_change_set(&self, id: i32) -> Result<Option<ChangeSet>, RefDataError> {
        self.with_transaction(move |conn| {
            Box::pin(async move { Ok(query::get_change_set(conn, id).await?) })
        })
        .await
    }

    /// The latest change set for a projection whose effective date is not in
    /// the future.
    pub async fn get_current_change_set(
        &self,
        projection: &Projection,
    ) -> Result<Option<ChangeSet>, RefDataError> {
        let projection = projection.clone();
        self.with_transaction(move |conn| {
            Box::pin(async move { Ok(query::get_current_change_set(conn, &projection).await?) })
        })
        .await
    }
}

impl std::fmt::Debug for RefData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefData")
            .field("migrations", &self.config.migrations)
            .finish_non_exhaustive()
    }
}
