//! Notification dispatcher.
//!
//! A single logical worker that drains `fby_notification` and delivers hook
//! events through the in-process bus. Each poll claims at most one due row
//! with `FOR UPDATE SKIP LOCKED` inside its own transaction, so any number
//! of dispatcher processes can run side by side: a notification is handled
//! by at most one worker at a time, and the `(hook, projection, status)`
//! unique constraint collapses duplicate scheduling into a single PENDING
//! row.
//!
//! Failed deliveries are rescheduled with exponential backoff and full
//! jitter until `max_attempts`, after which the row is poisoned: it stays
//! PENDING with its last error for inspection but is never claimed again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use refdata_core::config::NotificationsConfig;
use refdata_core::event_bus::EventBus;
use refdata_core::model::{HookEvent, Notification, NotificationStatus, Projection};
use sqlx::postgres::PgPool;
use sqlx::{FromRow, PgConnection};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::RefDataError;

#[derive(FromRow)]
struct NotificationRow {
    id: i64,
    hook_id: i32,
    projection_id: i32,
    scheduled_for: DateTime<Utc>,
    attempts: i32,
    status: String,
    last_attempted: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Self {
            id: row.id,
            hook_id: row.hook_id,
            projection_id: row.projection_id,
            scheduled_for: row.scheduled_for,
            attempts: row.attempts,
            status: match row.status.as_str() {
                "OK" => NotificationStatus::Ok,
                _ => NotificationStatus::Pending,
            },
            last_attempted: row.last_attempted,
            last_error: row.last_error,
        }
    }
}

/// The polling worker. Constructed by [`crate::RefData::start_notifications`]
/// and run as a background task until the shutdown flag flips.
pub struct NotificationDispatcher {
    pool: PgPool,
    bus: Arc<EventBus>,
    config: NotificationsConfig,
    shutdown: watch::Receiver<bool>,
}

impl NotificationDispatcher {
    pub(crate) fn new(
        pool: PgPool,
        bus: Arc<EventBus>,
        config: NotificationsConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            bus,
            config,
            shutdown,
        }
    }

    /// Run until stopped. Never returns an error: everything unexpected is
    /// logged and the loop carries on after the poll interval.
    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_attempts = self.config.max_attempts,
            "notification dispatcher starting"
        );

        if !self.config.initial_delay.is_zero() {
            self.idle(self.config.initial_delay).await;
        }

        while !*self.shutdown.borrow() {
            match self.poll_once().await {
                // Work was found; poll again immediately in case more is due.
                Ok(true) => {}
                Ok(false) => self.idle(self.config.interval).await,
                Err(err) => {
                    error!(error = %err, "notification poll failed");
                    self.idle(self.config.interval).await;
                }
            }
        }

        info!("notification dispatcher stopped");
    }

    /// Claim and deliver at most one notification. Returns whether a row was
    /// claimed.
    async fn poll_once(&self) -> Result<bool, RefDataError> {
        let mut tx = self.pool.begin().await?;

        let Some(notification) = claim_next(&mut *tx, self.config.max_attempts).await? else {
            tx.commit().await?;
            return Ok(false);
        };

        let event: String = sqlx::query_scalar("SELECT event FROM fby_hook WHERE id = $1")
            .bind(notification.hook_id)
            .fetch_one(&mut *tx)
            .await?;
        let projection = sqlx::query_as::<_, (i32, String, i32)>(
            "SELECT id, name, version FROM fby_projection WHERE id = $1",
        )
        .bind(notification.projection_id)
        .fetch_one(&mut *tx)
        .await?;
        let projection = Projection {
            id: projection.0,
            name: projection.1,
            version: projection.2,
        };

        let payload = HookEvent {
            event: event.clone(),
            projection,
            notification_id: notification.id,
            attempts: notification.attempts,
        };

        match self.bus.emit(payload).await {
            Ok(()) => {
                sqlx::query("SELECT fby_pass_notification($1)")
                    .bind(notification.id)
                    .execute(&mut *tx)
                    .await?;
                debug!(
                    notification_id = notification.id,
                    event = %event,
                    "notification delivered"
                );
            }
            Err(err) => {
                let delay = self.reschedule_delay(notification.attempts);
                let next_attempt = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                warn!(
                    notification_id = notification.id,
                    event = %event,
                    attempts = notification.attempts + 1,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "notification delivery failed"
                );
                sqlx::query("SELECT fby_fail_notification($1, $2, $3)")
                    .bind(notification.id)
                    .bind(next_attempt)
                    .bind(err.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Exponential backoff with full jitter:
    /// `min(max_reschedule_delay, uniform(0, 2^attempts * base))`.
    fn reschedule_delay(&self, attempts: i32) -> Duration {
        let base = self.config.base_reschedule_delay.as_millis() as u64;
        let ceiling = (1u64 << attempts.clamp(0, 62)).saturating_mul(base);
        let jittered = rand::thread_rng().gen_range(0..ceiling.max(1));
        Duration::from_millis(jittered.min(self.config.max_reschedule_delay.as_millis() as u64))
    }

    /// Sleep for `period`, waking early when the shutdown flag flips.
    async fn idle(&mut self, period: Duration) {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => {}
        }
    }
}

async fn claim_next(
    conn: &mut PgConnection,
    max_attempts: i32,
) -> Result<Option<Notification>, sqlx::Error> {
    let row = sqlx::query_as::<_, NotificationRow>(
        r#"
        SELECT id, hook_id, projection_id, scheduled_for, attempts, status,
               last_attempted, last_error
        FROM fby_get_next_notification($1)
        "#,
    )
    .bind(max_attempts)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(Notification::from))
}
