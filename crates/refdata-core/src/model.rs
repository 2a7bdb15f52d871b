//! Domain model for temporally versioned reference data.
//!
//! A [`Projection`] is the named, versioned view consumers request. It is
//! backed by one or more [`Entity`] versions. History is an append-only list
//! of [`ChangeSet`]s, each containing data frames that assert (`POST`) or
//! retract (`DELETE`) rows of an entity. [`Hook`]s subscribe to projection
//! changes and are delivered through durable [`Notification`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named, versioned view binding a set of entity versions together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    pub id: i32,
    pub name: String,
    pub version: i32,
}

impl std::fmt::Display for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

/// A versioned schema for a category of reference rows, e.g. `VAT Rate v1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i32,
    pub name: String,
    pub version: i32,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

/// An atomic, effective-dated revision of the world.
///
/// `entity_tag` is 20 random hex characters assigned by the database on
/// insert. It is opaque to callers (a weak ETag, not a content hash) and is
/// stable across reads of the same row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: i32,
    pub description: Option<String>,
    pub effective: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub entity_tag: String,
}

/// Whether a data frame asserts or retracts the identified row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameAction {
    Post,
    Delete,
}

impl FrameAction {
    /// Stable database encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameAction::Post => "POST",
            FrameAction::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for FrameAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscription tying an event name to a projection.
///
/// `projection_id` of `None` is a wildcard: the hook fires for every
/// projection affected by a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    pub id: i32,
    pub name: String,
    pub event: String,
    pub projection_id: Option<i32>,
}

/// Delivery state of a notification.
///
/// At most one `PENDING` and one `OK` row exist per `(hook, projection)` at
/// any instant; the database enforces this with a unique constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Ok,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "PENDING",
            NotificationStatus::Ok => "OK",
        }
    }
}

/// A durable unit of work: fire one hook for one projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub hook_id: i32,
    pub projection_id: i32,
    pub scheduled_for: DateTime<Utc>,
    pub attempts: i32,
    pub status: NotificationStatus,
    pub last_attempted: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Payload handed to hook subscribers by the notification dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookEvent {
    /// The hook's event name.
    pub event: String,
    /// The projection whose underlying data changed.
    pub projection: Projection,
    /// Id of the notification being delivered, for correlation.
    pub notification_id: i64,
    /// Delivery attempts so far, zero on first delivery.
    pub attempts: i32,
}
