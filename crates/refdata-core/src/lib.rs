//! # refdata-core
//!
//! Database-agnostic core of the reference data framework:
//!
//! - [`model`] - projections, entities, change sets, data frames, hooks and
//!   notifications
//! - [`dsl`] - the YAML document model and its structural validator
//! - [`event_bus`] - the in-process bus that delivers hook events to
//!   subscribers
//! - [`config`] - environment-driven configuration DTOs
//!
//! The PostgreSQL engine lives in the sibling `refdata-pg` crate.

pub mod config;
pub mod dsl;
pub mod event_bus;
pub mod model;

pub use config::{ConfigError, DatabaseConfig, NotificationsConfig, RefDataConfig};
pub use dsl::{DslError, Instruction};
pub use event_bus::{EventBus, EventBusError, HandlerResult, HookHandler};
pub use model::{
    ChangeSet, Entity, FrameAction, Hook, HookEvent, Notification, NotificationStatus, Projection,
};
