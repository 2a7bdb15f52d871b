//! In-process event bus.
//!
//! Each framework handle owns its own bus; there is no process-global
//! registry. Handlers are registered with [`EventBus::subscribe`] and invoked
//! sequentially, in registration order, by [`EventBus::emit`]. The first
//! handler error aborts the emit and propagates to the caller, which is how
//! the notification dispatcher learns that a delivery failed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

use crate::model::HookEvent;

/// What a handler reports back to the dispatcher.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// An async subscriber for one event name.
pub type HookHandler = Arc<dyn Fn(HookEvent) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Errors surfaced by [`EventBus::emit`].
#[derive(Debug, Error)]
pub enum EventBusError {
    /// A subscriber returned an error; the event is considered undelivered.
    #[error("handler for event '{event}' failed: {message}")]
    Handler { event: String, message: String },
}

/// Registry of event names to handlers.
///
/// Registration is expected to happen before dispatch starts; subscribing
/// while an emit is in flight is safe (the registry is read-locked per emit)
/// but the new handler only sees subsequent events.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<HookHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event name. Handlers stack: every handler
    /// registered for an event runs on each emit, in registration order.
    pub fn subscribe(&self, event: impl Into<String>, handler: HookHandler) {
        let event = event.into();
        let mut handlers = self.handlers.write().expect("event bus registry poisoned");
        handlers.entry(event).or_default().push(handler);
    }

    /// Number of handlers registered for an event.
    pub fn handler_count(&self, event: &str) -> usize {
        let handlers = self.handlers.read().expect("event bus registry poisoned");
        handlers.get(event).map(Vec::len).unwrap_or(0)
    }

    /// Deliver a payload to every handler of `payload.event`, awaiting each
    /// in turn. The first failure stops delivery and is returned.
    pub async fn emit(&self, payload: HookEvent) -> Result<(), EventBusError> {
        let event = payload.event.clone();
        let subscribers: Vec<HookHandler> = {
            let handlers = self.handlers.read().expect("event bus registry poisoned");
            handlers.get(&event).cloned().unwrap_or_default()
        };

        if subscribers.is_empty() {
            debug!(event = %event, "no subscribers registered");
            return Ok(());
        }

        for handler in subscribers {
            handler(payload.clone())
                .await
                .map_err(|e| EventBusError::Handler {
                    event: event.clone(),
                    message: e.to_string(),
                })?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().expect("event bus registry poisoned");
        f.debug_struct("EventBus")
            .field("events", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Projection;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn payload(event: &str) -> HookEvent {
        HookEvent {
            event: event.to_string(),
            projection: Projection {
                id: 1,
                name: "VAT Rates".to_string(),
                version: 1,
            },
            notification_id: 7,
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(
                "VAT Rates Changed",
                Arc::new(move |_| {
                    let order = Arc::clone(&order);
                    Box::pin(async move {
                        order.lock().unwrap().push(tag);
                        Ok(())
                    })
                }),
            );
        }

        bus.emit(payload("VAT Rates Changed")).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn handler_error_propagates_and_stops_delivery() {
        let bus = EventBus::new();
        let later_calls = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            "VAT Rates Changed",
            Arc::new(|_| Box::pin(async { Err("downstream unavailable".into()) })),
        );
        let counter = Arc::clone(&later_calls);
        bus.subscribe(
            "VAT Rates Changed",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            }),
        );

        let err = bus.emit(payload("VAT Rates Changed")).await.unwrap_err();
        assert!(err.to_string().contains("downstream unavailable"));
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.emit(payload("Nobody Listens")).await.unwrap();
        assert_eq!(bus.handler_count("Nobody Listens"), 0);
    }

    #[tokio::test]
    async fn events_are_isolated_by_name() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        bus.subscribe(
            "VAT Rates Changed",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            }),
        );

        bus.emit(payload("Park Catalogue Changed")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        bus.emit(payload("VAT Rates Changed")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
