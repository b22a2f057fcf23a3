//! Registry dispatching received events to user handlers.
//!
//! Handlers come in two flavors, plain synchronous functions and
//! suspending (future-returning) ones, modeled as the two arms of
//! [`EventHandler`] so the dispatcher can await the latter without forcing
//! either style on users. One handler per event type; re-registering
//! replaces.
//!
//! Handlers return a [`StateChanges`] patch. The game state machine merges
//! these patches into the next state update; receive-path handlers (server
//! and client façades) ignore the patch. Handler errors are caught at this
//! boundary by the caller, logged, and never kill a loop.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tether_proto::{Event, GameState, StateChanges};

/// Error type handlers may return; logged at the dispatch site.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler produces: a state patch, or an error to log.
pub type HandlerResult = Result<StateChanges, HandlerError>;

/// Context injected into every handler invocation alongside the event's
/// own arguments.
#[derive(Clone, Default)]
pub struct HandlerContext {
    /// Snapshot of the game state at dispatch time, when one is available.
    pub game_state: Option<GameState>,
    /// Address of the peer that sent the event, when known.
    pub client_address: Option<SocketAddr>,
    /// Seconds since the previous simulation step, inside the game loop.
    pub dt: Option<f64>,
}

type SyncFn = Arc<dyn Fn(&Event, &HandlerContext) -> HandlerResult + Send + Sync>;
type AsyncFn = Arc<
    dyn Fn(Event, HandlerContext) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>>
        + Send
        + Sync,
>;

/// A registered handler: synchronous or suspending.
#[derive(Clone)]
pub enum EventHandler {
    /// Invoked inline.
    Sync(SyncFn),
    /// Awaited by the dispatcher.
    Async(AsyncFn),
}

impl EventHandler {
    /// Invoke the handler with the event and injected context.
    pub async fn call(&self, event: &Event, context: &HandlerContext) -> HandlerResult {
        match self {
            EventHandler::Sync(f) => f(event, context),
            EventHandler::Async(f) => f(event.clone(), context.clone()).await,
        }
    }
}

/// Map from event type to its handler.
#[derive(Clone, Default)]
pub struct UniversalEventHandler {
    handlers: HashMap<String, EventHandler>,
}

impl UniversalEventHandler {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        UniversalEventHandler::default()
    }

    /// Register a synchronous handler, replacing any existing one for the
    /// same type.
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        handler: impl Fn(&Event, &HandlerContext) -> HandlerResult + Send + Sync + 'static,
    ) {
        self.handlers
            .insert(event_type.into(), EventHandler::Sync(Arc::new(handler)));
    }

    /// Register a suspending handler, replacing any existing one for the
    /// same type.
    pub fn register_async<F, Fut>(&mut self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(Event, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let wrapped: AsyncFn = Arc::new(move |event, context| Box::pin(handler(event, context)));
        self.handlers
            .insert(event_type.into(), EventHandler::Async(wrapped));
    }

    /// Whether a handler is registered for this event type.
    #[must_use]
    pub fn has_type(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Fetch the handler for an event type. The clone is cheap (`Arc`),
    /// letting callers drop any registry lock before awaiting.
    #[must_use]
    pub fn handler(&self, event_type: &str) -> Option<EventHandler> {
        self.handlers.get(event_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use tether_proto::Value;

    use super::*;

    #[tokio::test]
    async fn sync_handler_receives_args_and_context() {
        let mut registry = UniversalEventHandler::new();
        registry.register("ATTACK", |event, context| {
            let position = event.kwargs.get("attack_position").and_then(Value::as_float);
            assert_eq!(position, Some(0.05));
            assert!(context.game_state.is_some());

            let mut changes = StateChanges::new();
            changes.insert("hp".into(), Value::Int(90));
            Ok(changes)
        });

        let event = Event::new("ATTACK").with_kwarg("attack_position", 0.05f64);
        let context = HandlerContext {
            game_state: Some(GameState::new()),
            client_address: None,
            dt: Some(0.02),
        };

        let handler = registry.handler("ATTACK").expect("registered");
        let changes = handler.call(&event, &context).await.expect("handler ok");
        assert_eq!(changes.get("hp"), Some(&Value::Int(90)));
    }

    #[tokio::test]
    async fn async_handler_is_awaited() {
        let mut registry = UniversalEventHandler::new();
        registry.register_async("SLOW", |event, _context| async move {
            tokio::task::yield_now().await;
            let mut changes = StateChanges::new();
            changes.insert("echo".into(), Value::Str(event.event_type));
            Ok(changes)
        });

        let handler = registry.handler("SLOW").expect("registered");
        let changes = handler
            .call(&Event::new("SLOW"), &HandlerContext::default())
            .await
            .expect("handler ok");
        assert_eq!(changes.get("echo"), Some(&Value::Str("SLOW".into())));
    }

    #[tokio::test]
    async fn reregistering_replaces() {
        let mut registry = UniversalEventHandler::new();
        registry.register("E", |_, _| {
            let mut changes = StateChanges::new();
            changes.insert("version".into(), Value::Int(1));
            Ok(changes)
        });
        registry.register("E", |_, _| {
            let mut changes = StateChanges::new();
            changes.insert("version".into(), Value::Int(2));
            Ok(changes)
        });

        let handler = registry.handler("E").unwrap();
        let changes = handler
            .call(&Event::new("E"), &HandlerContext::default())
            .await
            .unwrap();
        assert_eq!(changes.get("version"), Some(&Value::Int(2)));
    }

    #[test]
    fn unknown_type_has_no_handler() {
        let registry = UniversalEventHandler::new();
        assert!(registry.handler("NOPE").is_none());
        assert!(!registry.has_type("NOPE"));
    }

    #[tokio::test]
    async fn handler_errors_are_returned_not_panicked() {
        let mut registry = UniversalEventHandler::new();
        registry.register("FAILS", |_, _| Err("user code broke".into()));

        let handler = registry.handler("FAILS").unwrap();
        let result = handler
            .call(&Event::new("FAILS"), &HandlerContext::default())
            .await;
        assert!(result.is_err());
    }
}
