//! Route registry and message routing.
//!
//! A [`Route`] binds a matcher to a handler closure, with optional
//! idempotency and lock settings. Routes are registered on a [`Router`]
//! before the consumer starts; the table is read-only once messages flow.
//! Several routes may match one message; they run in registration order.

use crate::error::WorkerError;
use crate::event::Event;
use crate::lock::RouteLock;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

use crate::matchers::Matcher;

/// A handler closure invoked with the decoded view of a matching message.
pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), WorkerError>> + Send + Sync>;

/// Build a [`Handler`] from an async function or closure.
///
/// # Example
///
/// ```rust,ignore
/// let handler = handler_fn(|event: Event| async move {
///     info!(name = ?event.name(), "handling");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// A named (matcher, handler) binding.
pub struct Route {
    name: String,
    matcher: Matcher,
    handler: Handler,
    idempotent: bool,
    lock: Option<RouteLock>,
}

impl Route {
    /// Create a route. The name identifies the handler in logs, metrics,
    /// failed-message records, and recovery messages.
    pub fn new(name: impl Into<String>, matcher: Matcher, handler: Handler) -> Self {
        Self {
            name: name.into(),
            matcher,
            handler,
            idempotent: false,
            lock: None,
        }
    }

    /// Declare the handler safe to re-invoke with the same input, making it
    /// eligible for retry through recovery-message republish.
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Serialise this handler through the distributed lock service.
    pub fn with_lock(mut self, lock: RouteLock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn lock(&self) -> Option<&RouteLock> {
        self.lock.as_ref()
    }

    pub(crate) fn matches(&self, body: &str) -> bool {
        (self.matcher)(body)
    }

    pub(crate) fn invoke(&self, event: Event) -> BoxFuture<'static, Result<(), WorkerError>> {
        (self.handler)(event)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("idempotent", &self.idempotent)
            .field("lock", &self.lock)
            .finish()
    }
}

/// Insertion-ordered route table.
///
/// Conflicting routes are intentionally allowed so multiple handlers can be
/// invoked for a single message.
#[derive(Default)]
pub struct Router {
    routes: Vec<Arc<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route. Registration order is invocation order.
    pub fn register(&mut self, route: Route) {
        self.routes.push(Arc::new(route));
    }

    /// All routes whose matcher accepts `body`, in registration order.
    pub fn select(&self, body: &str) -> Vec<Arc<Route>> {
        self.routes
            .iter()
            .filter(|route| route.matches(body))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchers::{always, json_matcher};

    fn noop_handler() -> Handler {
        handler_fn(|_event| async { Ok(()) })
    }

    #[test]
    fn test_select_preserves_registration_order() {
        let mut router = Router::new();
        router.register(Route::new("first", always(), noop_handler()));
        router.register(Route::new("second", json_matcher("name", "ping"), noop_handler()));
        router.register(Route::new("third", always(), noop_handler()));

        let selected = router.select(r#"{"name":"ping"}"#);
        let names: Vec<&str> = selected.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);

        let selected = router.select(r#"{"name":"other"}"#);
        let names: Vec<&str> = selected.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["first", "third"]);
    }

    #[test]
    fn test_select_no_match() {
        let mut router = Router::new();
        router.register(Route::new("ping", json_matcher("name", "ping"), noop_handler()));

        assert!(router.select(r#"{"name":"other"}"#).is_empty());
        assert!(router.select("not json").is_empty());
    }

    #[test]
    fn test_route_flags() {
        let route = Route::new("r", always(), noop_handler()).idempotent();
        assert!(route.is_idempotent());
        assert!(route.lock().is_none());
    }

    #[tokio::test]
    async fn test_handler_fn_invocation() {
        let route = Route::new("r", always(), handler_fn(|event: Event| async move {
            if event.name() == Some("boom") {
                Err(WorkerError::handler("boom"))
            } else {
                Ok(())
            }
        }));

        assert!(route.invoke(Event::parse(r#"{"name":"ok"}"#)).await.is_ok());
        assert!(route.invoke(Event::parse(r#"{"name":"boom"}"#)).await.is_err());
    }
}
