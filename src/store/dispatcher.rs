//! Action store: handlers, middleware chain, and serialized state.
//!
//! # Dispatch
//!
//! 1. Reject the action if its type is already being dispatched by the
//!    current task (reentrancy).
//! 2. Wait for any other in-flight dispatch of the same type to finish.
//! 3. Run the middleware chain; its terminal step runs every handler
//!    registered for the type, in registration order, under the state lock.
//! 4. If the state changed, emit `<type>` with the new state and
//!    `state-changed { type, state }`.
//!
//! A failing handler stops the handler phase. Writes from handlers that ran
//! before it are kept.
//!
//! Any failure is also announced as `error { type, message }` on the bus.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error, trace, warn};

use crate::error::{BoxError, Error, Result};
use crate::events::{EventBus, names};

use super::action::Action;
use super::middleware::{ChainRun, FnMiddleware, Middleware, MiddlewareContext, Next};

// ============================================================================
// Types
// ============================================================================

/// Requirements on the value a store holds.
pub trait StoreState: Clone + PartialEq + Serialize + Send + Sync + 'static {}

impl<T> StoreState for T where T: Clone + PartialEq + Serialize + Send + Sync + 'static {}

/// State-updating handler. Returns `Ok(None)` to leave the state unchanged.
pub type Handler<S> =
    Arc<dyn Fn(&S, Option<&Value>) -> std::result::Result<Option<S>, BoxError> + Send + Sync>;

tokio::task_local! {
    /// Action types being dispatched by the current task.
    static IN_FLIGHT: FxHashSet<String>;
}

// ============================================================================
// Store
// ============================================================================

/// Middleware-chained action store.
///
/// Cloning is cheap and shares the same store.
pub struct Store<S: StoreState> {
    inner: Arc<StoreInner<S>>,
}

struct StoreInner<S: StoreState> {
    /// Current state. Replaced, never mutated in place.
    state: Mutex<Arc<S>>,
    /// Handlers by action type.
    handlers: RwLock<FxHashMap<String, Vec<Handler<S>>>>,
    /// Middleware in registration order.
    middleware: RwLock<Vec<Arc<dyn Middleware<S>>>>,
    /// One lock per action type, held for the whole dispatch.
    gates: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Where changes are announced.
    bus: Arc<EventBus>,
}

impl<S: StoreState> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: StoreState> fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("actions", &self.inner.handlers.read().len())
            .field("middleware", &self.inner.middleware.read().len())
            .finish_non_exhaustive()
    }
}

impl<S: StoreState> Store<S> {
    /// Creates a store announcing changes on `bus`.
    #[must_use]
    pub fn new(initial: S, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(Arc::new(initial)),
                handlers: RwLock::new(FxHashMap::default()),
                middleware: RwLock::new(Vec::new()),
                gates: Mutex::new(FxHashMap::default()),
                bus,
            }),
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Registers a handler for `kind`. Handlers for one type run in
    /// registration order.
    pub fn define_action<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(&S, Option<&Value>) -> std::result::Result<Option<S>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        let kind = kind.into();
        trace!(action = %kind, "Handler registered");
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Registers several prepared handlers.
    pub fn define_actions<I, K>(&self, handlers: I)
    where
        I: IntoIterator<Item = (K, Handler<S>)>,
        K: Into<String>,
    {
        let mut table = self.inner.handlers.write();
        for (kind, handler) in handlers {
            table.entry(kind.into()).or_default().push(handler);
        }
    }

    /// Appends a middleware to the chain.
    pub fn use_middleware<M>(&self, middleware: M)
    where
        M: Middleware<S>,
    {
        self.inner.middleware.write().push(Arc::new(middleware));
    }

    /// Appends an async closure to the chain.
    pub fn use_fn<F, Fut>(&self, f: F)
    where
        F: Fn(MiddlewareContext<S>, Next<S>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.use_middleware(FnMiddleware::new(f));
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns a copy of the current state.
    #[must_use]
    pub fn state(&self) -> S {
        S::clone(&self.snapshot())
    }

    /// Returns the current state without copying it.
    #[must_use]
    pub fn snapshot(&self) -> Arc<S> {
        Arc::clone(&*self.inner.state.lock())
    }

    /// The bus changes are announced on.
    #[inline]
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: &str) -> usize {
        self.inner.handlers.read().get(kind).map_or(0, Vec::len)
    }

    /// Number of middleware in the chain.
    #[must_use]
    pub fn middleware_count(&self) -> usize {
        self.inner.middleware.read().len()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Dispatches an action through the middleware chain and its handlers.
    ///
    /// Resolves once the whole chain has settled.
    ///
    /// # Errors
    ///
    /// - [`Error::InvariantViolation`] if a middleware called `next` twice or
    ///   the action type is already being dispatched by this task
    /// - [`Error::Handler`] if a handler failed
    /// - whatever a middleware returned when aborting
    pub async fn dispatch(&self, kind: impl Into<String>, payload: Option<Value>) -> Result<()> {
        let action = Action::new(kind, payload);
        let mut in_flight = IN_FLIGHT.try_with(Clone::clone).unwrap_or_default();

        if in_flight.contains(action.kind()) {
            let err = Error::invariant_violation(format!(
                "`{}` dispatched from inside its own pipeline",
                action.kind()
            ));
            error!(action = %action, "Reentrant dispatch");
            self.report_failure(&action, &err);
            return Err(err);
        }
        in_flight.insert(action.kind().to_owned());

        let gate = self.gate(action.kind());
        let result = {
            let _serialized = gate.lock().await;
            IN_FLIGHT.scope(in_flight, self.run_chain(action.clone())).await
        };
        self.release_gate(action.kind(), gate);

        if let Err(ref err) = result {
            self.report_failure(&action, err);
        }
        result
    }

    async fn run_chain(&self, action: Action) -> Result<()> {
        let chain = self.inner.middleware.read().clone();
        trace!(action = %action, middleware = chain.len(), "Dispatching");

        let ctx = MiddlewareContext::new(action, self.snapshot(), self.clone());
        let run = ChainRun::new(chain, ctx);
        let outcome = Arc::clone(&run).step(0).await;

        match run.take_violation() {
            Some(violation) => Err(violation),
            None => outcome,
        }
    }

    /// Handler phase: the chain's terminal step.
    pub(crate) fn apply(&self, action: &Action) -> Result<()> {
        let handlers = self
            .inner
            .handlers
            .read()
            .get(action.kind())
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            trace!(action = %action, "No handlers registered");
            return Ok(());
        }

        let (changed, failure) = {
            let mut state = self.inner.state.lock();
            let before = Arc::clone(&*state);
            let mut failure = None;

            for handler in &handlers {
                match handler(&**state, action.payload()) {
                    Ok(Some(next)) => *state = Arc::new(next),
                    Ok(None) => {}
                    Err(e) => {
                        failure = Some(Error::handler(action.kind(), e.to_string()));
                        break;
                    }
                }
            }

            let changed = !Arc::ptr_eq(&*state, &before) && **state != *before;
            (changed.then(|| Arc::clone(&*state)), failure)
        };

        if let Some(state) = changed {
            self.announce(action.kind(), &state);
        }

        match failure {
            Some(err) => {
                warn!(action = %action, error = %err, "Handler failed, earlier writes kept");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn announce(&self, kind: &str, state: &S) {
        let state = match serde_json::to_value(state) {
            Ok(value) => value,
            Err(e) => {
                warn!(action = %kind, error = %e, "Failed to serialize store state");
                Value::Null
            }
        };

        debug!(action = %kind, "Store state changed");
        self.inner.bus.emit(kind, &state);
        self.inner.bus.emit(
            names::STORE_STATE_CHANGED,
            &json!({ "type": kind, "state": state }),
        );
    }

    fn report_failure(&self, action: &Action, err: &Error) {
        self.inner.bus.emit(
            names::ERROR,
            &json!({ "type": action.kind(), "message": err.to_string() }),
        );
    }

    fn gate(&self, kind: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.inner.gates.lock();
        Arc::clone(gates.entry(kind.to_owned()).or_default())
    }

    /// Drops the gate for `kind` once no dispatch holds or awaits it.
    fn release_gate(&self, kind: &str, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut gates = self.inner.gates.lock();
        drop(gate);
        if gates
            .get(kind)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(kind);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;
    use tokio_test::assert_ok;

    type Log = Arc<Mutex<Vec<String>>>;

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn counter() -> Store<i64> {
        let store = Store::new(0_i64, Arc::new(EventBus::new()));
        store.define_action("inc", |s: &i64, _| Ok(Some(s + 1)));
        store
    }

    fn tracer(log: &Log, name: &'static str) -> impl Middleware<i64> {
        let log = Arc::clone(log);
        FnMiddleware::new(move |_ctx: MiddlewareContext<i64>, next: Next<i64>| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{name}:before"));
                let result = next.run().await;
                log.lock().push(format!("{name}:after"));
                result
            }
        })
    }

    #[tokio::test]
    async fn test_handlers_run_in_order() {
        let store = Store::new(Vec::<u8>::new(), Arc::new(EventBus::new()));
        store.define_action("push", |s: &Vec<u8>, _| {
            let mut next = s.clone();
            next.push(1);
            Ok(Some(next))
        });
        store.define_action("push", |s: &Vec<u8>, _| {
            let mut next = s.clone();
            next.push(2);
            Ok(Some(next))
        });

        assert_ok!(store.dispatch("push", None).await);
        assert_eq!(store.state(), vec![1, 2]);
        assert_eq!(store.handler_count("push"), 2);
    }

    #[tokio::test]
    async fn test_payload_reaches_handler() {
        let store = Store::new(String::new(), Arc::new(EventBus::new()));
        store.define_action("set", |_: &String, payload| {
            Ok(payload.and_then(Value::as_str).map(str::to_owned))
        });

        store.dispatch("set", Some(json!("hello"))).await.unwrap();
        assert_eq!(store.state(), "hello");
    }

    #[tokio::test]
    async fn test_onion_order() {
        let store = counter();
        let log = log();
        store.use_middleware(tracer(&log, "a"));
        store.use_middleware(tracer(&log, "b"));
        {
            let log = Arc::clone(&log);
            store.define_action("inc", move |_, _| {
                log.lock().push("handler".into());
                Ok(None)
            });
        }

        store.dispatch("inc", None).await.unwrap();
        assert_eq!(
            *log.lock(),
            vec!["a:before", "b:before", "handler", "b:after", "a:after"]
        );
        assert_eq!(store.state(), 1);
    }

    #[tokio::test]
    async fn test_state_changed_only_when_different() {
        let bus = Arc::new(EventBus::new());
        let store = Store::new(0_i64, Arc::clone(&bus));
        store.define_action("same", |s: &i64, _| Ok(Some(*s)));
        store.define_action("noop", |_: &i64, _| Ok(None));
        store.define_action("inc", |s: &i64, _| Ok(Some(s + 1)));

        let seen = log();
        {
            let seen = Arc::clone(&seen);
            bus.on(names::STORE_STATE_CHANGED, move |payload: &Value| {
                seen.lock().push(payload.to_string());
            });
        }
        let named = log();
        {
            let named = Arc::clone(&named);
            bus.on("inc", move |payload: &Value| {
                named.lock().push(payload.to_string());
            });
        }

        store.dispatch("same", None).await.unwrap();
        store.dispatch("noop", None).await.unwrap();
        assert!(seen.lock().is_empty());

        store.dispatch("inc", None).await.unwrap();
        assert_eq!(*seen.lock(), vec![r#"{"state":1,"type":"inc"}"#]);
        assert_eq!(*named.lock(), vec!["1"]);
    }

    #[tokio::test]
    async fn test_unknown_action_is_noop() {
        let store = counter();
        assert_ok!(store.dispatch("nothing", None).await);
        assert_eq!(store.state(), 0);
    }

    #[tokio::test]
    async fn test_handler_failure_keeps_earlier_writes() {
        let bus = Arc::new(EventBus::new());
        let store = Store::new(0_i64, Arc::clone(&bus));
        store.define_action("x", |_: &i64, _| Ok(Some(42)));
        store.define_action("x", |_: &i64, _| Err("second handler broke".into()));
        store.define_action("x", |_: &i64, _| Ok(Some(-1)));

        let errors = log();
        {
            let errors = Arc::clone(&errors);
            bus.on(names::ERROR, move |payload: &Value| {
                errors.lock().push(payload["type"].as_str().unwrap_or_default().to_owned());
            });
        }

        let err = store.dispatch("x", None).await.unwrap_err();
        assert!(matches!(err, Error::Handler { ref action, .. } if action == "x"));
        assert_eq!(store.state(), 42);
        assert_eq!(*errors.lock(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_middleware_abort_skips_handlers() {
        let store = counter();
        let log = log();
        store.use_fn(|_ctx, _next| async { Err(Error::middleware("denied")) });
        store.use_middleware(tracer(&log, "downstream"));

        let err = store.dispatch("inc", None).await.unwrap_err();
        assert!(matches!(err, Error::Middleware { .. }));
        assert!(log.lock().is_empty());
        assert_eq!(store.state(), 0);
    }

    #[tokio::test]
    async fn test_next_twice_is_invariant_violation() {
        let store = counter();
        store.use_fn(|_ctx, next| async move {
            next.run().await?;
            next.run().await
        });

        let err = store.dispatch("inc", None).await.unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(store.state(), 1);
    }

    #[tokio::test]
    async fn test_next_twice_fails_even_if_ignored() {
        let store = counter();
        store.use_fn(|_ctx, next| async move {
            next.run().await?;
            let _ = next.run().await;
            Ok::<(), Error>(())
        });

        let err = store.dispatch("inc", None).await.unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[tokio::test]
    async fn test_reentrant_dispatch_is_rejected() {
        let store = counter();
        store.use_fn(|ctx: MiddlewareContext<i64>, next| async move {
            if ctx.action().kind() == "inc" {
                let nested = ctx.dispatch("inc", None).await;
                assert!(nested.unwrap_err().is_invariant_violation());
            }
            next.run().await
        });

        assert_ok!(store.dispatch("inc", None).await);
        assert_eq!(store.state(), 1);
    }

    #[tokio::test]
    async fn test_nested_dispatch_of_other_type() {
        let store = counter();
        store.define_action("double", |s: &i64, _| Ok(Some(s * 2)));
        store.use_fn(|ctx: MiddlewareContext<i64>, next| async move {
            next.run().await?;
            if ctx.action().kind() == "inc" {
                ctx.dispatch("double", None).await?;
            }
            Ok::<(), Error>(())
        });

        store.dispatch("inc", None).await.unwrap();
        store.dispatch("inc", None).await.unwrap();
        assert_eq!(store.state(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_middleware_settles_before_dispatch_returns() {
        let store = counter();
        store.use_fn(|_ctx, next| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            next.run().await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<(), Error>(())
        });

        store.dispatch("inc", None).await.unwrap();
        assert_eq!(store.state(), 1);
    }

    #[tokio::test]
    async fn test_context_sees_snapshot() {
        let store = counter();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            store.use_fn(move |ctx: MiddlewareContext<i64>, next| {
                let seen = Arc::clone(&seen);
                async move {
                    next.run().await?;
                    seen.lock().push(*ctx.state());
                    Ok::<(), Error>(())
                }
            });
        }

        store.dispatch("inc", None).await.unwrap();
        store.dispatch("inc", None).await.unwrap();
        assert_eq!(*seen.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_concurrent_dispatches_serialize_writes() {
        let store = counter();
        store.use_fn(|_ctx, next| async move {
            tokio::task::yield_now().await;
            next.run().await
        });

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.dispatch("inc", None).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(store.state(), 50);
        assert!(store.inner.gates.lock().is_empty());
    }

    #[tokio::test]
    async fn test_gates_are_released_after_dispatch() {
        let store = counter();
        for n in 0..100 {
            store.dispatch(format!("kind-{n}"), None).await.unwrap();
        }
        store.dispatch("inc", None).await.unwrap();

        assert!(store.inner.gates.lock().is_empty());
        assert_eq!(store.state(), 1);
    }

    #[tokio::test]
    async fn test_define_actions_batch() {
        let store = Store::new(0_i64, Arc::new(EventBus::new()));
        let add: Handler<i64> = Arc::new(|s: &i64, p: Option<&Value>| {
            Ok::<_, BoxError>(Some(s + p.and_then(Value::as_i64).unwrap_or(0)))
        });
        let reset: Handler<i64> = Arc::new(|_: &i64, _: Option<&Value>| Ok::<_, BoxError>(Some(0)));
        store.define_actions([("add", add), ("reset", reset)]);

        store.dispatch("add", Some(json!(5))).await.unwrap();
        assert_eq!(store.state(), 5);
        store.dispatch("reset", None).await.unwrap();
        assert_eq!(store.state(), 0);
    }
}
