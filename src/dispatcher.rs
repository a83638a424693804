//! Name-indexed handler registry and argument adaptation.
//!
//! Handlers come in three classes: sync handlers return a value, async
//! handlers receive a [`Responder`] and reply whenever ready, and coroutine
//! handlers return a future that is spawned on a caller-chosen runtime
//! handle. Registration adapts each statically-typed signature to the
//! dynamically-typed params found on the wire; mismatches answer with the
//! `"Incompatible arguments"` call error instead of touching the session.
//!
//! One registry instance may be shared by any number of sessions and
//! servers. Lookups take a brief shared view and handler execution happens
//! outside the lock, so mutation never blocks an in-flight invocation.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ERROR_DURING_CALL, INCOMPATIBLE_ARGUMENTS, NO_RESULT};
use crate::message::{Id, Params};
use crate::session::Outgoing;

pub(crate) type HandlerFn = Arc<dyn Fn(Responder, Params) + Send + Sync>;

/// Shared, concurrency-safe registry mapping method names to handlers.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, HandlerFn>>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    /// Register a synchronous handler answering positional calls.
    /// Returns false if the name is already taken.
    pub fn add<A, H>(&self, name: &str, handler: H) -> bool
    where
        A: FromParams + Send + 'static,
        H: SyncHandler<A>,
    {
        self.register(name, wrap_sync(handler, None))
    }

    /// Register a synchronous handler that also answers named calls, with
    /// `names` giving the parameter name for each position.
    pub fn add_with_names<A, H>(
        &self,
        name: &str,
        names: &'static [&'static str],
        handler: H,
    ) -> bool
    where
        A: FromParams + Send + 'static,
        H: SyncHandler<A>,
    {
        debug_assert_eq!(names.len(), A::ARITY, "one parameter name per argument");
        self.register(name, wrap_sync(handler, Some(names)))
    }

    /// Register a handler that receives a [`Responder`] and replies
    /// whenever it is ready.
    pub fn add_async<A, H>(&self, name: &str, handler: H) -> bool
    where
        A: FromParams + Send + 'static,
        H: AsyncHandler<A>,
    {
        self.register(name, wrap_async(handler, None))
    }

    /// Named-call variant of [`add_async`](Dispatcher::add_async).
    pub fn add_async_with_names<A, H>(
        &self,
        name: &str,
        names: &'static [&'static str],
        handler: H,
    ) -> bool
    where
        A: FromParams + Send + 'static,
        H: AsyncHandler<A>,
    {
        debug_assert_eq!(names.len(), A::ARITY, "one parameter name per argument");
        self.register(name, wrap_async(handler, Some(names)))
    }

    /// Register a handler returning a future. The future is spawned on
    /// `handle` and its outcome forwarded to the caller; an `Err` return
    /// answers with the error's message.
    pub fn add_coro<A, H>(&self, name: &str, handle: &Handle, handler: H) -> bool
    where
        A: FromParams + Send + 'static,
        H: CoroHandler<A>,
    {
        self.register(name, wrap_coro(handler, handle.clone(), None))
    }

    /// Named-call variant of [`add_coro`](Dispatcher::add_coro).
    pub fn add_coro_with_names<A, H>(
        &self,
        name: &str,
        handle: &Handle,
        names: &'static [&'static str],
        handler: H,
    ) -> bool
    where
        A: FromParams + Send + 'static,
        H: CoroHandler<A>,
    {
        debug_assert_eq!(names.len(), A::ARITY, "one parameter name per argument");
        self.register(name, wrap_coro(handler, handle.clone(), Some(names)))
    }

    pub fn has(&self, name: &str) -> bool {
        self.read_lock().contains_key(name)
    }

    /// Unregister `name`. In-flight invocations are unaffected.
    pub fn remove(&self, name: &str) -> bool {
        self.write_lock().remove(name).is_some()
    }

    /// Drop every handler, returning how many were registered.
    pub fn clear(&self) -> usize {
        let mut handlers = self.write_lock();
        let count = handlers.len();
        handlers.clear();
        count
    }

    /// Names of all registered handlers.
    pub fn known(&self) -> Vec<String> {
        self.read_lock().keys().cloned().collect()
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<HandlerFn> {
        self.read_lock().get(name).cloned()
    }

    fn register(&self, name: &str, handler: HandlerFn) -> bool {
        match self.write_lock().entry(name.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handler);
                true
            }
        }
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, HandlerFn>> {
        self.handlers.read().expect("handler registry lock poisoned")
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, HandlerFn>> {
        self.handlers.write().expect("handler registry lock poisoned")
    }
}

fn wrap_sync<A, H>(handler: H, names: Option<&'static [&'static str]>) -> HandlerFn
where
    A: FromParams + Send + 'static,
    H: SyncHandler<A>,
{
    Arc::new(move |responder: Responder, params: Params| {
        let Some(args) = A::from_params(&params, names) else {
            debug!("incompatible arguments");
            responder.set_error(INCOMPATIBLE_ARGUMENTS);
            return;
        };
        match handler.call(args) {
            Ok(value) => {
                let mut responder = responder;
                responder.fulfill(Ok(value));
            }
            Err(err) => {
                debug!(error = %err, "failed to serialize call result");
                responder.set_error_empty();
            }
        }
    })
}

fn wrap_async<A, H>(handler: H, names: Option<&'static [&'static str]>) -> HandlerFn
where
    A: FromParams + Send + 'static,
    H: AsyncHandler<A>,
{
    Arc::new(move |responder: Responder, params: Params| {
        let Some(args) = A::from_params(&params, names) else {
            debug!("incompatible arguments");
            responder.set_error(INCOMPATIBLE_ARGUMENTS);
            return;
        };
        handler.call(responder, args);
    })
}

fn wrap_coro<A, H>(handler: H, handle: Handle, names: Option<&'static [&'static str]>) -> HandlerFn
where
    A: FromParams + Send + 'static,
    H: CoroHandler<A>,
{
    Arc::new(move |responder: Responder, params: Params| {
        let Some(args) = A::from_params(&params, names) else {
            debug!("incompatible arguments");
            responder.set_error(INCOMPATIBLE_ARGUMENTS);
            return;
        };
        let future = handler.call(args);
        handle.spawn(async move {
            let mut responder = responder;
            match future.await {
                Ok(value) => responder.fulfill(Ok(value)),
                Err(err) => responder.fulfill(Err(Value::String(err.to_string()))),
            }
        });
    })
}

/// Decodes wire params into a typed argument tuple.
///
/// Positional arrays must match the arity exactly. Named maps require the
/// registration to carry parameter names and must contain every one of
/// them; extra keys are ignored. Everything else is a mismatch.
pub trait FromParams: Sized {
    const ARITY: usize;

    fn from_params(params: &Params, names: Option<&[&str]>) -> Option<Self>;
}

macro_rules! impl_tuple_params {
    ($count:expr $(, $ty:ident => $idx:tt)*) => {
        impl<$($ty: DeserializeOwned,)*> FromParams for ($($ty,)*) {
            const ARITY: usize = $count;

            fn from_params(params: &Params, names: Option<&[&str]>) -> Option<Self> {
                match params {
                    Params::Positional(args) => {
                        if args.len() != $count {
                            return None;
                        }
                        Some(($(serde_json::from_value::<$ty>(args[$idx].clone()).ok()?,)*))
                    }
                    Params::Named(_args) => {
                        let _names = names?;
                        Some(($(serde_json::from_value::<$ty>(
                            _args.get(*_names.get($idx)?)?.clone(),
                        ).ok()?,)*))
                    }
                    Params::Other(_) => None,
                }
            }
        }
    };
}

impl_tuple_params!(0);
impl_tuple_params!(1, T0 => 0);
impl_tuple_params!(2, T0 => 0, T1 => 1);
impl_tuple_params!(3, T0 => 0, T1 => 1, T2 => 2);
impl_tuple_params!(4, T0 => 0, T1 => 1, T2 => 2, T3 => 3);
impl_tuple_params!(5, T0 => 0, T1 => 1, T2 => 2, T3 => 3, T4 => 4);
impl_tuple_params!(6, T0 => 0, T1 => 1, T2 => 2, T3 => 3, T4 => 4, T5 => 5);
impl_tuple_params!(7, T0 => 0, T1 => 1, T2 => 2, T3 => 3, T4 => 4, T5 => 5, T6 => 6);
impl_tuple_params!(8, T0 => 0, T1 => 1, T2 => 2, T3 => 3, T4 => 4, T5 => 5, T6 => 6, T7 => 7);

/// A handler invoked inline whose return value is the reply.
pub trait SyncHandler<A>: Send + Sync + 'static {
    fn call(&self, args: A) -> serde_json::Result<Value>;
}

/// A handler that receives a [`Responder`] and replies whenever ready.
pub trait AsyncHandler<A>: Send + Sync + 'static {
    fn call(&self, responder: Responder, args: A);
}

/// A handler returning a future whose outcome is the reply.
pub trait CoroHandler<A>: Send + Sync + 'static {
    fn call(&self, args: A) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
}

macro_rules! impl_handler_fns {
    ($($ty:ident => $arg:ident),*) => {
        impl<F, R, $($ty,)*> SyncHandler<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> R + Send + Sync + 'static,
            R: Serialize,
        {
            fn call(&self, ($($arg,)*): ($($ty,)*)) -> serde_json::Result<Value> {
                serde_json::to_value(self($($arg),*))
            }
        }

        impl<F, $($ty,)*> AsyncHandler<($($ty,)*)> for F
        where
            F: Fn(Responder, $($ty),*) + Send + Sync + 'static,
        {
            fn call(&self, responder: Responder, ($($arg,)*): ($($ty,)*)) {
                self(responder, $($arg),*)
            }
        }

        impl<F, Fut, R, $($ty,)*> CoroHandler<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
            R: Serialize,
        {
            fn call(&self, ($($arg,)*): ($($ty,)*)) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>> {
                let future = self($($arg),*);
                Box::pin(async move { Ok(serde_json::to_value(future.await?)?) })
            }
        }
    };
}

impl_handler_fns!();
impl_handler_fns!(T0 => a0);
impl_handler_fns!(T0 => a0, T1 => a1);
impl_handler_fns!(T0 => a0, T1 => a1, T2 => a2);
impl_handler_fns!(T0 => a0, T1 => a1, T2 => a2, T3 => a3);
impl_handler_fns!(T0 => a0, T1 => a1, T2 => a2, T3 => a3, T4 => a4);
impl_handler_fns!(T0 => a0, T1 => a1, T2 => a2, T3 => a3, T4 => a4, T5 => a5);
impl_handler_fns!(T0 => a0, T1 => a1, T2 => a2, T3 => a3, T4 => a4, T5 => a5, T6 => a6);
impl_handler_fns!(T0 => a0, T1 => a1, T2 => a2, T3 => a3, T4 => a4, T5 => a5, T6 => a6, T7 => a7);

/// One-shot completion handle for a server-side call.
///
/// Firing it queues the reply for the originating request; exactly one
/// reply can ever leave a handle. Dropping it unfired answers with
/// `"Call finished with no result"`. Handles built for notifications
/// discard every outcome.
pub struct Responder {
    reply: Option<ReplyTo>,
}

struct ReplyTo {
    out: mpsc::UnboundedSender<Outgoing>,
    id: Id,
}

impl Responder {
    pub(crate) fn for_request(out: mpsc::UnboundedSender<Outgoing>, id: Id) -> Responder {
        Responder {
            reply: Some(ReplyTo { out, id }),
        }
    }

    pub(crate) fn for_notification() -> Responder {
        Responder { reply: None }
    }

    /// Reply successfully with `value`.
    pub fn respond(mut self, value: impl Serialize) {
        match serde_json::to_value(value) {
            Ok(value) => self.fulfill(Ok(value)),
            Err(err) => {
                debug!(error = %err, "failed to serialize reply");
                self.fulfill(Err(Value::String(ERROR_DURING_CALL.to_string())));
            }
        }
    }

    /// Reply with an error payload.
    pub fn set_error(mut self, value: impl Serialize) {
        match serde_json::to_value(value) {
            Ok(value) => self.fulfill(Err(value)),
            Err(_) => self.fulfill(Err(Value::String(ERROR_DURING_CALL.to_string()))),
        }
    }

    /// Reply with an error and no payload; the caller sees
    /// `"Error during call"`.
    pub fn set_error_empty(mut self) {
        self.fulfill(Err(Value::Null));
    }

    pub(crate) fn fulfill(&mut self, result: Result<Value, Value>) {
        let Some(reply) = self.reply.take() else {
            return;
        };
        // An error with no payload carries the sentinel message instead, so
        // the frame stays distinguishable from a successful nil reply.
        let result = match result {
            Err(Value::Null) => Err(Value::String(ERROR_DURING_CALL.to_string())),
            other => other,
        };
        let _ = reply.out.send(Outgoing::Reply {
            id: reply.id,
            result,
        });
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.reply.is_some() {
            self.fulfill(Err(Value::String(NO_RESULT.to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn positional(args: Vec<Value>) -> Params {
        Params::Positional(args)
    }

    fn reply_channel() -> (
        mpsc::UnboundedSender<Outgoing>,
        mpsc::UnboundedReceiver<Outgoing>,
    ) {
        mpsc::unbounded_channel()
    }

    fn take_reply(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Result<Value, Value> {
        match rx.try_recv().expect("no reply queued") {
            Outgoing::Reply { result, .. } => result,
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn from_params_positional() {
        let params = positional(vec![json!(1), json!("x")]);
        let (a, b) = <(i64, String)>::from_params(&params, None).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, "x");
    }

    #[test]
    fn from_params_rejects_wrong_arity() {
        let params = positional(vec![json!(1)]);
        assert!(<(i64, i64)>::from_params(&params, None).is_none());
        assert!(<()>::from_params(&params, None).is_none());
    }

    #[test]
    fn from_params_rejects_incompatible_types() {
        let params = positional(vec![json!(1), json!("two")]);
        assert!(<(i64, i64)>::from_params(&params, None).is_none());
        // Booleans are never promoted to integers.
        assert!(<(i64,)>::from_params(&positional(vec![json!(true)]), None).is_none());
        // Out-of-range integers are a mismatch, not a truncation.
        assert!(<(u8,)>::from_params(&positional(vec![json!(300)]), None).is_none());
    }

    #[test]
    fn from_params_named_lookup() {
        let params = Params::from_wire(json!({"a": 1, "b": 2, "extra": 9}));
        let names = ["a", "b"];
        let (a, b) = <(i64, i64)>::from_params(&params, Some(&names)).unwrap();
        assert_eq!((a, b), (1, 2));

        // Missing key is a mismatch.
        let short = Params::from_wire(json!({"a": 1}));
        assert!(<(i64, i64)>::from_params(&short, Some(&names)).is_none());

        // A named call against a handler registered without names too.
        assert!(<(i64, i64)>::from_params(&params, None).is_none());
    }

    #[test]
    fn from_params_rejects_other_shapes() {
        let params = Params::from_wire(json!(42));
        assert!(<(i64,)>::from_params(&params, None).is_none());
    }

    #[test]
    fn registry_add_has_remove() {
        let dispatcher = Dispatcher::new();
        assert!(dispatcher.add("f1", || 1));
        assert!(!dispatcher.add("f1", || 2));
        assert!(dispatcher.has("f1"));
        assert!(dispatcher.add("f2", |a: i64| a));
        let mut known = dispatcher.known();
        known.sort();
        assert_eq!(known, vec!["f1", "f2"]);
        assert!(dispatcher.remove("f1"));
        assert!(!dispatcher.remove("f1"));
        assert!(!dispatcher.has("f1"));
        assert_eq!(dispatcher.clear(), 1);
        assert!(dispatcher.known().is_empty());
    }

    #[test]
    fn sync_handler_replies_with_return_value() {
        let dispatcher = Dispatcher::new();
        dispatcher.add("add", |a: i64, b: i64| a + b);

        let (tx, mut rx) = reply_channel();
        let handler = dispatcher.lookup("add").unwrap();
        let responder = Responder::for_request(tx, Id::Number(1));
        (*handler)(responder, positional(vec![json!(40), json!(2)]));

        assert_eq!(take_reply(&mut rx), Ok(json!(42)));
    }

    #[test]
    fn sync_handler_rejects_bad_arguments() {
        let dispatcher = Dispatcher::new();
        dispatcher.add("add", |a: i64, b: i64| a + b);

        let (tx, mut rx) = reply_channel();
        let handler = dispatcher.lookup("add").unwrap();
        let responder = Responder::for_request(tx, Id::Number(1));
        (*handler)(responder, positional(vec![json!(1), json!("two")]));

        assert_eq!(
            take_reply(&mut rx),
            Err(Value::String(INCOMPATIBLE_ARGUMENTS.to_string()))
        );
    }

    #[test]
    fn async_handler_controls_its_reply() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_async("echo", |responder: Responder, value: String| {
            responder.respond(value);
        });

        let (tx, mut rx) = reply_channel();
        let handler = dispatcher.lookup("echo").unwrap();
        let responder = Responder::for_request(tx, Id::Number(3));
        (*handler)(responder, positional(vec![json!("hi")]));

        assert_eq!(take_reply(&mut rx), Ok(json!("hi")));
    }

    #[tokio::test]
    async fn coro_handler_spawns_and_replies() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_coro("double", &Handle::current(), |n: u64| async move {
            anyhow::Ok(n * 2)
        });

        let (tx, mut rx) = reply_channel();
        let handler = dispatcher.lookup("double").unwrap();
        let responder = Responder::for_request(tx, Id::Number(4));
        (*handler)(responder, positional(vec![json!(21)]));

        match rx.recv().await.expect("reply") {
            Outgoing::Reply { result, .. } => assert_eq!(result, Ok(json!(42))),
            _ => panic!("expected a reply"),
        }
    }

    #[tokio::test]
    async fn coro_handler_error_becomes_payload() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_coro("fail", &Handle::current(), |exists: bool| async move {
            if exists {
                anyhow::bail!("nope")
            }
            anyhow::Ok(())
        });

        let (tx, mut rx) = reply_channel();
        let handler = dispatcher.lookup("fail").unwrap();
        let responder = Responder::for_request(tx, Id::Number(5));
        (*handler)(responder, positional(vec![json!(true)]));

        match rx.recv().await.expect("reply") {
            Outgoing::Reply { result, .. } => {
                assert_eq!(result, Err(Value::String("nope".to_string())));
            }
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn dropped_responder_reports_no_result() {
        let (tx, mut rx) = reply_channel();
        let responder = Responder::for_request(tx, Id::Number(8));
        drop(responder);
        assert_eq!(
            take_reply(&mut rx),
            Err(Value::String(NO_RESULT.to_string()))
        );
    }

    #[test]
    fn empty_error_carries_the_sentinel_message() {
        let (tx, mut rx) = reply_channel();
        let responder = Responder::for_request(tx, Id::Number(9));
        responder.set_error_empty();
        assert_eq!(
            take_reply(&mut rx),
            Err(Value::String(ERROR_DURING_CALL.to_string()))
        );
    }

    #[test]
    fn notification_responder_discards_outcomes() {
        let responder = Responder::for_notification();
        responder.respond("ignored");
        let responder = Responder::for_notification();
        drop(responder);
    }
}
