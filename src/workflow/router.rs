//! Message Router - type-indexed dispatch without runtime reflection
//!
//! A router is a table from a message's exact type key to a plain function
//! pointer. Each entry is monomorphised from the owner's [`Handler`] impl for
//! that message type when it is registered, so dispatch is a map lookup plus
//! a deserialize; nothing is discovered at run time.

use std::{collections::HashMap, future::Future, marker::PhantomData, pin::Pin};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::domain::{
    error::WorkflowError,
    message::{Envelope, type_key}
};

/// Future returned by a routed handler
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Envelope, WorkflowError>> + Send + 'a>>;

type RouteFn<S, C> = for<'a> fn(&'a mut S, Envelope, &'a mut C) -> HandlerFuture<'a>;

/// Handles messages of type `M` with a context of type `C`
///
/// Synchronous handlers simply never await; a `()` reply serializes to `null`.
#[async_trait]
pub trait Handler<M, C>: Send
where
    M: Send + 'static,
    C: Send
{
    type Reply: Serialize + Send + 'static;

    async fn handle(&mut self, message: M, context: &mut C) -> Result<Self::Reply, WorkflowError>;
}

fn invoke<'a, S, C, M>(owner: &'a mut S, envelope: Envelope, context: &'a mut C) -> HandlerFuture<'a>
where
    S: Handler<M, C>,
    M: DeserializeOwned + Send + 'static,
    C: Send
{
    Box::pin(async move {
        let message = envelope.open::<M>()?;
        let reply = owner.handle(message, context).await?;
        Envelope::wrap(&reply)
    })
}

/// Dispatch table for one owner type `S`
pub struct MessageRouter<S, C> {
    routes:  HashMap<&'static str, RouteFn<S, C>>,
    _marker: PhantomData<fn(&mut S, &mut C)>
}

impl<S, C> Default for MessageRouter<S, C> {
    fn default() -> Self {
        Self { routes: HashMap::new(), _marker: PhantomData }
    }
}

impl<S, C> MessageRouter<S, C>
where
    S: Send,
    C: Send
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages of exactly type `M` to `S`'s handler
    ///
    /// A second registration for the same type is a configuration error.
    pub fn register<M>(&mut self) -> Result<&mut Self, WorkflowError>
    where
        S: Handler<M, C>,
        M: DeserializeOwned + Send + 'static
    {
        let key = type_key::<M>();
        if self.routes.contains_key(key) {
            return Err(WorkflowError::Configuration(format!("a handler for {} is already registered", key)));
        }
        self.routes.insert(key, invoke::<S, C, M> as RouteFn<S, C>);
        Ok(self)
    }

    pub fn can_handle(&self, type_name: &str) -> bool {
        self.routes.contains_key(type_name)
    }

    pub fn accepts<M: 'static>(&self) -> bool {
        self.can_handle(type_key::<M>())
    }

    /// Registered type keys, sorted for stable output
    pub fn accepted_types(&self) -> Vec<&'static str> {
        let mut types = self.routes.keys().copied().collect::<Vec<_>>();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Deliver `envelope` to the handler registered for its exact type
    pub async fn dispatch(&self, owner: &mut S, envelope: Envelope, context: &mut C) -> Result<Envelope, WorkflowError> {
        let route = self
            .routes
            .get(envelope.type_name.as_str())
            .ok_or_else(|| WorkflowError::Dispatch(format!("unhandled message type {}", envelope.type_name)))?;
        route(owner, envelope, context).await
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Add(i64);

    #[derive(Debug, Serialize, Deserialize)]
    struct Reset;

    #[derive(Debug, Serialize, Deserialize)]
    struct Unknown;

    #[derive(Default)]
    struct Counter {
        total: i64
    }

    #[derive(Default)]
    struct Trace {
        calls: Vec<&'static str>
    }

    #[async_trait]
    impl Handler<Add, Trace> for Counter {
        type Reply = i64;

        async fn handle(&mut self, message: Add, context: &mut Trace) -> Result<i64, WorkflowError> {
            // Suspends before completing, exercising the async form
            tokio::task::yield_now().await;
            self.total += message.0;
            context.calls.push("add");
            Ok(self.total)
        }
    }

    #[async_trait]
    impl Handler<Reset, Trace> for Counter {
        type Reply = ();

        async fn handle(&mut self, _message: Reset, context: &mut Trace) -> Result<(), WorkflowError> {
            self.total = 0;
            context.calls.push("reset");
            Ok(())
        }
    }

    fn router() -> MessageRouter<Counter, Trace> {
        let mut router = MessageRouter::new();
        router.register::<Add>().unwrap().register::<Reset>().unwrap();
        router
    }

    #[tokio::test]
    async fn test_dispatch_by_exact_type() {
        let router = router();
        let mut counter = Counter::default();
        let mut trace = Trace::default();

        let reply = router.dispatch(&mut counter, Envelope::wrap(&Add(5)).unwrap(), &mut trace).await.unwrap();
        assert_eq!(reply.open::<i64>().unwrap(), 5);

        let reply = router.dispatch(&mut counter, Envelope::wrap(&Reset).unwrap(), &mut trace).await.unwrap();
        assert_eq!(reply, Envelope::unit());
        assert_eq!(counter.total, 0);
        assert_eq!(trace.calls, vec!["add", "reset"]);
    }

    #[tokio::test]
    async fn test_unregistered_type_is_a_dispatch_error() {
        let router = router();
        let mut counter = Counter::default();
        let mut trace = Trace::default();

        let result = router.dispatch(&mut counter, Envelope::wrap(&Unknown).unwrap(), &mut trace).await;
        assert!(matches!(result, Err(WorkflowError::Dispatch(_))));
        assert!(trace.calls.is_empty());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut router = router();
        assert!(matches!(router.register::<Add>(), Err(WorkflowError::Configuration(_))));
    }

    #[test]
    fn test_can_handle() {
        let router = router();
        assert!(router.accepts::<Add>());
        assert!(router.can_handle(type_key::<Reset>()));
        assert!(!router.accepts::<Unknown>());
        assert_eq!(router.accepted_types().len(), 2);
    }
}
