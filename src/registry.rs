//! Endpoint registry.
//!
//! Built once during startup and shared read-only by every session.

use crate::error::EndpointError;
use futures::future::{self, BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// What a handler produces: an optional payload for the response, or an
/// error to map onto a status.
pub type HandlerResult = Result<Option<Value>, EndpointError>;

type NullaryFn = dyn Fn() -> BoxFuture<'static, HandlerResult> + Send + Sync;
type UnaryFn = dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// A registered endpoint implementation.
#[derive(Clone)]
pub enum Handler {
    /// Takes no payload.
    Nullary(Arc<NullaryFn>),
    /// Takes the request's `data` value.
    Unary(Arc<UnaryFn>),
}

impl Handler {
    pub fn nullary<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::Nullary(Arc::new(move || f().boxed()))
    }

    pub fn unary<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::Unary(Arc::new(move |data| f(data).boxed()))
    }

    /// Call the handler with `data` if the request carried one.
    ///
    /// A payload sent to a nullary handler, or a missing payload for a unary
    /// one, resolves to [`EndpointError::BadArguments`].
    pub fn invoke(&self, data: Option<Value>) -> BoxFuture<'static, HandlerResult> {
        match (self, data) {
            (Handler::Nullary(f), None) => f(),
            (Handler::Unary(f), Some(data)) => f(data),
            (Handler::Nullary(_), Some(_)) => {
                future::ready(Err(EndpointError::bad_arguments("endpoint takes no data"))).boxed()
            }
            (Handler::Unary(_), None) => {
                future::ready(Err(EndpointError::bad_arguments("endpoint requires data"))).boxed()
            }
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Nullary(_) => f.write_str("Handler::Nullary"),
            Handler::Unary(_) => f.write_str("Handler::Unary"),
        }
    }
}

/// Startup-time registration failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("endpoint '{0}' is registered twice")]
    DuplicateEndpoint(String),
}

/// Maps endpoint names to handlers.
#[derive(Debug, Default)]
pub struct Registry {
    handlers: HashMap<String, Handler>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `key`. Registering a key twice is an error.
    pub fn register(&mut self, key: impl Into<String>, handler: Handler) -> Result<(), RegistryError> {
        match self.handlers.entry(key.into()) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateEndpoint(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(handler);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, key: &str) -> Option<&Handler> {
        self.handlers.get(key)
    }

    /// Registered endpoint names, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}
