//! Handler registration.
//!
//! Handlers are registered per HTTP method, plus at most one default that
//! catches every method without its own entry.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use hyper::Method;

use crate::error::Result;
use crate::http::request::Request;
use crate::http::response::Response;

/// A request handler.
///
/// Returning an error before any response bytes were sent turns it into a
/// response carrying [`Error::status`](crate::error::Error::status).
pub trait Handler: Send + Sync + 'static {
    fn call<'a>(&'a self, request: &'a Request, response: &'a mut Response<'_>)
        -> BoxFuture<'a, Result<()>>;
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn call<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response<'_>,
    ) -> BoxFuture<'a, Result<()>> {
        (**self).call(request, response)
    }
}

#[derive(Clone, Default)]
pub struct Handlers {
    by_method: HashMap<Method, Arc<dyn Handler>>,
    default: Option<Arc<dyn Handler>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`, replacing any previous one.
    pub fn insert(&mut self, method: Method, handler: impl Handler) {
        self.by_method.insert(method, Arc::new(handler));
    }

    /// Register the catch-all handler, replacing any previous one.
    pub fn set_default(&mut self, handler: impl Handler) {
        self.default = Some(Arc::new(handler));
    }

    /// Method-specific handler first, then the default.
    pub fn resolve(&self, method: &Method) -> Option<&Arc<dyn Handler>> {
        self.by_method.get(method).or(self.default.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.by_method.is_empty() && self.default.is_none()
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("methods", &self.by_method.keys().collect::<Vec<_>>())
            .field("default", &self.default.is_some())
            .finish()
    }
}
