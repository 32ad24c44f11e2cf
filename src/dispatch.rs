//! Request dispatch: resolve, invoke, and normalize the outcome.
//!
//! Nothing a handler does, including panicking, escapes this module as
//! anything other than a [`Response`].

use crate::envelope::{Request, Response};
use crate::error::EndpointError;
use crate::registry::Registry;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Turns decoded requests into responses using a shared registry.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Dispatcher { registry }
    }

    /// Decode a frame, mapping any failure to a 400 response.
    pub fn decode(frame: &[u8]) -> Result<Request, Response> {
        Request::decode(frame).map_err(|e| {
            debug!(error = %e, "Malformed request");
            Response::bad_request()
        })
    }

    /// Run the handler registered for `request.endpoint`.
    pub async fn dispatch(&self, request: Request) -> Response {
        let Request { endpoint, data, .. } = request;

        let Some(handler) = self.registry.lookup(&endpoint) else {
            debug!(endpoint = %endpoint, "Endpoint not found");
            return Response::endpoint_not_found();
        };

        trace!(endpoint = %endpoint, has_data = data.is_some(), "Invoking endpoint");
        let outcome = AssertUnwindSafe(handler.invoke(data)).catch_unwind().await;

        match outcome {
            Ok(Ok(None)) => Response::success(),
            Ok(Ok(Some(value))) => Response::success_with(value),
            Ok(Err(err)) => {
                match &err {
                    EndpointError::Internal(detail) => {
                        error!(endpoint = %endpoint, error = %detail, "Endpoint failed")
                    }
                    EndpointError::BadArguments(reason) => {
                        debug!(endpoint = %endpoint, reason = %reason, "Bad arguments")
                    }
                    other => warn!(
                        endpoint = %endpoint,
                        code = other.code(),
                        error = %other,
                        "Endpoint returned an error"
                    ),
                }
                Response::from(&err)
            }
            Err(panic) => {
                error!(endpoint = %endpoint, panic = %panic_message(&*panic), "Endpoint panicked");
                Response::internal_error()
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
