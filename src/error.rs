//! Errors raised by endpoint handlers and their wire status mapping.

use crate::bot::BotError;
use crate::envelope::Response;
use thiserror::Error;

/// Failure returned by an endpoint handler.
///
/// Every variant maps to exactly one response status; none of them end the
/// session.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The payload has the wrong shape for this endpoint (400).
    #[error("bad arguments: {0}")]
    BadArguments(String),

    /// A referenced external identifier does not exist (404).
    ///
    /// The message is sent to the client as-is.
    #[error("{0}")]
    NotFound(String),

    /// The endpoint's upstream is down (503).
    #[error("service unavailable")]
    Unavailable,

    /// Anything unexpected (500). The detail is logged, never sent.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EndpointError {
    pub fn bad_arguments(reason: impl ToString) -> Self {
        EndpointError::BadArguments(reason.to_string())
    }

    /// Wire status code for this error.
    pub fn code(&self) -> u16 {
        match self {
            EndpointError::BadArguments(_) => 400,
            EndpointError::NotFound(_) => 404,
            EndpointError::Unavailable => 503,
            EndpointError::Internal(_) => 500,
        }
    }
}

impl From<&EndpointError> for Response {
    fn from(err: &EndpointError) -> Self {
        match err {
            EndpointError::BadArguments(_) => Response::bad_arguments(),
            EndpointError::NotFound(message) => Response::status(404, message.clone()),
            EndpointError::Unavailable => Response::unavailable(),
            EndpointError::Internal(_) => Response::internal_error(),
        }
    }
}

impl From<BotError> for EndpointError {
    fn from(err: BotError) -> Self {
        match err {
            BotError::NotFound(_) => EndpointError::NotFound(err.to_string()),
            BotError::Unavailable => EndpointError::Unavailable,
            BotError::Other(detail) => EndpointError::Internal(detail),
        }
    }
}
