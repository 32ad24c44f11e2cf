//! Connection authentication handshake.
//!
//! Every connection starts unauthenticated. The first request that is not
//! the exempt liveness check must carry `auth` equal to the shared secret.
//! A correct secret authenticates the connection for its lifetime and the
//! request is answered with a plain success instead of being dispatched. A
//! missing or wrong secret gets one 401 and the connection is closed.

use crate::envelope::Request;
use std::fmt;
use std::sync::Arc;

/// The one endpoint reachable without authenticating.
pub const EXEMPT_ENDPOINT: &str = "ping";

/// Shared secret clients authenticate with. Its `Debug` output is redacted.
#[derive(Clone)]
pub struct SharedSecret(Arc<str>);

impl SharedSecret {
    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        SharedSecret(secret.into())
    }

    /// Byte-for-byte comparison against a client token.
    pub fn matches(&self, candidate: &str) -> bool {
        self.0.as_bytes() == candidate.as_bytes()
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Per-connection authentication flag. Only ever goes from false to true.
#[derive(Debug, Default)]
pub struct AuthState {
    authenticated: bool,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}

/// What the session should do with a request after the gate has seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Pass the request to the dispatcher.
    Dispatch,
    /// The request was the handshake and succeeded; reply with success.
    Authenticated,
    /// The handshake failed; reply 401 and close.
    Rejected,
}

/// Checks requests on unauthenticated connections.
#[derive(Debug, Clone)]
pub struct AuthGate {
    secret: SharedSecret,
}

impl AuthGate {
    pub fn new(secret: SharedSecret) -> Self {
        AuthGate { secret }
    }

    pub fn admit(&self, state: &mut AuthState, request: &Request) -> Admission {
        if state.authenticated || request.endpoint == EXEMPT_ENDPOINT {
            return Admission::Dispatch;
        }

        match request.auth.as_deref() {
            Some(token) if self.secret.matches(token) => {
                state.authenticated = true;
                Admission::Authenticated
            }
            _ => Admission::Rejected,
        }
    }
}
