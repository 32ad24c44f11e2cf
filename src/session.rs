//! Per-connection session loop.
//!
//! A session reads one frame, answers it, and only then reads the next, so
//! responses always come back in request order.

use crate::auth::{Admission, AuthGate, AuthState};
use crate::connection::{SessionGuard, SessionTable};
use crate::dispatch::Dispatcher;
use crate::envelope::Response;
use crate::frame::{FrameError, FrameReader, FrameWriter, Framing};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// State shared by every session of one server.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub dispatcher: Dispatcher,
    pub gate: AuthGate,
    pub framing: Framing,
    pub sessions: SessionTable,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the connection between requests.
    Closed,
    /// Reading or writing failed.
    Transport,
    /// The peer sent an oversized frame.
    FrameTooLarge,
    /// The handshake failed.
    Unauthorized,
    /// The server is shutting down.
    Shutdown,
}

enum Reply {
    Continue(Response),
    Close(Response),
}

/// One client connection.
pub struct Session<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    auth: AuthState,
    slot: SessionGuard,
    context: SessionContext,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, peer: SocketAddr, context: SessionContext) -> Self {
        Session {
            reader: FrameReader::new(reader, context.framing),
            writer: FrameWriter::new(writer, context.framing.mode),
            auth: AuthState::default(),
            slot: context.sessions.register(peer),
            context,
        }
    }

    /// Serve requests until the peer goes away, a fatal error occurs, or
    /// `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) -> SessionEnd {
        let end = self.serve(&shutdown).await;

        if let Err(e) = self.writer.close().await {
            debug!(error = %e, "Error closing connection");
        }
        if let Some(info) = self.slot.info() {
            let duration = chrono::Utc::now() - info.connected_at;
            debug!(
                session = self.slot.id(),
                reason = ?end,
                authenticated = self.auth.is_authenticated(),
                duration_ms = duration.num_milliseconds(),
                "Session ended"
            );
        }
        end
    }

    async fn serve(&mut self, shutdown: &CancellationToken) -> SessionEnd {
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                frame = self.reader.next_frame() => frame,
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    trace!("Connection closed by client");
                    return SessionEnd::Closed;
                }
                Err(FrameError::Io(e)) => {
                    debug!(error = %e, "Connection error");
                    return SessionEnd::Transport;
                }
                Err(FrameError::TooLarge { limit }) => {
                    warn!(limit, "Request frame too large");
                    // The connection is closed either way.
                    let _ = self.writer.send(&Response::too_large().encode()).await;
                    return SessionEnd::FrameTooLarge;
                }
            };

            let reply = tokio::select! {
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                reply = self.handle_frame(&frame) => reply,
            };

            let (response, close) = match reply {
                Reply::Continue(response) => (response, false),
                Reply::Close(response) => (response, true),
            };
            if let Err(e) = self.writer.send(&response.encode()).await {
                debug!(error = %e, "Failed to write response");
                return SessionEnd::Transport;
            }
            if close {
                return SessionEnd::Unauthorized;
            }
        }
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> Reply {
        let request = match Dispatcher::decode(frame) {
            Ok(request) => request,
            Err(response) => return Reply::Continue(response),
        };

        match self.context.gate.admit(&mut self.auth, &request) {
            Admission::Dispatch => {
                Reply::Continue(self.context.dispatcher.dispatch(request).await)
            }
            Admission::Authenticated => {
                self.slot.mark_authenticated();
                info!(
                    authenticated_sessions = self.context.sessions.authenticated_count(),
                    "Client authenticated"
                );
                Reply::Continue(Response::success())
            }
            Admission::Rejected => {
                warn!(endpoint = %request.endpoint, "Authentication failed");
                Reply::Close(Response::unauthorized())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SharedSecret;
    use crate::config::FramingMode;
    use crate::registry::{Handler, Registry};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    const SECRET: &str = "s3cret";

    fn context() -> SessionContext {
        let mut registry = Registry::new();
        registry
            .register("ping", Handler::nullary(|| async { Ok(None) }))
            .unwrap();
        registry
            .register(
                "sleep",
                Handler::unary(|data| async move {
                    let millis = data.as_u64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(Some(data))
                }),
            )
            .unwrap();
        registry
            .register(
                "fail",
                Handler::nullary(|| async {
                    Err(crate::error::EndpointError::Internal("boom".to_string()))
                }),
            )
            .unwrap();

        SessionContext {
            dispatcher: Dispatcher::new(Arc::new(registry)),
            gate: AuthGate::new(SharedSecret::new(SECRET)),
            framing: Framing {
                mode: FramingMode::ShortRead,
                chunk_size: 1024,
                max_frame_size: 4096,
            },
            sessions: SessionTable::new(),
        }
    }

    fn spawn_session(
        context: SessionContext,
        shutdown: CancellationToken,
    ) -> (DuplexStream, JoinHandle<SessionEnd>) {
        let (client, server) = duplex(64 * 1024);
        let (read, write) = tokio::io::split(server);
        let peer = SocketAddr::from(([127, 0, 0, 1], 40000));
        let session = Session::new(read, write, peer, context);
        (client, tokio::spawn(session.run(shutdown)))
    }

    async fn roundtrip(client: &mut DuplexStream, request: &[u8]) -> Value {
        client.write_all(request).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        serde_json::from_slice(&buf[..n]).unwrap()
    }

    fn status(value: &Value) -> (u64, &str) {
        (
            value["status"]["code"].as_u64().unwrap(),
            value["status"]["message"].as_str().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_ping_without_auth() {
        let (mut client, handle) = spawn_session(context(), CancellationToken::new());

        let response = roundtrip(&mut client, br#"{"endpoint":"ping"}"#).await;
        assert_eq!(response, json!({"status": {"code": 200, "message": "Success"}}));

        drop(client);
        assert_eq!(handle.await.unwrap(), SessionEnd::Closed);
    }

    #[tokio::test]
    async fn test_unauthenticated_request_closes_session() {
        let context = context();
        let sessions = context.sessions.clone();
        let (mut client, handle) = spawn_session(context, CancellationToken::new());

        let response = roundtrip(&mut client, br#"{"endpoint":"sleep","data":1}"#).await;
        assert_eq!(status(&response), (401, "Unauthorized."));
        assert_eq!(handle.await.unwrap(), SessionEnd::Unauthorized);

        // The server side is gone: reads see EOF.
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(sessions.len(), 0);
    }

    #[tokio::test]
    async fn test_handshake_then_dispatch() {
        let context = context();
        let sessions = context.sessions.clone();
        let (mut client, handle) = spawn_session(context, CancellationToken::new());

        let response =
            roundtrip(&mut client, br#"{"endpoint":"anything","auth":"s3cret"}"#).await;
        assert_eq!(status(&response), (200, "Success"));
        assert_eq!(sessions.authenticated_count(), 1);

        let response = roundtrip(&mut client, br#"{"endpoint":"does_not_exist"}"#).await;
        assert_eq!(status(&response), (400, "Endpoint not found."));

        let response = roundtrip(&mut client, br#"{"endpoint":"sleep","data":5}"#).await;
        assert_eq!(response["data"], json!(5));

        drop(client);
        assert_eq!(handle.await.unwrap(), SessionEnd::Closed);
        assert_eq!(sessions.authenticated_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_requests_keep_session_open() {
        let (mut client, _handle) = spawn_session(context(), CancellationToken::new());

        let response = roundtrip(&mut client, b"not json at all").await;
        assert_eq!(status(&response), (400, "Bad request."));

        let response = roundtrip(&mut client, br#"{"data":1}"#).await;
        assert_eq!(status(&response), (400, "Bad request."));

        let response = roundtrip(&mut client, br#"{"endpoint":"ping"}"#).await;
        assert_eq!(status(&response), (200, "Success"));
    }

    #[tokio::test]
    async fn test_array_request_does_not_authenticate() {
        let context = context();
        let sessions = context.sessions.clone();
        let (mut client, _handle) = spawn_session(context, CancellationToken::new());

        let response = roundtrip(&mut client, br#"["x",null,"s3cret"]"#).await;
        assert_eq!(status(&response), (400, "Bad request."));
        assert_eq!(sessions.authenticated_count(), 0);

        // Still unauthenticated, so the next protected request is refused.
        let response = roundtrip(&mut client, br#"{"endpoint":"sleep","data":1}"#).await;
        assert_eq!(status(&response), (401, "Unauthorized."));
    }

    #[tokio::test]
    async fn test_handler_failure_keeps_session_open() {
        let (mut client, _handle) = spawn_session(context(), CancellationToken::new());
        roundtrip(&mut client, br#"{"endpoint":"x","auth":"s3cret"}"#).await;

        let response = roundtrip(&mut client, br#"{"endpoint":"fail"}"#).await;
        assert_eq!(status(&response), (500, "Internal server error."));

        let response = roundtrip(&mut client, br#"{"endpoint":"ping"}"#).await;
        assert_eq!(status(&response), (200, "Success"));
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_session() {
        let (mut client, handle) = spawn_session(context(), CancellationToken::new());

        let big = vec![b'x'; 5000];
        client.write_all(&big).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        let response: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(status(&response), (400, "Request too large."));
        assert_eq!(handle.await.unwrap(), SessionEnd::FrameTooLarge);
    }

    fn prefixed(payload: &[u8]) -> Vec<u8> {
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    async fn read_prefixed(client: &mut DuplexStream) -> Value {
        let len = client.read_u32().await.unwrap() as usize;
        let mut buf = vec![0u8; len];
        client.read_exact(&mut buf).await.unwrap();
        serde_json::from_slice(&buf).unwrap()
    }

    #[tokio::test]
    async fn test_responses_follow_request_order() {
        let mut context = context();
        context.framing.mode = FramingMode::LengthPrefixed;
        let (mut client, _handle) = spawn_session(context, CancellationToken::new());

        // Three frames in one write: handshake, a slow request, a fast one.
        let mut batch = prefixed(br#"{"endpoint":"x","auth":"s3cret"}"#);
        batch.extend(prefixed(br#"{"endpoint":"sleep","data":50}"#));
        batch.extend(prefixed(br#"{"endpoint":"sleep","data":0}"#));
        client.write_all(&batch).await.unwrap();

        assert_eq!(status(&read_prefixed(&mut client).await), (200, "Success"));
        assert_eq!(read_prefixed(&mut client).await["data"], json!(50));
        assert_eq!(read_prefixed(&mut client).await["data"], json!(0));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_idle_session() {
        let shutdown = CancellationToken::new();
        let (_client, handle) = spawn_session(context(), shutdown.clone());

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_handler() {
        let shutdown = CancellationToken::new();
        let (mut client, handle) = spawn_session(context(), shutdown.clone());
        roundtrip(&mut client, br#"{"endpoint":"x","auth":"s3cret"}"#).await;

        client
            .write_all(br#"{"endpoint":"sleep","data":60000}"#)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let end = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Shutdown);
    }
}
