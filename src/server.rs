//! TCP server for control-plane clients.
//!
//! Accepts connections, runs one session task per connection, and tears
//! everything down when the shutdown future resolves.

use crate::auth::AuthGate;
use crate::config::Config;
use crate::connection::SessionTable;
use crate::dispatch::Dispatcher;
use crate::frame::Framing;
use crate::registry::Registry;
use crate::session::{Session, SessionContext};
use futures::FutureExt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Listen backlog for the control socket.
const LISTEN_BACKLOG: i32 = 128;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Server instance
pub struct Server {
    listen: SocketAddr,
    shutdown_timeout: Duration,
    context: SessionContext,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a server around a fully populated registry.
    pub fn new(config: Config, registry: Registry) -> Self {
        let context = SessionContext {
            dispatcher: Dispatcher::new(Arc::new(registry)),
            gate: AuthGate::new(config.auth_secret.clone()),
            framing: Framing::from_config(&config),
            sessions: SessionTable::new(),
        };

        Server {
            listen: config.listen,
            shutdown_timeout: config.shutdown_timeout,
            context,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
        }
    }

    /// Bind the listening socket with `SO_REUSEADDR` so a restarted bot can
    /// take the port back immediately.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        create_listener(self.listen).map_err(|source| ServerError::Bind {
            addr: self.listen,
            source,
        })
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run<S>(self, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Serve connections from an already bound listener until `shutdown`
    /// resolves, then cancel every session and close the listener.
    pub async fn serve<S>(self, listener: TcpListener, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        tokio::pin!(shutdown);

        match listener.local_addr() {
            Ok(addr) => info!(address = %addr, "Server listening"),
            Err(e) => warn!(error = %e, "Server listening on unknown address"),
        }

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                () = &mut shutdown => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                break;
            };

            let accepted = tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    let context = self.context.clone();
                    let token = token.clone();
                    tracker.spawn(async move {
                        handle_connection(stream, peer, context, token).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        drop(listener);
        let live = self.context.sessions.len();
        info!(
            sessions = live,
            authenticated = self.context.sessions.authenticated_count(),
            "Shutting down control server"
        );

        token.cancel();
        tracker.close();
        if tokio::time::timeout(self.shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            for info in self.context.sessions.snapshot() {
                warn!(
                    peer = %info.peer,
                    since = %info.connected_at,
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "Session still running after shutdown timeout"
                );
            }
        }
    }
}

/// Run one session, logging and discarding any panic.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: SessionContext,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let (reader, writer) = stream.into_split();
    let session = Session::new(reader, writer, peer, context);
    let span = info_span!("session", peer = %peer);

    if AssertUnwindSafe(session.run(shutdown).instrument(span))
        .catch_unwind()
        .await
        .is_err()
    {
        error!(peer = %peer, "Session task panicked");
    }
}

/// Create a TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SharedSecret;
    use crate::bot::Bot;
    use crate::config::FramingMode;
    use crate::endpoints::{self, tests::fake_bot};
    use serde_json::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    const SECRET: &str = "s3cret";

    fn config() -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            max_connections: 16,
            shutdown_timeout: Duration::from_secs(2),
            framing: FramingMode::ShortRead,
            max_frame_size: 4096,
            chunk_size: 1024,
            auth_secret: SharedSecret::new(SECRET),
            log_level: "info".to_string(),
        }
    }

    struct Running {
        addr: SocketAddr,
        stop: oneshot::Sender<()>,
        handle: JoinHandle<()>,
    }

    fn start(config: Config) -> Running {
        let mut registry = Registry::new();
        endpoints::register_all(&mut registry, fake_bot() as Arc<dyn Bot>).unwrap();
        let server = Server::new(config, registry);
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(listener, async {
            let _ = stopped.await;
        }));
        Running { addr, stop, handle }
    }

    async fn roundtrip(stream: &mut TcpStream, request: &[u8]) -> Value {
        stream.write_all(request).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        serde_json::from_slice(&buf[..n]).unwrap()
    }

    fn code(value: &Value) -> u64 {
        value["status"]["code"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_example_scenario() {
        let server = start(config());

        let mut first = TcpStream::connect(server.addr).await.unwrap();
        let response = roundtrip(&mut first, br#"{"endpoint":"ping"}"#).await;
        assert_eq!(
            response,
            serde_json::json!({"status": {"code": 200, "message": "Success"}})
        );

        let response =
            roundtrip(&mut first, br#"{"endpoint":"send","data":{"message":"hi"}}"#).await;
        assert_eq!(code(&response), 401);
        let mut buf = [0u8; 16];
        assert_eq!(first.read(&mut buf).await.unwrap(), 0);

        let mut second = TcpStream::connect(server.addr).await.unwrap();
        let response = roundtrip(
            &mut second,
            br#"{"endpoint":"anything","auth":"s3cret"}"#,
        )
        .await;
        assert_eq!(code(&response), 200);

        let response = roundtrip(&mut second, br#"{"endpoint":"does_not_exist"}"#).await;
        assert_eq!(code(&response), 400);
        assert_eq!(response["status"]["message"], "Endpoint not found.");

        let response = roundtrip(
            &mut second,
            br#"{"endpoint":"member_activities","data":["42"]}"#,
        )
        .await;
        assert_eq!(code(&response), 200);
        assert_eq!(response["data"]["42"]["top_role"], "Moderator");

        server.stop.send(()).unwrap();
        server.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let server = start(config());

        let mut authed = TcpStream::connect(server.addr).await.unwrap();
        roundtrip(&mut authed, br#"{"endpoint":"x","auth":"s3cret"}"#).await;

        // A failed handshake on another connection does not disturb this one.
        let mut intruder = TcpStream::connect(server.addr).await.unwrap();
        let response = roundtrip(&mut intruder, br#"{"endpoint":"verify","auth":"nope"}"#).await;
        assert_eq!(code(&response), 401);

        let response = roundtrip(&mut authed, br#"{"endpoint":"verify","data":"42"}"#).await;
        assert_eq!(code(&response), 200);

        server.stop.send(()).unwrap();
        server.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_listener() {
        let server = start(config());

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        roundtrip(&mut client, br#"{"endpoint":"ping"}"#).await;

        server.stop.send(()).unwrap();
        server.handle.await.unwrap();

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(TcpStream::connect(server.addr).await.is_err());
    }

    #[tokio::test]
    async fn test_length_prefixed_framing() {
        let mut config = config();
        config.framing = FramingMode::LengthPrefixed;
        let server = start(config);

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        let request = br#"{"endpoint":"ping"}"#;
        client.write_u32(request.len() as u32).await.unwrap();
        client.write_all(request).await.unwrap();

        let len = client.read_u32().await.unwrap() as usize;
        let mut buf = vec![0u8; len];
        client.read_exact(&mut buf).await.unwrap();
        let response: Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(code(&response), 200);

        server.stop.send(()).unwrap();
        server.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let server = Server::new(config(), Registry::new());
        let listener = server.bind().unwrap();

        let mut taken = config();
        taken.listen = listener.local_addr().unwrap();
        let conflicting = Server::new(taken, Registry::new());
        assert!(matches!(conflicting.bind(), Err(ServerError::Bind { .. })));
    }
}
