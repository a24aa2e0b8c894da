//! TCP listener and accept loop.
//!
//! Binds the listening endpoint, admits connections under a concurrency
//! limit, and dispatches one handler task per connection. Handler and
//! accept failures are absorbed here; only startup failures propagate.

use crate::config::Config;
use crate::connection::{self, IoDeadlines};
use crate::shutdown::{Shutdown, ShutdownHandle};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Startup errors. Anything after a successful bind is handled locally
/// and never terminates the server.
#[derive(Debug)]
pub enum ServerError {
    /// The listen address could not be parsed, bound, or listened on.
    Bind(std::io::Error),
    /// Socket allocation or option setup failed.
    Socket(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(e) => write!(f, "Failed to bind listener: {}", e),
            ServerError::Socket(e) => write!(f, "Failed to set up listening socket: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(e) | ServerError::Socket(e) => Some(e),
        }
    }
}

/// Server instance owning the listening endpoint.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    connection_limit: Arc<Semaphore>,
    deadlines: IoDeadlines,
    drain_timeout: Duration,
    shutdown: Shutdown,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Server {
    /// Bind the listening endpoint with the configured backlog.
    ///
    /// Must be called from within a tokio runtime. Both error variants
    /// are fatal: the caller is expected to propagate them out of `main`.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr: SocketAddr = config.listen.parse().map_err(|e| {
            ServerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(ServerError::Socket)?;
        socket.set_reuse_address(true).map_err(ServerError::Socket)?;
        socket.set_nonblocking(true).map_err(ServerError::Socket)?;
        socket.bind(&addr.into()).map_err(ServerError::Bind)?;
        socket
            .listen(config.backlog.min(i32::MAX as u32) as i32)
            .map_err(ServerError::Bind)?;

        let listener = TcpListener::from_std(socket.into()).map_err(ServerError::Socket)?;
        let local_addr = listener.local_addr().map_err(ServerError::Socket)?;

        // Subscribing here rather than in run() means a trigger can never
        // race the accept loop's startup.
        let shutdown = Shutdown::new();
        let shutdown_rx = shutdown.subscribe();

        info!(
            address = %local_addr,
            backlog = config.backlog,
            max_connections = config.max_connections,
            "Server listening"
        );

        Ok(Server {
            listener,
            local_addr,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            deadlines: IoDeadlines::from_secs(config.read_timeout_secs, config.write_timeout_secs),
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
            shutdown,
            shutdown_rx,
        })
    }

    /// The address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Obtain a handle that stops the accept loop when triggered.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.handle()
    }

    /// Accept connections until shutdown is triggered.
    ///
    /// Each accepted connection is handed to its own task; the loop never
    /// waits on a handler. A failed accept is logged and the loop
    /// continues. On shutdown the listening endpoint is released first,
    /// then in-flight handlers get `drain_timeout` to finish before being
    /// aborted.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            listener,
            connection_limit,
            deadlines,
            drain_timeout,
            shutdown: _shutdown,
            mut shutdown_rx,
            ..
        } = self;

        let mut handlers: JoinSet<()> = JoinSet::new();

        loop {
            // Admission control: a connection slot is claimed before the
            // connection is accepted, so a saturated server leaves new
            // peers in the OS backlog instead of spawning for them.
            let admit = async {
                let permit = connection_limit.clone().acquire_owned().await;
                let accepted = listener.accept().await;
                (permit, accepted)
            };

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                (permit, accepted) = admit => {
                    let permit = match permit {
                        Ok(permit) => permit,
                        // The semaphore lives as long as the loop.
                        Err(_) => break,
                    };
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "Client connected");
                            handlers.spawn(async move {
                                match connection::handle_connection(stream, deadlines).await {
                                    Ok(outcome) => {
                                        debug!(peer = %peer, ?outcome, "Connection finished")
                                    }
                                    Err(e) => {
                                        warn!(peer = %peer, error = %e, "Connection error")
                                    }
                                }
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }

            // Reap finished handlers so the set does not grow unbounded.
            while handlers.try_join_next().is_some() {}
        }

        // Release the listening endpoint before draining so the port is
        // immediately rebindable.
        drop(listener);

        if !handlers.is_empty() {
            info!(active = handlers.len(), "Draining in-flight connections");
            let drained = tokio::time::timeout(drain_timeout, async {
                while handlers.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    active = handlers.len(),
                    "Drain timeout elapsed, aborting remaining handlers"
                );
                handlers.shutdown().await;
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Response, MAX_REQUEST_SIZE};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            backlog: 16,
            max_connections: 64,
            read_timeout_secs: 0,
            write_timeout_secs: 0,
            drain_timeout_secs: 5,
            workers: None,
            log_level: "info".to_string(),
        }
    }

    fn start_server(
        config: Config,
    ) -> (
        SocketAddr,
        ShutdownHandle,
        JoinHandle<Result<(), ServerError>>,
    ) {
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let task = tokio::spawn(server.run());
        (addr, handle, task)
    }

    async fn stop_server(handle: ShutdownHandle, task: JoinHandle<Result<(), ServerError>>) {
        handle.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serves_fixed_response() {
        let (addr, handle, task) = start_server(test_config());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, Response::hello());

        stop_server(handle, task).await;
    }

    #[tokio::test]
    async fn test_silent_client_gets_no_response() {
        let (addr, handle, task) = start_server(test_config());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());

        stop_server(handle, task).await;
    }

    #[tokio::test]
    async fn test_concurrent_clients_no_crosstalk() {
        let (addr, handle, task) = start_server(test_config());

        let mut clients = Vec::new();
        for i in 0..8 {
            clients.push(tokio::spawn(async move {
                let mut client = TcpStream::connect(addr).await.unwrap();
                let payload = format!("client-{} distinct payload", i);
                client.write_all(payload.as_bytes()).await.unwrap();

                let mut reply = Vec::new();
                client.read_to_end(&mut reply).await.unwrap();
                reply
            }));
        }

        for client in clients {
            assert_eq!(client.await.unwrap(), Response::hello());
        }

        stop_server(handle, task).await;
    }

    #[tokio::test]
    async fn test_reset_connection_does_not_poison_listener() {
        let (addr, handle, task) = start_server(test_config());

        // Force an RST so the handler's read fails.
        let client = TcpStream::connect(addr).await.unwrap();
        client.set_linger(Some(Duration::from_secs(0))).unwrap();
        drop(client);

        // An unrelated follow-up connection is served normally.
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello?").await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, Response::hello());

        stop_server(handle, task).await;
    }

    #[tokio::test]
    async fn test_oversized_request_is_truncated_and_served() {
        let (addr, handle, task) = start_server(test_config());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let payload = vec![b'x'; 4 * MAX_REQUEST_SIZE];
        client.write_all(&payload).await.unwrap();

        // The server responds without draining the rest of the payload.
        let expected = Response::hello();
        let mut reply = vec![0u8; expected.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, expected);

        stop_server(handle, task).await;
    }

    #[tokio::test]
    async fn test_port_rebindable_after_shutdown() {
        let (addr, handle, task) = start_server(test_config());
        stop_server(handle, task).await;

        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_in_flight_connection_served_during_drain() {
        let (addr, handle, task) = start_server(test_config());

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Give the accept loop a moment to hand the connection off.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.trigger();

        client.write_all(b"late request").await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, Response::hello());

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stragglers_after_drain_timeout() {
        let mut config = test_config();
        config.drain_timeout_secs = 1;
        let (addr, handle, task) = start_server(config);

        // An idle connection with no read deadline would pin its handler
        // forever; shutdown must still complete.
        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_error_on_occupied_port() {
        let (addr, handle, task) = start_server(test_config());

        let mut config = test_config();
        config.listen = addr.to_string();
        // SO_REUSEADDR does not allow two live listeners on one port.
        let err = Server::bind(&config).unwrap_err();
        assert!(matches!(err, ServerError::Bind(_)));

        stop_server(handle, task).await;
    }

    #[tokio::test]
    async fn test_bind_error_on_malformed_address() {
        let mut config = test_config();
        config.listen = "not-an-address".to_string();

        let err = Server::bind(&config).unwrap_err();
        assert!(matches!(err, ServerError::Bind(_)));
    }
}
