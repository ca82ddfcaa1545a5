//! WebSocket Game Server
//!
//! Async WebSocket server for coin flip sessions.
//! Accepts connections, pumps frames into the router and sweeps idle sessions.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn, error, debug, instrument};

use crate::core::rng::OutcomeSource;
use crate::game::state::{SessionConfig, TurnPolicy};
use crate::network::hub::{ConnectionHub, OutboundFrame};
use crate::network::protocol::{ErrorCode, ServerEvent, ServerMessage};
use crate::network::router::Router;
use crate::network::session::{SessionError, SessionStore};
use crate::persistence::PersistenceHandle;

/// How long a closing connection may take to flush its last frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Sessions with nobody attached are evicted after this long.
    pub idle_timeout: Duration,
    /// How often the idle sweep runs.
    pub sweep_interval: Duration,
    /// Rules for new sessions.
    pub session: SessionConfig,
    /// Outbound frames buffered per connection before it counts as slow.
    pub outbound_capacity: usize,
    /// Journal file; in-memory store when unset.
    pub journal_path: Option<PathBuf>,
    /// Fixed seed for reproducible flips; entropy when unset.
    pub rng_seed: Option<u64>,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            session: SessionConfig::default(),
            outbound_capacity: 64,
            journal_path: None,
            rng_seed: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Value could not be parsed or is out of range.
    #[error("Invalid value for {var}: {value:?}")]
    Invalid {
        /// Environment variable.
        var: &'static str,
        /// Rejected value.
        value: String,
    },
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

impl ServerConfig {
    /// Defaults overridden by `COINFLIP_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `COINFLIP_*` variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = parse_var(&lookup, "COINFLIP_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(max) = parse_var(&lookup, "COINFLIP_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(secs) = parse_var(&lookup, "COINFLIP_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "COINFLIP_SWEEP_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    var: "COINFLIP_SWEEP_INTERVAL_SECS",
                    value: secs.to_string(),
                });
            }
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "COINFLIP_TURN_TIMEOUT_SECS")? {
            config.session.turn_timeout = Duration::from_secs(secs);
        }
        if let Some(rounds) = parse_var::<u32>(&lookup, "COINFLIP_DEFAULT_ROUNDS")? {
            if rounds == 0 || rounds % 2 == 0 {
                return Err(ConfigError::Invalid {
                    var: "COINFLIP_DEFAULT_ROUNDS",
                    value: rounds.to_string(),
                });
            }
            config.session.max_rounds = rounds;
        }
        if let Some(policy) = lookup("COINFLIP_TURN_POLICY") {
            config.session.turn_policy = match policy.trim() {
                "alternate" => TurnPolicy::Alternate,
                "creator" | "creator_always" => TurnPolicy::CreatorAlways,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "COINFLIP_TURN_POLICY",
                        value: policy,
                    })
                }
            };
        }
        if let Some(path) = lookup("COINFLIP_JOURNAL_PATH").filter(|p| !p.trim().is_empty()) {
            config.journal_path = Some(PathBuf::from(path));
        }
        config.rng_seed = parse_var(&lookup, "COINFLIP_RNG_SEED")?;

        Ok(config)
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Message dispatch.
    router: Arc<Router>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(
        config: ServerConfig,
        outcomes: Arc<dyn OutcomeSource>,
        persistence: PersistenceHandle,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let router = Router::new(
            Arc::new(ConnectionHub::new()),
            Arc::new(SessionStore::new(config.session.clone())),
            outcomes,
            persistence,
        );

        Self {
            config,
            router: Arc::new(router),
            shutdown_tx,
        }
    }

    /// Bind and run the server until [`GameServer::shutdown`].
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the server on an already bound listener.
    #[instrument(skip_all, fields(version = %self.config.version))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);

        let sweep_router = self.router.clone();
        let sweep_every = self.config.sweep_interval;
        let idle_timeout = self.config.idle_timeout;

        // Spawn sweep task
        let sweep_handle = tokio::spawn(async move {
            Self::run_sweep_loop(sweep_router, sweep_every, idle_timeout).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.router.hub().connection_count().await;
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        sweep_handle.abort();

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let router = self.router.clone();
        let capacity = self.config.outbound_capacity;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (frame_tx, mut frame_rx) = mpsc::channel::<OutboundFrame>(capacity);

            // Register client
            let conn = router.hub().connect(frame_tx).await;
            debug!(conn = %conn, "Client {} registered", addr);

            // Spawn message sender task; ends once the hub drops the sender
            let mut sender_task = tokio::spawn(async move {
                while let Some(frame) = frame_rx.recv().await {
                    if ws_sender.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                router.handle_text(conn, &text).await;
                            }
                            Some(Ok(Message::Binary(_))) => {
                                let reply = ServerMessage::error(
                                    ErrorCode::MalformedMessage,
                                    "binary frames are not supported",
                                );
                                if let Err(e) = router.hub().send_to(conn, &reply).await {
                                    debug!("Error reply to {} failed: {}", addr, e);
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            // Pings are answered by tungstenite itself
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let notice = ServerMessage::new(ServerEvent::Shutdown {
                            reason: "Server shutting down".to_string(),
                        });
                        let _ = router.hub().send_to(conn, &notice).await;
                        break;
                    }
                }
            }

            // Cleanup
            router.handle_disconnect(conn).await;
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut sender_task).await.is_err() {
                sender_task.abort();
            }

            info!("Client {} cleaned up", addr);
        });
    }

    /// Run sweep loop.
    async fn run_sweep_loop(router: Arc<Router>, every: Duration, idle_timeout: Duration) {
        let mut interval = interval(every);

        loop {
            interval.tick().await;

            let evicted = router.sessions().sweep(idle_timeout).await;
            if !evicted.is_empty() {
                info!(count = evicted.len(), "Swept idle sessions");
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.router.hub().connection_count().await
    }

    /// Get live session count.
    pub async fn session_count(&self) -> usize {
        self.router.sessions().session_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::coin::CoinSide;
    use crate::core::rng::ScriptedSource;
    use crate::persistence::MemoryGateway;
    use std::collections::BTreeMap;

    fn test_server(config: ServerConfig) -> GameServer {
        let (persistence, _worker) = PersistenceHandle::spawn(MemoryGateway::new(), 16);
        GameServer::new(config, Arc::new(ScriptedSource::always(CoinSide::Heads)), persistence)
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.journal_path.is_none());
    }

    #[test]
    fn test_config_from_lookup() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("COINFLIP_BIND_ADDR", "127.0.0.1:9001"),
            ("COINFLIP_MAX_CONNECTIONS", "5"),
            ("COINFLIP_TURN_TIMEOUT_SECS", "10"),
            ("COINFLIP_DEFAULT_ROUNDS", "3"),
            ("COINFLIP_TURN_POLICY", "creator"),
            ("COINFLIP_JOURNAL_PATH", "/tmp/flips.jsonl"),
            ("COINFLIP_RNG_SEED", "42"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9001".parse().unwrap());
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.session.turn_timeout, Duration::from_secs(10));
        assert_eq!(config.session.max_rounds, 3);
        assert_eq!(config.session.turn_policy, TurnPolicy::CreatorAlways);
        assert_eq!(config.journal_path, Some(PathBuf::from("/tmp/flips.jsonl")));
        assert_eq!(config.rng_seed, Some(42));
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let err = ServerConfig::from_lookup(lookup(&[("COINFLIP_DEFAULT_ROUNDS", "4")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid { var: "COINFLIP_DEFAULT_ROUNDS", value: "4".into() }
        );
        assert!(ServerConfig::from_lookup(lookup(&[("COINFLIP_MAX_CONNECTIONS", "lots")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("COINFLIP_TURN_POLICY", "random")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("COINFLIP_SWEEP_INTERVAL_SECS", "0")])).is_err());
    }

    #[tokio::test]
    async fn test_server_creation() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = test_server(config);

        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let server = Arc::new(test_server(ServerConfig::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let running = server.clone();
        let handle = tokio::spawn(async move { running.serve(listener).await });
        tokio::task::yield_now().await;

        server.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_ping_over_websocket() {
        let server = Arc::new(test_server(ServerConfig::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();
        ws.send(Message::Text(r#"{"type":"ping","timestamp":7}"#.into()))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(value["clientTimestamp"], 7);

        ws.send(Message::Text("garbage".into())).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(value["code"], "malformed_message");

        server.shutdown();
    }
}
