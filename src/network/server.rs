//! ChatRelay Server
//!
//! The server accepts control connections, runs one supervisor per
//! connection and a single datagram router, all sharing one session
//! registry.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use super::connection::{ConnectionError, ConnectionHandle};
use super::registry::SessionRegistry;
use super::{router, supervisor, NetworkConfig};
use crate::protocol::{encode, MessageType, Payload, SERVER_IDENTITY};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Both transports are bound
    Started {
        tcp_addr: SocketAddr,
        udp_addr: SocketAddr,
    },
    UserLoggedIn {
        identity: String,
        addr: SocketAddr,
    },
    /// A login was refused and its connection closed
    LoginRejected {
        identity: String,
        addr: SocketAddr,
    },
    UserLoggedOut {
        identity: String,
        reason: String,
    },
    Stopped,
}

/// ChatRelay Server
pub struct Server {
    config: NetworkConfig,
    registry: Arc<SessionRegistry>,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal observed by every task
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    local_addrs: Option<(SocketAddr, SocketAddr)>,
    running: Arc<RwLock<bool>>,
}

impl Server {
    /// Create a new server around an injected registry
    pub fn new(config: NetworkConfig, registry: Arc<SessionRegistry>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            registry,
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            tasks: Vec::new(),
            local_addrs: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Bound (control, datagram) addresses once started
    pub fn local_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        self.local_addrs
    }

    /// Bind both transports and start serving
    pub async fn start(&mut self) -> ServerResult<()> {
        if self.is_running().await {
            return Err(ServerError::AlreadyRunning);
        }

        let tcp_bind = format!("{}:{}", self.config.host, self.config.tcp_port);
        let listener = TcpListener::bind(&tcp_bind).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind TCP {}: {}", tcp_bind, e))
        })?;

        let udp_bind = format!("{}:{}", self.config.host, self.config.udp_port);
        let socket = UdpSocket::bind(&udp_bind).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind UDP {}: {}", udp_bind, e))
        })?;

        let tcp_addr = listener.local_addr()?;
        let udp_addr = socket.local_addr()?;
        tracing::info!("TCP server listening on {}", tcp_addr);
        tracing::info!("UDP server listening on {}", udp_addr);
        self.local_addrs = Some((tcp_addr, udp_addr));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let _ = self.event_tx.try_send(ServerEvent::Started { tcp_addr, udp_addr });

        self.tasks.push(tokio::spawn(router::run(
            socket,
            self.registry.clone(),
            shutdown_rx.clone(),
        )));

        let registry = self.registry.clone();
        let event_tx = self.event_tx.clone();
        let outbound_queue = self.config.outbound_queue;

        // Spawn the accept loop
        self.tasks.push(tokio::spawn(async move {
            let mut shutdown = shutdown_rx.clone();
            let mut supervisors = JoinSet::new();

            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New TCP connection from {}, waiting for login...", addr);

                                supervisors.spawn(supervisor::supervise(
                                    stream,
                                    addr,
                                    supervisor::SupervisorContext {
                                        registry: registry.clone(),
                                        events: event_tx.clone(),
                                        outbound_queue,
                                    },
                                    shutdown_rx.clone(),
                                ));
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    Some(_) = supervisors.join_next(), if !supervisors.is_empty() => {}
                    _ = shutdown.changed() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            // Supervisors see the same signal and run their own cleanup
            while supervisors.join_next().await.is_some() {}
        }));

        Ok(())
    }

    /// Stop the server and wait for every task to exit
    pub async fn stop(&mut self) -> ServerResult<()> {
        if !self.is_running().await {
            return Err(ServerError::NotRunning);
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!("Server task failed: {}", e);
            }
        }

        // Sessions whose supervisor never reached its own cleanup
        if !self.registry.is_empty().await {
            for identity in self.registry.snapshot_identities().await {
                tracing::warn!("Removing leftover session '{}'", identity);
                self.registry.unregister(&identity).await;
            }
        }

        {
            let mut running = self.running.write().await;
            *running = false;
        }

        let _ = self.event_tx.try_send(ServerEvent::Stopped);
        tracing::info!("Server has been shut down");

        Ok(())
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Queue a frame for one peer; failures only affect that peer
pub(super) fn deliver(identity: &str, handle: &ConnectionHandle, frame: Bytes) -> bool {
    if !handle.is_connected() {
        tracing::debug!("Skipping '{}' at {}: connection closing", identity, handle.addr());
        return false;
    }

    match handle.send(frame) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                "Failed to send to '{}' at {}: {}. Client might be disconnected.",
                identity,
                handle.addr(),
                e
            );
            false
        }
    }
}

/// Forward raw bytes to one identity if it is registered
pub(super) async fn forward_to(registry: &SessionRegistry, recipient: &str, frame: Bytes) -> bool {
    match registry.lookup(recipient).await {
        Some(session) => deliver(recipient, &session.handle, frame),
        None => {
            tracing::debug!("Recipient '{}' is not logged in, dropping", recipient);
            false
        }
    }
}

/// Push the current identity list to every session
pub(super) async fn broadcast_user_list(registry: &SessionRegistry) {
    let pushed = registry
        .queue_to_all(|users| {
            encode(
                MessageType::UserList,
                SERVER_IDENTITY,
                0,
                &Payload::user_list(users.to_vec()),
            )
        })
        .await;

    match pushed {
        Ok(users) => tracing::info!(
            "Broadcasting updated user list to {} clients: {:?}",
            users.len(),
            users
        ),
        Err(e) => tracing::error!("Failed to encode user list: {}", e),
    }
}

/// Acknowledge a datagram over the sender's control channel
pub(super) async fn send_ack(registry: &SessionRegistry, identity: &str, sequence: u32) -> bool {
    let Some(session) = registry.lookup(identity).await else {
        tracing::debug!("No session for '{}', ACK #{} not sent", identity, sequence);
        return false;
    };

    match encode(MessageType::Ack, SERVER_IDENTITY, sequence, &Payload::new()) {
        Ok(ack) => {
            let sent = deliver(identity, &session.handle, ack);
            if sent {
                tracing::info!("Sent ACK for message #{} to '{}'", sequence, identity);
            }
            sent
        }
        Err(e) => {
            tracing::error!("Failed to encode ACK for '{}': {}", identity, e);
            false
        }
    }
}
