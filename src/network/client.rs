//! ChatRelay Client
//!
//! Speaks the sender side of the protocol: logs in over the control
//! channel, sends text as acknowledged datagrams, answers and measures pings
//! and turns everything the server pushes into `ClientEvent`s.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use super::connection::{Connection, ConnectionError, ConnectionHandle};
use super::NetworkConfig;
use crate::protocol::{encode, CodecError, Frame, MessageType, Payload};
use crate::reliability::{ReliableSender, RetransmitPolicy, RttProbe, SendError};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Invalid packet: {0}")]
    Codec(#[from] CodecError),

    #[error("Message could not be sent: {0}")]
    Send(#[from] SendError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Control channel is up and the login was sent
    Connected {
        server_addr: SocketAddr,
    },
    MessageReceived {
        sender: String,
        text: String,
        private: bool,
    },
    UserListChanged {
        users: Vec<String>,
    },
    /// The server confirmed receipt of a datagram
    Acknowledged {
        sequence: u32,
    },
    PingMeasured {
        target: String,
        rtt: Duration,
    },
    Retransmitted {
        sequence: u32,
        attempt: u32,
    },
    /// Retry limit reached without an acknowledgment
    DeliveryAbandoned {
        sequence: u32,
    },
    ConnectionLost {
        reason: String,
    },
}

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// ChatRelay Client
pub struct Client {
    config: NetworkConfig,
    identity: String,
    state: Arc<RwLock<ClientState>>,
    /// Event sender
    event_tx: mpsc::Sender<ClientEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    /// Queue onto the control connection
    connection_handle: Arc<RwLock<Option<ConnectionHandle>>>,
    /// Datagram side of the session
    sender: Arc<RwLock<Option<Arc<ReliableSender>>>>,
    probe: Arc<Mutex<RttProbe>>,
    /// Shutdown signal shared by the control and sweep tasks
    shutdown_tx: Arc<RwLock<Option<Arc<watch::Sender<bool>>>>>,
}

impl Client {
    /// Create a new client
    pub fn new(config: NetworkConfig, identity: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            identity: identity.into(),
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            event_tx,
            event_rx: Some(event_rx),
            connection_handle: Arc::new(RwLock::new(None)),
            sender: Arc::new(RwLock::new(None)),
            probe: Arc::new(Mutex::new(RttProbe::new())),
            shutdown_tx: Arc::new(RwLock::new(None)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn policy(&self) -> RetransmitPolicy {
        RetransmitPolicy::new(
            self.config.retransmit_timeout,
            self.config.sweep_interval,
            self.config.max_retransmits,
        )
    }

    /// Connect to a server by hostname using the configured ports
    pub async fn connect_hostname(&self, hostname: &str) -> ClientResult<()> {
        let tcp_addr = super::resolve_host(hostname, self.config.tcp_port).await?;
        let udp_addr = super::resolve_host(hostname, self.config.udp_port).await?;
        self.connect(tcp_addr, udp_addr).await
    }

    /// Open the control channel, log in and start the background tasks
    pub async fn connect(&self, tcp_addr: SocketAddr, udp_addr: SocketAddr) -> ClientResult<()> {
        {
            let state = self.state.read().await;
            if *state != ClientState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
        }

        // Fails early on an identity that cannot be encoded
        let login = encode(MessageType::Login, &self.identity, 0, &Payload::new())?;

        {
            let mut state = self.state.write().await;
            *state = ClientState::Connecting;
        }

        match self.establish(tcp_addr, udp_addr, login).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut state = self.state.write().await;
                *state = ClientState::Disconnected;
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        tcp_addr: SocketAddr,
        udp_addr: SocketAddr,
        login: Bytes,
    ) -> ClientResult<()> {
        tracing::info!("Connecting to {} as '{}'", tcp_addr, self.identity);

        let stream = match tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            TcpStream::connect(tcp_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::Io(e)),
            Err(_) => return Err(ClientError::Timeout),
        };

        let mut conn = Connection::new(stream, tcp_addr);
        conn.send_raw(&login).await?;

        let reliable = Arc::new(ReliableSender::bind(&*self.identity, udp_addr, self.policy()).await?);
        tracing::info!("Connection successful, datagrams from {}", reliable.local_addr()?);

        let (msg_tx, msg_rx) = mpsc::channel::<Bytes>(self.config.outbound_queue);
        let handle = ConnectionHandle::new(tcp_addr, msg_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        *self.connection_handle.write().await = Some(handle.clone());
        *self.sender.write().await = Some(reliable.clone());
        *self.shutdown_tx.write().await = Some(shutdown_tx.clone());
        *self.state.write().await = ClientState::Connected;

        emit(&self.event_tx, ClientEvent::Connected { server_addr: tcp_addr });

        tokio::spawn(sweep_loop(
            reliable.clone(),
            self.event_tx.clone(),
            shutdown_rx.clone(),
        ));

        let session = ControlSession {
            identity: self.identity.clone(),
            reliable,
            probe: self.probe.clone(),
            event_tx: self.event_tx.clone(),
        };
        let slots = Slots {
            state: self.state.clone(),
            connection_handle: self.connection_handle.clone(),
            sender: self.sender.clone(),
            shutdown_slot: self.shutdown_tx.clone(),
        };
        tokio::spawn(control_loop(
            conn,
            handle,
            msg_rx,
            session,
            slots,
            shutdown_tx,
            shutdown_rx,
        ));

        Ok(())
    }

    /// Send text to everyone, or privately to `target`
    ///
    /// Returns the sequence number the server will acknowledge.
    pub async fn send_text(&self, text: &str, target: Option<&str>) -> ClientResult<u32> {
        let sender = self
            .sender
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;

        let (kind, payload) = match target {
            Some(recipient) => (MessageType::PrivateText, Payload::private(text, recipient)),
            None => (MessageType::BroadcastText, Payload::broadcast(text)),
        };

        let sequence = sender.send(kind, &payload).await.map_err(|e| {
            tracing::error!("Failed to send message: {}", e);
            e
        })?;
        Ok(sequence)
    }

    /// Start a round-trip probe to `target`
    pub async fn ping(&self, target: &str) -> ClientResult<()> {
        let handle = self
            .connection_handle
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;

        let request = encode(MessageType::PingRequest, &self.identity, 0, &Payload::ping(target))?;

        tracing::info!("Sending PING request to '{}'", target);
        self.probe.lock().await.start(target, Instant::now());
        if let Err(e) = handle.send(request) {
            self.probe.lock().await.cancel(target);
            return Err(e.into());
        }
        Ok(())
    }

    /// Log out and stop the background tasks
    pub async fn logout(&self) -> ClientResult<()> {
        if !self.is_connected().await {
            return Err(ClientError::NotConnected);
        }

        tracing::info!("Logging out...");
        if let Some(tx) = &*self.shutdown_tx.read().await {
            let _ = tx.send(true);
        }
        Ok(())
    }

    /// Datagrams still waiting for an acknowledgment
    pub async fn pending_count(&self) -> usize {
        match &*self.sender.read().await {
            Some(sender) => sender.pending_count().await,
            None => 0,
        }
    }

    /// Get the current state
    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ClientState::Connected
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // The background tasks own the socket; tell them to log out and exit
        if let Ok(slot) = self.shutdown_tx.try_read() {
            if let Some(tx) = &*slot {
                let _ = tx.send(true);
            }
        }
    }
}

/// Forward an event without ever blocking protocol handling
fn emit(event_tx: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    if let Err(e) = event_tx.try_send(event) {
        tracing::debug!("Client event dropped: {}", e);
    }
}

/// Everything the control loop needs to react to server pushes
struct ControlSession {
    identity: String,
    reliable: Arc<ReliableSender>,
    probe: Arc<Mutex<RttProbe>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

/// Client fields reset when the session ends
struct Slots {
    state: Arc<RwLock<ClientState>>,
    connection_handle: Arc<RwLock<Option<ConnectionHandle>>>,
    sender: Arc<RwLock<Option<Arc<ReliableSender>>>>,
    shutdown_slot: Arc<RwLock<Option<Arc<watch::Sender<bool>>>>>,
}

async fn control_loop(
    mut conn: Connection,
    handle: ConnectionHandle,
    mut msg_rx: mpsc::Receiver<Bytes>,
    session: ControlSession,
    slots: Slots,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let reason = loop {
        tokio::select! {
            biased;

            Some(frame) = msg_rx.recv() => {
                if let Err(e) = conn.send_raw(&frame).await {
                    break format!("Send error: {}", e);
                }
            }

            result = conn.recv() => {
                match result {
                    Ok(Some(frame)) => {
                        if let Some(reply) = session.dispatch(frame).await {
                            if let Err(e) = conn.send_raw(&reply).await {
                                break format!("Send error: {}", e);
                            }
                        }
                    }
                    Ok(None) => break "Connection to server lost".to_string(),
                    Err(e) => break format!("Connection to server lost: {}", e),
                }
            }

            _ = shutdown_rx.changed() => {
                match encode(MessageType::Logout, &session.identity, 0, &Payload::new()) {
                    Ok(logout) => {
                        if let Err(e) = conn.send_raw(&logout).await {
                            tracing::warn!("Error during logout: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("Error during logout: {}", e),
                }
                break "Logged out".to_string();
            }
        }
    };

    // Clean up
    handle.mark_disconnected();
    let _ = shutdown_tx.send(true);

    *slots.connection_handle.write().await = None;
    *slots.sender.write().await = None;
    *slots.shutdown_slot.write().await = None;
    *slots.state.write().await = ClientState::Disconnected;

    let _ = conn.close().await;
    tracing::info!("Disconnected from {}: {}", conn.remote_addr(), reason);
    emit(&session.event_tx, ClientEvent::ConnectionLost { reason });
}

impl ControlSession {
    /// Apply one server push; returns a frame to write back, if any
    async fn dispatch(&self, frame: Frame) -> Option<Bytes> {
        let kind = frame.kind()?;
        let payload = match frame.payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Dropping {:?} from server: {}", kind, e);
                return None;
            }
        };

        match kind {
            MessageType::Ack => {
                let sequence = frame.sequence();
                if self.reliable.acknowledge(sequence).await {
                    tracing::info!("ACK received for UDP packet #{}", sequence);
                    emit(&self.event_tx, ClientEvent::Acknowledged { sequence });
                } else {
                    tracing::debug!("Ignoring ACK for unknown packet #{}", sequence);
                }
                None
            }

            MessageType::PingRequest => {
                tracing::info!("Received PING request from '{}'. Responding...", frame.sender());
                match encode(
                    MessageType::PingResponse,
                    &self.identity,
                    0,
                    &Payload::ping(frame.sender()),
                ) {
                    Ok(response) => Some(response),
                    Err(e) => {
                        tracing::warn!("Cannot answer PING from '{}': {}", frame.sender(), e);
                        None
                    }
                }
            }

            MessageType::PingResponse => {
                let from = frame.sender();
                if let Some(rtt) = self.probe.lock().await.complete(from, Instant::now()) {
                    tracing::info!(
                        "PING response from '{}' received. RTT: {} ms",
                        from,
                        rtt.as_millis()
                    );
                    emit(
                        &self.event_tx,
                        ClientEvent::PingMeasured {
                            target: from.to_string(),
                            rtt,
                        },
                    );
                }
                None
            }

            MessageType::UserList => {
                match payload.users() {
                    Some(users) => emit(
                        &self.event_tx,
                        ClientEvent::UserListChanged {
                            users: users.to_vec(),
                        },
                    ),
                    None => tracing::warn!("User list without users"),
                }
                None
            }

            MessageType::BroadcastText | MessageType::PrivateText => {
                match payload.text() {
                    Some(text) => emit(
                        &self.event_tx,
                        ClientEvent::MessageReceived {
                            sender: frame.sender().to_string(),
                            text: text.to_string(),
                            private: kind == MessageType::PrivateText,
                        },
                    ),
                    None => tracing::warn!("Text message from '{}' without text", frame.sender()),
                }
                None
            }

            MessageType::Login | MessageType::Logout => None,
        }
    }
}

async fn sweep_loop(
    reliable: Arc<ReliableSender>,
    event_tx: mpsc::Sender<ClientEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(reliable.policy().sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = reliable.sweep().await;
                for (sequence, attempt) in report.retransmitted {
                    emit(&event_tx, ClientEvent::Retransmitted { sequence, attempt });
                }
                for sequence in report.abandoned {
                    emit(&event_tx, ClientEvent::DeliveryAbandoned { sequence });
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}
