//! Per-connection supervisor
//!
//! Drives one control connection through login, the authenticated session
//! and a single cleanup on exit, whichever way the connection ends.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use super::connection::{Connection, ConnectionHandle};
use super::registry::SessionRegistry;
use super::server::{broadcast_user_list, forward_to, ServerEvent};
use crate::protocol::{Frame, MessageType};

/// Shared state handed to every supervisor
pub(super) struct SupervisorContext {
    pub registry: Arc<SessionRegistry>,
    pub events: mpsc::Sender<ServerEvent>,
    pub outbound_queue: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SupervisorState {
    AwaitingLogin,
    Authenticated { identity: String },
    Closed,
}

/// Why the connection loop ended
#[derive(Debug)]
enum Exit {
    Logout,
    Rejected,
    Dropped(String),
    Shutdown,
}

impl Exit {
    fn reason(&self) -> String {
        match self {
            Exit::Logout => "Logged out".to_string(),
            Exit::Rejected => "Login rejected".to_string(),
            Exit::Dropped(reason) => reason.clone(),
            Exit::Shutdown => "Server shutting down".to_string(),
        }
    }
}

/// Run one control connection to completion
pub(super) async fn supervise<S>(
    stream: S,
    addr: SocketAddr,
    ctx: SupervisorContext,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Connection::new(stream, addr);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(ctx.outbound_queue);
    let handle = ConnectionHandle::new(addr, outbound_tx);
    let mut state = SupervisorState::AwaitingLogin;

    let exit = loop {
        tokio::select! {
            result = conn.recv() => {
                match result {
                    Ok(Some(frame)) => {
                        if let Some(exit) = handle_frame(&ctx, &handle, &mut state, frame).await {
                            break exit;
                        }
                    }
                    Ok(None) => break Exit::Dropped("Connection closed".to_string()),
                    Err(e) => break Exit::Dropped(format!("Error: {}", e)),
                }
            }

            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = conn.send_raw(&frame).await {
                    break Exit::Dropped(format!("Send error: {}", e));
                }
            }

            _ = shutdown.changed() => break Exit::Shutdown,
        }
    };

    // Single cleanup point for every exit path
    handle.mark_disconnected();
    let previous = std::mem::replace(&mut state, SupervisorState::Closed);

    if let SupervisorState::Authenticated { identity } = previous {
        match &exit {
            Exit::Dropped(reason) => {
                tracing::warn!("Connection with '{}' dropped unexpectedly: {}", identity, reason)
            }
            _ => tracing::info!("User '{}' disconnected: {}", identity, exit.reason()),
        }

        ctx.registry.unregister_connection(&identity, handle.id()).await;
        broadcast_user_list(&ctx.registry).await;
        tracing::info!("Cleaned up resources for user '{}'", identity);

        let _ = ctx.events.try_send(ServerEvent::UserLoggedOut {
            identity,
            reason: exit.reason(),
        });
    } else {
        tracing::debug!("Connection from {} closed before login: {}", addr, exit.reason());
    }

    let _ = conn.close().await;
}

/// Apply one inbound frame; `Some` ends the connection
async fn handle_frame(
    ctx: &SupervisorContext,
    handle: &ConnectionHandle,
    state: &mut SupervisorState,
    frame: Frame,
) -> Option<Exit> {
    let Some(kind) = frame.kind() else {
        tracing::debug!(
            "Ignoring unknown message type {:#04x} from {}",
            frame.header.message_type,
            handle.addr()
        );
        return None;
    };

    let payload = match frame.payload() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Dropping packet from {}: {}", handle.addr(), e);
            return None;
        }
    };

    match (&*state, kind) {
        (SupervisorState::AwaitingLogin, MessageType::Login) => {
            let identity = frame.sender().to_string();
            if identity.is_empty() {
                tracing::warn!("Login failed for {}: empty username", handle.addr());
                reject(ctx, handle, identity);
                return Some(Exit::Rejected);
            }

            match ctx.registry.register(&identity, handle.clone()).await {
                Ok(()) => {
                    tracing::info!(
                        "User '{}' logged in successfully from {}",
                        identity,
                        handle.addr()
                    );
                    let _ = ctx.events.try_send(ServerEvent::UserLoggedIn {
                        identity: identity.clone(),
                        addr: handle.addr(),
                    });
                    *state = SupervisorState::Authenticated { identity };
                    broadcast_user_list(&ctx.registry).await;
                    None
                }
                Err(e) => {
                    tracing::warn!("Login failed for {}: {}", handle.addr(), e);
                    reject(ctx, handle, identity);
                    Some(Exit::Rejected)
                }
            }
        }

        (SupervisorState::AwaitingLogin, other) => {
            tracing::debug!("Ignoring {:?} from {} before login", other, handle.addr());
            None
        }

        (SupervisorState::Authenticated { identity }, MessageType::Logout) => {
            tracing::info!("User '{}' initiated a clean logout", identity);
            Some(Exit::Logout)
        }

        (
            SupervisorState::Authenticated { .. },
            MessageType::PingRequest | MessageType::PingResponse,
        ) => {
            match payload.recipient() {
                Some(recipient) => {
                    tracing::info!(
                        "{:?}: forwarding from '{}' to '{}'",
                        kind,
                        frame.sender(),
                        recipient
                    );
                    forward_to(&ctx.registry, recipient, frame.raw).await;
                }
                None => tracing::debug!("{:?} without recipient, dropping", kind),
            }
            None
        }

        (SupervisorState::Authenticated { identity }, other) => {
            tracing::debug!("Ignoring {:?} from '{}' on the control channel", other, identity);
            None
        }

        (SupervisorState::Closed, _) => None,
    }
}

fn reject(ctx: &SupervisorContext, handle: &ConnectionHandle, identity: String) {
    let _ = ctx.events.try_send(ServerEvent::LoginRejected {
        identity,
        addr: handle.addr(),
    });
}
