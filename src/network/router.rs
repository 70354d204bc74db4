//! Datagram router
//!
//! Single receive loop over the server's UDP endpoint. Text datagrams are
//! re-sent byte for byte over the recipients' control channels and
//! acknowledged to the sender over its own control channel.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use super::registry::SessionRegistry;
use super::server::{deliver, forward_to, send_ack};
use crate::protocol::{Frame, MessageType, MAX_DATAGRAM_SIZE};

/// What the router did with one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum RouteOutcome {
    Dropped(&'static str),
    Broadcast { delivered: usize, acked: bool },
    Private { delivered: bool, acked: bool },
}

/// Receive datagrams until shutdown
pub(super) async fn run(
    socket: UdpSocket,
    registry: Arc<SessionRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, from)) => {
                        if let RouteOutcome::Dropped(reason) = route(&registry, &buf[..n], from).await {
                            tracing::debug!("Dropped datagram from {}: {}", from, reason);
                        }
                    }
                    Err(e) => tracing::error!("Error in UDP handler: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!("Datagram router stopped");
}

/// Route one datagram
pub(super) async fn route(
    registry: &SessionRegistry,
    datagram: &[u8],
    from: SocketAddr,
) -> RouteOutcome {
    let frame = match Frame::from_datagram(datagram) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("Malformed datagram from {}: {}", from, e);
            return RouteOutcome::Dropped("malformed header");
        }
    };

    let payload = match frame.payload() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Unparseable datagram payload from {}: {}", from, e);
            return RouteOutcome::Dropped("unparseable payload");
        }
    };

    let sender = frame.sender().to_string();
    let sequence = frame.sequence();
    if !registry.update_datagram_address(&sender, from).await {
        tracing::debug!("Datagram from unregistered identity '{}' at {}", sender, from);
    }

    let Some(kind) = frame.kind().filter(|kind| kind.is_datagram()) else {
        return RouteOutcome::Dropped("not a datagram message type");
    };

    if kind == MessageType::BroadcastText {
        tracing::info!(
            "Received public UDP message (Seq:{}) from '{}', forwarding",
            sequence,
            sender
        );
        let mut delivered = 0;
        for (identity, handle) in registry.handles_except(&sender).await {
            if deliver(&identity, &handle, frame.raw.clone()) {
                delivered += 1;
            }
        }
        let acked = send_ack(registry, &sender, sequence).await;
        return RouteOutcome::Broadcast { delivered, acked };
    }

    let Some(recipient) = payload.recipient().filter(|r| !r.is_empty()) else {
        return RouteOutcome::Dropped("private text without recipient");
    };
    tracing::info!(
        "Received private UDP message (Seq:{}) from '{}' to '{}', forwarding",
        sequence,
        sender,
        recipient
    );
    let delivered = forward_to(registry, recipient, frame.raw.clone()).await;
    // The ACK confirms server receipt, not delivery
    let acked = send_ack(registry, &sender, sequence).await;
    RouteOutcome::Private { delivered, acked }
}
