//! Datagram sender with acknowledgment tracking
//!
//! Every send is recorded in the pending table before it leaves the socket,
//! so a concurrent sweep can never miss it. Resends are byte-identical to
//! the first transmission and keep its sequence number.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use super::{PendingTable, RetransmitPolicy, SequenceCounter};
use crate::protocol::{encode, CodecError, MessageType, Payload};

/// Send errors
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Encoding failed: {0}")]
    Codec(#[from] CodecError),

    #[error("Socket error: {0}")]
    Io(#[from] io::Error),
}

/// Result of one retransmission sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// (sequence, retransmit count) of every resend attempted
    pub retransmitted: Vec<(u32, u32)>,
    /// Sequences given up on
    pub abandoned: Vec<u32>,
}

/// Sender side of the datagram reliability layer
#[derive(Debug)]
pub struct ReliableSender {
    identity: String,
    socket: UdpSocket,
    server_addr: SocketAddr,
    policy: RetransmitPolicy,
    counter: SequenceCounter,
    pending: Mutex<PendingTable>,
}

impl ReliableSender {
    pub fn new(
        identity: impl Into<String>,
        socket: UdpSocket,
        server_addr: SocketAddr,
        policy: RetransmitPolicy,
    ) -> Self {
        Self {
            identity: identity.into(),
            socket,
            server_addr,
            policy,
            counter: SequenceCounter::new(),
            pending: Mutex::new(PendingTable::new()),
        }
    }

    /// Bind an ephemeral socket matching the server's address family
    pub async fn bind(
        identity: impl Into<String>,
        server_addr: SocketAddr,
        policy: RetransmitPolicy,
    ) -> io::Result<Self> {
        let local: SocketAddr = if server_addr.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self::new(identity, socket, server_addr, policy))
    }

    pub fn policy(&self) -> &RetransmitPolicy {
        &self.policy
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sequence, encode, record and transmit one datagram
    pub async fn send(&self, kind: MessageType, payload: &Payload) -> Result<u32, SendError> {
        let sequence = self.counter.next();
        let packet = encode(kind, &self.identity, sequence, payload)?;

        self.pending
            .lock()
            .await
            .record(sequence, packet.clone(), Instant::now());

        if let Err(e) = self.transmit(&packet).await {
            self.pending.lock().await.acknowledge(sequence);
            return Err(e.into());
        }

        tracing::debug!("Sent {:?} #{} to {}", kind, sequence, self.server_addr);
        Ok(sequence)
    }

    /// Retire a pending datagram; `false` for unknown or already retired
    pub async fn acknowledge(&self, sequence: u32) -> bool {
        self.pending.lock().await.acknowledge(sequence)
    }

    /// Resend everything that timed out
    ///
    /// The table lock is released before any socket write.
    pub async fn sweep(&self) -> SweepReport {
        let outcome = {
            let mut pending = self.pending.lock().await;
            if pending.is_empty() {
                return SweepReport::default();
            }
            pending.sweep(Instant::now(), &self.policy)
        };
        if outcome.is_empty() {
            return SweepReport::default();
        }

        let mut report = SweepReport {
            abandoned: outcome.abandoned,
            ..Default::default()
        };

        for (sequence, raw, attempt) in outcome.retransmit {
            tracing::warn!("Packet #{} timed out. Retransmitting...", sequence);
            if let Err(e) = self.transmit(&raw).await {
                tracing::warn!("Retransmission of #{} failed: {}", sequence, e);
            }
            report.retransmitted.push((sequence, attempt));
        }

        for sequence in &report.abandoned {
            tracing::warn!("Packet #{} abandoned after {:?} retransmissions", sequence, self.policy.max_retransmits);
        }

        report
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn transmit(&self, packet: &Bytes) -> io::Result<()> {
        self.socket.send_to(packet, self.server_addr).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_header, MAX_DATAGRAM_SIZE};
    use std::time::Duration;

    fn fast_policy(max: u32) -> RetransmitPolicy {
        RetransmitPolicy::new(Duration::from_millis(100), Duration::from_millis(20), max)
    }

    async fn fake_server() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("datagram expected")
            .unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn test_send_assigns_increasing_sequences() {
        let (server, addr) = fake_server().await;
        let sender = ReliableSender::bind("alice", addr, fast_policy(0)).await.unwrap();

        let first = sender.send(MessageType::BroadcastText, &Payload::broadcast("a")).await.unwrap();
        let second = sender.send(MessageType::BroadcastText, &Payload::broadcast("b")).await.unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(sender.pending_count().await, 2);

        let header = decode_header(&recv(&server).await).unwrap();
        assert_eq!(header.sender, "alice");
        assert_eq!(header.sequence, 1);
    }

    #[tokio::test]
    async fn test_lost_datagram_is_retransmitted_identically() {
        let (server, addr) = fake_server().await;
        let sender = ReliableSender::bind("alice", addr, fast_policy(0)).await.unwrap();

        let sequence = sender
            .send(MessageType::PrivateText, &Payload::private("hi", "bob"))
            .await
            .unwrap();
        // The first copy is "lost": read and ignored
        let original = recv(&server).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        let report = sender.sweep().await;
        assert_eq!(report.retransmitted, vec![(sequence, 1)]);

        let resent = recv(&server).await;
        assert_eq!(resent, original);

        assert!(sender.acknowledge(sequence).await);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sender.sweep().await, SweepReport::default());
        assert!(!sender.acknowledge(sequence).await);
    }

    #[tokio::test]
    async fn test_sweep_before_timeout_is_quiet() {
        let (_server, addr) = fake_server().await;
        let sender = ReliableSender::bind("alice", addr, fast_policy(0)).await.unwrap();
        sender.send(MessageType::BroadcastText, &Payload::broadcast("a")).await.unwrap();

        assert_eq!(sender.sweep().await, SweepReport::default());
        assert_eq!(sender.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_retry_limit_abandons() {
        let (_server, addr) = fake_server().await;
        let sender = ReliableSender::bind("alice", addr, fast_policy(1)).await.unwrap();
        let sequence = sender.send(MessageType::BroadcastText, &Payload::broadcast("a")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(sender.sweep().await.retransmitted, vec![(sequence, 1)]);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(sender.sweep().await.abandoned, vec![sequence]);
        assert_eq!(sender.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_encode_failure_records_nothing() {
        let (_server, addr) = fake_server().await;
        let sender = ReliableSender::bind("a-name-that-is-too-long", addr, fast_policy(0))
            .await
            .unwrap();

        let err = sender.send(MessageType::BroadcastText, &Payload::broadcast("a")).await;
        assert!(matches!(err, Err(SendError::Codec(CodecError::IdentityTooLong(_)))));
        assert_eq!(sender.pending_count().await, 0);
    }
}
