//! Multicast channels: one receive loop per group, one sender draining the dispatch queue.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peabak_core::{decode, encode, Message};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Semaphore};

use crate::config::PeerConfig;
use crate::dispatch::{route, ChannelKind};
use crate::peer::Peer;

/// Largest UDP payload; anything the codec accepts fits.
const RECV_BUF: usize = 65_536;

/// Group address of each channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Groups {
    pub control: SocketAddrV4,
    pub backup: SocketAddrV4,
    pub restore: SocketAddrV4,
}

impl Groups {
    pub fn addr(&self, kind: ChannelKind) -> SocketAddrV4 {
        match kind {
            ChannelKind::Control => self.control,
            ChannelKind::Backup => self.backup,
            ChannelKind::Restore => self.restore,
        }
    }
}

impl From<&PeerConfig> for Groups {
    fn from(c: &PeerConfig) -> Self {
        Self {
            control: c.control,
            backup: c.backup,
            restore: c.restore,
        }
    }
}

/// Socket bound to the group's port and joined to the group. Address reuse
/// lets several peers share one host.
pub fn bind_group(group: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
    socket.bind(&SocketAddr::V4(bind).into())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Unbound socket for outbound datagrams to any group.
pub fn sender_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Receive until `stop` is set. Every read is bounded by `read_timeout` so the
/// flag is observed. Handlers run as tasks; `inflight` bounds how many.
pub async fn run_receiver(
    kind: ChannelKind,
    socket: UdpSocket,
    peer: Arc<Peer>,
    stop: Arc<AtomicBool>,
    read_timeout: Duration,
    inflight: Arc<Semaphore>,
) {
    let mut buf = vec![0u8; RECV_BUF];
    let own_id = peer.id();
    while !stop.load(Ordering::Relaxed) {
        let (n, from) = match tokio::time::timeout(read_timeout, socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                tracing::warn!(channel = kind.name(), error = %e, "receive failed");
                continue;
            }
            Ok(Ok(v)) => v,
        };
        let msg = match decode(&buf[..n]) {
            Ok(msg) => msg.with_origin(from),
            Err(e) => {
                tracing::warn!(channel = kind.name(), %from, len = n, error = %e, "dropping malformed datagram");
                continue;
            }
        };
        if msg.sender_id == own_id {
            continue;
        }
        let Ok(permit) = inflight.clone().acquire_owned().await else {
            break;
        };
        let peer = peer.clone();
        tokio::spawn(async move {
            peer.handle_message(msg).await;
            drop(permit);
        });
    }
    tracing::debug!(channel = kind.name(), "receiver stopped");
}

/// Drain the dispatch queue, writing each message to its channel's group.
pub async fn run_sender(mut rx: mpsc::Receiver<Message>, socket: UdpSocket, groups: Groups) {
    while let Some(msg) = rx.recv().await {
        let kind = route(&msg);
        let dest = groups.addr(kind);
        let bytes = encode(&msg);
        match socket.send_to(&bytes, dest).await {
            Ok(_) => tracing::debug!(channel = kind.name(), msg_type = %msg.message_type(), len = bytes.len(), "sent"),
            Err(e) => tracing::warn!(channel = kind.name(), %dest, error = %e, "send failed"),
        }
    }
}
