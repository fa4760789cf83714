//! The shared, refcounted L2CAP transport handle.
//!
//! Opens an L2CAP connection to the peer: the fixed ATT channel (CID
//! `0x0004`) when no PSM is given, a dynamic PSM otherwise. The transport is
//! wrapped in an [`Arc`]; cloning a [`TransportHandle`] is the only way to
//! acquire a reference, and dropping the last clone closes the channel —
//! there is no explicit `release()`/`unref()` to forget to call (§9
//! "Refcount discipline → ownership").

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::{
    l2cap::{SeqPacket, Security, SecurityLevel, SocketAddr},
    Address, AddressType, Error, ErrorKind, Result,
};

/// What [`crate::escalator::with_escalation`] needs from a transport: the
/// ability to raise its security level. An `async fn` trait expressed as
/// boxed futures, matching [`crate::cache::CacheStore`] — the escalator is
/// generic over this instead of `TransportHandle` directly so its retry
/// bookkeeping can be driven by a test double instead of a live L2CAP
/// socket.
pub trait SecurityGate: Send + Sync {
    /// Raises this transport's security level.
    fn set_security<'a>(&'a self, level: SecurityLevel) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

impl SecurityGate for TransportHandle {
    fn set_security<'a>(&'a self, level: SecurityLevel) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { self.set_security(level).await })
    }
}

/// Fixed ATT channel identifier, used when no dynamic PSM is supplied.
pub const ATT_CID: u16 = 0x0004;

struct TransportInner {
    socket: AsyncMutex<SeqPacket>,
    peer_addr: Address,
}

/// A reference to the shared transport for one peer connection.
///
/// Clone to acquire a reference for the duration of an operation; drop when
/// done. The underlying socket closes once the last clone is dropped.
#[derive(Clone)]
pub struct TransportHandle(Arc<TransportInner>);

impl TransportHandle {
    /// Opens an L2CAP connection to `peer_addr`. `psm` selects a dynamic
    /// PSM; `None` uses the fixed ATT CID. `security` is the initial
    /// security level (`Config::initial_security`, normally `LOW`).
    pub async fn connect(
        peer_addr: Address, addr_type: AddressType, psm: Option<u16>, security: SecurityLevel,
    ) -> Result<Self> {
        let sa = match psm {
            Some(psm) => SocketAddr::new(peer_addr, addr_type, psm),
            // The fixed ATT channel is addressed via `cid`, not `psm`.
            None => SocketAddr { addr: peer_addr, addr_type, psm: 0, cid: ATT_CID },
        };
        let socket = SeqPacket::connect(sa).await.map_err(|err| {
            Error::with_message(ErrorKind::TransportFailure("L2CAP connect failed".into()), err.to_string())
        })?;
        socket
            .as_ref()
            .set_security(Security { level: security, key_size: 0 })
            .map_err(|err| Error::with_message(ErrorKind::TransportFailure("set_security failed".into()), err.to_string()))?;
        Ok(Self(Arc::new(TransportInner { socket: AsyncMutex::new(socket), peer_addr })))
    }

    /// Wraps an already-connected [`SeqPacket`] (the caller pre-opened the
    /// transport; see §6's "pre-opened transport (optional)" input).
    pub fn from_socket(socket: SeqPacket, peer_addr: Address) -> Self {
        Self(Arc::new(TransportInner { socket: AsyncMutex::new(socket), peer_addr }))
    }

    /// Peer address this transport is connected to.
    pub fn peer_addr(&self) -> Address {
        self.0.peer_addr
    }

    /// Current L2CAP socket security level.
    pub async fn security(&self) -> Result<SecurityLevel> {
        let socket = self.0.socket.lock().await;
        Ok(socket.as_ref().security()?.level)
    }

    /// Raises the socket's security level. Used exclusively by the
    /// escalator (§4.4); nothing else should call this.
    pub async fn set_security(&self, level: SecurityLevel) -> Result<()> {
        let socket = self.0.socket.lock().await;
        socket
            .as_ref()
            .set_security(Security { level, key_size: 0 })
            .map_err(|err| Error::with_message(ErrorKind::TransportFailure("set_security failed".into()), err.to_string()))
    }

    /// Sends one raw ATT PDU.
    pub async fn send(&self, pdu: &[u8]) -> Result<()> {
        let socket = self.0.socket.lock().await;
        socket.send(pdu).await.map_err(|err| {
            Error::with_message(ErrorKind::TransportFailure("L2CAP send failed".into()), err.to_string())
        })?;
        Ok(())
    }

    /// Receives one raw ATT PDU. L2CAP sequential-packet sockets preserve
    /// message boundaries, so one `recv` call yields exactly one PDU.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let socket = self.0.socket.lock().await;
        socket.recv(buf).await.map_err(|err| {
            Error::with_message(ErrorKind::TransportFailure("L2CAP recv failed".into()), err.to_string())
        })
    }

    /// Number of live references to this transport (operations + watchers
    /// holding a clone). Used by tests to check the refcount invariant in
    /// §8; not meant for control flow.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}
