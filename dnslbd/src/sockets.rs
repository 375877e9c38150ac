//! Socket records and readiness fan-in.
//!
//! Every worker owns reuseport siblings of each frontend socket plus two
//! disjoint sets of connected forwarder sockets (regular forwarding and
//! watchdog probing), so no socket is ever shared between workers.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::future::select_all;
use once_cell::sync::OnceCell;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// A client-facing listen endpoint plus the forwarders it balances across.
pub struct Frontend {
    pub name: String,
    listen: SocketAddr,
    bound: OnceCell<SocketAddr>,
    forwarders: Vec<usize>,
}

impl Frontend {
    pub fn new(name: String, listen: SocketAddr, forwarders: Vec<usize>) -> Self {
        Self {
            name,
            listen,
            bound: OnceCell::new(),
            forwarders,
        }
    }

    /// The effective address: the configured one, or the kernel-resolved
    /// address once the first socket is bound (port-zero listeners).
    pub fn addr(&self) -> SocketAddr {
        self.bound.get().copied().unwrap_or(self.listen)
    }

    pub fn set_bound(&self, addr: SocketAddr) {
        let _ = self.bound.set(addr);
    }

    /// Whether this frontend balances across the given forwarder index.
    pub fn balances(&self, fwd_index: usize) -> bool {
        self.forwarders.contains(&fwd_index)
    }
}

/// One worker's reuseport share of a frontend.
pub struct FrontendSocket {
    pub sock: UdpSocket,
    pub frontend: Arc<Frontend>,
}

/// A connected socket aimed at one forwarder.
pub struct ForwarderSocket {
    pub sock: UdpSocket,
    pub forwarder: Arc<crate::upstream::Forwarder>,
    /// Forwarder index within the owning context.
    pub index: usize,
}

/// Bind a UDP socket with SO_REUSEPORT so every worker can own its share
/// of the same frontend address.
pub fn bind_reuseport(addr: SocketAddr) -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    #[cfg(unix)]
    sock.set_reuse_port(true)?;
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;
    UdpSocket::from_std(sock.into())
}

/// Open a connected socket towards one forwarder.
pub async fn connect_forwarder(
    forwarder: &Arc<crate::upstream::Forwarder>,
    index: usize,
) -> io::Result<ForwarderSocket> {
    let local = match forwarder.addr {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };
    let sock = UdpSocket::bind(local).await?;
    sock.connect(forwarder.addr).await?;
    Ok(ForwarderSocket {
        sock,
        forwarder: Arc::clone(forwarder),
        index,
    })
}

/// Wait for one datagram on any socket of a frontend set.
///
/// Cancel-safe: each inner receive either yields a whole datagram or
/// nothing, so dropping the future between wakes loses no data.
pub async fn recv_from_any(
    socks: Vec<Arc<FrontendSocket>>,
    max_pkt: usize,
) -> (Arc<FrontendSocket>, io::Result<(BytesMut, SocketAddr)>) {
    debug_assert!(!socks.is_empty());
    let futs = socks
        .into_iter()
        .map(|s| {
            Box::pin(async move {
                let mut buf = BytesMut::zeroed(max_pkt);
                let res = s.sock.recv_from(&mut buf).await.map(|(n, peer)| {
                    buf.truncate(n);
                    (buf, peer)
                });
                (s, res)
            })
        })
        .collect::<Vec<_>>();
    let (out, _, _) = select_all(futs).await;
    out
}

/// Wait for one datagram on any connected forwarder socket.
pub async fn recv_any(
    socks: Vec<Arc<ForwarderSocket>>,
    max_pkt: usize,
) -> (Arc<ForwarderSocket>, io::Result<BytesMut>) {
    debug_assert!(!socks.is_empty());
    let futs = socks
        .into_iter()
        .map(|s| {
            Box::pin(async move {
                let mut buf = BytesMut::zeroed(max_pkt);
                let res = s.sock.recv(&mut buf).await.map(|n| {
                    buf.truncate(n);
                    buf
                });
                (s, res)
            })
        })
        .collect::<Vec<_>>();
    let (out, _, _) = select_all(futs).await;
    out
}
