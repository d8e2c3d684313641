//! Per-interface UDP ingress and peer discovery (spec.md §4.B).

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::EndpointConfig;
use crate::error::EndpointError;
use crate::stats::Stats;
use crate::tunnel::Tunnel;

const WG_READ_BUF_LEN: usize = 1500;

/// A single bound, interface-pinned endpoint and its learned peer address.
pub struct Endpoint {
    index: usize,
    socket: UdpSocket,
    peer_addr_tx: watch::Sender<Option<SocketAddr>>,
    peer_addr_rx: watch::Receiver<Option<SocketAddr>>,
}

impl Endpoint {
    pub fn open(index: usize, cfg: &EndpointConfig) -> Result<Self, EndpointError> {
        let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        socket2.set_reuse_address(true)?;

        #[cfg(target_os = "linux")]
        socket2.bind_device(Some(cfg.interface.as_bytes()))?;

        let bind_addr: SocketAddr = format!("0.0.0.0:{}", cfg.port).parse().unwrap();
        socket2.bind(&bind_addr.into())?;
        socket2.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket2.into())?;
        let (peer_addr_tx, peer_addr_rx) = watch::channel(None);

        info!(index, interface = %cfg.interface, port = cfg.port, "endpoint bound");

        Ok(Self {
            index,
            socket,
            peer_addr_tx,
            peer_addr_rx,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn learned_peer(&self) -> Option<SocketAddr> {
        *self.peer_addr_rx.borrow()
    }

    /// Non-blocking send to the learned peer. Returns `Ok(None)` when no
    /// peer has been learned yet, matching `wsocket_sendToPeer`'s `-1`
    /// "not ready" return.
    fn try_send(&self, buf: &[u8]) -> std::io::Result<Option<usize>> {
        match self.learned_peer() {
            Some(addr) => self.socket.try_send_to(buf, addr).map(Some),
            None => Ok(None),
        }
    }

    /// Loops receiving inbound datagrams, decrypting each through `tunnel`
    /// and publishing the first-seen source address as the learned peer.
    pub async fn recv_task(
        self: Arc<Self>,
        tunnel: Arc<Tunnel>,
        endpoints: Arc<EndpointSet>,
        stats: Arc<Stats>,
        cancel: tokio_util::sync::CancellationToken,
        mut on_plaintext: impl FnMut(&[u8], usize) + Send,
    ) {
        let mut buf = vec![0u8; WG_READ_BUF_LEN];
        loop {
            let recvd = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => r,
            };
            match recvd {
                Ok((n, src)) => {
                    if self.peer_addr_tx.borrow().is_none() {
                        let _ = self.peer_addr_tx.send(Some(src));
                        info!(index = self.index, %src, "learned peer address");
                    }
                    tunnel.decrypt(&buf[..n], self.index, &endpoints, &stats, &mut on_plaintext);
                }
                Err(e) => {
                    warn!(index = self.index, error = %e, "recv error");
                    stats.endpoints[self.index].errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// All configured endpoints, addressed by index.
pub struct EndpointSet {
    endpoints: Vec<Arc<Endpoint>>,
}

impl EndpointSet {
    pub fn open(cfgs: &[EndpointConfig]) -> Result<Self, EndpointError> {
        let endpoints = cfgs
            .iter()
            .enumerate()
            .map(|(i, cfg)| Endpoint::open(i, cfg).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { endpoints })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Arc<Endpoint> {
        self.endpoints[index].clone()
    }

    /// Sends `buf` to every ready endpoint's learned peer, skipping any
    /// endpoint that hasn't learned a peer yet. Accounts for estimated
    /// IPv4/UDP overhead in `bytes_out`.
    pub fn send_to_all(&self, buf: &[u8], stats: &Stats) {
        for ep in &self.endpoints {
            match ep.try_send(buf) {
                Ok(Some(_)) => {
                    stats.endpoints[ep.index]
                        .bytes_out
                        .fetch_add(buf.len() as u64 + 28, Ordering::Relaxed);
                }
                Ok(None) => {} // endpoint hasn't learned a peer yet
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    stats.endpoints[ep.index].send_congestion.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(index = ep.index, error = %e, "send error");
                    stats.endpoints[ep.index].errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}
