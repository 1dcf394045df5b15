// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::peer::{FrameRouter, Peer, CONNECT_RETRIES, CONNECT_RETRY_DELAY};
use crate::queue::{MessageQueue, MessageSink, ResendCache};
use crate::wire::{is_self_addr, Message, PeerEntry, BROADCAST, LOOPBACK};

/// Poll granularity of the accept loop.
pub const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Capability the message processor holds on the connection graph:
/// identity, outbound sends, peer retirement with gateway failover, and
/// the mesh bookkeeping adopted from `Connect`/`Disconnect` messages.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    fn self_ip(&self) -> IpAddr;

    fn managed_paths(&self) -> Vec<PathBuf>;

    /// Stamp, serialize, route, and record `msg`. The unspecified
    /// destination broadcasts; `broadcast_to_self` additionally delivers
    /// the message to the local queue.
    async fn send(
        &self,
        msg: Message,
        destination: IpAddr,
        broadcast_to_self: bool,
    ) -> anyhow::Result<()>;

    /// Remove the peer whose remote address is `ip`, promoting a backup
    /// to gateway when the gateway itself was lost. Returns the removed
    /// address, or `None` when no such peer existed.
    async fn retire_peer(&self, ip: IpAddr) -> Option<IpAddr>;

    /// Adopt the mesh view offered in a `Connect` message.
    async fn adopt_mesh(&self, backup_peers: Vec<PeerEntry>, managed_paths: Vec<PathBuf>);

    /// Forget a disconnected node as a failover candidate.
    async fn drop_backup(&self, ip: IpAddr);
}

#[derive(Debug, Default)]
struct GatewayState {
    /// The peer this node entered the mesh through; `None` when
    /// bootstrapping or between failovers.
    gateway_ip: Option<IpAddr>,
    /// Ordered failover candidates. Exactly one is promoted at a time.
    backup_peers: Vec<PeerEntry>,
}

/// Owner of the connection graph: the peer list under a read/write lock,
/// the accept loop, the gateway pointer, and every outbound serialization.
pub struct PeerManager {
    self_weak: Weak<PeerManager>,
    self_ip: IpAddr,
    service_port: u16,
    peers: RwLock<Vec<Peer>>,
    gateway: StdMutex<GatewayState>,
    managed: StdMutex<Vec<PathBuf>>,
    sink: Arc<MessageQueue>,
    sent_cache: Arc<StdMutex<ResendCache>>,
    stop: watch::Sender<bool>,
    accept: StdMutex<Option<JoinHandle<()>>>,
}

impl PeerManager {
    /// Bind the listener on the overlay address and spawn the accept
    /// loop. `port` 0 picks an ephemeral port (tests); the bound port
    /// becomes the advertised service port.
    pub async fn start(
        self_ip: IpAddr,
        port: u16,
        managed: Vec<PathBuf>,
        sink: Arc<MessageQueue>,
        sent_cache: Arc<StdMutex<ResendCache>>,
    ) -> anyhow::Result<Arc<Self>> {
        let listener = TcpListener::bind(SocketAddr::new(self_ip, port)).await?;
        let service_port = listener.local_addr()?.port();
        let (stop, stop_rx) = watch::channel(false);

        let manager = Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            self_ip,
            service_port,
            peers: RwLock::new(Vec::new()),
            gateway: StdMutex::new(GatewayState::default()),
            managed: StdMutex::new(managed),
            sink,
            sent_cache,
            stop,
            accept: StdMutex::new(None),
        });

        let accept = tokio::spawn(manager.clone().accept_loop(listener, stop_rx));
        *manager.accept.lock().expect("accept mutex") = Some(accept);
        info!(%self_ip, service_port, "listening for peers");
        Ok(manager)
    }

    pub fn service_port(&self) -> u16 {
        self.service_port
    }

    pub fn gateway_ip(&self) -> Option<IpAddr> {
        self.gateway.lock().expect("gateway mutex").gateway_ip
    }

    pub fn backup_peers(&self) -> Vec<PeerEntry> {
        self.gateway
            .lock()
            .expect("gateway mutex")
            .backup_peers
            .clone()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Join an existing mesh through `ip:port`; the peer goes to the
    /// front of the list and becomes the gateway.
    pub async fn connect_gateway(&self, ip: IpAddr, port: u16) -> Result<(), SyncError> {
        let stream =
            Peer::connect(self.self_ip, ip, port, CONNECT_RETRIES, CONNECT_RETRY_DELAY).await?;
        let peer = Peer::spawn(stream, ip, port, self.router_weak(), self.sink.clone());
        self.peers.write().await.insert(0, peer);
        self.gateway.lock().expect("gateway mutex").gateway_ip = Some(ip);
        info!(gateway = %ip, port, "joined mesh");
        Ok(())
    }

    /// Stop the accept loop and retire every peer. Run before the message
    /// manager shuts down so nothing new arrives.
    pub async fn stop(&self) {
        let _ = self.stop.send(true);
        let accept = self.accept.lock().expect("accept mutex").take();
        if let Some(handle) = accept {
            let _ = handle.await;
        }
        let mut peers = std::mem::take(&mut *self.peers.write().await);
        for peer in &mut peers {
            peer.stop().await;
        }
    }

    fn router_weak(&self) -> Weak<dyn FrameRouter> {
        self.self_weak.clone()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                return;
            }
            tokio::select! {
                _ = stop.changed() => return,
                accepted = tokio::time::timeout(ACCEPT_POLL, listener.accept()) => {
                    let Ok(accepted) = accepted else { continue };
                    match accepted {
                        Ok((stream, addr)) => self.admit(stream, addr).await,
                        Err(err) => warn!(%err, "accept failed"),
                    }
                }
            }
        }
    }

    /// Welcome an inbound peer: offer it the current peers as backups,
    /// hand it the managed folders, and queue an initial-state sync in
    /// its name. The write lock is released before sending — `send`
    /// takes the read lock.
    async fn admit(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let remote_ip = addr.ip();
        let (backup_offer, managed) = {
            let mut peers = self.peers.write().await;
            let offer: Vec<PeerEntry> = peers
                .iter()
                .map(|p| PeerEntry {
                    ip: p.remote_ip(),
                    port: p.redial_port(),
                })
                .collect();
            peers.push(Peer::spawn(
                stream,
                remote_ip,
                self.service_port,
                self.router_weak(),
                self.sink.clone(),
            ));
            (offer, self.managed.lock().expect("managed mutex").clone())
        };
        info!(%remote_ip, "accepted peer");

        let connect = Message::connect(backup_offer, managed);
        if let Err(err) = self.send_to(connect, remote_ip, false).await {
            warn!(%remote_ip, %err, "failed to send connect message");
        }

        let mut request = Message::initial_sync_request();
        request.header.receiver = LOOPBACK;
        request.header.originator = remote_ip;
        request.seal();
        self.sink.enqueue(request);
    }

    /// Stamp routing fields, serialize once, route, and keep the sealed
    /// message for future resend requests.
    pub async fn send_to(
        &self,
        mut msg: Message,
        destination: IpAddr,
        broadcast_to_self: bool,
    ) -> anyhow::Result<()> {
        msg.header.receiver = destination;
        msg.header.sender = self.self_ip;
        if msg.header.originator.is_unspecified() {
            msg.header.originator = self.self_ip;
        }
        msg.seal();
        let frame = msg.encode()?;
        let src = if broadcast_to_self { BROADCAST } else { LOOPBACK };
        self.route(&frame, &msg, src).await;
        self.sent_cache
            .lock()
            .expect("sent cache mutex")
            .push(msg);
        Ok(())
    }

    /// Pure routing. `src` is excluded from fan-out and suppresses local
    /// delivery when it names this node.
    async fn route(&self, frame: &[u8], msg: &Message, src: IpAddr) {
        let dst = msg.header.receiver;
        if is_self_addr(dst) || dst == self.self_ip {
            self.sink.enqueue(msg.clone());
            return;
        }
        if dst.is_unspecified() {
            self.fanout(frame, src).await;
            if !is_self_addr(src) && src != self.self_ip {
                self.sink.enqueue(msg.clone());
            }
            return;
        }
        let delivered = {
            let peers = self.peers.read().await;
            match peers.iter().find(|p| p.remote_ip() == dst) {
                Some(peer) => {
                    if let Err(err) = peer.send(frame).await {
                        warn!(peer = %dst, %err, "direct send failed");
                    }
                    true
                }
                None => false,
            }
        };
        if !delivered {
            // No direct link to the destination: flood and let the mesh
            // carry it.
            self.fanout(frame, src).await;
        }
    }

    async fn fanout(&self, frame: &[u8], except: IpAddr) {
        let peers = self.peers.read().await;
        for peer in peers.iter().filter(|p| p.remote_ip() != except) {
            if let Err(err) = peer.send(frame).await {
                warn!(peer = %peer.remote_ip(), %err, "broadcast send failed");
            }
        }
    }
}

#[async_trait]
impl FrameRouter for PeerManager {
    async fn route_frame(&self, frame: Vec<u8>, from: IpAddr) {
        let mut msg = match Message::decode(&frame) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%from, %err, "dropping unroutable frame");
                return;
            }
        };
        if msg.header.sender.is_unspecified() {
            msg.header.sender = from;
        }
        self.route(&frame, &msg, from).await;
    }
}

#[async_trait]
impl PeerDirectory for PeerManager {
    fn self_ip(&self) -> IpAddr {
        self.self_ip
    }

    fn managed_paths(&self) -> Vec<PathBuf> {
        self.managed.lock().expect("managed mutex").clone()
    }

    async fn send(
        &self,
        msg: Message,
        destination: IpAddr,
        broadcast_to_self: bool,
    ) -> anyhow::Result<()> {
        self.send_to(msg, destination, broadcast_to_self).await
    }

    async fn retire_peer(&self, ip: IpAddr) -> Option<IpAddr> {
        let mut peers = self.peers.write().await;
        let index = peers.iter().position(|p| p.remote_ip() == ip)?;
        let mut retired = peers.remove(index);

        let was_gateway = self.gateway.lock().expect("gateway mutex").gateway_ip == Some(ip);
        if was_gateway {
            self.gateway.lock().expect("gateway mutex").gateway_ip = None;
            // Walk the backups in order; each candidate leaves the list
            // whether or not it answers, so an exhausted walk leaves the
            // list empty rather than full of known-dead entries.
            loop {
                let entry = {
                    let mut gateway = self.gateway.lock().expect("gateway mutex");
                    if gateway.backup_peers.is_empty() {
                        break;
                    }
                    gateway.backup_peers.remove(0)
                };
                if entry.ip.is_unspecified() {
                    continue;
                }
                match Peer::connect(
                    self.self_ip,
                    entry.ip,
                    entry.port,
                    CONNECT_RETRIES,
                    CONNECT_RETRY_DELAY,
                )
                .await
                {
                    Ok(stream) => {
                        peers.insert(
                            0,
                            Peer::spawn(
                                stream,
                                entry.ip,
                                entry.port,
                                self.router_weak(),
                                self.sink.clone(),
                            ),
                        );
                        self.gateway.lock().expect("gateway mutex").gateway_ip = Some(entry.ip);
                        info!(gateway = %entry.ip, "promoted backup to gateway");
                        break;
                    }
                    Err(err) => {
                        debug!(backup = %entry.ip, %err, "backup unreachable, trying next");
                        continue;
                    }
                }
            }
        }
        drop(peers);

        // The write lock is gone; joining the retired reader is safe now.
        retired.stop().await;
        Some(ip)
    }

    async fn adopt_mesh(&self, backup_peers: Vec<PeerEntry>, managed_paths: Vec<PathBuf>) {
        self.gateway.lock().expect("gateway mutex").backup_peers = backup_peers;
        *self.managed.lock().expect("managed mutex") = managed_paths;
    }

    async fn drop_backup(&self, ip: IpAddr) {
        self.gateway
            .lock()
            .expect("gateway mutex")
            .backup_peers
            .retain(|b| b.ip != ip);
    }
}
