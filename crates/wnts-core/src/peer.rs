// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{SyncError, TransportError};
use crate::queue::MessageSink;
use crate::wire::{write_frame, FrameDecoder, Message};

/// Poll granularity of the read loop; stop requests are observed within
/// this bound.
pub const READ_POLL: Duration = Duration::from_millis(100);

/// Default retry count for [`Peer::connect`] (0 retries forever).
pub const CONNECT_RETRIES: u32 = 3;

/// Default delay between connect attempts.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Where a peer's reader hands complete frames. Implemented by the peer
/// manager's router; a `Weak` reference keeps readers from pinning it.
#[async_trait]
pub trait FrameRouter: Send + Sync {
    async fn route_frame(&self, frame: Vec<u8>, from: IpAddr);
}

/// One directly connected remote: the write half of its socket, the
/// reader task, and the cached remote address.
pub struct Peer {
    remote_ip: IpAddr,
    /// Port this peer can be re-dialed on (the dialed port for outbound
    /// peers, the shared service port for accepted ones).
    redial_port: u16,
    writer: Mutex<OwnedWriteHalf>,
    stop: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
}

impl Peer {
    /// Take ownership of a connected stream and spawn its read loop.
    pub fn spawn(
        stream: TcpStream,
        remote_ip: IpAddr,
        redial_port: u16,
        router: Weak<dyn FrameRouter>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (stop, stop_rx) = watch::channel(false);
        let reader = tokio::spawn(read_loop(read_half, remote_ip, router, sink, stop_rx));
        Self {
            remote_ip,
            redial_port,
            writer: Mutex::new(write_half),
            stop,
            reader: Some(reader),
        }
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_ip
    }

    pub fn redial_port(&self) -> u16 {
        self.redial_port
    }

    /// Write one framed message: length prefix, then the body, atomically
    /// with respect to other senders (the per-peer writer lock).
    pub async fn send(&self, body: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, body).await
    }

    /// Cooperatively stop and join the reader before the socket goes
    /// away. Must complete before the peer is dropped mid-session so the
    /// reader never touches a retired socket.
    pub async fn stop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }

    /// Dial `ip:port` from the local overlay address, retrying up to
    /// `retries` times (0 retries without bound) with `delay` between
    /// attempts.
    pub async fn connect(
        local_ip: IpAddr,
        ip: IpAddr,
        port: u16,
        retries: u32,
        delay: Duration,
    ) -> Result<TcpStream, SyncError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match dial(local_ip, ip, port).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!(%ip, port, attempts, %err, "connect attempt failed");
                    if retries != 0 && attempts >= retries {
                        return Err(SyncError::ConnectFailed { ip, port, attempts });
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

async fn dial(local_ip: IpAddr, ip: IpAddr, port: u16) -> std::io::Result<TcpStream> {
    let socket = match ip {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    // Bind the outgoing socket to the overlay address so the remote sees
    // this node's identity, not whatever source the OS would pick.
    if !local_ip.is_unspecified() && local_ip.is_ipv4() == ip.is_ipv4() {
        socket.bind(SocketAddr::new(local_ip, 0))?;
    }
    socket.connect(SocketAddr::new(ip, port)).await
}

/// Per-peer read loop: a two-state framing machine fed by bounded reads.
/// Terminal link errors synthesize a local `LinkLost` and retire the
/// peer; transient errors are logged and the loop continues.
async fn read_loop(
    mut read_half: OwnedReadHalf,
    remote_ip: IpAddr,
    router: Weak<dyn FrameRouter>,
    sink: Arc<dyn MessageSink>,
    mut stop: watch::Receiver<bool>,
) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        if *stop.borrow() {
            return;
        }
        tokio::select! {
            _ = stop.changed() => return,
            read = tokio::time::timeout(READ_POLL, read_half.read(&mut chunk)) => {
                let read = match read {
                    // Poll window elapsed with no data; go observe stop.
                    Err(_) => continue,
                    Ok(read) => read,
                };
                match read {
                    Ok(0) => {
                        debug!(%remote_ip, "peer closed the stream");
                        sink.enqueue(Message::link_lost(remote_ip));
                        return;
                    }
                    Ok(n) => {
                        decoder.extend(&chunk[..n]);
                        loop {
                            match decoder.next_frame() {
                                Ok(Some(frame)) => {
                                    let Some(router) = router.upgrade() else { return };
                                    router.route_frame(frame, remote_ip).await;
                                }
                                Ok(None) => break,
                                Err(err) => {
                                    // A bogus length prefix means the
                                    // stream is desynchronized beyond
                                    // repair; retire the link.
                                    error!(%remote_ip, %err, "frame stream desynchronized");
                                    sink.enqueue(Message::link_lost(remote_ip));
                                    return;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        let classified = TransportError::classify(err);
                        if classified.is_link_loss() {
                            debug!(%remote_ip, %classified, "link lost");
                            sink.enqueue(Message::link_lost(remote_ip));
                            return;
                        }
                        warn!(%remote_ip, %classified, "transient read error");
                    }
                }
            }
        }
    }
}
