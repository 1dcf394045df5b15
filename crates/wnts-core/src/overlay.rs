// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The overlay-network seam. The runtime behind it supplies remotely
//! addressable stream endpoints and reports lifecycle events; `setup`
//! polls the event-driven flags until the node is online and the service
//! network is joined, mirroring how the original waited on its virtual
//! network. The shipped runtime (`LanOverlay`) stands on the host
//! network directly.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tracing::{debug, info};

use crate::error::SyncError;

/// Poll interval while waiting to come online.
const ONLINE_POLL: Duration = Duration::from_millis(100);

/// Poll interval while waiting for the service network join.
const JOIN_POLL: Duration = Duration::from_secs(1);

/// Give up on the runtime after this long without the expected events.
const SETUP_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayEvent {
    Online,
    Offline,
    AddressReady(IpAddr),
    NetworkReady,
    NetworkDown,
}

/// Contract the overlay runtime must satisfy: start delivering events
/// into the channel (at minimum `Online`, `AddressReady`, and
/// `NetworkReady` once the node is reachable), and stop on demand.
pub trait OverlayRuntime: Send {
    fn start(&mut self, events: Sender<OverlayEvent>) -> Result<(), SyncError>;
    fn stop(&mut self);
}

/// Overlay runtime backed by the plain host network: the "overlay"
/// address is a routable local interface address (or a configured
/// override), and admission control is left to the surrounding network.
#[derive(Debug, Default)]
pub struct LanOverlay {
    bind_ip: Option<IpAddr>,
}

impl LanOverlay {
    pub fn new(bind_ip: Option<IpAddr>) -> Self {
        Self { bind_ip }
    }
}

impl OverlayRuntime for LanOverlay {
    fn start(&mut self, events: Sender<OverlayEvent>) -> Result<(), SyncError> {
        let ip = match self.bind_ip {
            Some(ip) => ip,
            None => discover_local_ip()?,
        };
        // The host network is already up, so the full event sequence is
        // delivered immediately.
        let _ = events.send(OverlayEvent::Online);
        let _ = events.send(OverlayEvent::AddressReady(ip));
        let _ = events.send(OverlayEvent::NetworkReady);
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Pick the local address a routed packet would leave from. The UDP
/// connect never sends anything; it only asks the kernel for a route.
fn discover_local_ip() -> Result<IpAddr, SyncError> {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(("192.0.2.1", 9))?;
        Ok(socket.local_addr()?.ip())
    };
    let ip = probe().map_err(|err| {
        SyncError::OverlayUnavailable(format!("no routable local address: {err}"))
    })?;
    if ip.is_unspecified() || ip.is_loopback() {
        return Err(SyncError::OverlayUnavailable(
            "no routable local address (configure one explicitly)".into(),
        ));
    }
    Ok(ip)
}

/// The node's stable identity on disk: an Ed25519 keypair created on
/// first run. Replication itself does not sign messages (authentication
/// beyond overlay admission is out of scope); the blob anchors the
/// node's identity across restarts.
pub struct NodeIdentity {
    signing_key: SigningKey,
    path: PathBuf,
}

impl NodeIdentity {
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let bytes = fs::read(path)?;
            let key_bytes: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("identity blob at {} is malformed", path.display()))?;
            return Ok(Self {
                signing_key: SigningKey::from_bytes(&key_bytes),
                path: path.to_path_buf(),
            });
        }
        let mut rng = OsRng;
        let signing_key = SigningKey::generate(&mut rng);
        fs::write(path, signing_key.to_bytes())?;
        Ok(Self {
            signing_key,
            path: path.to_path_buf(),
        })
    }

    /// Hex form of the verifying key, logged at startup.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Wrapper owning the overlay runtime, its event flags, and the joined
/// address.
pub struct OverlayNode {
    runtime: Box<dyn OverlayRuntime>,
    events: Receiver<OverlayEvent>,
    online: bool,
    networks_joined: i32,
    ip: Option<IpAddr>,
    identity: NodeIdentity,
}

impl std::fmt::Debug for OverlayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayNode")
            .field("online", &self.online)
            .field("networks_joined", &self.networks_joined)
            .field("ip", &self.ip)
            .finish()
    }
}

impl OverlayNode {
    /// Start the runtime and block until the node is online and the
    /// service network is joined. Fails with `OverlayUnavailable` when
    /// the runtime cannot start or never becomes ready.
    pub async fn setup(
        mut runtime: Box<dyn OverlayRuntime>,
        identity_path: &Path,
    ) -> anyhow::Result<Self> {
        let identity = NodeIdentity::load_or_create(identity_path)?;
        info!(fingerprint = %identity.fingerprint(), "node identity loaded");

        let (tx, rx) = std::sync::mpsc::channel();
        runtime.start(tx)?;

        let mut node = Self {
            runtime,
            events: rx,
            online: false,
            networks_joined: 0,
            ip: None,
            identity,
        };

        let deadline = tokio::time::Instant::now() + SETUP_DEADLINE;
        while !node.online {
            node.drain_events();
            if node.online {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SyncError::OverlayUnavailable(
                    "node never came online".into(),
                )
                .into());
            }
            tokio::time::sleep(ONLINE_POLL).await;
        }
        while node.networks_joined <= 0 {
            node.drain_events();
            if node.networks_joined > 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SyncError::OverlayUnavailable(
                    "service network never became ready".into(),
                )
                .into());
            }
            tokio::time::sleep(JOIN_POLL).await;
        }
        node.drain_events();

        let Some(ip) = node.ip else {
            return Err(
                SyncError::OverlayUnavailable("runtime reported no address".into()).into(),
            );
        };
        info!(%ip, "overlay ready");
        Ok(node)
    }

    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    debug!(?event, "overlay event");
                    match event {
                        OverlayEvent::Online => self.online = true,
                        OverlayEvent::Offline => self.online = false,
                        OverlayEvent::AddressReady(ip) => self.ip = Some(ip),
                        OverlayEvent::NetworkReady => self.networks_joined += 1,
                        OverlayEvent::NetworkDown => self.networks_joined -= 1,
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    /// The joined overlay address; stable for the node's lifetime.
    pub fn ip(&self) -> IpAddr {
        self.ip.expect("setup guarantees an address")
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn shutdown(&mut self) {
        self.runtime.stop();
        info!("overlay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn setup_with_configured_address_completes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = dir.path().join(".nodedata");
        let ip: IpAddr = "127.0.0.2".parse().expect("valid ip");

        let mut node = OverlayNode::setup(Box::new(LanOverlay::new(Some(ip))), &identity)
            .await
            .expect("setup");
        assert_eq!(node.ip(), ip);
        node.shutdown();
    }

    #[tokio::test]
    async fn identity_survives_restarts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".nodedata");

        let first = NodeIdentity::load_or_create(&path).expect("create");
        let second = NodeIdentity::load_or_create(&path).expect("reload");
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.fingerprint().len(), 64);
    }

    #[tokio::test]
    async fn runtime_that_never_reports_an_address_fails_setup() {
        struct SilentRuntime;
        impl OverlayRuntime for SilentRuntime {
            fn start(&mut self, events: Sender<OverlayEvent>) -> Result<(), SyncError> {
                // Online and joined, but no address event.
                let _ = events.send(OverlayEvent::Online);
                let _ = events.send(OverlayEvent::NetworkReady);
                Ok(())
            }
            fn stop(&mut self) {}
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let identity = dir.path().join(".nodedata");
        let err = OverlayNode::setup(Box::new(SilentRuntime), &identity)
            .await
            .expect_err("no address means no overlay");
        assert!(err.to_string().contains("no address"));
    }
}
