// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Top-level owner of the replication plane. One value per node, fields
//! in teardown order: the peer manager stops first so nothing new
//! arrives, the message manager drains and cleans up, the overlay goes
//! last.

use std::fs;
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::error::SyncError;
use crate::lock_store::LockStore;
use crate::message_manager::{file_mtime_secs, MessageManager, ProcessOutcome};
use crate::overlay::{LanOverlay, OverlayNode};
use crate::peer_manager::{PeerDirectory, PeerManager};
use crate::queue::{MessageQueue, ResendCache};
use crate::sweeper::{mirror_path, FsSweeper, SweepEvent};
use crate::wire::{Message, BROADCAST};

/// Length of one pacing window: a sweep followed by message processing.
pub const TICK: Duration = Duration::from_secs(1);

pub struct Runtime {
    peers: Arc<PeerManager>,
    messages: MessageManager,
    sweeper: FsSweeper,
    overlay: OverlayNode,
    queue: Arc<MessageQueue>,
    locks: LockStore,
    config: NodeConfig,
}

impl Runtime {
    /// Bring the node up: overlay first, then the listener, then (when
    /// joining) the gateway connection that starts the initial sync.
    pub async fn start(config: NodeConfig) -> anyhow::Result<Self> {
        let overlay = OverlayNode::setup(
            Box::new(LanOverlay::new(config.bind_ip)),
            &config.identity_path,
        )
        .await?;
        let self_ip = overlay.ip();

        // A joining node starts with no folders; the list arrives in the
        // gateway's connect message.
        let folders = if config.is_joining() {
            vec![]
        } else {
            config.folders.clone()
        };

        let queue = Arc::new(MessageQueue::new());
        let cache = Arc::new(StdMutex::new(ResendCache::default()));
        let peers = PeerManager::start(
            self_ip,
            config.port,
            folders.clone(),
            queue.clone(),
            cache.clone(),
        )
        .await?;

        let mut sweeper = FsSweeper::new(&config.work_root, folders);
        if !config.is_joining() {
            sweeper.setup()?;
        }

        let messages = MessageManager::new(
            queue.clone(),
            cache,
            peers.clone() as Arc<dyn PeerDirectory>,
            &config.work_root,
            config.is_joining(),
        );

        if let Some((gateway_ip, gateway_port)) = config.gateway {
            peers.connect_gateway(gateway_ip, gateway_port).await?;
        }

        Ok(Self {
            peers,
            messages,
            sweeper,
            overlay,
            queue,
            locks: LockStore::new(&config.work_root),
            config,
        })
    }

    pub fn ip(&self) -> IpAddr {
        self.overlay.ip()
    }

    pub fn service_port(&self) -> u16 {
        self.peers.service_port()
    }

    pub fn is_finished_connecting(&self) -> bool {
        self.messages.is_finished_connecting()
    }

    /// Drive pacing windows until cancelled (the caller selects against
    /// a shutdown signal and then calls [`Runtime::shutdown`]).
    pub async fn run(&mut self) {
        info!(ip = %self.ip(), port = self.service_port(), "node running");
        loop {
            let started = tokio::time::Instant::now();
            self.tick().await;
            tokio::time::sleep_until(started + TICK).await;
        }
    }

    /// One pacing window: adopt any managed-path change, sweep, turn
    /// sweep events into outbound messages, then drain the queue for the
    /// remainder of the window.
    pub async fn tick(&mut self) {
        let managed = self.peers.managed_paths();
        if managed != self.sweeper.folders() {
            info!(folders = managed.len(), "managed folders changed, resetting sweeper");
            self.sweeper.set_folders(managed);
        }

        let events = self.sweeper.total_sweep_every_n(self.config.full_sweep_every);
        for event in events {
            self.apply_sweep_event(event).await;
        }

        let deadline = tokio::time::Instant::now() + TICK;
        let mut consecutive_deferrals = 0usize;
        while tokio::time::Instant::now() < deadline {
            match self.messages.process_next().await {
                ProcessOutcome::Idle => break,
                ProcessOutcome::Processed => consecutive_deferrals = 0,
                ProcessOutcome::Deferred => {
                    consecutive_deferrals += 1;
                    // Only deferred work left; let the window close
                    // instead of spinning on it.
                    if consecutive_deferrals > self.queue.len() {
                        break;
                    }
                }
            }
        }
    }

    /// Convert a sweep observation into replication traffic. Events whose
    /// file content equals the `.wnts` mirror are replication echoes (a
    /// handler wrote the file) and are suppressed.
    async fn apply_sweep_event(&mut self, event: SweepEvent) {
        let root = self.config.work_root.clone();
        match event {
            SweepEvent::Created(rel) | SweepEvent::Modified(rel) => {
                let abs = root.join(&rel);
                let content = match fs::read(&abs) {
                    Ok(content) => content,
                    Err(err) => {
                        let err = SyncError::fs(&abs, err);
                        warn!(%err, "skipping unreadable changed file");
                        return;
                    }
                };
                let mirror = mirror_path(&root, &rel);
                if fs::read(&mirror).map(|m| m == content).unwrap_or(false) {
                    return;
                }
                if let Some(parent) = mirror.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if let Err(err) = fs::write(&mirror, &content) {
                    let err = SyncError::fs(&mirror, err);
                    warn!(%err, "failed to refresh mirror");
                }
                let timestamp = file_mtime_secs(&abs);
                let msg = Message::content_change(rel, timestamp, content);
                if let Err(err) = self.peers.send_to(msg, BROADCAST, false).await {
                    warn!(%err, "failed to broadcast content change");
                }
            }
            SweepEvent::Deleted(rel) => {
                let mirror = mirror_path(&root, &rel);
                if !mirror.exists() {
                    // The delete handler already cleaned up: this is the
                    // echo of a replicated deletion.
                    return;
                }
                let _ = fs::remove_file(&mirror);
                let msg = Message::delete_file(rel, now_secs());
                if let Err(err) = self.peers.send_to(msg, BROADCAST, false).await {
                    warn!(%err, "failed to broadcast delete");
                }
            }
            SweepEvent::LockHint(rel) => {
                // A sidecar means the write bits were stripped by the
                // lock handler, not by a local chmod.
                if self.locks.is_locked(&rel) {
                    return;
                }
                let msg = Message::lock(rel, now_secs());
                if let Err(err) = self.peers.send_to(msg, BROADCAST, true).await {
                    warn!(%err, "failed to broadcast lock");
                }
            }
            SweepEvent::UnlockHint(rel) => {
                if !self.locks.is_locked(&rel) {
                    return;
                }
                let msg = Message::unlock(rel, now_secs());
                if let Err(err) = self.peers.send_to(msg, BROADCAST, true).await {
                    warn!(%err, "failed to broadcast unlock");
                }
            }
        }
    }

    /// Fixed teardown order: peer manager, message manager, overlay.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        self.peers.stop().await;
        self.messages.shutdown().await;
        self.overlay.shutdown();
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
