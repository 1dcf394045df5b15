// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Single-threaded consumer of the priority queue: integrity checking,
//! the connecting barrier, and the per-kind handlers that turn messages
//! into filesystem and peer-graph effects.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context as _;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::lock_store::{LockRecord, LockStore};
use crate::peer_manager::PeerDirectory;
use crate::queue::{MessageQueue, ResendCache};
use crate::sweeper::{enumerate_managed, mirror_path};
use crate::wire::{Body, FileMeta, Message, BROADCAST, LOOPBACK};

/// Sleep when the queue is empty, bounding the processor's idle spin.
pub const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// What one `process_next` call did, so the pacing loop can tell real
/// progress from an empty queue or a connecting-barrier deferral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Queue was empty; the call slept.
    Idle,
    /// A message was dispatched (successfully or not).
    Processed,
    /// A message was re-enqueued behind the connecting barrier.
    Deferred,
}

pub struct MessageManager {
    queue: Arc<MessageQueue>,
    cache: Arc<StdMutex<ResendCache>>,
    directory: Arc<dyn PeerDirectory>,
    locks: LockStore,
    root: PathBuf,
    /// Connecting-barrier counters: file-mutating work defers until
    /// `received >= total`. Bootstrapping starts at 0/0 (open);
    /// joining starts at 0/1, a sentinel the initial sync stream
    /// replaces with the real total.
    received_initial: u64,
    total_initial: u64,
}

impl MessageManager {
    pub fn new(
        queue: Arc<MessageQueue>,
        cache: Arc<StdMutex<ResendCache>>,
        directory: Arc<dyn PeerDirectory>,
        root: impl Into<PathBuf>,
        joining: bool,
    ) -> Self {
        let root = root.into();
        Self {
            queue,
            cache,
            directory,
            locks: LockStore::new(root.clone()),
            root,
            received_initial: 0,
            total_initial: if joining { 1 } else { 0 },
        }
    }

    pub fn is_finished_connecting(&self) -> bool {
        self.received_initial >= self.total_initial
    }

    /// Pop and handle the head of the queue (sleeping 100 ms when there
    /// is none). Corrupt frames trigger a resend request to the previous
    /// hop; messages arriving behind the connecting barrier re-enter the
    /// queue at base priority + 1.
    pub async fn process_next(&mut self) -> ProcessOutcome {
        let Some(msg) = self.queue.pop() else {
            tokio::time::sleep(IDLE_SLEEP).await;
            return ProcessOutcome::Idle;
        };

        if let Err(err) = verify_integrity(&msg) {
            warn!(from = %msg.header.sender, %err, "requesting resend");
            let reply = Message::resend_request(msg.header.message_hash, msg.header.receiver);
            if let Err(err) = self.directory.send(reply, msg.header.sender, false).await {
                warn!(%err, "failed to send resend request");
            }
            return ProcessOutcome::Processed;
        }

        if !self.is_finished_connecting() && !barrier_exempt(&msg) {
            let priority = msg.priority().saturating_add(1);
            self.queue.push_with_priority(priority, msg);
            return ProcessOutcome::Deferred;
        }

        match self.dispatch(&msg).await {
            Ok(()) => {
                self.cache.lock().expect("resend cache mutex").push(msg);
            }
            Err(err) => {
                warn!(kind = ?msg.msg_type(), %err, "handler failed, message dropped");
            }
        }
        ProcessOutcome::Processed
    }

    async fn dispatch(&mut self, msg: &Message) -> anyhow::Result<()> {
        match &msg.body {
            Body::Payload(payload) => {
                info!(
                    originator = %msg.header.originator,
                    payload = %String::from_utf8_lossy(payload),
                    "payload"
                );
                Ok(())
            }
            Body::ResendRequest {
                requested_hash,
                original_destination,
            } => {
                self.handle_resend(msg, *requested_hash, *original_destination)
                    .await
            }
            Body::Lock(meta) => self.handle_lock(msg, meta),
            Body::Unlock(meta) => self.handle_unlock(msg, meta),
            Body::DeleteFile(meta) => self.handle_delete(msg, meta),
            Body::ContentChange { file, content } => self.handle_content_change(msg, file, content),
            Body::InitialSync {
                file,
                content,
                index,
                total,
            } => self.handle_initial_sync(file, content, *index, *total),
            Body::InitialSyncRequest => self.handle_initial_sync_request(msg).await,
            Body::Connect {
                backup_peers,
                managed_paths,
            } => {
                self.handle_connect(backup_peers.clone(), managed_paths.clone())
                    .await
            }
            Body::Disconnect => self.handle_disconnect(msg).await,
            Body::LinkLost => self.handle_link_lost(msg).await,
        }
    }

    async fn handle_resend(
        &mut self,
        msg: &Message,
        requested_hash: u64,
        original_destination: std::net::IpAddr,
    ) -> anyhow::Result<()> {
        // Our own resend request echoed back through the mesh: drop it.
        if msg.header.originator == self.directory.self_ip() {
            return Ok(());
        }
        let cached = self
            .cache
            .lock()
            .expect("resend cache mutex")
            .find(requested_hash)
            .cloned();
        match cached {
            Some(original) => {
                debug!(requested_hash, to = %original_destination, "resending cached message");
                self.directory
                    .send(original, original_destination, false)
                    .await
            }
            None => {
                debug!(requested_hash, "resend requested for unknown hash");
                Ok(())
            }
        }
    }

    fn handle_lock(&mut self, msg: &Message, meta: &FileMeta) -> anyhow::Result<()> {
        let rel = &meta.path;
        let abs = self.root.join(rel);
        if !abs.exists() {
            debug!(path = %rel.display(), "lock refused, no such managed file");
            return Ok(());
        }
        let self_ip = self.directory.self_ip();

        if !self.locks.is_locked(rel) {
            let removed = if msg.header.originator == self_ip {
                0
            } else {
                self.locks.strip_write_bits(rel)?
            };
            self.locks.write_lock(
                rel,
                LockRecord {
                    originator: msg.header.originator,
                    timestamp: meta.timestamp,
                },
                removed,
            )?;
            debug!(path = %rel.display(), holder = %msg.header.originator, "locked");
            return Ok(());
        }

        let (existing, mask) = self.locks.read_lock(rel)?;
        // Conflict resolution: the strictly earlier lock wins; ties keep
        // the current holder.
        if meta.timestamp < existing.timestamp {
            let mut mask = mask;
            if msg.header.originator != self_ip {
                mask |= self.locks.strip_write_bits(rel)?;
            }
            self.locks.write_lock(
                rel,
                LockRecord {
                    originator: msg.header.originator,
                    timestamp: meta.timestamp,
                },
                mask,
            )?;
            debug!(
                path = %rel.display(),
                winner = %msg.header.originator,
                loser = %existing.originator,
                "earlier lock displaced the holder"
            );
        }
        Ok(())
    }

    fn handle_unlock(&mut self, msg: &Message, meta: &FileMeta) -> anyhow::Result<()> {
        let rel = &meta.path;
        if !self.locks.is_locked(rel) {
            return Ok(());
        }
        let (existing, mask) = self.locks.read_lock(rel)?;
        if existing.originator != msg.header.originator {
            // Only the holder unlocks.
            return Ok(());
        }
        if self.root.join(rel).exists() {
            self.locks.restore_write_bits(rel, mask)?;
        }
        self.locks.remove_lock(rel)?;
        debug!(path = %rel.display(), "unlocked");
        Ok(())
    }

    fn handle_delete(&mut self, msg: &Message, meta: &FileMeta) -> anyhow::Result<()> {
        let rel = &meta.path;
        if self.refused_by_lock(msg, rel)? {
            return Ok(());
        }
        let abs = self.root.join(rel);
        remove_if_present(&abs)?;
        remove_if_present(&mirror_path(&self.root, rel))?;
        if self.locks.is_locked(rel) {
            self.locks.remove_lock(rel)?;
        }
        debug!(path = %rel.display(), "deleted");
        Ok(())
    }

    fn handle_content_change(
        &mut self,
        msg: &Message,
        file: &FileMeta,
        content: &[u8],
    ) -> anyhow::Result<()> {
        let rel = &file.path;
        if self.refused_by_lock(msg, rel)? {
            return Ok(());
        }
        self.write_managed_file(rel, content)?;
        debug!(path = %rel.display(), bytes = content.len(), "content applied");
        Ok(())
    }

    fn handle_initial_sync(
        &mut self,
        file: &FileMeta,
        content: &[u8],
        index: u64,
        total: u64,
    ) -> anyhow::Result<()> {
        self.total_initial = total;
        // An empty path is the zero-files marker: it carries the total
        // and counts no file.
        if !file.path.as_os_str().is_empty() {
            self.write_managed_file(&file.path, content)?;
            self.received_initial += 1;
        }
        debug!(
            index,
            total,
            received = self.received_initial,
            "initial sync progressed"
        );
        if self.is_finished_connecting() {
            info!(files = self.received_initial, "initial sync complete");
        }
        Ok(())
    }

    async fn handle_initial_sync_request(&mut self, msg: &Message) -> anyhow::Result<()> {
        let requester = msg.header.originator;
        let folders = self.directory.managed_paths();
        let files = enumerate_managed(&self.root, &folders);

        // Read everything up front so the advertised total only counts
        // files that will actually be sent.
        let mut entries: Vec<(PathBuf, i64, Vec<u8>)> = Vec::with_capacity(files.len());
        for rel in files {
            let abs = self.root.join(&rel);
            match fs::read(&abs) {
                Ok(content) => {
                    let timestamp = file_mtime_secs(&abs);
                    entries.push((rel, timestamp, content));
                }
                Err(err) => {
                    let err = SyncError::fs(&abs, err);
                    warn!(%err, "skipping unreadable file in sync");
                }
            }
        }

        if entries.is_empty() {
            // Zero-files marker so the requester's barrier still lifts.
            let marker = Message::initial_sync(PathBuf::new(), 0, Vec::new(), 0, 0);
            return self.directory.send(marker, requester, false).await;
        }

        let total = entries.len() as u64;
        info!(files = total, to = %requester, "streaming initial state");
        for (index, (rel, timestamp, content)) in entries.into_iter().enumerate() {
            let locked = self.locks.is_locked(&rel);
            let sync =
                Message::initial_sync(rel.clone(), timestamp, content, index as u64, total);
            self.directory.send(sync, requester, false).await?;

            if locked {
                let (record, _) = self.locks.read_lock(&rel)?;
                let mut lock = Message::lock(rel, record.timestamp);
                lock.header.originator = record.originator;
                self.directory.send(lock, requester, false).await?;
            }
        }
        Ok(())
    }

    async fn handle_connect(
        &mut self,
        backup_peers: Vec<crate::wire::PeerEntry>,
        managed_paths: Vec<PathBuf>,
    ) -> anyhow::Result<()> {
        info!(
            backups = backup_peers.len(),
            folders = managed_paths.len(),
            "adopting mesh view"
        );
        self.directory
            .adopt_mesh(backup_peers, managed_paths.clone())
            .await;

        // Local managed state is wiped; the initial sync stream is the
        // source of truth from here.
        for folder in &managed_paths {
            let abs = self.root.join(folder);
            match fs::remove_dir_all(&abs) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("wiping {}", abs.display()))
                }
            }
            fs::create_dir_all(&abs)
                .with_context(|| format!("recreating {}", abs.display()))?;
        }

        self.received_initial = 0;
        self.total_initial = 1;
        Ok(())
    }

    async fn handle_link_lost(&mut self, msg: &Message) -> anyhow::Result<()> {
        let lost = msg.header.originator;
        warn!(peer = %lost, "link lost");
        if let Some(removed) = self.directory.retire_peer(lost).await {
            // Tell the rest of the mesh the node is unreachable.
            let mut disconnect = Message::disconnect();
            disconnect.header.originator = removed;
            self.directory.send(disconnect, BROADCAST, true).await?;
        }
        Ok(())
    }

    async fn handle_disconnect(&mut self, msg: &Message) -> anyhow::Result<()> {
        let gone = msg.header.originator;
        info!(node = %gone, "node disconnected");
        self.directory.drop_backup(gone).await;

        // Free whatever the departed node held: one loopback unlock per
        // managed file. The unlock handler ignores files it did not hold.
        let folders = self.directory.managed_paths();
        for rel in enumerate_managed(&self.root, &folders) {
            let mut unlock = Message::unlock(rel, 0);
            unlock.header.receiver = LOOPBACK;
            unlock.header.originator = gone;
            unlock.seal();
            self.queue.push(unlock);
        }
        Ok(())
    }

    /// Whether a file-mutating message must be refused because another
    /// node holds the lock.
    fn refused_by_lock(&self, msg: &Message, rel: &std::path::Path) -> anyhow::Result<bool> {
        if !self.locks.is_locked(rel) {
            return Ok(false);
        }
        let (record, _) = self.locks.read_lock(rel)?;
        if record.originator != msg.header.originator {
            debug!(
                path = %rel.display(),
                holder = %record.originator,
                requester = %msg.header.originator,
                "refused, file locked by another node"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Write a managed file and refresh its `.wnts` mirror, creating
    /// parent directories as needed.
    fn write_managed_file(&self, rel: &std::path::Path, content: &[u8]) -> anyhow::Result<()> {
        let abs = self.root.join(rel);
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&abs, content).with_context(|| format!("writing {}", abs.display()))?;

        let mirror = mirror_path(&self.root, rel);
        if let Some(parent) = mirror.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&mirror, content)
            .with_context(|| format!("writing mirror {}", mirror.display()))?;
        Ok(())
    }

    /// Drain the queue synchronously (the peer manager must already be
    /// stopped), then restore permissions for every surviving lock
    /// sidecar so a shutdown never leaves files write-protected.
    pub async fn shutdown(&mut self) {
        while let Some(msg) = self.queue.pop() {
            if verify_integrity(&msg).is_err() {
                continue;
            }
            if !self.is_finished_connecting() && !barrier_exempt(&msg) {
                debug!(kind = ?msg.msg_type(), "dropping deferred message at shutdown");
                continue;
            }
            if let Err(err) = self.dispatch(&msg).await {
                warn!(kind = ?msg.msg_type(), %err, "handler failed during shutdown drain");
            }
        }

        let folders = self.directory.managed_paths();
        for rel in enumerate_managed(&self.root, &folders) {
            if !self.locks.is_locked(&rel) {
                continue;
            }
            match self.locks.read_lock(&rel) {
                Ok((_, mask)) => {
                    if let Err(err) = self.locks.restore_write_bits(&rel, mask) {
                        warn!(path = %rel.display(), %err, "failed to restore permissions");
                    }
                    if let Err(err) = self.locks.remove_lock(&rel) {
                        warn!(path = %rel.display(), %err, "failed to remove lock sidecar");
                    }
                }
                Err(err) => warn!(path = %rel.display(), %err, "unreadable lock sidecar"),
            }
        }
    }
}

/// Check the stored integrity hash against the message's current bytes.
fn verify_integrity(msg: &Message) -> Result<(), SyncError> {
    let computed = msg.hash();
    if msg.header.message_hash == computed {
        Ok(())
    } else {
        Err(SyncError::FrameCorrupt {
            stored: msg.header.message_hash,
            computed,
        })
    }
}

fn barrier_exempt(msg: &Message) -> bool {
    matches!(
        msg.body,
        Body::Connect { .. } | Body::InitialSync { .. } | Body::ResendRequest { .. } | Body::LinkLost
    )
}

fn remove_if_present(path: &std::path::Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
    }
}

pub(crate) fn file_mtime_secs(path: &std::path::Path) -> i64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
