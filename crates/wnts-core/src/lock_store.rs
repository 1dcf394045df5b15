// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! On-disk advisory locks: a sidecar file under the managed folder's
//! `.wnts` directory plus stripped write-permission bits on the target.
//!
//! Invariant: the sidecar exists ⇔ the file's owner/group/other write
//! bits are all cleared. The sidecar records which bits were removed, so
//! unlocking restores exactly what locking took.

use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::config::{LOCK_PREFIX, STATE_DIR};

/// All unix write bits (owner, group, other).
pub const WRITE_MASK: u32 = 0o222;

/// The lock message persisted beside the mirror, minus routing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub originator: IpAddr,
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize)]
struct SidecarFile {
    record: LockRecord,
    removed_mode: u32,
}

/// Lock bookkeeping for files under one work root. Paths handed in are
/// relative to that root, with the managed folder as first component.
#[derive(Debug, Clone)]
pub struct LockStore {
    root: PathBuf,
}

impl LockStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Sidecar location for a managed file: the `.wnts` tree sits at the
    /// top of the managed folder, and the sidecar lives beside the
    /// mirrored copy as `.lock.<filename>`.
    pub fn lock_path(&self, rel: &Path) -> PathBuf {
        let mut components = rel.iter();
        let folder = components.next().map(PathBuf::from).unwrap_or_default();
        let inside: PathBuf = components.collect();
        let file_name = inside
            .file_name()
            .or_else(|| folder.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = inside.parent().map(Path::to_path_buf).unwrap_or_default();
        self.root
            .join(folder)
            .join(STATE_DIR)
            .join(parent)
            .join(format!("{LOCK_PREFIX}{file_name}"))
    }

    pub fn is_locked(&self, rel: &Path) -> bool {
        self.lock_path(rel).exists()
    }

    pub fn read_lock(&self, rel: &Path) -> anyhow::Result<(LockRecord, u32)> {
        let path = self.lock_path(rel);
        let bytes = fs::read(&path)
            .with_context(|| format!("reading lock sidecar {}", path.display()))?;
        let sidecar: SidecarFile = crate::cbor::from_slice(&bytes)
            .with_context(|| format!("parsing lock sidecar {}", path.display()))?;
        Ok((sidecar.record, sidecar.removed_mode))
    }

    pub fn write_lock(&self, rel: &Path, record: LockRecord, removed_mode: u32) -> anyhow::Result<()> {
        let path = self.lock_path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating lock directory {}", parent.display()))?;
        }
        let bytes = crate::cbor::to_vec(&SidecarFile {
            record,
            removed_mode,
        })?;
        fs::write(&path, bytes)
            .with_context(|| format!("writing lock sidecar {}", path.display()))?;
        Ok(())
    }

    pub fn remove_lock(&self, rel: &Path) -> anyhow::Result<()> {
        let path = self.lock_path(rel);
        fs::remove_file(&path)
            .with_context(|| format!("removing lock sidecar {}", path.display()))?;
        Ok(())
    }

    /// Clear every write bit on the target file, returning exactly the
    /// bits that were removed (what unlock later restores).
    pub fn strip_write_bits(&self, rel: &Path) -> anyhow::Result<u32> {
        let abs = self.root.join(rel);
        let meta = fs::metadata(&abs)
            .with_context(|| format!("reading permissions of {}", abs.display()))?;
        let mode = meta.permissions().mode();
        let removed = mode & WRITE_MASK;
        if removed != 0 {
            fs::set_permissions(&abs, fs::Permissions::from_mode(mode & !WRITE_MASK))
                .with_context(|| format!("clearing write bits on {}", abs.display()))?;
        }
        Ok(removed)
    }

    /// Put back the write bits a lock removed.
    pub fn restore_write_bits(&self, rel: &Path, removed_mode: u32) -> anyhow::Result<()> {
        let abs = self.root.join(rel);
        let meta = fs::metadata(&abs)
            .with_context(|| format!("reading permissions of {}", abs.display()))?;
        let mode = meta.permissions().mode();
        fs::set_permissions(&abs, fs::Permissions::from_mode(mode | removed_mode))
            .with_context(|| format!("restoring write bits on {}", abs.display()))?;
        Ok(())
    }

    /// Current write bits of the target (0 means fully write-protected).
    pub fn write_bits(&self, rel: &Path) -> anyhow::Result<u32> {
        let abs = self.root.join(rel);
        let meta = fs::metadata(&abs)
            .with_context(|| format!("reading permissions of {}", abs.display()))?;
        Ok(meta.permissions().mode() & WRITE_MASK)
    }
}
