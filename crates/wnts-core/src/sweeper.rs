// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Polling filesystem watcher with a fast-track optimization: recently
//! active files are re-checked every sweep, the full tree only every Nth
//! sweep. Also tracks write-permission transitions so a local `chmod`
//! surfaces as a lock/unlock hint.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use tracing::{debug, warn};

use crate::config::STATE_DIR;
use crate::error::SyncError;
use crate::lock_store::WRITE_MASK;

/// A fast-tracked file leaves the fast track once its mtime is this far
/// behind the wall clock.
pub const QUIESCENCE: Duration = Duration::from_secs(10);

/// What a sweep observed, with paths relative to the work root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    /// All write bits disappeared without our own doing — a local
    /// advisory-lock request.
    LockHint(PathBuf),
    /// Write bits came back — a local advisory-unlock request.
    UnlockHint(PathBuf),
}

impl SweepEvent {
    pub fn path(&self) -> &Path {
        match self {
            Self::Created(p)
            | Self::Modified(p)
            | Self::Deleted(p)
            | Self::LockHint(p)
            | Self::UnlockHint(p) => p,
        }
    }
}

/// Mirror location of a managed file: the `.wnts` tree at the top of its
/// managed folder, same relative layout inside.
pub fn mirror_path(root: &Path, rel: &Path) -> PathBuf {
    let mut components = rel.iter();
    let folder = components.next().map(PathBuf::from).unwrap_or_default();
    let inside: PathBuf = components.collect();
    root.join(folder).join(STATE_DIR).join(inside)
}

pub struct FsSweeper {
    root: PathBuf,
    folders: Vec<PathBuf>,
    /// Last seen (mtime, sweep iteration) per file, full-sweep view.
    timestamps: BTreeMap<PathBuf, (SystemTime, u64)>,
    /// Same bookkeeping for the recently active subset.
    fast_track: BTreeMap<PathBuf, (SystemTime, u64)>,
    /// Last seen write bits per file, for lock/unlock hints.
    modes: BTreeMap<PathBuf, u32>,
    iteration: u64,
}

impl FsSweeper {
    pub fn new(root: impl Into<PathBuf>, folders: Vec<PathBuf>) -> Self {
        Self {
            root: root.into(),
            folders,
            timestamps: BTreeMap::new(),
            fast_track: BTreeMap::new(),
            modes: BTreeMap::new(),
            iteration: 0,
        }
    }

    pub fn folders(&self) -> &[PathBuf] {
        &self.folders
    }

    /// Reset the `.wnts` state of every managed folder, mirror the current
    /// tree as the last-known-good copy, and prime the tracking tables so
    /// the first sweep reports nothing.
    pub fn setup(&mut self) -> anyhow::Result<()> {
        for folder in &self.folders {
            let state = self.root.join(folder).join(STATE_DIR);
            match fs::remove_dir_all(&state) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("clearing state dir {}", state.display()))
                }
            }
        }

        for path in self.enumerate() {
            let abs = self.root.join(&path);
            let mirror = mirror_path(&self.root, &path);
            if let Some(parent) = mirror.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating mirror dir {}", parent.display()))?;
            }
            fs::copy(&abs, &mirror)
                .with_context(|| format!("mirroring {}", abs.display()))?;

            if let Ok(meta) = fs::metadata(&abs) {
                let mtime = meta.modified().unwrap_or_else(|_| SystemTime::now());
                self.timestamps.insert(path.clone(), (mtime, 0));
                self.modes.insert(path, meta.permissions().mode() & WRITE_MASK);
            }
        }
        Ok(())
    }

    /// Adopt a new folder list (mesh join). Tracking state restarts from
    /// scratch; the wiped folders are repopulated by the initial sync.
    pub fn set_folders(&mut self, folders: Vec<PathBuf>) {
        self.folders = folders;
        self.timestamps.clear();
        self.fast_track.clear();
        self.modes.clear();
        self.iteration = 0;
    }

    /// Sweep, running a full scan every `n` iterations and a fast-track
    /// scan otherwise.
    pub fn total_sweep_every_n(&mut self, n: u64) -> Vec<SweepEvent> {
        let total = n <= 1 || self.iteration % n == 0;
        self.sweep(total)
    }

    pub fn sweep(&mut self, total: bool) -> Vec<SweepEvent> {
        self.sweep_at(total, SystemTime::now())
    }

    /// Sweep with an injected wall clock (`now` only drives fast-track
    /// expiry).
    pub fn sweep_at(&mut self, total: bool, now: SystemTime) -> Vec<SweepEvent> {
        let paths: Vec<PathBuf> = if total {
            self.enumerate()
        } else {
            self.fast_track.keys().cloned().collect()
        };

        let mut events = Vec::new();
        let mut removed = Vec::new();

        for path in paths {
            let abs = self.root.join(&path);
            let meta = match fs::metadata(&abs) {
                Ok(meta) => meta,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    removed.push(path);
                    continue;
                }
                Err(err) => {
                    let err = SyncError::fs(&abs, err);
                    warn!(%err, "skipping unreadable file");
                    continue;
                }
            };
            let mtime = meta.modified().unwrap_or(now);
            let write_bits = meta.permissions().mode() & WRITE_MASK;

            match self.modes.get(&path) {
                Some(&prev) if prev != 0 && write_bits == 0 => {
                    events.push(SweepEvent::LockHint(path.clone()));
                }
                Some(&prev) if prev == 0 && write_bits != 0 => {
                    events.push(SweepEvent::UnlockHint(path.clone()));
                }
                _ => {}
            }
            self.modes.insert(path.clone(), write_bits);

            if total {
                match self.timestamps.get(&path) {
                    None => {
                        events.push(SweepEvent::Created(path.clone()));
                        self.fast_track.insert(path.clone(), (mtime, self.iteration));
                    }
                    Some(&(prev, _)) if prev < mtime => {
                        events.push(SweepEvent::Modified(path.clone()));
                        self.fast_track.insert(path.clone(), (mtime, self.iteration));
                    }
                    Some(_) => {}
                }
                self.timestamps.insert(path, (mtime, self.iteration));
            } else {
                if let Some(&(prev, _)) = self.fast_track.get(&path) {
                    if prev < mtime {
                        events.push(SweepEvent::Modified(path.clone()));
                    }
                }
                self.fast_track.insert(path, (mtime, self.iteration));
            }
        }

        // A tracked file whose iteration counter did not advance was not
        // seen by this sweep: it is gone. Files whose mtime fell behind
        // the quiescence window leave the fast track.
        let mut fast_removed = Vec::new();
        let scanned: Vec<(PathBuf, (SystemTime, u64))> = if total {
            self.timestamps
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect()
        } else {
            self.fast_track
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect()
        };
        for (path, (mtime, seen_at)) in scanned {
            if seen_at != self.iteration {
                events.push(SweepEvent::Deleted(path.clone()));
                removed.push(path);
            } else if now
                .duration_since(mtime)
                .map(|age| age > QUIESCENCE)
                .unwrap_or(false)
            {
                fast_removed.push(path);
            }
        }

        for path in &removed {
            self.timestamps.remove(path);
            self.fast_track.remove(path);
            self.modes.remove(path);
        }
        for path in &fast_removed {
            self.fast_track.remove(path);
        }

        self.iteration += 1;
        if !events.is_empty() {
            debug!(iteration = self.iteration, count = events.len(), "sweep events");
        }
        events
    }

    /// All managed files, relative to the work root, `.wnts` subtrees
    /// excluded.
    pub fn enumerate(&self) -> Vec<PathBuf> {
        enumerate_managed(&self.root, &self.folders)
    }
}

/// Recursively list the files of every managed folder, relative to the
/// work root, `.wnts` subtrees excluded. Unreadable entries are logged
/// and skipped.
pub fn enumerate_managed(root: &Path, folders: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack: Vec<PathBuf> = folders
        .iter()
        .map(|f| root.join(f))
        .filter(|p| p.is_dir())
        .collect();

    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                let err = SyncError::fs(&dir, err);
                warn!(%err, "skipping unreadable directory");
                continue;
            }
        };
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.file_name().is_some_and(|n| n == STATE_DIR) {
                continue;
            }
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => stack.push(path),
                Ok(ft) if ft.is_file() => {
                    if let Ok(rel) = path.strip_prefix(root) {
                        out.push(rel.to_path_buf());
                    }
                }
                _ => {}
            }
        }
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, FsSweeper) {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("data/sub")).expect("mkdir");
        fs::write(dir.path().join("data/a.txt"), b"a").expect("write");
        fs::write(dir.path().join("data/sub/b.txt"), b"b").expect("write");
        let sweeper = FsSweeper::new(dir.path(), vec![PathBuf::from("data")]);
        (dir, sweeper)
    }

    #[test]
    fn setup_mirrors_files_and_reports_nothing() {
        let (dir, mut sweeper) = fixture();
        sweeper.setup().expect("setup");

        assert!(dir.path().join("data/.wnts/a.txt").exists());
        assert!(dir.path().join("data/.wnts/sub/b.txt").exists());
        assert!(sweeper.sweep(true).is_empty());
    }

    #[test]
    fn created_modified_deleted_cycle() {
        let (dir, mut sweeper) = fixture();
        sweeper.setup().expect("setup");
        assert!(sweeper.sweep(true).is_empty());

        fs::write(dir.path().join("data/new.txt"), b"new").expect("write");
        let events = sweeper.sweep(true);
        assert_eq!(events, vec![SweepEvent::Created(PathBuf::from("data/new.txt"))]);

        // mtime must move forward for a modification to register.
        let later = SystemTime::now() + Duration::from_secs(5);
        fs::write(dir.path().join("data/new.txt"), b"newer").expect("write");
        set_mtime(&dir.path().join("data/new.txt"), later);
        let events = sweeper.sweep(true);
        assert_eq!(events, vec![SweepEvent::Modified(PathBuf::from("data/new.txt"))]);

        fs::remove_file(dir.path().join("data/new.txt")).expect("rm");
        let events = sweeper.sweep(true);
        assert_eq!(events, vec![SweepEvent::Deleted(PathBuf::from("data/new.txt"))]);
    }

    #[test]
    fn fast_track_sees_changes_between_full_sweeps() {
        let (dir, mut sweeper) = fixture();
        sweeper.setup().expect("setup");

        fs::write(dir.path().join("data/hot.txt"), b"v1").expect("write");
        assert_eq!(
            sweeper.sweep(true),
            vec![SweepEvent::Created(PathBuf::from("data/hot.txt"))]
        );

        let later = SystemTime::now() + Duration::from_secs(3);
        fs::write(dir.path().join("data/hot.txt"), b"v2").expect("write");
        set_mtime(&dir.path().join("data/hot.txt"), later);

        // Fast-track sweep (not a full scan) still notices the change.
        let events = sweeper.sweep(false);
        assert_eq!(events, vec![SweepEvent::Modified(PathBuf::from("data/hot.txt"))]);
    }

    #[test]
    fn quiescent_files_leave_the_fast_track() {
        let (dir, mut sweeper) = fixture();
        sweeper.setup().expect("setup");

        fs::write(dir.path().join("data/hot.txt"), b"v1").expect("write");
        sweeper.sweep(true);
        assert!(sweeper.fast_track.contains_key(Path::new("data/hot.txt")));

        // Pretend the wall clock moved past the quiescence window.
        let future = SystemTime::now() + QUIESCENCE + Duration::from_secs(1);
        sweeper.sweep_at(false, future);
        assert!(!sweeper.fast_track.contains_key(Path::new("data/hot.txt")));
    }

    #[test]
    fn chmod_transitions_become_hints() {
        let (dir, mut sweeper) = fixture();
        sweeper.setup().expect("setup");
        let abs = dir.path().join("data/a.txt");

        fs::set_permissions(&abs, fs::Permissions::from_mode(0o444)).expect("chmod");
        let events = sweeper.sweep(true);
        assert_eq!(events, vec![SweepEvent::LockHint(PathBuf::from("data/a.txt"))]);

        fs::set_permissions(&abs, fs::Permissions::from_mode(0o644)).expect("chmod");
        let events = sweeper.sweep(true);
        assert_eq!(events, vec![SweepEvent::UnlockHint(PathBuf::from("data/a.txt"))]);
    }

    #[test]
    fn wnts_subtree_is_never_scanned() {
        let (dir, mut sweeper) = fixture();
        sweeper.setup().expect("setup");
        assert!(sweeper.sweep(true).is_empty());

        fs::write(dir.path().join("data/.wnts/ghost.txt"), b"x").expect("write");
        assert!(sweeper.sweep(true).is_empty());
    }

    fn set_mtime(path: &Path, to: SystemTime) {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .expect("open for mtime");
        file.set_modified(to).expect("set mtime");
    }
}
