// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! End-to-end scenarios over real sockets: two full runtimes on loopback
//! aliases converging through the actual wire path.

use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::lock_store::LockStore;
use crate::runtime::Runtime;

struct Node {
    _dir: tempfile::TempDir,
    root: PathBuf,
    ip: IpAddr,
    port: u16,
    task: JoinHandle<()>,
}

impl Node {
    async fn start(bind: &str, folders: Vec<&str>, gateway: Option<(IpAddr, u16)>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        for folder in &folders {
            fs::create_dir_all(root.join(folder)).expect("mkdir");
        }
        let config = NodeConfig {
            port: 0,
            folders: folders.iter().map(PathBuf::from).collect(),
            gateway,
            bind_ip: Some(bind.parse().expect("valid ip")),
            work_root: root.clone(),
            identity_path: root.join(".nodedata"),
            full_sweep_every: 1,
        };
        let mut runtime = Runtime::start(config).await.expect("start runtime");
        let ip = runtime.ip();
        let port = runtime.service_port();
        let task = tokio::spawn(async move { runtime.run().await });
        Self {
            _dir: dir,
            root,
            ip,
            port,
            task,
        }
    }

    fn stop(&self) {
        self.task.abort();
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

fn content_of(path: &Path) -> Option<Vec<u8>> {
    fs::read(path).ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_node_mesh_bootstraps_and_propagates_changes() {
    // Node A bootstraps a mesh with one seeded file.
    let a = Node::start("127.0.0.2", vec!["dir"], None).await;
    fs::write(a.root.join("dir/hello.txt"), b"hi").expect("seed file");

    // Node B joins through A and adopts the folder list.
    let b = Node::start("127.0.0.3", vec![], Some((a.ip, a.port))).await;

    // Scenario: the seeded file reaches the joiner via the initial sync.
    wait_for("initial sync of hello.txt", Duration::from_secs(4), || {
        content_of(&b.root.join("dir/hello.txt")) == Some(b"hi".to_vec())
    })
    .await;

    // Scenario: a write on A propagates to B.
    fs::write(a.root.join("dir/hello.txt"), b"bye").expect("rewrite");
    wait_for("propagated write", Duration::from_secs(4), || {
        content_of(&b.root.join("dir/hello.txt")) == Some(b"bye".to_vec())
    })
    .await;

    // New files propagate too, including into subdirectories.
    fs::create_dir_all(a.root.join("dir/sub")).expect("mkdir");
    fs::write(a.root.join("dir/sub/deep.txt"), b"deep").expect("write");
    wait_for("propagated creation", Duration::from_secs(4), || {
        content_of(&b.root.join("dir/sub/deep.txt")) == Some(b"deep".to_vec())
    })
    .await;

    // And writes flow the other way once B is a full member.
    fs::write(b.root.join("dir/from_b.txt"), b"reverse").expect("write");
    wait_for("reverse propagation", Duration::from_secs(4), || {
        content_of(&a.root.join("dir/from_b.txt")) == Some(b"reverse".to_vec())
    })
    .await;

    a.stop();
    b.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deletions_replicate_without_echoing_back() {
    let a = Node::start("127.0.0.4", vec!["dir"], None).await;
    fs::write(a.root.join("dir/doomed.txt"), b"x").expect("seed");

    let b = Node::start("127.0.0.5", vec![], Some((a.ip, a.port))).await;
    wait_for("initial sync", Duration::from_secs(4), || {
        b.root.join("dir/doomed.txt").exists()
    })
    .await;

    fs::remove_file(a.root.join("dir/doomed.txt")).expect("rm");
    wait_for("replicated delete", Duration::from_secs(4), || {
        !b.root.join("dir/doomed.txt").exists()
    })
    .await;

    // The mirror went with it on both sides.
    wait_for("mirrors cleaned", Duration::from_secs(2), || {
        !a.root.join("dir/.wnts/doomed.txt").exists()
            && !b.root.join("dir/.wnts/doomed.txt").exists()
    })
    .await;

    a.stop();
    b.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_chmod_becomes_a_mesh_wide_advisory_lock() {
    let a = Node::start("127.0.0.6", vec!["dir"], None).await;
    fs::write(a.root.join("dir/guarded.txt"), b"precious").expect("seed");

    let b = Node::start("127.0.0.7", vec![], Some((a.ip, a.port))).await;
    wait_for("initial sync", Duration::from_secs(4), || {
        b.root.join("dir/guarded.txt").exists()
    })
    .await;

    // Dropping the write bits locally is the lock request.
    fs::set_permissions(
        a.root.join("dir/guarded.txt"),
        fs::Permissions::from_mode(0o444),
    )
    .expect("chmod");

    let rel = PathBuf::from("dir/guarded.txt");
    wait_for("lock visible on both nodes", Duration::from_secs(6), || {
        let a_locked = LockStore::new(&a.root).is_locked(&rel);
        let b_locked = LockStore::new(&b.root).is_locked(&rel);
        let b_bits = fs::metadata(b.root.join("dir/guarded.txt"))
            .map(|m| m.permissions().mode() & 0o222)
            .unwrap_or(0o222);
        a_locked && b_locked && b_bits == 0
    })
    .await;

    // The lock holder is A on both sides.
    let (record_a, _) = LockStore::new(&a.root).read_lock(&rel).expect("a lock");
    let (record_b, _) = LockStore::new(&b.root).read_lock(&rel).expect("b lock");
    assert_eq!(record_a.originator, a.ip);
    assert_eq!(record_b.originator, a.ip);

    a.stop();
    b.stop();
}
