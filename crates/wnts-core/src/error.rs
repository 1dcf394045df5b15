// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::path::PathBuf;

/// Error kinds callers must be able to match on.
///
/// Most operation seams return `anyhow::Result`; these variants surface
/// where the caller's reaction differs per kind — connect retries move to
/// the next backup, link loss retires the peer, frame corruption is
/// recovered through a resend request.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("overlay runtime unavailable: {0}")]
    OverlayUnavailable(String),

    #[error("connect to {ip}:{port} failed after {attempts} attempts")]
    ConnectFailed {
        ip: std::net::IpAddr,
        port: u16,
        attempts: u32,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("frame integrity hash mismatch (stored {stored:#x}, computed {computed:#x})")]
    FrameCorrupt { stored: u64, computed: u64 },

    #[error("unknown message type tag {0}")]
    UnknownMessageType(u8),

    #[error("filesystem operation on {} failed: {source}", path.display())]
    Fs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Classified socket failures. `NotConnected` and `PollError` retire the
/// peer peacefully as a link loss; everything else is logged and the read
/// loop continues.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer endpoint is not connected")]
    NotConnected,

    #[error("poll reported an error condition on the socket")]
    PollError,

    #[error("i/o failure: {0}")]
    Other(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this failure means the link is gone for good.
    pub fn is_link_loss(&self) -> bool {
        matches!(self, Self::NotConnected | Self::PollError)
    }

    /// Classify an I/O error the way the read loop needs it: terminal
    /// disconnection kinds collapse into `NotConnected`, poll-level error
    /// conditions into `PollError`, the rest stay transient.
    pub fn classify(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotConnected
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Self::NotConnected,
            _ => Self::Other(err),
        }
    }
}

impl SyncError {
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Fs {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn terminal_kinds_classify_as_link_loss() {
        for kind in [
            io::ErrorKind::NotConnected,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
        ] {
            let classified = TransportError::classify(io::Error::new(kind, "gone"));
            assert!(classified.is_link_loss(), "{kind:?} should retire the peer");
        }
    }

    #[test]
    fn transient_kinds_stay_transient() {
        let classified =
            TransportError::classify(io::Error::new(io::ErrorKind::WouldBlock, "try again"));
        assert!(!classified.is_link_loss());
    }

    #[test]
    fn fs_errors_name_the_file() {
        let err = SyncError::fs(
            "data/broken.txt",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("data/broken.txt"));
    }

    #[test]
    fn frame_corruption_reports_both_hashes() {
        let err = SyncError::FrameCorrupt {
            stored: 0x10,
            computed: 0x20,
        };
        let text = err.to_string();
        assert!(text.contains("0x10") && text.contains("0x20"));
    }
}
