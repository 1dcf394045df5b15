pub mod cbor;
pub mod config;
pub mod diff;
pub mod error;
pub mod lock_store;
pub mod message_manager;
pub mod overlay;
pub mod peer;
pub mod peer_manager;
pub mod queue;
pub mod runtime;
pub mod sweeper;
pub mod wire;

pub use config::{NodeConfig, DEFAULT_PORT, STATE_DIR};
pub use diff::{apply_diff, extract_diff, invert, undo_diff, Hunk};
pub use error::{SyncError, TransportError};
pub use lock_store::{LockRecord, LockStore};
pub use message_manager::{MessageManager, ProcessOutcome};
pub use overlay::{LanOverlay, NodeIdentity, OverlayEvent, OverlayNode, OverlayRuntime};
pub use peer::{FrameRouter, Peer};
pub use peer_manager::{PeerDirectory, PeerManager};
pub use queue::{MessageQueue, MessageSink, ResendCache};
pub use runtime::Runtime;
pub use sweeper::{FsSweeper, SweepEvent};
pub use wire::{Body, FileMeta, FrameDecoder, Header, Message, MsgType, PeerEntry};

#[cfg(test)]
mod conformance;
