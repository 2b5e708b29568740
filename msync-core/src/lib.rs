//! Core library for msync – a continuous two-way directory mirror.
//!
//! On connect the two sides exchange metadata seeds, reconcile any drift by
//! modification time, then stream incremental updates until one side goes
//! away. The engine is transport-agnostic: watchers, filesystem access, and
//! the peer stream all plug in as capabilities.

mod config;
mod fs_access;
mod proto;
mod queues;
mod rules;
mod save_local;
mod save_remote;
mod server;
mod session;
mod sync;
mod tasks;
mod tree;
mod update;
mod watcher;

pub use config::MountConfig;
pub use fs_access::{FileAccess, NativeFileAccess, StubFileAccess};
pub use proto::{
    memory_pair, read_frame, write_frame, FramedReceiver, FramedSender, Hello, PeerReceiver,
    PeerSender, WireMessage, MAX_FRAME_BYTES,
};
pub use queues::{Backlog, Queues, SyncEvent};
pub use rules::PathRules;
pub use save_local::SaveToLocal;
pub use save_remote::SaveToRemote;
pub use server::{MountEndpoint, Server};
pub use session::{accept_session, connect_session, SessionHandle, WatcherFactory};
pub use sync::SyncLogic;
pub use tasks::SessionState;
pub use tree::{now_millis, NodeId, NodeType, UpdateTree};
pub use update::{Update, UpdateKind, INITIAL_SYNC_MARKER};
pub use watcher::{scan_mount, FileWatcher, NotifyFileWatcher, StubFileWatcher};
