//! The bridge runtime: the subsystem that owns cross-world marshalling
//! between the native FUSE session (`channel.rs`, `session.rs`, `mnt/`,
//! `ll/`, the sync [`crate::Filesystem`] trait) and an async, managed-style
//! handler.
//!
//! Organised by the components named in the architecture this module
//! implements:
//!
//! - [`types`] -- C1, the branded 64-bit id / timestamp / stat layer.
//! - [`buffer`] -- C2, ownership-tracked cross-boundary byte buffers.
//! - [`dispatcher`] -- C3, the thread-safe operation dispatcher.
//! - [`adapters`] -- C4, per-opcode argument/reply shapes.
//! - [`write_queue`] -- C5, the per-fd prioritised write serializer.
//! - [`shutdown`] -- C7, the staged drain/unmount state machine.
//! - [`poll`] -- C8, retained poll handles and kernel notification.
//! - [`copy_range`] -- C9, the `copy_file_range` fastpath/fallback.
//!
//! C6 (session & mount lifecycle) is the pre-existing native
//! `Session`/`MountOption` surface in `session.rs`/`mnt/`; this module
//! does not duplicate it, only hands it requests and takes replies.

pub mod adapters;
pub mod buffer;
pub mod copy_range;
pub mod dispatcher;
pub mod error;
pub mod poll;
pub mod shutdown;
pub mod types;
pub mod write_queue;

/// The bridge's three configuration structs, grouped the way
/// `mnt::mount_options::Config` is the single place mount options live.
/// Each struct is defined alongside the subsystem it configures; this
/// module just gives callers one import path for all of them.
pub mod config {
    pub use super::dispatcher::DispatcherConfig;
    pub use super::shutdown::ShutdownConfig;
    pub use super::write_queue::WriteQueueConfig;
}

pub use adapters::{ConnInfo, DirEntry, DirEntryPlus, IoctlArg, LockInfo, Operation, PartialStat, Reply, SetxattrFlags, TimeSpec};
pub use buffer::{BufferHandle, BufferOwner, Finalizer};
pub use copy_range::{CopyRangeAdapter, CopyStatsSnapshot};
pub use dispatcher::{AbortSignal, Dispatcher, DispatcherStatsSnapshot, OperationHandler};
pub use error::{BridgeError, FuseErrno};
pub use poll::PollBridge;
pub use shutdown::{ShutdownCallbacks, ShutdownCoordinator, ShutdownState, ShutdownStatsSnapshot};
pub use types::{is_valid_errno, Fh, Ino, OpName, SetattrMask, Stat, Statvfs, TimePrecision, Timespec, Timestamp};
pub use write_queue::{FdStats, Priority, WriteQueue, WriteResult};

use std::sync::Arc;

/// The bridge runtime for one mounted session: owns the dispatcher, write
/// serializer, shutdown coordinator, and poll/copy-range adapters as one
/// unit, wired together the way §2's data-flow diagram describes.
///
/// A session loop that receives kernel requests from the native channel
/// calls [`Bridge::dispatcher`] to enqueue them and [`Bridge::shutdown`]
/// to tear the whole thing down; everything else is reached through the
/// individual component accessors.
#[derive(Debug)]
pub struct Bridge {
    dispatcher: Arc<Dispatcher>,
    write_queue: Arc<WriteQueue>,
    shutdown: Arc<ShutdownCoordinator>,
    poll: Arc<PollBridge>,
    copy_range: Arc<CopyRangeAdapter>,
}

impl Bridge {
    /// Builds a bridge runtime with the given component configurations.
    pub fn new(
        dispatcher_config: config::DispatcherConfig,
        write_queue_config: config::WriteQueueConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(dispatcher_config);
        let write_queue = WriteQueue::new(write_queue_config);
        let shutdown = ShutdownCoordinator::new(Arc::clone(&dispatcher), Arc::clone(&write_queue));
        Self {
            dispatcher,
            write_queue,
            shutdown,
            poll: PollBridge::new(),
            copy_range: CopyRangeAdapter::new(),
        }
    }

    /// The operation dispatcher (C3).
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The write serializer (C5).
    pub fn write_queue(&self) -> &Arc<WriteQueue> {
        &self.write_queue
    }

    /// The shutdown coordinator (C7).
    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The poll/notify bridge (C8).
    pub fn poll(&self) -> &Arc<PollBridge> {
        &self.poll
    }

    /// The copy-range adapter (C9).
    pub fn copy_range(&self) -> &Arc<CopyRangeAdapter> {
        &self.copy_range
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(config::DispatcherConfig::default(), config::WriteQueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bridge_wires_shutdown_to_its_own_dispatcher_and_write_queue() {
        let bridge = Bridge::default();
        bridge.dispatcher().run();
        bridge
            .shutdown_coordinator()
            .initiate_graceful_shutdown("test", std::time::Duration::from_millis(20))
            .await;
        assert_eq!(bridge.shutdown_coordinator().state(), ShutdownState::Closed);
        let err = bridge
            .dispatcher()
            .enqueue(crate::RequestId::from(1u64), Operation::Destroy)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ShuttingDown));
    }
}
