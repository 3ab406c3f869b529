//! The poll/notify bridge (C8): retained poll handles and kernel
//! notifications.
//!
//! The native layer already exposes [`crate::Notifier`]/[`crate::PollHandle`]
//! for sending a `FUSE_NOTIFY_POLL` message down the channel; this module
//! is the bookkeeping layer on top that §4.8 calls for -- a map from the
//! kernel-supplied opaque key to a ref-counted, idempotently-destroyable
//! record, so a handler can hold onto a poll handle across suspension
//! points without racing its own teardown.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Notifier, PollHandle};

struct PollEntry {
    notifier: Notifier,
    ref_count: usize,
    alive: bool,
}

/// Maintains the set of poll handles currently retained because a `poll`
/// upcall returned `keepPolling=true`.
pub struct PollBridge {
    handles: Mutex<HashMap<u64, PollEntry>>,
}

impl std::fmt::Debug for PollBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollBridge")
            .field("retained", &self.handles.lock().len())
            .finish()
    }
}

impl PollBridge {
    /// An empty poll bridge.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Records a poll handle returned by a `poll` upcall with
    /// `keepPolling=true`. Calling this again for the same key bumps its
    /// reference count instead of creating a duplicate entry.
    pub fn retain(&self, handle: PollHandle, notifier: Notifier) {
        let mut handles = self.handles.lock();
        handles
            .entry(handle.0)
            .and_modify(|e| e.ref_count += 1)
            .or_insert(PollEntry {
                notifier,
                ref_count: 1,
                alive: true,
            });
    }

    /// `notifyPollHandle(key, urgent)`: synchronously signals the kernel
    /// that readiness changed. Returns `false` if the key is unknown or
    /// has already been destroyed; `urgent` is accepted for interface
    /// parity with the spec but the underlying kernel notification is a
    /// single best-effort message regardless of priority.
    pub fn notify(&self, key: u64, _urgent: bool) -> bool {
        let notifier = {
            let handles = self.handles.lock();
            match handles.get(&key) {
                Some(entry) if entry.alive => entry.notifier.clone(),
                _ => return false,
            }
        };
        match notifier.poll(PollHandle(key)) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("poll notification for handle {key} failed: {e}");
                false
            }
        }
    }

    /// `destroyPollHandle(key)`: idempotent. Returns `true` exactly once
    /// per live handle -- the first caller to observe `alive` tears it
    /// down; every later caller (including concurrent ones) sees `false`.
    pub fn destroy(&self, key: u64) -> bool {
        let mut handles = self.handles.lock();
        match handles.get_mut(&key) {
            Some(entry) if entry.alive => {
                entry.alive = false;
                entry.ref_count = entry.ref_count.saturating_sub(1);
                if entry.ref_count == 0 {
                    handles.remove(&key);
                }
                true
            }
            _ => false,
        }
    }

    /// Tears down every retained handle, for use during shutdown. Returns
    /// the number of handles that were still alive.
    pub fn teardown_all(&self) -> usize {
        let mut handles = self.handles.lock();
        let alive = handles.values().filter(|e| e.alive).count();
        handles.clear();
        alive
    }

    /// Number of handles currently retained (alive or not yet fully
    /// dereferenced), for diagnostics.
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// True if no handles are retained.
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

impl Default for PollBridge {
    fn default() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelSender;
    use crate::io_ops::{FileDescriptorRawHandle, SubChannel};
    use std::os::unix::io::IntoRawFd;
    use std::sync::Arc;

    fn fake_notifier() -> Notifier {
        // A channel sender wrapping a freshly opened /dev/null fd is
        // enough to exercise the bridge's own bookkeeping; the actual
        // `write` syscall this triggers is not under test here. Ownership
        // of the fd transfers to the handle, which closes it on drop.
        let fd = std::fs::OpenOptions::new()
            .write(true)
            .open("/dev/null")
            .unwrap()
            .into_raw_fd();
        let handle = FileDescriptorRawHandle::new(fd);
        let sub_channel = SubChannel::new(handle).unwrap();
        Notifier::new(ChannelSender(Arc::new(sub_channel)))
    }

    #[test]
    fn destroy_is_idempotent() {
        let bridge = PollBridge::new();
        bridge.retain(PollHandle(7), fake_notifier());
        assert!(bridge.destroy(7));
        assert!(!bridge.destroy(7));
    }

    #[test]
    fn unknown_key_notify_returns_false() {
        let bridge = PollBridge::new();
        assert!(!bridge.notify(42, false));
    }

    #[test]
    fn destroyed_handle_notify_returns_false_and_is_side_effect_free() {
        let bridge = PollBridge::new();
        bridge.retain(PollHandle(1), fake_notifier());
        bridge.destroy(1);
        assert!(!bridge.notify(1, false));
    }
}
