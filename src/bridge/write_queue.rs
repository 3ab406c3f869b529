//! The write serializer (C5): per-fd ordered, prioritised write queues.
//!
//! Mirrors the dispatcher's "bounded channel, single consumer" shape but
//! keyed per file handle, since writes on the same fd must be executed
//! in priority order while writes on distinct fds may run concurrently.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use super::buffer::BufferHandle;
use super::types::Fh;

/// One of the four priority bands a queued write may be assigned.
/// Ordered `Urgent > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Drained last.
    Low,
    /// Drained third.
    Normal,
    /// Drained second.
    High,
    /// Drained first.
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// A monotonic id assigned to a write at enqueue time, also used to break
/// ties between writes in the same priority band (FIFO within a band).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WriteOpId(u64);

/// A single queued write, awaiting the executor.
pub struct QueuedWrite<'a> {
    /// File handle the write targets.
    pub fh: Fh,
    /// Byte offset within the file.
    pub offset: i64,
    /// Payload.
    pub buffer: BufferHandle<'a>,
    /// Priority band.
    pub priority: Priority,
    /// Monotonic enqueue sequence, used as the FIFO tiebreaker.
    pub sequence: WriteOpId,
}

struct Entry {
    priority: Priority,
    sequence: WriteOpId,
    offset: i64,
    len: usize,
    buffer: BufferHandle<'static>,
    completion: oneshot::Sender<WriteResult>,
}

/// What `processWriteQueues`'s executor returns for one write: either the
/// number of bytes it acknowledged, or a negative errno.
#[derive(Debug, Clone, Copy)]
pub struct WriteResult(pub Result<u32, crate::Errno>);

/// Ordered purely by `(priority, sequence)` so a `BinaryHeap` pops the
/// highest-priority, earliest-enqueued write first: ties broken by
/// earliest sequence, which is why `sequence` is wrapped in [`Reverse`]
/// for max-heap pop-smallest-sequence-first semantics.
struct HeapKey(Priority, Reverse<WriteOpId>);

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0 && self.1 == other.1
    }
}
impl Eq for HeapKey {}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0).then_with(|| self.1.cmp(&other.1))
    }
}

struct FdQueue {
    heap: BinaryHeap<(HeapKey, usize)>,
    entries: HashMap<usize, Entry>,
    next_slot: usize,
    depth_peak: usize,
    bytes_written: u64,
    bytes_pending: u64,
}

impl FdQueue {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_slot: 0,
            depth_peak: 0,
            bytes_written: 0,
            bytes_pending: 0,
        }
    }

    fn push(&mut self, entry: Entry) {
        let key = HeapKey(entry.priority, Reverse(entry.sequence));
        let slot = self.next_slot;
        self.next_slot += 1;
        self.bytes_pending += entry.len as u64;
        self.entries.insert(slot, entry);
        self.heap.push((key, slot));
        self.depth_peak = self.depth_peak.max(self.entries.len());
    }

    fn pop(&mut self) -> Option<Entry> {
        let (_, slot) = self.heap.pop()?;
        let entry = self.entries.remove(&slot)?;
        self.bytes_pending -= entry.len as u64;
        Some(entry)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Statistics for one fd's write queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct FdStats {
    /// Current number of queued writes.
    pub depth: usize,
    /// Highest depth ever observed.
    pub peak_depth: usize,
    /// Total bytes acknowledged by the executor.
    pub bytes_written: u64,
    /// Total bytes still queued.
    pub bytes_pending: u64,
}

/// Configuration for [`WriteQueue::new`].
#[derive(Debug, Clone, Copy)]
pub struct WriteQueueConfig {
    /// Default max queue size for an fd with no specific override.
    pub default_max_queue_size: usize,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self { default_max_queue_size: 256 }
    }
}

/// The write serializer. One instance serves an entire session; it
/// multiplexes every open fd's queue.
pub struct WriteQueue {
    config: Mutex<WriteQueueConfig>,
    per_fd_limit: Mutex<HashMap<Fh, usize>>,
    queues: Mutex<HashMap<Fh, FdQueue>>,
    sequence: AtomicU64,
    notify: Notify,
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("config", &self.config)
            .field("open_fds", &self.queues.lock().len())
            .finish()
    }
}

impl WriteQueue {
    /// Creates an empty write serializer.
    pub fn new(config: WriteQueueConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            per_fd_limit: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    /// `configureWriteQueues(cfg)`.
    pub fn configure(&self, config: WriteQueueConfig) {
        *self.config.lock() = config;
    }

    /// Sets a per-fd override for the maximum queue size.
    pub fn set_fd_limit(&self, fh: Fh, limit: usize) {
        self.per_fd_limit.lock().insert(fh, limit);
    }

    fn limit_for(&self, fh: Fh) -> usize {
        self.per_fd_limit
            .lock()
            .get(&fh)
            .copied()
            .unwrap_or(self.config.lock().default_max_queue_size)
    }

    /// `enqueueWrite`: returns the monotonic operation id and a receiver
    /// that resolves once the executor acknowledges (or rejects) the
    /// write. Fails with `EAGAIN` if the fd's queue is already at its
    /// configured maximum.
    pub fn enqueue(
        &self,
        fh: Fh,
        offset: i64,
        buffer: BufferHandle<'static>,
        priority: Priority,
    ) -> Result<(WriteOpId, oneshot::Receiver<WriteResult>), crate::Errno> {
        let sequence = WriteOpId(self.sequence.fetch_add(1, Ordering::Relaxed));
        let len = buffer.len();
        let (tx, rx) = oneshot::channel();
        let mut queues = self.queues.lock();
        let limit = self.limit_for(fh);
        let queue = queues.entry(fh).or_insert_with(FdQueue::new);
        if queue.entries.len() >= limit {
            return Err(crate::Errno::EAGAIN);
        }
        queue.push(Entry {
            priority,
            sequence,
            offset,
            len,
            buffer,
            completion: tx,
        });
        drop(queues);
        self.notify.notify_waiters();
        Ok((sequence, rx))
    }

    /// `processWriteQueues(executor)`: drives up to `max_ops` ready
    /// writes, one per fd per call (so distinct fds make concurrent
    /// progress), calling `executor(fh, offset, &bytes)` for each and
    /// completing its waiting [`WriteQueue::enqueue`] caller.
    pub async fn process_write_queues<E, Fut>(&self, max_ops: usize, executor: E) -> usize
    where
        E: Fn(Fh, i64, BufferHandle<'static>) -> Fut,
        Fut: std::future::Future<Output = WriteResult>,
    {
        let mut processed = 0;
        // Round-robin across fds so distinct fds make concurrent progress,
        // but keep draining the same fd while it still has ready writes
        // and budget remains, so a single busy fd isn't starved down to
        // one write per call.
        let ready: Vec<(Fh, Entry)> = {
            let mut queues = self.queues.lock();
            let mut ready = Vec::new();
            loop {
                let mut made_progress = false;
                for (fh, queue) in queues.iter_mut() {
                    if ready.len() >= max_ops {
                        break;
                    }
                    if let Some(entry) = queue.pop() {
                        ready.push((*fh, entry));
                        made_progress = true;
                    }
                }
                if !made_progress || ready.len() >= max_ops {
                    break;
                }
            }
            ready
        };
        for (fh, entry) in ready {
            let offset = entry.offset;
            let len = entry.len as u64;
            let buffer = entry.buffer;
            let result = executor(fh, offset, buffer).await;
            if let WriteResult(Ok(written)) = result {
                let mut queues = self.queues.lock();
                if let Some(q) = queues.get_mut(&fh) {
                    q.bytes_written += u64::from(written);
                }
                let _ = len;
            }
            let _ = entry.completion.send(result);
            processed += 1;
        }
        processed
    }

    /// `flushWriteQueue(fd, timeout)`: blocks until the fd's queue is
    /// empty or `timeout` elapses.
    pub async fn flush_queue(&self, fh: Fh, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let queues = self.queues.lock();
                match queues.get(&fh) {
                    None => return true,
                    Some(q) if q.is_empty() => return true,
                    _ => {}
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            let wait = (deadline - Instant::now()).min(Duration::from_millis(10));
            tokio::time::sleep(wait).await;
        }
    }

    /// `flushAllWriteQueues(timeout)`: the global variant, used during
    /// shutdown. Any writes still queued when `timeout` elapses are
    /// completed with `EIO` and dropped, per §4.5's invariant that "no
    /// operation leaves the queue without a completion."
    pub async fn flush_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queues.lock().values().all(FdQueue::is_empty) {
                return true;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10).min(deadline - Instant::now())).await;
        }
        let mut queues = self.queues.lock();
        for queue in queues.values_mut() {
            while let Some(entry) = queue.pop() {
                let _ = entry.completion.send(WriteResult(Err(crate::Errno::EIO)));
            }
        }
        false
    }

    /// `getWriteQueueStats(fh)`.
    pub fn stats(&self, fh: Fh) -> FdStats {
        let queues = self.queues.lock();
        match queues.get(&fh) {
            None => FdStats::default(),
            Some(q) => FdStats {
                depth: q.entries.len(),
                peak_depth: q.depth_peak,
                bytes_written: q.bytes_written,
                bytes_pending: q.bytes_pending,
            },
        }
    }

    /// `resetWriteQueueStats`.
    pub fn reset_stats(&self, fh: Fh) {
        if let Some(q) = self.queues.lock().get_mut(&fh) {
            q.depth_peak = q.entries.len();
            q.bytes_written = 0;
        }
    }

    /// Drops bookkeeping for an fd once `release` has been handled,
    /// matching "the bridge removes the fh from internal tables and the
    /// write serializer."
    pub fn forget_fd(&self, fh: Fh) {
        self.queues.lock().remove(&fh);
        self.per_fd_limit.lock().remove(&fh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_on_same_fd_execute_in_priority_then_fifo_order() {
        let queue = WriteQueue::new(WriteQueueConfig::default());
        let fh = Fh::from(1u64);
        let (_id1, _rx1) = queue
            .enqueue(fh, 0, BufferHandle::owned(b"aaaa".to_vec()).unwrap(), Priority::Normal)
            .unwrap();
        let (_id2, _rx2) = queue
            .enqueue(fh, 4, BufferHandle::owned(b"BBBB".to_vec()).unwrap(), Priority::Urgent)
            .unwrap();
        let (_id3, _rx3) = queue
            .enqueue(fh, 8, BufferHandle::owned(b"cccc".to_vec()).unwrap(), Priority::Normal)
            .unwrap();

        let order = std::sync::Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        queue
            .process_write_queues(3, move |_fh, offset, _buf| {
                let order = order2.clone();
                async move {
                    order.lock().push(offset);
                    WriteResult(Ok(4))
                }
            })
            .await;
        assert_eq!(*order.lock(), vec![4, 0, 8]);
    }

    #[tokio::test]
    async fn exceeding_fd_limit_returns_eagain() {
        let mut config = WriteQueueConfig::default();
        config.default_max_queue_size = 1;
        let queue = WriteQueue::new(config);
        let fh = Fh::from(9u64);
        queue
            .enqueue(fh, 0, BufferHandle::owned(b"a".to_vec()).unwrap(), Priority::Normal)
            .unwrap();
        let err = queue
            .enqueue(fh, 1, BufferHandle::owned(b"b".to_vec()).unwrap(), Priority::Normal)
            .unwrap_err();
        assert_eq!(err, crate::Errno::EAGAIN);
    }
}
