//! The operation dispatcher (C3): the serialisation point between FUSE's
//! multi-threaded native worker pool and the single-threaded cooperative
//! managed runtime.
//!
//! Modelled the way the rest of this crate hands work across that same
//! boundary -- a bounded channel plus one consumer task, the same shape
//! `channel.rs`/`session.rs` use for the native I/O loop -- except here
//! the "other side" is a user-supplied async handler instead of a
//! kernel fd.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::RequestId;

use super::adapters::{Operation, Reply};
use super::error::BridgeError;
use super::types::OpName;

/// `setOperationHandler`'s registered callback: takes an unmarshalled
/// [`Operation`] and a cancellation signal, returns a [`Reply`].
///
/// Boxed as a trait object because each opcode's payload has a different
/// shape; the dispatcher only needs to call it and doesn't care which.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Reply<'static>> + Send>>;

/// A registered operation handler.
pub trait OperationHandler: Send + Sync {
    /// Handle one request. `aborted` resolves if the request's abort
    /// signal fires while the handler is still running; conforming
    /// handlers should race against it and return promptly, but the
    /// dispatcher enforces the EINTR override regardless.
    fn call(&self, op: Operation<'static>, aborted: AbortSignal) -> HandlerFuture;
}

impl<F> OperationHandler for F
where
    F: Fn(Operation<'static>, AbortSignal) -> HandlerFuture + Send + Sync,
{
    fn call(&self, op: Operation<'static>, aborted: AbortSignal) -> HandlerFuture {
        self(op, aborted)
    }
}

/// A cooperative cancellation signal combining an optional caller signal
/// with an optional timeout, per §5's "Cancellation" contract.
#[derive(Clone)]
pub struct AbortSignal {
    fired: Arc<tokio::sync::Notify>,
    already: Arc<std::sync::atomic::AtomicBool>,
}

impl AbortSignal {
    fn new() -> Self {
        Self {
            fired: Arc::new(tokio::sync::Notify::new()),
            already: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Builds a standalone abort signal not tied to a dispatcher-owned
    /// request, for adapters (e.g. the copy-range adapter) that want to
    /// honour cooperative cancellation outside of a full dispatcher round
    /// trip, and for unit tests.
    pub(crate) fn new_for_tests() -> Self {
        Self::new()
    }

    /// Fires the abort signal. Idempotent.
    pub fn abort(&self) {
        if !self.already.swap(true, Ordering::SeqCst) {
            self.fired.notify_waiters();
        }
    }

    /// True once [`AbortSignal::abort`] has been called.
    pub fn is_aborted(&self) -> bool {
        self.already.load(Ordering::SeqCst)
    }

    /// Resolves once the signal fires. A handler may `select!` on this
    /// alongside its own I/O to respond to cancellation promptly.
    pub async fn aborted(&self) {
        if self.is_aborted() {
            return;
        }
        self.fired.notified().await;
    }
}

/// Configuration for [`Dispatcher::new`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of requests the queue may hold before `enqueue`
    /// starts rejecting new work.
    pub max_queue_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { max_queue_size: 1000 }
    }
}

/// A point-in-time snapshot of dispatcher statistics.
#[derive(Debug, Clone, Default)]
pub struct DispatcherStatsSnapshot {
    /// Total requests ever enqueued.
    pub enqueued: u64,
    /// Total requests ever completed (replied or abandoned).
    pub completed: u64,
    /// Current queue depth.
    pub depth: usize,
    /// Highest queue depth ever observed.
    pub peak_depth: usize,
    /// Per-opcode completion counts.
    pub per_opcode: Vec<(OpName, u64)>,
}

#[derive(Default)]
struct Stats {
    enqueued: AtomicU64,
    completed: AtomicU64,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    per_opcode: DashMap<OpName, AtomicU64>,
}

impl Stats {
    fn note_enqueue(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
    }

    fn note_dequeue(&self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }

    fn note_complete(&self, op: OpName) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.per_opcode
            .entry(op)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            depth: self.depth.load(Ordering::Relaxed),
            peak_depth: self.peak_depth.load(Ordering::Relaxed),
            per_opcode: self
                .per_opcode
                .iter()
                .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

struct QueuedRequest {
    id: RequestId,
    op: Operation<'static>,
    abort: AbortSignal,
    reply_tx: oneshot::Sender<Reply<'static>>,
}

/// The operation dispatcher. One instance serves one mounted session.
pub struct Dispatcher {
    config: DispatcherConfig,
    handlers: DashMap<OpName, Arc<dyn OperationHandler>>,
    tx: mpsc::Sender<QueuedRequest>,
    rx: Mutex<Option<mpsc::Receiver<QueuedRequest>>>,
    in_flight: DashMap<RequestId, AbortSignal>,
    shutting_down: std::sync::atomic::AtomicBool,
    unmounting: std::sync::atomic::AtomicBool,
    stats: Stats,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("handler_count", &self.handlers.len())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher with a bounded queue of `config.max_queue_size`.
    pub fn new(config: DispatcherConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.max_queue_size.max(1));
        Arc::new(Self {
            config,
            handlers: DashMap::new(),
            tx,
            rx: Mutex::new(Some(rx)),
            in_flight: DashMap::new(),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
            unmounting: std::sync::atomic::AtomicBool::new(false),
            stats: Stats::default(),
        })
    }

    /// `setOperationHandler`: idempotent; replaces any existing handler
    /// for this name. Fails silently (returns `false`) for names outside
    /// the closed allowlist -- there are none, since [`OpName`] already
    /// is that allowlist, but the signature mirrors the external contract.
    pub fn set_operation_handler(&self, op: OpName, handler: Arc<dyn OperationHandler>) -> bool {
        self.handlers.insert(op, handler);
        true
    }

    /// `removeOperationHandler`: detaches a handler. Returns `true` if
    /// one was present.
    pub fn remove_operation_handler(&self, op: OpName) -> bool {
        self.handlers.remove(&op).is_some()
    }

    /// `enqueue(request)`: safe to call from any native thread. Rejects
    /// new work once shutdown has been requested; the rejection reason
    /// depends on which phase the shutdown coordinator has reached --
    /// `Unmounting` (or later) always wins over the earlier `Draining`
    /// rejection, since unmount is the stronger refusal.
    pub async fn enqueue(
        &self,
        id: RequestId,
        op: Operation<'static>,
    ) -> Result<oneshot::Receiver<Reply<'static>>, BridgeError> {
        if self.unmounting.load(Ordering::Acquire) {
            return Err(BridgeError::Unmounting);
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(BridgeError::ShuttingDown);
        }
        let abort = AbortSignal::new();
        self.in_flight.insert(id, abort.clone());
        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = QueuedRequest { id, op, abort, reply_tx };
        self.stats.note_enqueue();
        self.tx.try_send(queued).map_err(|e| {
            self.stats.note_dequeue();
            self.in_flight.remove(&id);
            match e {
                mpsc::error::TrySendError::Full(_) => BridgeError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => BridgeError::ShuttingDown,
            }
        })?;
        Ok(reply_rx)
    }

    /// Fires the abort signal for `id`, if it is still in flight.
    pub fn abort(&self, id: RequestId) {
        if let Some(signal) = self.in_flight.get(&id) {
            signal.abort();
        }
    }

    /// `initialize`: spawns the single managed-side consumer task that
    /// drains the queue in FIFO order and invokes the registered handler
    /// for each opcode. Each handler call is spawned as its own task so a
    /// slow handler never blocks dequeue of the next request.
    pub fn run(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = this.rx.lock().await.take().expect("run() called twice");
            while let Some(req) = rx.recv().await {
                this.stats.note_dequeue();
                let this2 = Arc::clone(&this);
                tokio::spawn(async move { this2.drive(req).await });
            }
        })
    }

    async fn drive(&self, req: QueuedRequest) {
        let op_name = req.op.op_name();
        let handler = self.handlers.get(&op_name).map(|h| Arc::clone(h.value()));
        let reply = if req.abort.is_aborted() {
            Reply::Err(crate::Errno::EINTR)
        } else if let Some(handler) = handler {
            let fut = handler.call(req.op, req.abort.clone());
            let result = match tokio::spawn(fut).await {
                Ok(reply) => reply,
                Err(join_err) => {
                    warn!("handler for {op_name} panicked: {join_err}");
                    Reply::Err(BridgeError::HandlerPanicked(join_err.to_string()).to_errno())
                }
            };
            if req.abort.is_aborted() && !matches!(result, Reply::Err(_)) {
                Reply::Err(crate::Errno::EINTR)
            } else {
                result
            }
        } else {
            debug!("no handler registered for {op_name}");
            Reply::Err(BridgeError::Unhandled.to_errno())
        };
        self.in_flight.remove(&req.id);
        self.stats.note_complete(op_name);
        let _ = req.reply_tx.send(reply);
    }

    /// Switches the rejection errno new `enqueue` calls see from
    /// `ESHUTDOWN` to `EIO`, mirroring the shutdown coordinator's
    /// transition from `Draining` into `Unmounting`.
    pub(crate) fn mark_unmounting(&self) {
        self.unmounting.store(true, Ordering::Release);
    }

    /// `shutdown(timeout)`: stops accepting new enqueues immediately,
    /// waits up to `timeout` for in-flight requests to drain, then
    /// abandons whatever remains by replying EIO (the caller is expected
    /// to have already dropped their receiver half in that case).
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.in_flight.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let abandoned = self.in_flight.len();
        for entry in self.in_flight.iter() {
            entry.value().abort();
        }
        self.in_flight.clear();
        abandoned
    }

    /// `getDispatcherStats()`.
    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// `resetDispatcherStats()`.
    pub fn reset_stats(&self) {
        self.stats.enqueued.store(0, Ordering::Relaxed);
        self.stats.completed.store(0, Ordering::Relaxed);
        self.stats.peak_depth.store(self.stats.depth.load(Ordering::Relaxed), Ordering::Relaxed);
        self.stats.per_opcode.clear();
    }

    /// `setDispatcherConfig(cfg)`. Only fields that don't affect the
    /// already-allocated channel capacity may be changed at runtime.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::adapters::Operation;

    fn noop_handler() -> Arc<dyn OperationHandler> {
        Arc::new(|_op: Operation<'static>, _abort: AbortSignal| -> HandlerFuture {
            Box::pin(async move { Reply::Ok })
        })
    }

    #[tokio::test]
    async fn enqueue_dispatches_to_registered_handler() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        dispatcher.set_operation_handler(OpName::Destroy, noop_handler());
        dispatcher.run();
        let rx = dispatcher
            .enqueue(RequestId::from(1u64), Operation::Destroy)
            .await
            .unwrap();
        let reply = rx.await.unwrap();
        assert!(matches!(reply, Reply::Ok));
        assert_eq!(dispatcher.stats().completed, 1);
    }

    #[tokio::test]
    async fn unhandled_op_returns_enosys() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        dispatcher.run();
        let rx = dispatcher
            .enqueue(RequestId::from(2u64), Operation::Destroy)
            .await
            .unwrap();
        let reply = rx.await.unwrap();
        assert!(matches!(reply, Reply::Err(e) if e == crate::Errno::ENOSYS));
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_rejected() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        dispatcher.run();
        dispatcher.shutdown(Duration::from_millis(10)).await;
        let err = dispatcher
            .enqueue(RequestId::from(3u64), Operation::Destroy)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ShuttingDown));
    }

    #[tokio::test]
    async fn enqueue_after_unmounting_is_eio_not_eshutdown() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        dispatcher.run();
        dispatcher.shutdown(Duration::from_millis(10)).await;
        dispatcher.mark_unmounting();
        let err = dispatcher
            .enqueue(RequestId::from(4u64), Operation::Destroy)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unmounting));
        assert_eq!(err.to_errno(), crate::Errno::EIO);
    }
}
