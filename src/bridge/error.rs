//! Error taxonomy for the bridge layer, distinct from the kernel-facing
//! [`Errno`](crate::Errno) wire value.

use std::fmt;

use crate::Errno;

/// Something that went wrong inside the bridge itself, as opposed to an
/// errno a handler chose to return.
///
/// Every variant knows how to degrade into exactly one kernel reply via
/// [`to_errno`](BridgeError::to_errno); the dispatcher and adapters never
/// need a second error type to reason about.
#[derive(Debug)]
pub enum BridgeError {
    /// A buffer, timestamp, or argument failed validation before it ever
    /// reached a handler.
    Validation(String),
    /// A new upcall arrived after the shutdown coordinator entered
    /// `Draining`.
    ShuttingDown,
    /// A new upcall arrived after the shutdown coordinator entered
    /// `Unmounting` or later.
    Unmounting,
    /// The abort signal associated with a request fired before or during
    /// the handler call.
    Cancelled,
    /// The handler panicked instead of returning a value.
    HandlerPanicked(String),
    /// The operation dispatcher's queue was at `maxQueueSize`.
    QueueFull,
    /// No handler is registered for this operation name.
    Unhandled,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Validation(msg) => write!(f, "invalid argument: {msg}"),
            BridgeError::ShuttingDown => write!(f, "bridge is shutting down"),
            BridgeError::Unmounting => write!(f, "bridge is unmounting"),
            BridgeError::Cancelled => write!(f, "request was cancelled"),
            BridgeError::HandlerPanicked(msg) => write!(f, "handler panicked: {msg}"),
            BridgeError::QueueFull => write!(f, "dispatcher queue is full"),
            BridgeError::Unhandled => write!(f, "no handler registered for operation"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl BridgeError {
    /// The single errno this error collapses to when it must be reported
    /// back across the kernel boundary.
    pub fn to_errno(&self) -> Errno {
        match self {
            BridgeError::Validation(_) => Errno::EINVAL,
            BridgeError::ShuttingDown => Errno::ESHUTDOWN,
            BridgeError::Unmounting => Errno::EIO,
            BridgeError::Cancelled => Errno::EINTR,
            BridgeError::HandlerPanicked(_) => Errno::EIO,
            BridgeError::QueueFull => Errno::EAGAIN,
            BridgeError::Unhandled => Errno::ENOSYS,
        }
    }
}

/// A structured, managed-facing error: an errno plus the context a
/// handler or caller needs to decide what happened, without forcing them
/// to memorize numeric codes.
///
/// This is the "Managed-facing errors" record: every field beyond `errno`
/// is optional context, and the four predicates below are derived solely
/// from the errno itself.
#[derive(Debug, Clone)]
pub struct FuseErrno {
    /// The POSIX errno this failure maps to.
    pub errno: Errno,
    /// The syscall-like operation name that failed, if known.
    pub syscall: Option<&'static str>,
    /// The path the operation concerned, if any.
    pub path: Option<std::path::PathBuf>,
    /// A human-readable message.
    pub message: Option<String>,
}

impl FuseErrno {
    /// Build a bare `FuseErrno` from just an errno.
    pub fn new(errno: Errno) -> Self {
        Self {
            errno,
            syscall: None,
            path: None,
            message: None,
        }
    }

    /// Attach the syscall-like name that failed.
    pub fn with_syscall(mut self, syscall: &'static str) -> Self {
        self.syscall = Some(syscall);
        self
    }

    /// Attach the path the operation concerned.
    pub fn with_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// True for permission-denied style errnos.
    pub fn is_permission(&self) -> bool {
        matches!(self.errno, Errno::EACCES | Errno::EPERM)
    }

    /// True for not-found style errnos.
    pub fn is_not_found(&self) -> bool {
        matches!(self.errno, Errno::ENOENT)
    }

    /// True for already-exists style errnos.
    pub fn is_exists(&self) -> bool {
        matches!(self.errno, Errno::EEXIST)
    }

    /// True for errnos that indicate a transient condition worth retrying.
    pub fn is_temporary(&self) -> bool {
        matches!(self.errno, Errno::EAGAIN | Errno::EINTR | Errno::EBUSY)
    }

    /// True for I/O failures.
    pub fn is_io(&self) -> bool {
        matches!(self.errno, Errno::EIO)
    }

    /// True for invalid-argument style errnos.
    pub fn is_invalid(&self) -> bool {
        matches!(self.errno, Errno::EINVAL | Errno::ENOTSUP)
    }
}

impl fmt::Display for FuseErrno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.errno)?;
        if let Some(syscall) = self.syscall {
            write!(f, " ({syscall})")?;
        }
        if let Some(path) = &self.path {
            write!(f, " [{}]", path.display())?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FuseErrno {}
