//! Ownership-tracked byte buffers crossing the native/managed boundary.
//!
//! [`crate::Container`] already gives us an owned-or-borrowed byte slice
//! with a dozen storage strategies; `BufferHandle` wraps one instance of
//! it with the three-kind taxonomy the bridge contract calls for
//! (external / managed / borrowed) plus the `{owner tag, generation
//! counter}` pair that lets a caller detect a stale handle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::Bytes;

use super::error::BridgeError;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// A finaliser for foreign memory backing an [`BufferOwner::External`]
/// buffer. Invoked exactly once, when the last holder of the buffer
/// drops. Must tolerate being invoked from inside a shutdown sequence
/// that may itself be unwinding other finalisers concurrently.
pub trait Finalizer: Send + Sync {
    /// Release the foreign memory. Called at most once.
    fn finalize(&self);
}

impl<F: Fn() + Send + Sync> Finalizer for F {
    fn finalize(&self) {
        self()
    }
}

/// Which of the three buffer kinds a [`BufferHandle`] carries.
#[derive(Clone)]
pub enum BufferOwner {
    /// Wraps memory owned by the native side (or further upstream); a
    /// [`Finalizer`] runs when the last holder drops it.
    External(Arc<dyn Finalizer>),
    /// Bridge-owned memory, zero-filled on allocation.
    Managed,
    /// Caller-owned memory; no ownership transfer happens at all.
    Borrowed,
}

impl fmt::Debug for BufferOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferOwner::External(_) => f.write_str("External"),
            BufferOwner::Managed => f.write_str("Managed"),
            BufferOwner::Borrowed => f.write_str("Borrowed"),
        }
    }
}

/// An owned-or-borrowed byte buffer plus the bookkeeping needed to catch
/// a stale reference after a cross-boundary transfer has invalidated it.
#[derive(Debug)]
pub struct BufferHandle<'a> {
    data: Bytes<'a>,
    owner: BufferOwner,
    generation: u64,
    moved: bool,
}

const MAX_BUFFER_LEN: usize = 1 << 30;

impl<'a> BufferHandle<'a> {
    /// Wraps bridge-owned, zero-filled memory of `len` bytes.
    pub fn managed(len: usize) -> Result<Self, BridgeError> {
        Self::validate(len, false)?;
        Ok(Self {
            data: Bytes::Vec(vec![0u8; len]),
            owner: BufferOwner::Managed,
            generation: next_generation(),
            moved: false,
        })
    }

    /// Wraps already-initialized bytes the bridge has taken ownership of
    /// (e.g. copied out of a kernel request buffer), tagged `Managed`.
    pub fn owned(data: Vec<u8>) -> Result<Self, BridgeError> {
        Self::validate(data.len(), false)?;
        Ok(Self {
            data: Bytes::Vec(data),
            owner: BufferOwner::Managed,
            generation: next_generation(),
            moved: false,
        })
    }

    /// Wraps a caller-owned slice without taking ownership.
    pub fn borrowed(slice: &'a [u8]) -> Result<Self, BridgeError> {
        Self::validate(slice.len(), false)?;
        Ok(Self {
            data: Bytes::Ref(slice),
            owner: BufferOwner::Borrowed,
            generation: next_generation(),
            moved: false,
        })
    }

    /// Wraps foreign memory that must be released through `finalizer`
    /// exactly once.
    pub fn external(data: Vec<u8>, finalizer: Arc<dyn Finalizer>) -> Result<Self, BridgeError> {
        Self::validate(data.len(), false)?;
        Ok(Self {
            data: Bytes::Vec(data),
            owner: BufferOwner::External(finalizer),
            generation: next_generation(),
            moved: false,
        })
    }

    /// Explicitly constructs an empty `Managed` buffer, e.g. for a
    /// zero-byte read or write reply. The only way to get a zero-length
    /// handle: every other constructor rejects `len == 0` outright.
    pub fn empty() -> Self {
        Self {
            data: Bytes::Vec(Vec::new()),
            owner: BufferOwner::Managed,
            generation: next_generation(),
            moved: false,
        }
    }

    fn validate(len: usize, allow_empty: bool) -> Result<(), BridgeError> {
        if len == 0 && !allow_empty {
            return Err(BridgeError::Validation("zero-length buffer".into()));
        }
        if len > MAX_BUFFER_LEN {
            return Err(BridgeError::Validation(format!(
                "buffer length {len} exceeds implementation limit {MAX_BUFFER_LEN}"
            )));
        }
        Ok(())
    }

    /// The generation counter stamped at construction time.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Which ownership kind this handle carries.
    pub fn owner(&self) -> &BufferOwner {
        &self.owner
    }

    /// Number of bytes in the buffer.
    pub fn len(&self) -> usize {
        match self.data.try_borrow() {
            Ok(b) => b.len(),
            Err(_) => 0,
        }
    }

    /// True if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves ownership of the underlying bytes out, invalidating this
    /// handle's view (future reads through it return an empty slice).
    /// Mirrors "Cross-boundary transfer moves ownership; the source view
    /// is invalidated."
    pub fn take(&mut self) -> Bytes<'a> {
        self.moved = true;
        std::mem::replace(&mut self.data, Bytes::Empty)
    }

    /// True once [`BufferHandle::take`] has been called.
    pub fn is_moved(&self) -> bool {
        self.moved
    }

    /// Borrows the bytes, so long as the handle hasn't already been
    /// moved out from under the caller.
    pub fn as_bytes(&self) -> Result<&Bytes<'a>, BridgeError> {
        if self.moved {
            return Err(BridgeError::Validation("buffer already moved".into()));
        }
        Ok(&self.data)
    }
}

impl Drop for BufferHandle<'_> {
    fn drop(&mut self) {
        if let BufferOwner::External(finalizer) = &self.owner {
            if Arc::strong_count(finalizer) == 1 {
                finalizer.finalize();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn managed_buffer_is_zero_filled() {
        let buf = BufferHandle::managed(8).unwrap();
        let bytes = buf.as_bytes().unwrap().try_borrow().unwrap();
        assert_eq!(&*bytes, &[0u8; 8]);
    }

    #[test]
    fn rejects_oversized_buffer() {
        assert!(BufferHandle::managed(MAX_BUFFER_LEN + 1).is_err());
    }

    #[test]
    fn rejects_implicit_zero_length() {
        assert!(BufferHandle::managed(0).is_err());
        assert!(BufferHandle::owned(Vec::new()).is_err());
        assert!(BufferHandle::borrowed(&[]).is_err());
    }

    #[test]
    fn explicit_empty_is_allowed() {
        let buf = BufferHandle::empty();
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn take_invalidates_source_view() {
        let mut buf = BufferHandle::borrowed(b"hello").unwrap();
        let _ = buf.take();
        assert!(buf.as_bytes().is_err());
    }

    #[test]
    fn external_finalizer_runs_once_on_drop() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let finalizer: Arc<dyn Finalizer> = Arc::new(move || {
            ran2.store(true, Ordering::SeqCst);
        });
        {
            let _buf = BufferHandle::external(vec![1, 2, 3], finalizer).unwrap();
        }
        assert!(ran.load(Ordering::SeqCst));
    }
}
