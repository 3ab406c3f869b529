//! The copy-range adapter (C9): kernel `copy_file_range` fastpath plus a
//! chunked read/write fallback, with statistics.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use super::dispatcher::AbortSignal;
use super::error::BridgeError;

const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Point-in-time copy-range statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyStatsSnapshot {
    /// Total `copyFileRange` calls served.
    pub total_operations: u64,
    /// Total bytes copied across all calls.
    pub total_bytes: u64,
    /// Whether the kernel `copy_file_range(2)` fastpath is currently
    /// believed to be available (cleared the first time it fails with an
    /// errno that indicates lack of support).
    pub kernel_path_available: bool,
}

#[derive(Default)]
struct Stats {
    total_operations: AtomicU64,
    total_bytes: AtomicU64,
    kernel_path_available: AtomicBool,
}

/// Implements `copyFileRange(fd_in, off_in, fd_out, off_out, len, flags)`.
///
/// Tries the kernel fastpath (`copy_file_range(2)`) first. On `ENOSYS` or
/// `EXDEV` -- the two errnos that mean "the kernel can't do this, not that
/// this particular copy is invalid" -- it falls back to a chunked
/// read/write loop and remembers not to try the fastpath again.
pub struct CopyRangeAdapter {
    chunk_size: std::sync::atomic::AtomicUsize,
    stats: Stats,
}

impl std::fmt::Debug for CopyRangeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyRangeAdapter")
            .field("chunk_size", &self.chunk_size())
            .field("stats", &self.stats())
            .finish()
    }
}

impl CopyRangeAdapter {
    /// Builds an adapter that assumes the kernel fastpath is available
    /// until proven otherwise.
    pub fn new() -> Arc<Self> {
        let stats = Stats::default();
        stats.kernel_path_available.store(true, Ordering::Relaxed);
        Arc::new(Self {
            chunk_size: std::sync::atomic::AtomicUsize::new(DEFAULT_CHUNK_SIZE),
            stats,
        })
    }

    /// `setCopyChunkSize`.
    pub fn set_chunk_size(&self, size: usize) {
        self.chunk_size.store(size.max(1), Ordering::Relaxed);
    }

    /// `getCopyChunkSize`.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.load(Ordering::Relaxed)
    }

    /// `getCopyStats`.
    pub fn stats(&self) -> CopyStatsSnapshot {
        CopyStatsSnapshot {
            total_operations: self.stats.total_operations.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            kernel_path_available: self.stats.kernel_path_available.load(Ordering::Relaxed),
        }
    }

    /// `resetCopyStats`.
    pub fn reset_stats(&self) {
        self.stats.total_operations.store(0, Ordering::Relaxed);
        self.stats.total_bytes.store(0, Ordering::Relaxed);
    }

    /// Copies `len` bytes from `fd_in` to `fd_out`. `None` offsets mean
    /// "use the fd's current position," matching `copy_file_range(2)`
    /// semantics (and the fallback loop uses `pread`/`pwrite` at the
    /// fd's current offset via `lseek` otherwise).
    pub async fn copy_file_range(
        &self,
        fd_in: std::os::unix::io::RawFd,
        off_in: Option<i64>,
        fd_out: std::os::unix::io::RawFd,
        off_out: Option<i64>,
        len: u64,
        flags: u32,
        aborted: &AbortSignal,
    ) -> Result<u64, BridgeError> {
        if aborted.is_aborted() {
            return Err(BridgeError::Cancelled);
        }
        self.stats.total_operations.fetch_add(1, Ordering::Relaxed);
        if self.stats.kernel_path_available.load(Ordering::Relaxed) {
            match kernel_copy_file_range(fd_in, off_in, fd_out, off_out, len, flags) {
                Ok(copied) => {
                    self.stats.total_bytes.fetch_add(copied, Ordering::Relaxed);
                    return Ok(copied);
                }
                Err(e) if is_unsupported(&e) => {
                    debug!("kernel copy_file_range unsupported ({e}), falling back");
                    self.stats
                        .kernel_path_available
                        .store(false, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("copy_file_range failed: {e}");
                    return Err(BridgeError::Validation(e.to_string()));
                }
            }
        }
        let copied =
            chunked_fallback(fd_in, off_in, fd_out, off_out, len, self.chunk_size(), aborted)
                .await
                .map_err(|e| BridgeError::Validation(e.to_string()))?;
        self.stats.total_bytes.fetch_add(copied, Ordering::Relaxed);
        Ok(copied)
    }
}

fn is_unsupported(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == libc::ENOSYS || code == libc::EXDEV || code == libc::EOPNOTSUPP
    )
}

#[cfg(target_os = "linux")]
fn kernel_copy_file_range(
    fd_in: std::os::unix::io::RawFd,
    off_in: Option<i64>,
    fd_out: std::os::unix::io::RawFd,
    off_out: Option<i64>,
    len: u64,
    flags: u32,
) -> io::Result<u64> {
    let mut off_in_val: libc::loff_t = off_in.unwrap_or(0);
    let mut off_out_val: libc::loff_t = off_out.unwrap_or(0);
    let off_in_ptr = if off_in.is_some() {
        std::ptr::addr_of_mut!(off_in_val)
    } else {
        std::ptr::null_mut()
    };
    let off_out_ptr = if off_out.is_some() {
        std::ptr::addr_of_mut!(off_out_val)
    } else {
        std::ptr::null_mut()
    };
    let rc = unsafe {
        libc::copy_file_range(
            fd_in,
            off_in_ptr,
            fd_out,
            off_out_ptr,
            len as usize,
            flags as std::os::raw::c_uint,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as u64)
    }
}

/// macOS FUSE has no `copy_file_range` opcode or syscall; always report
/// the fastpath unsupported so callers fall back to the chunked loop.
#[cfg(not(target_os = "linux"))]
fn kernel_copy_file_range(
    _fd_in: std::os::unix::io::RawFd,
    _off_in: Option<i64>,
    _fd_out: std::os::unix::io::RawFd,
    _off_out: Option<i64>,
    _len: u64,
    _flags: u32,
) -> io::Result<u64> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

/// Copies in chunks of `chunk_size` using `pread`/`pwrite` when explicit
/// offsets are given, or plain `read`/`write` against the fd's current
/// position otherwise. Checked cooperatively against `aborted` between
/// chunks so a long copy can still be interrupted.
async fn chunked_fallback(
    fd_in: std::os::unix::io::RawFd,
    mut off_in: Option<i64>,
    fd_out: std::os::unix::io::RawFd,
    mut off_out: Option<i64>,
    len: u64,
    chunk_size: usize,
    aborted: &AbortSignal,
) -> io::Result<u64> {
    let mut remaining = len;
    let mut total = 0u64;
    let mut buf = vec![0u8; chunk_size];
    while remaining > 0 {
        if aborted.is_aborted() {
            break;
        }
        let want = remaining.min(chunk_size as u64) as usize;
        let read = blocking_read(fd_in, &mut buf[..want], off_in)?;
        if read == 0 {
            break;
        }
        let mut written = 0usize;
        while written < read {
            let n = blocking_write(fd_out, &buf[written..read], off_out.map(|o| o + written as i64))?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "short write in copy fallback"));
            }
            written += n;
        }
        if let Some(o) = off_in.as_mut() {
            *o += read as i64;
        }
        if let Some(o) = off_out.as_mut() {
            *o += read as i64;
        }
        total += read as u64;
        remaining -= read as u64;
        tokio::task::yield_now().await;
    }
    Ok(total)
}

fn blocking_read(fd: std::os::unix::io::RawFd, buf: &mut [u8], offset: Option<i64>) -> io::Result<usize> {
    let rc = match offset {
        Some(off) => unsafe {
            libc::pread(fd, buf.as_mut_ptr().cast(), buf.len(), off as libc::off_t)
        },
        None => unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) },
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

fn blocking_write(fd: std::os::unix::io::RawFd, buf: &[u8], offset: Option<i64>) -> io::Result<usize> {
    let rc = match offset {
        Some(off) => unsafe {
            libc::pwrite(fd, buf.as_ptr().cast(), buf.len(), off as libc::off_t)
        },
        None => unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) },
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, FromRawFd};

    fn pipe_fds() -> (std::os::unix::io::RawFd, std::os::unix::io::RawFd) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[tokio::test]
    async fn chunked_fallback_copies_through_a_pipe() {
        let (r, w) = pipe_fds();
        let payload = b"hello copy range";
        let writer = std::thread::spawn(move || {
            let mut f = unsafe { std::fs::File::from_raw_fd(w) };
            std::io::Write::write_all(&mut f, payload).unwrap();
        });
        let out_file = tempfile::tempfile().unwrap();
        let out_fd = out_file.as_raw_fd();
        let aborted = AbortSignal::new_for_tests();
        let copied = chunked_fallback(r, None, out_fd, Some(0), payload.len() as u64, 4, &aborted)
            .await
            .unwrap();
        writer.join().unwrap();
        assert_eq!(copied, payload.len() as u64);
        unsafe { libc::close(r) };
    }

    #[tokio::test]
    async fn copy_aborts_immediately_when_already_cancelled() {
        let (r, w) = pipe_fds();
        let out_file = tempfile::tempfile().unwrap();
        let out_fd = out_file.as_raw_fd();
        let adapter = CopyRangeAdapter::new();
        let aborted = AbortSignal::new_for_tests();
        aborted.abort();
        let err = adapter
            .copy_file_range(r, None, out_fd, Some(0), 16, 0, &aborted)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn unsupported_errno_detection() {
        assert!(is_unsupported(&io::Error::from_raw_os_error(libc::ENOSYS)));
        assert!(is_unsupported(&io::Error::from_raw_os_error(libc::EXDEV)));
        assert!(!is_unsupported(&io::Error::from_raw_os_error(libc::EIO)));
    }
}
