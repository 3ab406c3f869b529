//! Low-level wire types shared between the request parser and reply encoder.
//!
//! Everything in here mirrors a field of the kernel ABI closely enough that
//! it can be encoded/decoded without allocation; the newtypes exist so the
//! rest of the crate can't accidentally mix up an inode number with a file
//! handle or forget to flip an errno's sign on the way out.

use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroI32;
use std::time::{Duration, SystemTime};

pub(crate) mod argument;
pub(crate) mod errno;
pub(crate) mod flags;
pub(crate) mod fuse_abi;
pub(crate) mod ioctl;
mod ioslice_concat;
pub(crate) mod notify;
pub(crate) mod reply;
pub(crate) mod request;

pub(crate) use ioslice_concat::IosliceConcat;
pub(crate) use request::{FileHandle, INodeNo, LockOwner, Version};
pub(crate) use request::{Operation, Request, RequestError};
pub(crate) use reply::Response;

/// The `unique` field of a FUSE request/reply pair.
///
/// The kernel picks this value; the bridge only ever echoes it back in the
/// matching reply header, so it carries no ordering or uniqueness guarantee
/// beyond "whatever the kernel happened to pick."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        RequestId(value)
    }
}

impl From<RequestId> for u64 {
    fn from(value: RequestId) -> Self {
        value.0
    }
}

/// An inode's generation number, used together with its [`INodeNo`] to
/// detect a recycled inode after NFS-style export caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Generation(pub(crate) u64);

impl From<u64> for Generation {
    fn from(value: u64) -> Self {
        Generation(value)
    }
}

impl From<Generation> for u64 {
    fn from(value: Generation) -> Self {
        value.0
    }
}

/// A POSIX errno, stored as the positive libc value.
///
/// The wire encoding wants the negated value in `fuse_out_header::error`;
/// negating only at that one call site (see [`reply::Response::with_iovec`])
/// keeps every other comparison and `Display` impl reading like the errno
/// table everyone already knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub(crate) NonZeroI32);

impl Errno {
    /// Builds an `Errno` from a positive libc error code.
    ///
    /// # Panics
    /// Panics if `code` is zero or negative; zero isn't an error and a
    /// negative value is almost always a caller accidentally passing the
    /// already-negated wire form.
    #[must_use]
    pub const fn new(code: i32) -> Self {
        match NonZeroI32::new(code) {
            Some(code) => Errno(code),
            None => panic!("errno code must be non-zero"),
        }
    }

    /// Builds an `Errno` from a raw libc error code, taking the absolute
    /// value so callers don't need to know whether it's already negated.
    #[must_use]
    pub fn from_i32(code: i32) -> Self {
        Self::new(code.abs())
    }

    /// The positive libc error code.
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.0.get()
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

impl From<Errno> for i32 {
    fn from(value: Errno) -> Self {
        value.0.get()
    }
}

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        impl Errno {
            $(
                #[allow(missing_docs)]
                pub const $name: Errno = Errno::new(libc::$name);
            )*
        }
    };
}

errno_consts! {
    EPERM, ENOENT, ESRCH, EINTR, EIO, ENXIO, E2BIG, ENOEXEC, EBADF, ECHILD,
    EAGAIN, ENOMEM, EACCES, EFAULT, ENOTBLK, EBUSY, EEXIST, EXDEV, ENODEV,
    ENOTDIR, EISDIR, EINVAL, ENFILE, EMFILE, ENOTTY, ETXTBSY, EFBIG, ENOSPC,
    ESPIPE, EROFS, EMLINK, EPIPE, EDOM, ERANGE, EDEADLK, ENAMETOOLONG,
    ENOLCK, ENOSYS, ENOTEMPTY, ELOOP, EWOULDBLOCK, ENOMSG, EIDRM, ECHRNG,
    EL2NSYNC, EL3HLT, EL3RST, ELNRNG, EUNATCH, ENOCSI, EL2HLT, EBADE, EBADR,
    EXFULL, ENOANO, EBADRQC, EBADSLT, EDEADLOCK, EBFONT, ENOSTR, ENODATA,
    ETIME, ENOSR, ENONET, ENOPKG, EREMOTE, ENOLINK, EADV, ESRMNT, ECOMM,
    EPROTO, EMULTIHOP, EDOTDOT, EBADMSG, EOVERFLOW, ENOTUNIQ, EBADFD,
    EREMCHG, ELIBACC, ELIBBAD, ELIBSCN, ELIBMAX, ELIBEXEC, EILSEQ, ERESTART,
    ESTRPIPE, EUSERS, ENOTSOCK, EDESTADDRREQ, EMSGSIZE, EPROTOTYPE,
    ENOPROTOOPT, EPROTONOSUPPORT, ESOCKTNOSUPPORT, EOPNOTSUPP, EPFNOSUPPORT,
    EAFNOSUPPORT, EADDRINUSE, EADDRNOTAVAIL, ENETDOWN, ENETUNREACH,
    ENETRESET, ECONNABORTED, ECONNRESET, ENOBUFS, EISCONN, ENOTCONN,
    ESHUTDOWN, ETOOMANYREFS, ETIMEDOUT, ECONNREFUSED, EHOSTDOWN,
    EHOSTUNREACH, EALREADY, EINPROGRESS, ESTALE, EUCLEAN, ENOTNAM, ENAVAIL,
    EISNAM, EREMOTEIO, EDQUOT, ENOMEDIUM, EMEDIUMTYPE, ECANCELED, ENOKEY,
    EKEYEXPIRED, EKEYREVOKED, EKEYREJECTED, EOWNERDEAD, ENOTRECOVERABLE,
    ERFKILL, EHWPOISON, ENOTSUP,
}

/// A POSIX advisory lock description, as reported to/from `getlk`/`setlk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Lock {
    pub(crate) range: (u64, u64),
    pub(crate) typ: i32,
    pub(crate) pid: u32,
}

/// Either an explicit timestamp or "leave it as the kernel's current time",
/// the two options `utimens` can ask a handler to apply.
#[derive(Debug, Clone, Copy)]
pub enum TimeOrNow {
    /// Set the timestamp to this value.
    SpecificTime(SystemTime),
    /// Set the timestamp to the current time, evaluated by the handler.
    Now,
}

impl TryFrom<(i64, u32)> for TimeOrNow {
    type Error = std::num::TryFromIntError;

    fn try_from((secs, nsecs): (i64, u32)) -> Result<Self, Self::Error> {
        const UTIME_NOW: u32 = 0x3fff_ffff;
        if nsecs == UTIME_NOW {
            Ok(TimeOrNow::Now)
        } else {
            Ok(TimeOrNow::SpecificTime(
                crate::time::system_time_from_time(secs, nsecs),
            ))
        }
    }
}

#[allow(unused)]
pub(crate) const fn duration_from_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}
