//! Branded 64-bit identifiers, nanosecond timestamps, and the stat-family
//! records that cross the native/managed boundary losslessly.
//!
//! `Ino`/`Fh` are intentionally re-exports of the wire-layer newtypes
//! ([`crate::INodeNo`], [`crate::FileHandle`]) rather than fresh types:
//! the bridge never needs to disagree with the kernel session about what
//! an inode number is, it only needs to promise callers it won't truncate
//! one.

use std::convert::TryFrom;
use std::fmt;
use std::time::{Duration, SystemTime};

use crate::Errno;

/// Inode number. Opaque to the bridge; never interpreted, only carried.
pub type Ino = crate::INodeNo;
/// File handle, as chosen by the `open`/`opendir`/`create` handler.
pub type Fh = crate::FileHandle;

const NANOS_PER_SEC: i64 = 1_000_000_000;
/// Implementation-defined far-future sentinel: year 9999, used to reject
/// timestamps that are clearly the result of a unit mixup (e.g. seconds
/// passed where nanoseconds were expected times a billion).
const FAR_FUTURE_NS: i64 = 253_402_300_799 * NANOS_PER_SEC;

/// A timestamp expressed as signed nanoseconds since the Unix epoch.
///
/// Round-trips losslessly through [`Timestamp::to_timespec`] and
/// [`Timestamp::from_timespec`] for every valid value, including the
/// sub-second precision milestones (s/ms/us/ns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(i64);

/// A `{seconds, nanoseconds}` pair, the shape the native FUSE layer wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timespec {
    /// Seconds since the Unix epoch. May be negative.
    pub seconds: i64,
    /// Nanoseconds within the second, always in `[0, 10^9)`.
    pub nanoseconds: u32,
}

/// A malformed timestamp: an out-of-range string, an out-of-range
/// nanosecond count, or a value past [`FAR_FUTURE_NS`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTime(pub String);

impl fmt::Display for InvalidTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time: {}", self.0)
    }
}

impl std::error::Error for InvalidTime {}

impl Timestamp {
    /// The Unix epoch itself.
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Builds a `Timestamp` from a nanosecond count, rejecting values past
    /// the far-future sentinel or before what negative `i64` can express.
    pub fn from_nanos(ns: i64) -> Result<Self, InvalidTime> {
        if ns > FAR_FUTURE_NS {
            return Err(InvalidTime(format!("{ns} ns is past the far-future sentinel")));
        }
        Ok(Timestamp(ns))
    }

    /// The raw nanosecond count since the epoch.
    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Converts to `{seconds, nanoseconds}`, with `nanoseconds` always
    /// non-negative regardless of the sign of the input.
    pub fn to_timespec(&self) -> Timespec {
        let mut seconds = self.0.div_euclid(NANOS_PER_SEC);
        let mut nanoseconds = self.0.rem_euclid(NANOS_PER_SEC);
        if nanoseconds == NANOS_PER_SEC {
            seconds += 1;
            nanoseconds = 0;
        }
        Timespec {
            seconds,
            nanoseconds: nanoseconds as u32,
        }
    }

    /// The inverse of [`Timestamp::to_timespec`].
    pub fn from_timespec(ts: Timespec) -> Result<Self, InvalidTime> {
        if ts.nanoseconds >= NANOS_PER_SEC as u32 {
            return Err(InvalidTime(format!(
                "nanoseconds {} out of range [0, 1e9)",
                ts.nanoseconds
            )));
        }
        let ns = ts
            .seconds
            .checked_mul(NANOS_PER_SEC)
            .and_then(|s| s.checked_add(i64::from(ts.nanoseconds)))
            .ok_or_else(|| InvalidTime("timestamp overflows i64 nanoseconds".into()))?;
        Timestamp::from_nanos(ns)
    }

    /// Parses any of the accepted `to_ns` input shapes: an ISO 8601 /
    /// RFC 3339 string (e.g. `"2021-01-01T00:00:00Z"`), a bare integer
    /// (treated as milliseconds if `>= 1e12`, else seconds), a
    /// floating-point seconds count, or a `"sec.nsec"` string whose
    /// fractional part is padded or truncated to exactly nine digits.
    pub fn parse(input: &str) -> Result<Self, InvalidTime> {
        let input = input.trim();
        if let Ok(time) = humantime::parse_rfc3339(input) {
            return Ok(Timestamp::from(time));
        }
        if let Some((sec_part, frac_part)) = input.split_once('.') {
            if let Ok(seconds) = sec_part.parse::<i64>() {
                let mut digits: String = frac_part.chars().take(9).collect();
                while digits.len() < 9 {
                    digits.push('0');
                }
                if let Ok(nanoseconds) = digits.parse::<u32>() {
                    return Timestamp::from_timespec(Timespec { seconds, nanoseconds });
                }
            }
        }
        if let Ok(ms_or_secs) = input.parse::<i64>() {
            return if ms_or_secs.unsigned_abs() >= 1_000_000_000_000 {
                ms_or_secs
                    .checked_mul(1_000_000)
                    .ok_or_else(|| InvalidTime(format!("{input} overflows as milliseconds")))
                    .and_then(Timestamp::from_nanos)
            } else {
                Timestamp::from_timespec(Timespec {
                    seconds: ms_or_secs,
                    nanoseconds: 0,
                })
            };
        }
        if let Ok(float_secs) = input.parse::<f64>() {
            let ns = (float_secs * NANOS_PER_SEC as f64).round();
            if !ns.is_finite() || ns > i64::MAX as f64 || ns < i64::MIN as f64 {
                return Err(InvalidTime(format!("{input} is out of range")));
            }
            return Timestamp::from_nanos(ns as i64);
        }
        Err(InvalidTime(format!("unrecognised time string {input:?}")))
    }

    /// Rounds to the nearest precision milestone, truncating toward zero.
    pub fn round_to(&self, precision: TimePrecision) -> Timestamp {
        let unit = precision.nanos_per_unit();
        Timestamp(self.0 - self.0.rem_euclid(unit))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(value: SystemTime) -> Self {
        let (secs, nanos) = crate::time::time_from_system_time(&value);
        Timestamp::from_timespec(Timespec {
            seconds: secs,
            nanoseconds: nanos,
        })
        .unwrap_or(Timestamp(FAR_FUTURE_NS))
    }
}

impl From<Timestamp> for SystemTime {
    fn from(value: Timestamp) -> Self {
        let ts = value.to_timespec();
        crate::time::system_time_from_time(ts.seconds, ts.nanoseconds)
    }
}

/// The rounding granularities `to_ns`/`Timestamp::round_to` support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePrecision {
    /// Whole seconds.
    Second,
    /// Milliseconds.
    Millisecond,
    /// Microseconds.
    Microsecond,
    /// Nanoseconds (a no-op rounding).
    Nanosecond,
}

impl TimePrecision {
    fn nanos_per_unit(self) -> i64 {
        match self {
            TimePrecision::Second => NANOS_PER_SEC,
            TimePrecision::Millisecond => 1_000_000,
            TimePrecision::Microsecond => 1_000,
            TimePrecision::Nanosecond => 1,
        }
    }
}

/// `{ino, mode, nlink, uid, gid, rdev, size, blksize, blocks, atime, mtime, ctime}`.
///
/// `mode` carries the POSIX file-type bits in its top nibble (`S_IFDIR`,
/// `S_IFREG`, ...) the same way `libc::stat::st_mode` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Inode number.
    pub ino: Ino,
    /// Type bits (top nibble) and permission bits.
    pub mode: u32,
    /// Hard link count.
    pub nlink: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Device id, for device-special files.
    pub rdev: u32,
    /// Size in bytes.
    pub size: u64,
    /// Preferred I/O block size.
    pub blksize: u32,
    /// Number of 512-byte blocks allocated.
    pub blocks: u64,
    /// Time of last access.
    pub atime: Timestamp,
    /// Time of last modification.
    pub mtime: Timestamp,
    /// Time of last status change.
    pub ctime: Timestamp,
}

impl From<crate::FileAttr> for Stat {
    fn from(attr: crate::FileAttr) -> Self {
        let type_bits = match attr.kind {
            crate::FileType::NamedPipe => libc::S_IFIFO,
            crate::FileType::CharDevice => libc::S_IFCHR,
            crate::FileType::BlockDevice => libc::S_IFBLK,
            crate::FileType::Directory => libc::S_IFDIR,
            crate::FileType::RegularFile => libc::S_IFREG,
            crate::FileType::Symlink => libc::S_IFLNK,
            crate::FileType::Socket => libc::S_IFSOCK,
        };
        Stat {
            ino: attr.ino,
            mode: type_bits as u32 | u32::from(attr.perm),
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            size: attr.size,
            blksize: attr.blksize,
            blocks: attr.blocks,
            atime: attr.atime.into(),
            mtime: attr.mtime.into(),
            ctime: attr.ctime.into(),
        }
    }
}

fn decode_kind(mode: u32) -> crate::reply::FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFIFO as u32 => crate::reply::FileType::NamedPipe,
        m if m == libc::S_IFCHR as u32 => crate::reply::FileType::CharDevice,
        m if m == libc::S_IFBLK as u32 => crate::reply::FileType::BlockDevice,
        m if m == libc::S_IFDIR as u32 => crate::reply::FileType::Directory,
        m if m == libc::S_IFLNK as u32 => crate::reply::FileType::Symlink,
        m if m == libc::S_IFSOCK as u32 => crate::reply::FileType::Socket,
        _ => crate::reply::FileType::RegularFile,
    }
}

impl From<Stat> for crate::reply::FileAttr {
    fn from(stat: Stat) -> Self {
        let ctime = SystemTime::from(stat.ctime);
        crate::reply::FileAttr {
            ino: stat.ino.into(),
            size: stat.size,
            blocks: stat.blocks,
            atime: stat.atime.into(),
            mtime: stat.mtime.into(),
            ctime,
            crtime: ctime,
            kind: decode_kind(stat.mode),
            perm: (stat.mode & 0o7777) as u16,
            nlink: stat.nlink,
            uid: stat.uid,
            gid: stat.gid,
            rdev: stat.rdev,
            blksize: stat.blksize,
            flags: 0,
        }
    }
}

impl From<Statvfs> for crate::reply::Statfs {
    fn from(vfs: Statvfs) -> Self {
        crate::reply::Statfs {
            blocks: vfs.blocks,
            bfree: vfs.bfree,
            bavail: vfs.bavail,
            files: vfs.files,
            ffree: vfs.ffree,
            bsize: vfs.bsize,
            namelen: vfs.namemax,
            frsize: vfs.frsize,
        }
    }
}

/// `{bsize, frsize, blocks, bfree, bavail, files, ffree, favail, fsid, flag, namemax}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Statvfs {
    /// Filesystem block size.
    pub bsize: u32,
    /// Fragment size.
    pub frsize: u32,
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Free blocks available to unprivileged users.
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Free inodes available to unprivileged users.
    pub favail: u64,
    /// Filesystem id.
    pub fsid: u64,
    /// Mount flags.
    pub flag: u32,
    /// Maximum filename length.
    pub namemax: u32,
}

bitflags::bitflags! {
    /// The fields a `setattr` caller may intend to change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetattrMask: u32 {
        /// Permission bits.
        const MODE = 1 << 0;
        /// Owning uid.
        const UID = 1 << 1;
        /// Owning gid.
        const GID = 1 << 2;
        /// File size (truncate).
        const SIZE = 1 << 3;
        /// Explicit access time.
        const ATIME = 1 << 4;
        /// Access time := now.
        const ATIME_NOW = 1 << 5;
        /// Explicit modification time.
        const MTIME = 1 << 6;
        /// Modification time := now.
        const MTIME_NOW = 1 << 7;
        /// Explicit change time.
        const CTIME = 1 << 8;
    }
}

/// An operation name, drawn from the closed allowlist in the external
/// interface contract. Every FUSE callback the bridge can dispatch has
/// exactly one variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum OpName {
    Init,
    Destroy,
    Lookup,
    Getattr,
    Setattr,
    Truncate,
    Readlink,
    Mknod,
    Mkdir,
    Chmod,
    Chown,
    Symlink,
    Unlink,
    Rmdir,
    Rename,
    Link,
    Open,
    Read,
    ReadBuf,
    Write,
    WriteBuf,
    Flush,
    Release,
    Fsync,
    Opendir,
    Readdir,
    Releasedir,
    Fsyncdir,
    Statfs,
    Access,
    Create,
    CopyFileRange,
    Utimens,
    Getxattr,
    Setxattr,
    Listxattr,
    Removexattr,
    Fallocate,
    Lseek,
    Flock,
    Lock,
    Ioctl,
    Bmap,
    Poll,
    Setlk,
    Getlk,
}

impl OpName {
    /// Every name in the closed allowlist, in the order §6 lists them.
    pub const ALL: &'static [OpName] = &[
        OpName::Init,
        OpName::Destroy,
        OpName::Lookup,
        OpName::Getattr,
        OpName::Setattr,
        OpName::Truncate,
        OpName::Readlink,
        OpName::Mknod,
        OpName::Mkdir,
        OpName::Chmod,
        OpName::Chown,
        OpName::Symlink,
        OpName::Unlink,
        OpName::Rmdir,
        OpName::Rename,
        OpName::Link,
        OpName::Open,
        OpName::Read,
        OpName::ReadBuf,
        OpName::Write,
        OpName::WriteBuf,
        OpName::Flush,
        OpName::Release,
        OpName::Fsync,
        OpName::Opendir,
        OpName::Readdir,
        OpName::Releasedir,
        OpName::Fsyncdir,
        OpName::Statfs,
        OpName::Access,
        OpName::Create,
        OpName::CopyFileRange,
        OpName::Utimens,
        OpName::Getxattr,
        OpName::Setxattr,
        OpName::Listxattr,
        OpName::Removexattr,
        OpName::Fallocate,
        OpName::Lseek,
        OpName::Flock,
        OpName::Lock,
        OpName::Ioctl,
        OpName::Bmap,
        OpName::Poll,
        OpName::Setlk,
        OpName::Getlk,
    ];

    /// Parses a name from the wire string (e.g. for `setOperationHandler`
    /// called with a plain string). Unknown names return `None`; callers
    /// must not raise, per the contract that "unknown names return false
    /// without raising".
    pub fn parse(name: &str) -> Option<OpName> {
        OpName::ALL.iter().copied().find(|op| op.as_str() == name)
    }

    /// The canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpName::Init => "init",
            OpName::Destroy => "destroy",
            OpName::Lookup => "lookup",
            OpName::Getattr => "getattr",
            OpName::Setattr => "setattr",
            OpName::Truncate => "truncate",
            OpName::Readlink => "readlink",
            OpName::Mknod => "mknod",
            OpName::Mkdir => "mkdir",
            OpName::Chmod => "chmod",
            OpName::Chown => "chown",
            OpName::Symlink => "symlink",
            OpName::Unlink => "unlink",
            OpName::Rmdir => "rmdir",
            OpName::Rename => "rename",
            OpName::Link => "link",
            OpName::Open => "open",
            OpName::Read => "read",
            OpName::ReadBuf => "read_buf",
            OpName::Write => "write",
            OpName::WriteBuf => "write_buf",
            OpName::Flush => "flush",
            OpName::Release => "release",
            OpName::Fsync => "fsync",
            OpName::Opendir => "opendir",
            OpName::Readdir => "readdir",
            OpName::Releasedir => "releasedir",
            OpName::Fsyncdir => "fsyncdir",
            OpName::Statfs => "statfs",
            OpName::Access => "access",
            OpName::Create => "create",
            OpName::CopyFileRange => "copy_file_range",
            OpName::Utimens => "utimens",
            OpName::Getxattr => "getxattr",
            OpName::Setxattr => "setxattr",
            OpName::Listxattr => "listxattr",
            OpName::Removexattr => "removexattr",
            OpName::Fallocate => "fallocate",
            OpName::Lseek => "lseek",
            OpName::Flock => "flock",
            OpName::Lock => "lock",
            OpName::Ioctl => "ioctl",
            OpName::Bmap => "bmap",
            OpName::Poll => "poll",
            OpName::Setlk => "setlk",
            OpName::Getlk => "getlk",
        }
    }

    /// The errnos a conforming handler is allowed to return for this
    /// operation, used only for validation/diagnostics -- the dispatcher
    /// never rejects a handler reply for returning outside this set, it
    /// just logs at debug level, since downstream drivers occasionally
    /// have legitimate reasons to deviate.
    pub fn allowed_errnos(&self) -> &'static [Errno] {
        match self {
            OpName::Lookup => &[Errno::ENOENT, Errno::EACCES, Errno::ENOTDIR, Errno::ENAMETOOLONG, Errno::EIO],
            OpName::Getattr => &[Errno::ENOENT, Errno::EIO],
            OpName::Open => &[Errno::ENOENT, Errno::EACCES, Errno::EISDIR, Errno::EIO],
            OpName::Read => &[Errno::EBADF, Errno::EIO],
            OpName::Write => &[Errno::EBADF, Errno::ENOSPC, Errno::EFBIG, Errno::EIO],
            OpName::Getxattr => &[Errno::ENODATA, Errno::ERANGE, Errno::ENOTSUP, Errno::EIO],
            OpName::Setxattr => &[Errno::ENODATA, Errno::EEXIST, Errno::ENOSPC, Errno::ENOTSUP],
            _ => &[Errno::EIO],
        }
    }
}

impl fmt::Display for OpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns whether `code` is zero (success) or a known negative errno,
/// the two shapes a kernel reply's error field may legally take. Rejects
/// nonzero codes that don't correspond to any errno this platform's libc
/// actually defines, rather than just checking the sign.
pub fn is_valid_errno(code: i32) -> bool {
    code == 0 || (code < 0 && crate::ll::errno::is_known_errno(-code))
}

impl TryFrom<Duration> for Timestamp {
    type Error = InvalidTime;

    fn try_from(value: Duration) -> Result<Self, InvalidTime> {
        let nanos = i64::try_from(value.as_nanos())
            .map_err(|_| InvalidTime("duration overflows i64 nanoseconds".into()))?;
        Timestamp::from_nanos(nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_round_trip_required_vector() {
        let ns = 1_234_567_890_123_456_789_i64;
        let ts = Timestamp::from_nanos(ns).unwrap();
        let round = Timestamp::from_timespec(ts.to_timespec()).unwrap();
        assert_eq!(round.as_nanos(), ns);
    }

    #[test]
    fn negative_timestamps_keep_nonnegative_nanos() {
        let ts = Timestamp::from_nanos(-200_000_000).unwrap();
        let spec = ts.to_timespec();
        assert_eq!(spec.seconds, -1);
        assert_eq!(spec.nanoseconds, 800_000_000);
    }

    #[test]
    fn fractional_near_one_second_does_not_roll_over() {
        let ts = Timestamp::from_timespec(Timespec {
            seconds: 5,
            nanoseconds: 999_999_999,
        })
        .unwrap();
        assert_eq!(ts.to_timespec().nanoseconds, 999_999_999);
    }

    #[test]
    fn parse_sec_nsec_string_pads_fraction() {
        let ts = Timestamp::parse("5.1").unwrap();
        assert_eq!(ts.to_timespec(), Timespec { seconds: 5, nanoseconds: 100_000_000 });
    }

    #[test]
    fn parse_iso8601_string() {
        let ts = Timestamp::parse("2021-01-01T00:00:00Z").unwrap();
        assert_eq!(ts.to_timespec(), Timespec { seconds: 1_609_459_200, nanoseconds: 0 });
    }

    #[test]
    fn parse_iso8601_with_fractional_seconds() {
        let ts = Timestamp::parse("2021-01-01T00:00:00.5Z").unwrap();
        assert_eq!(ts.to_timespec(), Timespec { seconds: 1_609_459_200, nanoseconds: 500_000_000 });
    }

    #[test]
    fn parse_milliseconds_when_large() {
        let ts = Timestamp::parse("1700000000000").unwrap();
        assert_eq!(ts.as_nanos(), 1_700_000_000_000 * 1_000_000);
    }

    #[test]
    fn errno_name_round_trips() {
        assert!(is_valid_errno(0));
        assert!(is_valid_errno(-(libc::ENOENT)));
        assert_eq!(Errno::ENOENT.code(), libc::ENOENT);
    }

    #[test]
    fn is_valid_errno_rejects_positive_and_unknown_codes() {
        assert!(!is_valid_errno(libc::ENOENT), "positive codes are not a legal reply error field");
        assert!(!is_valid_errno(-999_999), "not a real errno on any platform");
    }

    #[test]
    fn op_name_parse_rejects_unknown_without_panic() {
        assert_eq!(OpName::parse("lookup"), Some(OpName::Lookup));
        assert_eq!(OpName::parse("not_a_real_op"), None);
    }
}
