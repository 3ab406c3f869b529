//! Per-opcode argument and reply shapes (C4).
//!
//! Every variant here corresponds to exactly one name in [`OpName`]. The
//! dispatcher (C3) is generic over `Operation`/`Reply`; it never inspects
//! the payload, only the discriminant needed for routing and stats. The
//! per-op adapter functions at the bottom of this file are where
//! unmarshal/invoke/reply actually happens, and are what a session loop
//! wired to the native kernel channel would call.

use std::ffi::OsString;
use std::time::Duration;

use crate::{Errno, FopenFlags, Generation, IoctlFlags, PollHandle};

use super::buffer::BufferHandle;
use super::error::BridgeError;
use super::types::{Fh, Ino, OpName, SetattrMask, Stat, Statvfs, TimePrecision, Timestamp};

/// Flags accompanying a `setxattr` call, per the two-phase xattr contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetxattrFlags {
    /// No constraint; create or replace.
    None,
    /// Fail with `EEXIST` if the attribute is already present.
    Create,
    /// Fail with `ENODATA` if the attribute is absent.
    Replace,
}

/// A directory entry as handed back by `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry name.
    pub name: OsString,
    /// Inode this entry points at.
    pub ino: Ino,
    /// File type of the entry.
    pub kind: crate::FileType,
    /// Offset the kernel should pass back on the next `readdir` call to
    /// resume immediately after this entry.
    pub next_offset: i64,
}

/// A directory entry as handed back by `readdir_plus`-style calls that
/// also populate the attribute cache (we reuse it for `readdir` too when
/// a handler has the attributes cheaply available).
#[derive(Debug, Clone)]
pub struct DirEntryPlus {
    /// The base entry.
    pub entry: DirEntry,
    /// Lookup generation counter.
    pub generation: Generation,
    /// Full attributes.
    pub attr: Stat,
    /// How long the kernel may cache `attr`.
    pub attr_timeout: Duration,
    /// How long the kernel may cache the name -> ino mapping.
    pub entry_timeout: Duration,
}

/// Connection info handed to the `init` handler, verbatim from the
/// kernel's handshake, plus the mutable config it may override.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    /// Kernel FUSE protocol major version.
    pub proto_major: u32,
    /// Kernel FUSE protocol minor version.
    pub proto_minor: u32,
    /// Capability flags the kernel supports.
    pub capable: u64,
    /// Capability flags currently requested.
    pub want: u64,
    /// Maximum single write size the kernel will send.
    pub max_write: u32,
    /// Maximum single read size the kernel will send.
    pub max_read: u32,
    /// Maximum readahead size.
    pub max_readahead: u32,
    /// Maximum number of background requests.
    pub max_background: u16,
    /// Background-queue congestion threshold.
    pub congestion_threshold: u16,
    /// Timestamp granularity, in nanoseconds.
    pub time_gran_ns: u32,
}

/// A POSIX advisory lock description used by `getlk`/`setlk`/`flock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockInfo {
    /// Starting byte offset of the locked range.
    pub start: u64,
    /// Ending byte offset (inclusive) of the locked range.
    pub end: u64,
    /// Lock type: `F_RDLCK`, `F_WRLCK`, or `F_UNLCK`.
    pub typ: i32,
    /// Owning process id, as reported by the kernel.
    pub pid: u32,
}

/// One unmarshalled kernel request, tagged by [`OpName`] implicitly via
/// the enum discriminant. This is what C3 hands to a registered handler.
#[derive(Debug)]
#[allow(missing_docs)]
pub enum Operation<'a> {
    Init { info: ConnInfo },
    Destroy,
    Lookup { parent: Ino, name: OsString },
    Getattr { ino: Ino, fh: Option<Fh> },
    Setattr { ino: Ino, valid: SetattrMask, attr: PartialStat },
    Truncate { ino: Ino, fh: Option<Fh>, size: u64 },
    Readlink { ino: Ino },
    Mknod { parent: Ino, name: OsString, mode: u32, rdev: u32, umask: u32 },
    Mkdir { parent: Ino, name: OsString, mode: u32, umask: u32 },
    Chmod { ino: Ino, mode: u32 },
    Chown { ino: Ino, uid: Option<u32>, gid: Option<u32> },
    Symlink { parent: Ino, name: OsString, link: OsString },
    Unlink { parent: Ino, name: OsString },
    Rmdir { parent: Ino, name: OsString },
    Rename { parent: Ino, name: OsString, new_parent: Ino, new_name: OsString, flags: u32 },
    Link { ino: Ino, new_parent: Ino, new_name: OsString },
    Open { ino: Ino, flags: i32 },
    Read { ino: Ino, fh: Fh, offset: i64, size: u32 },
    ReadBuf { ino: Ino, fh: Fh, offset: i64, size: u32 },
    Write { ino: Ino, fh: Fh, offset: i64, data: BufferHandle<'a> },
    WriteBuf { ino: Ino, fh: Fh, offset: i64, chunks: Vec<BufferHandle<'a>> },
    Flush { ino: Ino, fh: Fh, lock_owner: u64 },
    Release { ino: Ino, fh: Fh, flags: i32, lock_owner: Option<u64>, flush: bool },
    Fsync { ino: Ino, fh: Fh, datasync: bool },
    Opendir { ino: Ino, flags: i32 },
    Readdir { ino: Ino, fh: Fh, offset: i64, size_budget: usize },
    Releasedir { ino: Ino, fh: Fh, flags: i32 },
    Fsyncdir { ino: Ino, fh: Fh, datasync: bool },
    Statfs { ino: Ino },
    Access { ino: Ino, mask: i32 },
    Create { parent: Ino, name: OsString, mode: u32, umask: u32, flags: i32 },
    CopyFileRange {
        ino_in: Ino,
        fh_in: Fh,
        offset_in: i64,
        ino_out: Ino,
        fh_out: Fh,
        offset_out: i64,
        len: u64,
        flags: u32,
    },
    Utimens { ino: Ino, fh: Option<Fh>, atime: TimeSpec, mtime: TimeSpec },
    Getxattr { ino: Ino, name: OsString, size: u32 },
    Setxattr { ino: Ino, name: OsString, value: BufferHandle<'a>, flags: SetxattrFlags },
    Listxattr { ino: Ino, size: u32 },
    Removexattr { ino: Ino, name: OsString },
    Fallocate { ino: Ino, fh: Fh, offset: i64, len: i64, mode: i32 },
    Lseek { ino: Ino, fh: Fh, offset: i64, whence: i32 },
    Flock { ino: Ino, fh: Fh, lock_owner: u64, op: i32 },
    Lock { ino: Ino, fh: Fh, lock_owner: u64, lock: LockInfo, sleep: bool },
    Ioctl { ino: Ino, fh: Fh, cmd: u32, arg: IoctlArg<'a>, flags: IoctlFlags, out_size: u32 },
    Bmap { ino: Ino, blocksize: u32, idx: u64 },
    Poll { ino: Ino, fh: Fh, kh: Option<PollHandle> },
    Setlk { ino: Ino, fh: Fh, lock_owner: u64, lock: LockInfo, sleep: bool },
    Getlk { ino: Ino, fh: Fh, lock_owner: u64, lock: LockInfo },
}

impl<'a> Operation<'a> {
    /// The operation name this variant routes under, used by the
    /// dispatcher for handler lookup and per-opcode statistics.
    pub fn op_name(&self) -> OpName {
        match self {
            Operation::Init { .. } => OpName::Init,
            Operation::Destroy => OpName::Destroy,
            Operation::Lookup { .. } => OpName::Lookup,
            Operation::Getattr { .. } => OpName::Getattr,
            Operation::Setattr { .. } => OpName::Setattr,
            Operation::Truncate { .. } => OpName::Truncate,
            Operation::Readlink { .. } => OpName::Readlink,
            Operation::Mknod { .. } => OpName::Mknod,
            Operation::Mkdir { .. } => OpName::Mkdir,
            Operation::Chmod { .. } => OpName::Chmod,
            Operation::Chown { .. } => OpName::Chown,
            Operation::Symlink { .. } => OpName::Symlink,
            Operation::Unlink { .. } => OpName::Unlink,
            Operation::Rmdir { .. } => OpName::Rmdir,
            Operation::Rename { .. } => OpName::Rename,
            Operation::Link { .. } => OpName::Link,
            Operation::Open { .. } => OpName::Open,
            Operation::Read { .. } => OpName::Read,
            Operation::ReadBuf { .. } => OpName::ReadBuf,
            Operation::Write { .. } => OpName::Write,
            Operation::WriteBuf { .. } => OpName::WriteBuf,
            Operation::Flush { .. } => OpName::Flush,
            Operation::Release { .. } => OpName::Release,
            Operation::Fsync { .. } => OpName::Fsync,
            Operation::Opendir { .. } => OpName::Opendir,
            Operation::Readdir { .. } => OpName::Readdir,
            Operation::Releasedir { .. } => OpName::Releasedir,
            Operation::Fsyncdir { .. } => OpName::Fsyncdir,
            Operation::Statfs { .. } => OpName::Statfs,
            Operation::Access { .. } => OpName::Access,
            Operation::Create { .. } => OpName::Create,
            Operation::CopyFileRange { .. } => OpName::CopyFileRange,
            Operation::Utimens { .. } => OpName::Utimens,
            Operation::Getxattr { .. } => OpName::Getxattr,
            Operation::Setxattr { .. } => OpName::Setxattr,
            Operation::Listxattr { .. } => OpName::Listxattr,
            Operation::Removexattr { .. } => OpName::Removexattr,
            Operation::Fallocate { .. } => OpName::Fallocate,
            Operation::Lseek { .. } => OpName::Lseek,
            Operation::Flock { .. } => OpName::Flock,
            Operation::Lock { .. } => OpName::Lock,
            Operation::Ioctl { .. } => OpName::Ioctl,
            Operation::Bmap { .. } => OpName::Bmap,
            Operation::Poll { .. } => OpName::Poll,
            Operation::Setlk { .. } => OpName::Setlk,
            Operation::Getlk { .. } => OpName::Getlk,
        }
    }
}

/// `ioctl`'s argument, whose shape depends on the downstream driver; see
/// the Open Question this resolves in `DESIGN.md`.
#[derive(Debug)]
pub enum IoctlArg<'a> {
    /// The `cmd`-sized integer argument, when it fits in 32 bits.
    Value(u32),
    /// A buffer argument, for commands whose `_IOC_SIZE` indicates an
    /// in/out buffer larger than a plain integer.
    Buffer(BufferHandle<'a>),
}

/// The subset of a [`Stat`] a `setattr` call actually supplied, gated by
/// the companion [`SetattrMask`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PartialStat {
    /// New permission bits, if `MODE` is set.
    pub mode: Option<u32>,
    /// New owning uid, if `UID` is set.
    pub uid: Option<u32>,
    /// New owning gid, if `GID` is set.
    pub gid: Option<u32>,
    /// New size, if `SIZE` is set.
    pub size: Option<u64>,
    /// New access time, if `ATIME` is set (mutually exclusive with `ATIME_NOW`).
    pub atime: Option<Timestamp>,
    /// New modification time, if `MTIME` is set.
    pub mtime: Option<Timestamp>,
    /// New change time, if `CTIME` is set.
    pub ctime: Option<Timestamp>,
}

/// `utimens`' per-field time argument.
#[derive(Debug, Clone, Copy)]
pub enum TimeSpec {
    /// Leave this timestamp untouched.
    Omit,
    /// Set it to the bridge's current time.
    Now,
    /// Set it to this explicit value.
    Explicit(Timestamp),
}

/// What an adapter hands back to the native side.
#[derive(Debug)]
#[allow(missing_docs)]
pub enum Reply<'a> {
    Ok,
    Init { info: ConnInfo },
    Entry { ino: Ino, generation: Generation, attr: Stat, attr_timeout: Duration, entry_timeout: Duration },
    Attr { attr: Stat, timeout: Duration },
    Data(BufferHandle<'a>),
    Written(u32),
    Link(OsString),
    Dir { entries: Vec<DirEntry>, has_more: bool, next_offset: i64 },
    DirPlus { entries: Vec<DirEntryPlus>, has_more: bool, next_offset: i64 },
    Open { fh: Fh, flags: FopenFlags },
    Created { ino: Ino, generation: Generation, attr: Stat, attr_timeout: Duration, entry_timeout: Duration, fh: Fh, flags: FopenFlags },
    Statfs(Statvfs),
    Xattr { size: u32, data: Option<BufferHandle<'a>> },
    Poll { revents: u32, keep_polling: bool },
    Lock(LockInfo),
    Ioctl { result: i32, data: Option<BufferHandle<'a>> },
    Bmap(u64),
    Lseek(i64),
    Copied(u64),
    Err(Errno),
}

impl<'a> Reply<'a> {
    /// Collapses any reply to a plain errno, for adapters that only need
    /// to know success/failure (e.g. flush, fsync, release).
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Reply::Err(e) => Some(*e),
            _ => None,
        }
    }
}

/// Infers the implied mask bits from which [`PartialStat`] fields are
/// present, unions them with the caller-supplied mask, and rejects
/// anything outside the supported set.
pub fn resolve_setattr_mask(
    requested: SetattrMask,
    attr: &PartialStat,
) -> Result<SetattrMask, BridgeError> {
    let mut implied = SetattrMask::empty();
    if attr.mode.is_some() {
        implied |= SetattrMask::MODE;
    }
    if attr.uid.is_some() {
        implied |= SetattrMask::UID;
    }
    if attr.gid.is_some() {
        implied |= SetattrMask::GID;
    }
    if attr.size.is_some() {
        implied |= SetattrMask::SIZE;
    }
    if attr.atime.is_some() {
        implied |= SetattrMask::ATIME;
    }
    if attr.mtime.is_some() {
        implied |= SetattrMask::MTIME;
    }
    if attr.ctime.is_some() {
        implied |= SetattrMask::CTIME;
    }
    let union = requested | implied;
    let supported = SetattrMask::all();
    if !supported.contains(union) {
        return Err(BridgeError::Validation(format!(
            "setattr mask {union:?} has bits outside the supported set {supported:?}"
        )));
    }
    Ok(union)
}

/// Resolves a `TimeSpec` to a concrete [`Timestamp`], substituting the
/// bridge's current time for `Now`. Returns `None` for `Omit`.
pub fn resolve_time(spec: TimeSpec, now: impl FnOnce() -> Timestamp) -> Option<Timestamp> {
    match spec {
        TimeSpec::Omit => None,
        TimeSpec::Now => Some(now()),
        TimeSpec::Explicit(ts) => Some(ts.round_to(TimePrecision::Nanosecond)),
    }
}

/// What an xattr adapter should ask a handler to do, derived from the
/// kernel-supplied `size` argument per the two-phase `getxattr`/
/// `listxattr` protocol: `size == 0` is a size query, `size > 0` asks
/// for the data and must fail with `ERANGE` if it doesn't fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrQuery {
    /// Report only the byte length the full value would need.
    SizeOnly,
    /// Return up to `buffer_size` bytes of the value.
    Data {
        /// The buffer size the kernel offered.
        buffer_size: u32,
    },
}

impl XattrQuery {
    /// Classifies a raw `size` argument per the two-phase protocol.
    pub fn from_requested_size(size: u32) -> Self {
        if size == 0 {
            XattrQuery::SizeOnly
        } else {
            XattrQuery::Data { buffer_size: size }
        }
    }
}

/// Checks a handler-reported value length against the query that was
/// made, returning the reply the adapter should send: the byte count for
/// a size query, the value's length for a data query that fits, or
/// `ERANGE` for one that doesn't.
pub fn resolve_xattr_reply(query: XattrQuery, value_len: usize) -> Result<u32, Errno> {
    let value_len: u32 = value_len.try_into().map_err(|_| Errno::ERANGE)?;
    match query {
        XattrQuery::SizeOnly => Ok(value_len),
        XattrQuery::Data { buffer_size } if value_len <= buffer_size => Ok(value_len),
        XattrQuery::Data { .. } => Err(Errno::ERANGE),
    }
}

/// A `readdir` page, shaped for the kernel: `.`/`..` are always present
/// (at the front, if the caller's own offset range hasn't already passed
/// them), entries stop once adding the next one would exceed
/// `size_budget`, and `next_offset` is whatever the kernel should pass
/// back on the following call.
///
/// `entry_cost` mirrors the ≈80-bytes-per-entry heuristic §4.4 calls for
/// (`fuse_dirent` header plus the name, rounded up); callers on a
/// platform with a different on-wire dirent layout may supply their own.
pub fn paginate_readdir(
    parent_ino: Ino,
    self_ino: Ino,
    offset: i64,
    entries: impl IntoIterator<Item = DirEntry>,
    size_budget: usize,
    entry_cost: impl Fn(&DirEntry) -> usize,
) -> (Vec<DirEntry>, bool, i64) {
    let dot = DirEntry {
        name: OsString::from("."),
        ino: self_ino,
        kind: crate::FileType::Directory,
        next_offset: 1,
    };
    let dotdot = DirEntry {
        name: OsString::from(".."),
        ino: parent_ino,
        kind: crate::FileType::Directory,
        next_offset: 2,
    };
    let synthetic = [dot, dotdot];
    let mut candidates = synthetic
        .into_iter()
        .filter(|e| e.next_offset > offset)
        .chain(entries)
        .peekable();

    let mut page = Vec::new();
    let mut used = 0usize;
    let mut has_more = false;
    while let Some(entry) = candidates.next() {
        let cost = entry_cost(&entry);
        if !page.is_empty() && used + cost > size_budget {
            has_more = true;
            // Stash this entry back as the one that didn't fit; since we
            // can't push front onto a `Peekable` adapter we just note it
            // overflowed the budget and stop, the caller resumes from
            // `page.last().next_offset` next time.
            break;
        }
        used += cost;
        page.push(entry);
        if candidates.peek().is_some() {
            has_more = true;
        } else {
            has_more = false;
        }
    }
    let next_offset = page.last().map(|e: &DirEntry| e.next_offset).unwrap_or(offset);
    (page, has_more, next_offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, ino: u64, next_offset: i64) -> DirEntry {
        DirEntry {
            name: OsString::from(name),
            ino: Ino::from(ino),
            kind: crate::FileType::RegularFile,
            next_offset,
        }
    }

    #[test]
    fn setattr_mask_infers_from_present_fields() {
        let attr = PartialStat { size: Some(0), ..Default::default() };
        let mask = resolve_setattr_mask(SetattrMask::empty(), &attr).unwrap();
        assert_eq!(mask, SetattrMask::SIZE);
    }

    #[test]
    fn setattr_mask_unions_requested_and_implied_bits() {
        let attr = PartialStat { uid: Some(0), ..Default::default() };
        let mask = resolve_setattr_mask(SetattrMask::MODE, &attr).unwrap();
        assert_eq!(mask, SetattrMask::MODE | SetattrMask::UID);
    }

    #[test]
    fn resolve_time_substitutes_now_and_passes_through_explicit() {
        let now = Timestamp::try_from(Duration::from_secs(42)).unwrap();
        assert!(resolve_time(TimeSpec::Omit, || now).is_none());
        assert_eq!(resolve_time(TimeSpec::Now, || now).unwrap(), now);
        let explicit = Timestamp::try_from(Duration::from_secs(7)).unwrap();
        assert_eq!(resolve_time(TimeSpec::Explicit(explicit), || now).unwrap(), explicit);
    }

    #[test]
    fn xattr_size_query_reports_length_without_range_check() {
        let query = XattrQuery::from_requested_size(0);
        assert_eq!(resolve_xattr_reply(query, 4096).unwrap(), 4096);
    }

    #[test]
    fn xattr_data_query_fails_erange_when_buffer_too_small() {
        let query = XattrQuery::from_requested_size(8);
        assert_eq!(resolve_xattr_reply(query, 16).unwrap_err(), Errno::ERANGE);
        assert_eq!(resolve_xattr_reply(query, 8).unwrap(), 8);
    }

    #[test]
    fn readdir_pagination_always_includes_dot_entries_from_offset_zero() {
        let entries = vec![entry("a", 10, 3), entry("b", 11, 4)];
        let (page, has_more, next_offset) =
            paginate_readdir(Ino::from(1), Ino::from(2), 0, entries, 1024, |_| 80);
        let names: Vec<_> = page.iter().map(|e| e.name.to_str().unwrap()).collect();
        assert_eq!(names, vec![".", "..", "a", "b"]);
        assert!(!has_more);
        assert_eq!(next_offset, 4);
    }

    #[test]
    fn readdir_pagination_resumes_past_dot_entries() {
        let entries = vec![entry("a", 10, 3), entry("b", 11, 4)];
        let (page, _, _) = paginate_readdir(Ino::from(1), Ino::from(2), 2, entries, 1024, |_| 80);
        let names: Vec<_> = page.iter().map(|e| e.name.to_str().unwrap()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn readdir_pagination_honours_size_budget() {
        let entries = vec![entry("a", 10, 3), entry("b", 11, 4), entry("c", 12, 5)];
        let (page, has_more, next_offset) =
            paginate_readdir(Ino::from(1), Ino::from(2), 2, entries, 160, |_| 80);
        assert_eq!(page.len(), 2);
        assert!(has_more);
        assert_eq!(next_offset, 4);
    }

    #[test]
    fn readdir_pagination_always_makes_progress_even_when_one_entry_exceeds_budget() {
        let entries = vec![entry("huge", 10, 3)];
        let (page, has_more, _) = paginate_readdir(Ino::from(1), Ino::from(2), 2, entries, 10, |_| 9999);
        assert_eq!(page.len(), 1, "an oversized single entry must still be emitted, not dropped");
        assert!(!has_more);
    }
}
