//! Wire encoding for kernel-directed notifications (`FUSE_NOTIFY_*`).
//!
//! Notifications reuse the reply wire format but repurpose two header
//! fields: `unique` is always `0` (there is no request to answer) and
//! `error` carries the notify code instead of an errno.

use std::convert::TryInto;
use std::ffi::OsStr;
use std::io::IoSlice;
use std::num::TryFromIntError;
use std::os::unix::ffi::OsStrExt;

use smallvec::{smallvec, SmallVec};
use zerocopy::IntoBytes;

use super::fuse_abi as abi;
use super::fuse_abi::fuse_notify_code as notify_code;
use super::INodeNo;
use crate::notify::PollHandle;

pub(crate) enum Notification<'a> {
    Poll(abi::fuse_notify_poll_wakeup_out),
    InvalInode(abi::fuse_notify_inval_inode_out),
    InvalEntry {
        header: abi::fuse_notify_inval_entry_out,
        name: &'a OsStr,
    },
    Store {
        header: abi::fuse_notify_store_out,
        data: &'a [u8],
    },
    Delete {
        header: abi::fuse_notify_delete_out,
        name: &'a OsStr,
    },
}

impl<'a> Notification<'a> {
    pub(crate) fn new_poll(kh: PollHandle) -> Self {
        Notification::Poll(abi::fuse_notify_poll_wakeup_out { kh: kh.0 })
    }

    pub(crate) fn new_inval_inode(ino: INodeNo, offset: i64, len: i64) -> Self {
        Notification::InvalInode(abi::fuse_notify_inval_inode_out {
            ino: ino.0,
            off: offset,
            len,
        })
    }

    pub(crate) fn new_inval_entry(
        parent: INodeNo,
        name: &'a OsStr,
    ) -> Result<Self, TryFromIntError> {
        Ok(Notification::InvalEntry {
            header: abi::fuse_notify_inval_entry_out {
                parent: parent.0,
                namelen: name.as_bytes().len().try_into()?,
                padding: 0,
            },
            name,
        })
    }

    pub(crate) fn new_store(
        ino: INodeNo,
        offset: u64,
        data: &'a [u8],
    ) -> Result<Self, TryFromIntError> {
        Ok(Notification::Store {
            header: abi::fuse_notify_store_out {
                nodeid: ino.0,
                offset,
                size: data.len().try_into()?,
                padding: 0,
            },
            data,
        })
    }

    pub(crate) fn new_delete(
        parent: INodeNo,
        child: INodeNo,
        name: &'a OsStr,
    ) -> Result<Self, TryFromIntError> {
        Ok(Notification::Delete {
            header: abi::fuse_notify_delete_out {
                parent: parent.0,
                child: child.0,
                namelen: name.as_bytes().len().try_into()?,
                padding: 0,
            },
            name,
        })
    }

    /// Encodes `fuse_out_header` plus this notification's body and hands the
    /// resulting iovec slice to `f`. Fails if the body is larger than the
    /// wire length field (`u32`) can represent.
    pub(crate) fn with_iovec<F: FnOnce(&[IoSlice<'_>]) -> T, T>(
        &self,
        code: notify_code,
        f: F,
    ) -> Result<T, TryFromIntError> {
        let mut v: SmallVec<[IoSlice<'_>; 3]> = smallvec![];
        let bodylen = match self {
            Notification::Poll(b) => {
                v.push(IoSlice::new(b.as_bytes()));
                b.as_bytes().len()
            }
            Notification::InvalInode(b) => {
                v.push(IoSlice::new(b.as_bytes()));
                b.as_bytes().len()
            }
            Notification::InvalEntry { header, name } => {
                v.push(IoSlice::new(header.as_bytes()));
                v.push(IoSlice::new(name.as_bytes()));
                header.as_bytes().len() + name.as_bytes().len()
            }
            Notification::Store { header, data } => {
                v.push(IoSlice::new(header.as_bytes()));
                v.push(IoSlice::new(data));
                header.as_bytes().len() + data.len()
            }
            Notification::Delete { header, name } => {
                v.push(IoSlice::new(header.as_bytes()));
                v.push(IoSlice::new(name.as_bytes()));
                header.as_bytes().len() + name.as_bytes().len()
            }
        };
        let header = abi::fuse_out_header {
            unique: 0,
            error: code as i32,
            len: (size_of::<abi::fuse_out_header>() + bodylen).try_into()?,
        };
        let mut full: SmallVec<[IoSlice<'_>; 4]> = smallvec![IoSlice::new(header.as_bytes())];
        full.extend(v);
        Ok(f(&full))
    }
}
