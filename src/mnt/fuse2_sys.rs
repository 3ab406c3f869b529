//! Minimal mirror of libfuse's `struct fuse_args` (from `fuse_opt.h`).
//!
//! Only the layout is needed: this crate's default mount path talks to the
//! kernel directly and never links libfuse, but the argument-vector helper in
//! `with_fuse_args` is exercised by tests regardless of the active mount
//! backend.

#[repr(C)]
#[derive(Debug)]
pub(crate) struct fuse_args {
    pub argc: libc::c_int,
    pub argv: *const *const libc::c_char,
    pub allocated: libc::c_int,
}
