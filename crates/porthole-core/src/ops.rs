use std::ffi::CStr;

use libc::{c_int, mode_t};

/// Which open-style entry point the caller came through.
///
/// All three share open semantics; filesystem-format libraries reach the
/// fortified two-argument variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    /// `open(2)`.
    Open,
    /// `open64(2)`.
    Open64,
    /// `__open64_2`, the fortified variant without a mode argument.
    Open64Fortified,
}

impl OpenKind {
    /// Symbol name, for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Open64 => "open64",
            Self::Open64Fortified => "__open64_2",
        }
    }
}

/// Which seek entry point the caller came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekKind {
    /// `lseek(2)`.
    Seek,
    /// `lseek64(2)`.
    Seek64,
}

impl SeekKind {
    /// Symbol name, for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Seek => "lseek",
            Self::Seek64 => "lseek64",
        }
    }
}

/// The real file operations the interceptor delegates through.
///
/// One method per intercepted operation class, with the C calling
/// convention preserved: negative return values signal failure and `errno`
/// belongs to the implementation. The production implementation lives in
/// the preload crate and resolves the genuine libc entry points once at
/// load; tests substitute a recording fake.
///
/// The stat family is deliberately absent. The caller owns the platform
/// `struct stat` buffer, so delegation for size queries stays in the
/// preload adapter; the core only decides whether and with what value the
/// size field is overridden.
pub trait FileOps {
    /// Open (and possibly create) a file. `mode` is present only when the
    /// flag set requires one.
    fn open(&self, path: &CStr, flags: c_int, mode: Option<mode_t>, kind: OpenKind) -> c_int;

    /// Close a descriptor.
    fn close(&self, fd: c_int) -> c_int;

    /// Reposition a descriptor. `offset` and the result are in the target
    /// file's own coordinate space.
    fn seek(&self, fd: c_int, offset: i64, whence: c_int, kind: SeekKind) -> i64;

    /// Manipulate file space (`fallocate(2)`).
    fn allocate(&self, fd: c_int, mode: c_int, offset: i64, len: i64) -> c_int;

    /// Positioned read at an absolute offset.
    fn pread(&self, fd: c_int, buf: &mut [u8], offset: i64) -> isize;

    /// Positioned write at an absolute offset.
    fn pwrite(&self, fd: c_int, buf: &[u8], offset: i64) -> isize;
}
