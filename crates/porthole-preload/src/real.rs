//! Resolution of the genuine glibc entry points.
//!
//! Every forwarded symbol is looked up once at library load through
//! `dlsym(RTLD_NEXT, ...)`, so the shim's own exported symbols are skipped
//! and the next definition in search order (normally glibc's) is bound.
//! Foreign-call plumbing lives entirely here; the interceptor in
//! `porthole-core` never sees a raw pointer.

use std::ffi::CStr;
use std::mem;

use libc::{c_char, c_int, c_void, mode_t, off64_t, off_t, size_t, ssize_t};
use porthole_core::{FileOps, OpenKind, SeekKind};

type OpenFn = unsafe extern "C" fn(*const c_char, c_int, mode_t) -> c_int;
type Open2Fn = unsafe extern "C" fn(*const c_char, c_int) -> c_int;
type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
type SeekFn = unsafe extern "C" fn(c_int, off_t, c_int) -> off_t;
type Seek64Fn = unsafe extern "C" fn(c_int, off64_t, c_int) -> off64_t;
type XstatFn = unsafe extern "C" fn(c_int, *const c_char, *mut libc::stat) -> c_int;
type Xstat64Fn = unsafe extern "C" fn(c_int, *const c_char, *mut libc::stat64) -> c_int;
type FstatFn = unsafe extern "C" fn(c_int, *mut libc::stat) -> c_int;
type Fstat64Fn = unsafe extern "C" fn(c_int, *mut libc::stat64) -> c_int;
type Fxstat64Fn = unsafe extern "C" fn(c_int, c_int, *mut libc::stat64) -> c_int;
type FallocateFn = unsafe extern "C" fn(c_int, c_int, off_t, off_t) -> c_int;
type Pread64Fn = unsafe extern "C" fn(c_int, *mut c_void, size_t, off64_t) -> ssize_t;
type Pwrite64Fn = unsafe extern "C" fn(c_int, *const c_void, size_t, off64_t) -> ssize_t;

/// The genuine libc implementations behind the shim.
pub(crate) struct RealFileOps {
    open: OpenFn,
    open64: OpenFn,
    open64_2: Open2Fn,
    close: CloseFn,
    lseek: SeekFn,
    lseek64: Seek64Fn,
    pub(crate) xstat: XstatFn,
    pub(crate) xstat64: Xstat64Fn,
    pub(crate) fstat: FstatFn,
    pub(crate) fstat64: Fstat64Fn,
    pub(crate) fxstat64: Fxstat64Fn,
    fallocate: FallocateFn,
    pub(crate) pread64: Pread64Fn,
    pub(crate) pwrite64: Pwrite64Fn,
}

impl RealFileOps {
    /// Resolve every forwarded symbol, failing with the name of the first
    /// one that cannot be found.
    pub(crate) fn resolve() -> Result<Self, &'static str> {
        // SAFETY: each pointer comes from dlsym for the matching symbol, so
        // the transmuted signature is the one glibc exports.
        unsafe {
            Ok(Self {
                open: mem::transmute::<*mut c_void, OpenFn>(next_sym(c"open")?),
                open64: mem::transmute::<*mut c_void, OpenFn>(next_sym(c"open64")?),
                open64_2: mem::transmute::<*mut c_void, Open2Fn>(next_sym(c"__open64_2")?),
                close: mem::transmute::<*mut c_void, CloseFn>(next_sym(c"close")?),
                lseek: mem::transmute::<*mut c_void, SeekFn>(next_sym(c"lseek")?),
                lseek64: mem::transmute::<*mut c_void, Seek64Fn>(next_sym(c"lseek64")?),
                xstat: mem::transmute::<*mut c_void, XstatFn>(next_sym(c"__xstat")?),
                xstat64: mem::transmute::<*mut c_void, Xstat64Fn>(next_sym(c"__xstat64")?),
                fstat: mem::transmute::<*mut c_void, FstatFn>(next_sym(c"fstat")?),
                fstat64: mem::transmute::<*mut c_void, Fstat64Fn>(next_sym(c"fstat64")?),
                fxstat64: mem::transmute::<*mut c_void, Fxstat64Fn>(next_sym(c"__fxstat64")?),
                fallocate: mem::transmute::<*mut c_void, FallocateFn>(next_sym(c"fallocate")?),
                pread64: mem::transmute::<*mut c_void, Pread64Fn>(next_sym(c"pread64")?),
                pwrite64: mem::transmute::<*mut c_void, Pwrite64Fn>(next_sym(c"pwrite64")?),
            })
        }
    }
}

fn next_sym(name: &'static CStr) -> Result<*mut c_void, &'static str> {
    let ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if ptr.is_null() {
        Err(name.to_str().unwrap_or("<non-utf8 symbol>"))
    } else {
        Ok(ptr)
    }
}

impl FileOps for RealFileOps {
    fn open(&self, path: &CStr, flags: c_int, mode: Option<mode_t>, kind: OpenKind) -> c_int {
        unsafe {
            match kind {
                OpenKind::Open => (self.open)(path.as_ptr(), flags, mode.unwrap_or(0)),
                OpenKind::Open64 => (self.open64)(path.as_ptr(), flags, mode.unwrap_or(0)),
                OpenKind::Open64Fortified => (self.open64_2)(path.as_ptr(), flags),
            }
        }
    }

    fn close(&self, fd: c_int) -> c_int {
        unsafe { (self.close)(fd) }
    }

    fn seek(&self, fd: c_int, offset: i64, whence: c_int, kind: SeekKind) -> i64 {
        unsafe {
            match kind {
                SeekKind::Seek => (self.lseek)(fd, offset, whence),
                SeekKind::Seek64 => (self.lseek64)(fd, offset, whence),
            }
        }
    }

    fn allocate(&self, fd: c_int, mode: c_int, offset: i64, len: i64) -> c_int {
        unsafe { (self.fallocate)(fd, mode, offset, len) }
    }

    fn pread(&self, fd: c_int, buf: &mut [u8], offset: i64) -> isize {
        unsafe { (self.pread64)(fd, buf.as_mut_ptr().cast::<c_void>(), buf.len(), offset) }
    }

    fn pwrite(&self, fd: c_int, buf: &[u8], offset: i64) -> isize {
        unsafe { (self.pwrite64)(fd, buf.as_ptr().cast::<c_void>(), buf.len(), offset) }
    }
}
