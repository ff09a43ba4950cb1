//! `LD_PRELOAD` shim exporting the intercepted glibc file-I/O symbols.
//!
//! Loaded ahead of glibc, this library rebinds a fixed set of file-access
//! entry points so that a configured byte window of one target file appears
//! to be an independent, whole file. Everything that is not the target
//! passes through untouched. The decision logic lives in `porthole-core`;
//! this crate is the foreign-call boundary: argument marshalling, errno,
//! process lifecycle and the genuine-symbol resolution.
//!
//! ```text
//! export LD_PRELOAD=./libporthole.so PORTHOLE_FILE=disk.img,44040192,33554944
//! mke2fs -F -q -t ext4 -m 0 disk.img
//! e2fsck -n disk.img
//! unset LD_PRELOAD
//! ```

mod real;

use std::ffi::CStr;
use std::fs::File;
use std::os::fd::FromRawFd;
use std::process;
use std::slice;
use std::sync::OnceLock;

use libc::{c_char, c_int, c_void, mode_t, off64_t, off_t, size_t, ssize_t};
use nix::errno::Errno;
use porthole_core::{
    DiagLevel, DiagSink, FileOps, InterceptError, InterceptResult, Interceptor, LOG_FILE_NAME,
    OpenKind, SeekKind, Verbosity, Window,
};

use crate::real::RealFileOps;

static CONTEXT: OnceLock<Interceptor<RealFileOps>> = OnceLock::new();

/// Force construction at load so a bad window descriptor aborts before the
/// host program can touch any file.
#[unsafe(link_section = ".init_array")]
#[used]
static PORTHOLE_INIT: extern "C" fn() = {
    extern "C" fn init() {
        let _ = context();
    }
    init
};

/// Flush the duplicate log on unload, mirroring the constructor above.
#[unsafe(link_section = ".fini_array")]
#[used]
static PORTHOLE_FINI: extern "C" fn() = {
    extern "C" fn fini() {
        if let Some(ctx) = CONTEXT.get() {
            ctx.sink().flush();
        }
    }
    fini
};

fn context() -> &'static Interceptor<RealFileOps> {
    CONTEXT.get_or_init(|| match build_context() {
        Ok(ctx) => ctx,
        Err(msg) => {
            eprintln!("porthole: {msg}");
            process::exit(1);
        }
    })
}

fn build_context() -> Result<Interceptor<RealFileOps>, String> {
    let window = Window::from_env().map_err(|e| e.to_string())?;
    let ops = RealFileOps::resolve().map_err(|sym| format!("cannot resolve symbol {sym}"))?;
    let sink = if window.verbosity() >= Verbosity::Info {
        // Open the log through the real entry point: going through
        // std::fs here would re-enter our own exported open64 while the
        // context is still being initialized.
        let fd = ops.open(
            c"porthole.log",
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            Some(0o644),
            OpenKind::Open64,
        );
        if fd < 0 {
            return Err(format!("cannot open {LOG_FILE_NAME}: {}", Errno::last()));
        }
        let file = unsafe { File::from_raw_fd(fd) };
        DiagSink::with_log_handle(window.verbosity(), file)
    } else {
        DiagSink::new(window.verbosity())
    };
    sink.line(
        DiagLevel::Info,
        true,
        &format!("porthole target file: {}", window.path().display()),
    );
    sink.line(
        DiagLevel::Info,
        true,
        &format!("porthole      offset: {}", window.base()),
    );
    sink.line(
        DiagLevel::Info,
        true,
        &format!("porthole         len: {}", window.length()),
    );
    Ok(Interceptor::new(window, sink, ops))
}

fn fatal(err: &InterceptError) -> ! {
    eprintln!("porthole: fatal: {err}");
    process::exit(1);
}

fn set_errno(errno: Errno) {
    // SAFETY: __errno_location points at this thread's errno slot.
    unsafe { *libc::__errno_location() = errno as c_int };
}

fn reply_int(res: InterceptResult<c_int>) -> c_int {
    match res {
        Ok(v) => v,
        Err(err) if err.is_fatal() => fatal(&err),
        Err(err) => {
            set_errno(err.errno());
            -1
        }
    }
}

fn reply_off(res: InterceptResult<i64>) -> i64 {
    match res {
        Ok(v) => v,
        Err(err) if err.is_fatal() => fatal(&err),
        Err(err) => {
            set_errno(err.errno());
            -1
        }
    }
}

fn reply_ssize(res: InterceptResult<isize>) -> ssize_t {
    match res {
        Ok(v) => v,
        Err(err) if err.is_fatal() => fatal(&err),
        Err(err) => {
            set_errno(err.errno());
            -1
        }
    }
}

/// Whether the flag set carries a creation mode in the variadic slot.
fn needs_mode(flags: c_int) -> bool {
    (flags & libc::O_CREAT) != 0 || (flags & libc::O_TMPFILE) == libc::O_TMPFILE
}

fn size_to_off(size: u64) -> off_t {
    i64::try_from(size).unwrap_or(i64::MAX)
}

// =============================================================================
// open-style entry points
// =============================================================================

unsafe fn open_impl(path: *const c_char, flags: c_int, mode: mode_t, kind: OpenKind) -> c_int {
    if path.is_null() {
        set_errno(Errno::EFAULT);
        return -1;
    }
    let ctx = context();
    let path = unsafe { CStr::from_ptr(path) };
    let mode = needs_mode(flags).then_some(mode);
    reply_int(ctx.open(path, flags, mode, kind))
}

/// open(2). Declared non-variadic with a trailing mode, ABI-compatible on
/// the supported targets; the value is only read when `flags` requires one.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    unsafe { open_impl(path, flags, mode, OpenKind::Open) }
}

/// open64(2).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    unsafe { open_impl(path, flags, mode, OpenKind::Open64) }
}

/// The fortified two-argument open used by libext2fs.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __open64_2(path: *const c_char, flags: c_int) -> c_int {
    unsafe { open_impl(path, flags, 0, OpenKind::Open64Fortified) }
}

// =============================================================================
// close
// =============================================================================

/// close(2). A tracked descriptor is unregistered whether or not the real
/// close succeeds.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    reply_int(context().close(fd))
}

// =============================================================================
// seek
// =============================================================================

/// lseek(2). Tracked descriptors support absolute positioning only.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lseek(fd: c_int, offset: off_t, whence: c_int) -> off_t {
    reply_off(context().seek(fd, offset, whence, SeekKind::Seek))
}

/// lseek64(2).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lseek64(fd: c_int, offset: off64_t, whence: c_int) -> off64_t {
    reply_off(context().seek(fd, offset, whence, SeekKind::Seek64))
}

// =============================================================================
// status queries — delegate into the caller's buffer, then fake the size
// =============================================================================

/// `__xstat`, the glibc path-stat entry point with the 32-bit size field.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __xstat(ver: c_int, path: *const c_char, buf: *mut libc::stat) -> c_int {
    let ctx = context();
    let res = unsafe { (ctx.ops().xstat)(ver, path, buf) };
    if path.is_null() || buf.is_null() {
        return res;
    }
    let cpath = unsafe { CStr::from_ptr(path) };
    let size = ctx.stat_size(cpath);
    if res == 0 {
        if let Some(size) = size {
            unsafe { (*buf).st_size = size_to_off(size) };
        }
    }
    ctx.sink().line(
        DiagLevel::Debug,
        size.is_some(),
        &format!("__xstat({}) => {res}", cpath.to_string_lossy()),
    );
    res
}

/// `__xstat64`, the 64-bit variant.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __xstat64(
    ver: c_int,
    path: *const c_char,
    buf: *mut libc::stat64,
) -> c_int {
    let ctx = context();
    let res = unsafe { (ctx.ops().xstat64)(ver, path, buf) };
    if path.is_null() || buf.is_null() {
        return res;
    }
    let cpath = unsafe { CStr::from_ptr(path) };
    let size = ctx.stat_size(cpath);
    if res == 0 {
        if let Some(size) = size {
            unsafe { (*buf).st_size = size_to_off(size) };
        }
    }
    ctx.sink().line(
        DiagLevel::Debug,
        size.is_some(),
        &format!("__xstat64({}) => {res}", cpath.to_string_lossy()),
    );
    res
}

/// fstat(2).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fstat(fd: c_int, buf: *mut libc::stat) -> c_int {
    let ctx = context();
    let res = unsafe { (ctx.ops().fstat)(fd, buf) };
    let size = ctx.fstat_size(fd);
    if res == 0 && !buf.is_null() {
        if let Some(size) = size {
            unsafe { (*buf).st_size = size_to_off(size) };
        }
    }
    ctx.sink().line(
        DiagLevel::Debug,
        size.is_some(),
        &format!("fstat({fd}) => {res}"),
    );
    res
}

/// fstat64(2).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fstat64(fd: c_int, buf: *mut libc::stat64) -> c_int {
    let ctx = context();
    let res = unsafe { (ctx.ops().fstat64)(fd, buf) };
    let size = ctx.fstat_size(fd);
    if res == 0 && !buf.is_null() {
        if let Some(size) = size {
            unsafe { (*buf).st_size = size_to_off(size) };
        }
    }
    ctx.sink().line(
        DiagLevel::Debug,
        size.is_some(),
        &format!("fstat64({fd}) => {res}"),
    );
    res
}

/// `__fxstat64`, the versioned descriptor-stat entry point.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __fxstat64(ver: c_int, fd: c_int, buf: *mut libc::stat64) -> c_int {
    let ctx = context();
    let res = unsafe { (ctx.ops().fxstat64)(ver, fd, buf) };
    let size = ctx.fstat_size(fd);
    if res == 0 && !buf.is_null() {
        if let Some(size) = size {
            unsafe { (*buf).st_size = size_to_off(size) };
        }
    }
    ctx.sink().line(
        DiagLevel::Debug,
        size.is_some(),
        &format!("__fxstat64({fd}) => {res}"),
    );
    res
}

// =============================================================================
// space allocation
// =============================================================================

/// fallocate(2). An out-of-window offset reports no-space.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fallocate(fd: c_int, mode: c_int, offset: off_t, len: off_t) -> c_int {
    reply_int(context().allocate(fd, mode, offset, len))
}

// =============================================================================
// positioned I/O
// =============================================================================

/// pread64(2). Only the starting offset is translated, never the count.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pread64(
    fd: c_int,
    buf: *mut c_void,
    count: size_t,
    offset: off64_t,
) -> ssize_t {
    let ctx = context();
    if buf.is_null() && count != 0 {
        // The kernel rejects a null buffer regardless of offset.
        return unsafe { (ctx.ops().pread64)(fd, buf, count, offset) };
    }
    let slice = if count == 0 {
        &mut [][..]
    } else {
        unsafe { slice::from_raw_parts_mut(buf.cast::<u8>(), count) }
    };
    reply_ssize(ctx.pread(fd, slice, offset))
}

/// pwrite64(2).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pwrite64(
    fd: c_int,
    buf: *const c_void,
    count: size_t,
    offset: off64_t,
) -> ssize_t {
    let ctx = context();
    if buf.is_null() && count != 0 {
        return unsafe { (ctx.ops().pwrite64)(fd, buf, count, offset) };
    }
    let slice = if count == 0 {
        &[][..]
    } else {
        unsafe { slice::from_raw_parts(buf.cast::<u8>(), count) }
    };
    reply_ssize(ctx.pwrite(fd, slice, offset))
}
