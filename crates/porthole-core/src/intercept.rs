//! The operation interceptor.
//!
//! One entry point per intercepted operation: decide by path match or
//! registry membership, translate offsets into the target file's coordinate
//! space, delegate through the injected [`FileOps`] capability, adjust the
//! result, and keep the descriptor registry in step with open/close events.
//! Non-matching calls are pure pass-throughs that consult the registry
//! exactly once and modify nothing.

use std::ffi::CStr;
use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};

use libc::{SEEK_SET, c_int, mode_t};

use crate::diag::{DiagLevel, DiagSink};
use crate::error::{InterceptError, InterceptResult};
use crate::ops::{FileOps, OpenKind, SeekKind};
use crate::registry::FdRegistry;
use crate::translate::{from_absolute, to_absolute};
use crate::window::Window;

/// Process-wide interception context.
///
/// Owns the immutable [`Window`], the descriptor registry, the diagnostic
/// sink and the real-operations adapter; exactly one instance exists per
/// process, constructed before the first intercepted call. Registry
/// mutation and seek's check-then-act sequence are serialized by an
/// internal mutex, so multi-threaded tools are safe without external
/// locking.
#[derive(Debug)]
pub struct Interceptor<O> {
    window: Window,
    registry: Mutex<FdRegistry>,
    sink: DiagSink,
    ops: O,
}

impl<O: FileOps> Interceptor<O> {
    /// Assemble the context from its parts.
    pub fn new(window: Window, sink: DiagSink, ops: O) -> Self {
        Self {
            window,
            registry: Mutex::new(FdRegistry::new()),
            sink,
            ops,
        }
    }

    /// The configured window.
    #[must_use]
    pub fn window(&self) -> &Window {
        &self.window
    }

    /// The diagnostic sink.
    #[must_use]
    pub fn sink(&self) -> &DiagSink {
        &self.sink
    }

    /// The injected real-operations adapter.
    #[must_use]
    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// Whether `fd` currently refers to the target file.
    #[must_use]
    pub fn is_tracked(&self, fd: RawFd) -> bool {
        self.lock_registry().contains(fd)
    }

    /// Open-style call. Delegates with the original arguments; a
    /// successful open of the target path registers the new descriptor.
    ///
    /// # Errors
    ///
    /// Fatal [`InterceptError::RegistryFull`] when a 17th target descriptor
    /// would need tracking.
    pub fn open(
        &self,
        path: &CStr,
        flags: c_int,
        mode: Option<mode_t>,
        kind: OpenKind,
    ) -> InterceptResult<c_int> {
        let target = self.window.matches_path(path);
        let res = self.ops.open(path, flags, mode, kind);
        self.sink.line(
            DiagLevel::Debug,
            target,
            &format!(
                "{}({}, {:#x}, {:#o}) => {}",
                kind.name(),
                path.to_string_lossy(),
                flags,
                mode.unwrap_or(0),
                res
            ),
        );
        if target && res >= 0 {
            self.lock_registry()
                .insert(res)
                .map_err(|e| self.fail(e))?;
        }
        Ok(res)
    }

    /// Close. Delegates first; a tracked descriptor is unregistered
    /// afterwards whether or not the real close succeeded.
    ///
    /// # Errors
    ///
    /// Fatal [`InterceptError::UntrackedDescriptor`] if the registry and
    /// the real descriptor lifecycle have diverged.
    pub fn close(&self, fd: RawFd) -> InterceptResult<c_int> {
        let mut registry = self.lock_registry();
        let tracked = registry.contains(fd);
        let res = self.ops.close(fd);
        if tracked {
            registry.remove(fd).map_err(|e| self.fail(e))?;
        }
        drop(registry);
        self.sink
            .line(DiagLevel::Debug, tracked, &format!("close({fd}) => {res}"));
        Ok(res)
    }

    /// Absolute seek. Tracked descriptors accept `SEEK_SET` only; the
    /// offset is validated against the window, translated, delegated, the
    /// real result verified against the requested absolute position, and
    /// the returned position translated back to window-relative. Failed
    /// seeks are reported as-is, without back-translation.
    ///
    /// # Errors
    ///
    /// Fatal [`InterceptError::UnsupportedWhence`] for any other origin on
    /// a tracked descriptor; recoverable [`InterceptError::OutOfWindow`]
    /// (the real seek is never issued, so the position is untouched) and
    /// [`InterceptError::SeekMismatch`].
    pub fn seek(&self, fd: RawFd, offset: i64, whence: c_int, kind: SeekKind) -> InterceptResult<i64> {
        // Hold the registry lock across the whole tracked sequence so a
        // concurrent close cannot interleave with validate-then-delegate.
        let registry = self.lock_registry();
        if !registry.contains(fd) {
            drop(registry);
            let res = self.ops.seek(fd, offset, whence, kind);
            self.sink.line(
                DiagLevel::Debug,
                false,
                &format!("{}({fd}, {offset}, {whence}) => {res}", kind.name()),
            );
            return Ok(res);
        }
        if whence != SEEK_SET {
            return Err(self.fail(InterceptError::UnsupportedWhence { fd, whence }));
        }
        let absolute = to_absolute(&self.window, offset).map_err(|e| self.fail(e))?;
        let raw = self.ops.seek(fd, offset_to_i64(absolute), SEEK_SET, kind);
        if raw != offset_to_i64(absolute) {
            return Err(self.fail(InterceptError::SeekMismatch {
                want: absolute,
                got: raw,
            }));
        }
        let rel = i64::try_from(from_absolute(&self.window, absolute)).unwrap_or(i64::MAX);
        self.sink.line(
            DiagLevel::Debug,
            true,
            &format!("{}({fd}, {offset}, {whence}) => {rel}", kind.name()),
        );
        Ok(rel)
    }

    /// Space allocation. The requested offset is validated and translated;
    /// the length and the real result pass through unchanged.
    ///
    /// # Errors
    ///
    /// Recoverable [`InterceptError::AllocOutOfWindow`], reported to the
    /// caller as no-space.
    pub fn allocate(&self, fd: RawFd, mode: c_int, offset: i64, len: i64) -> InterceptResult<c_int> {
        if !self.is_tracked(fd) {
            let res = self.ops.allocate(fd, mode, offset, len);
            self.sink.line(
                DiagLevel::Debug,
                false,
                &format!("fallocate({fd}, {mode}, {offset}, {len}) => {res}"),
            );
            return Ok(res);
        }
        let absolute = to_absolute(&self.window, offset).map_err(|e| {
            self.fail(match e {
                InterceptError::OutOfWindow { offset, length } => {
                    InterceptError::AllocOutOfWindow { offset, length }
                }
                other => other,
            })
        })?;
        let res = self.ops.allocate(fd, mode, offset_to_i64(absolute), len);
        self.sink.line(
            DiagLevel::Debug,
            true,
            &format!("fallocate({fd}, {mode}, {offset}, {len}) => {res}"),
        );
        Ok(res)
    }

    /// Positioned read. Only the starting offset is translated; the count
    /// and the returned byte count are never adjusted.
    ///
    /// # Errors
    ///
    /// Recoverable [`InterceptError::OutOfWindow`].
    pub fn pread(&self, fd: RawFd, buf: &mut [u8], offset: i64) -> InterceptResult<isize> {
        let count = buf.len();
        if !self.is_tracked(fd) {
            let res = self.ops.pread(fd, buf, offset);
            self.sink.line(
                DiagLevel::Debug,
                false,
                &format!("pread64({fd}, {count}, {offset}) => {res}"),
            );
            return Ok(res);
        }
        let absolute = to_absolute(&self.window, offset).map_err(|e| self.fail(e))?;
        let res = self.ops.pread(fd, buf, offset_to_i64(absolute));
        self.sink.line(
            DiagLevel::Debug,
            true,
            &format!("pread64({fd}, {count}, {offset}) => {res}"),
        );
        Ok(res)
    }

    /// Positioned write. Same offset policy as [`Self::pread`].
    ///
    /// # Errors
    ///
    /// Recoverable [`InterceptError::OutOfWindow`].
    pub fn pwrite(&self, fd: RawFd, buf: &[u8], offset: i64) -> InterceptResult<isize> {
        let count = buf.len();
        if !self.is_tracked(fd) {
            let res = self.ops.pwrite(fd, buf, offset);
            self.sink.line(
                DiagLevel::Debug,
                false,
                &format!("pwrite64({fd}, {count}, {offset}) => {res}"),
            );
            return Ok(res);
        }
        let absolute = to_absolute(&self.window, offset).map_err(|e| self.fail(e))?;
        let res = self.ops.pwrite(fd, buf, offset_to_i64(absolute));
        self.sink.line(
            DiagLevel::Debug,
            true,
            &format!("pwrite64({fd}, {count}, {offset}) => {res}"),
        );
        Ok(res)
    }

    /// Size override for a status query by path: `Some(length)` when the
    /// path matches the target, `None` for pass-through.
    #[must_use]
    pub fn stat_size(&self, path: &CStr) -> Option<u64> {
        self.window
            .matches_path(path)
            .then(|| self.window.length())
    }

    /// Size override for a status query by descriptor.
    #[must_use]
    pub fn fstat_size(&self, fd: RawFd) -> Option<u64> {
        self.is_tracked(fd).then(|| self.window.length())
    }

    fn lock_registry(&self) -> MutexGuard<'_, FdRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, err: InterceptError) -> InterceptError {
        self.sink
            .line(DiagLevel::Error, true, &format!("porthole: {err}"));
        if err.is_fatal() {
            tracing::error!(error = %err, "fatal interception failure");
        } else {
            tracing::debug!(error = %err, "rejected out-of-window access");
        }
        err
    }
}

fn offset_to_i64(abs: u64) -> i64 {
    // Window construction keeps base + length within the i64 domain.
    i64::try_from(abs).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use nix::errno::Errno;

    use super::*;
    use crate::window::Verbosity;

    const BASE: u64 = 44_040_192;
    const LENGTH: u64 = 33_554_944;

    /// Recording in-memory stand-in for the real libc entry points.
    #[derive(Default)]
    struct FakeOps {
        next_fd: Cell<RawFd>,
        fail_open: Cell<bool>,
        close_result: Cell<c_int>,
        seek_skew: Cell<i64>,
        opens: RefCell<Vec<(String, c_int, Option<mode_t>)>>,
        seeks: RefCell<Vec<(RawFd, i64, c_int)>>,
        allocs: RefCell<Vec<(RawFd, c_int, i64, i64)>>,
        reads: RefCell<Vec<(RawFd, usize, i64)>>,
        writes: RefCell<Vec<(RawFd, Vec<u8>, i64)>>,
    }

    impl FakeOps {
        fn new() -> Self {
            let ops = Self::default();
            ops.next_fd.set(3);
            ops
        }
    }

    impl FileOps for FakeOps {
        fn open(&self, path: &CStr, flags: c_int, mode: Option<mode_t>, _kind: OpenKind) -> c_int {
            self.opens.borrow_mut().push((
                path.to_string_lossy().into_owned(),
                flags,
                mode,
            ));
            if self.fail_open.get() {
                return -1;
            }
            let fd = self.next_fd.get();
            self.next_fd.set(fd + 1);
            fd
        }

        fn close(&self, _fd: c_int) -> c_int {
            self.close_result.get()
        }

        fn seek(&self, fd: c_int, offset: i64, whence: c_int, _kind: SeekKind) -> i64 {
            self.seeks.borrow_mut().push((fd, offset, whence));
            offset + self.seek_skew.get()
        }

        fn allocate(&self, fd: c_int, mode: c_int, offset: i64, len: i64) -> c_int {
            self.allocs.borrow_mut().push((fd, mode, offset, len));
            0
        }

        fn pread(&self, fd: c_int, buf: &mut [u8], offset: i64) -> isize {
            self.reads.borrow_mut().push((fd, buf.len(), offset));
            buf.fill(0xab);
            isize::try_from(buf.len()).unwrap()
        }

        fn pwrite(&self, fd: c_int, buf: &[u8], offset: i64) -> isize {
            self.writes.borrow_mut().push((fd, buf.to_vec(), offset));
            isize::try_from(buf.len()).unwrap()
        }
    }

    fn interceptor() -> Interceptor<FakeOps> {
        let window = Window::new("disk.img", BASE, LENGTH, Verbosity::Quiet).unwrap();
        Interceptor::new(window, DiagSink::new(Verbosity::Quiet), FakeOps::new())
    }

    fn open_target(ctx: &Interceptor<FakeOps>) -> RawFd {
        ctx.open(c"disk.img", libc::O_RDWR, None, OpenKind::Open)
            .unwrap()
    }

    #[test]
    fn test_open_target_registers_descriptor() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        assert!(ctx.is_tracked(fd));
    }

    #[test]
    fn test_open_other_path_is_pass_through() {
        let ctx = interceptor();
        let fd = ctx
            .open(c"/etc/mtab", libc::O_RDONLY, None, OpenKind::Open)
            .unwrap();
        assert!(!ctx.is_tracked(fd));
    }

    #[test]
    fn test_failed_open_of_target_is_not_registered() {
        let ctx = interceptor();
        ctx.ops().fail_open.set(true);
        let res = ctx
            .open(c"disk.img", libc::O_RDWR, None, OpenKind::Open)
            .unwrap();
        assert_eq!(res, -1);
        assert!(ctx.lock_registry().is_empty());
    }

    #[test]
    fn test_open_forwards_creation_mode() {
        let ctx = interceptor();
        ctx.open(c"disk.img", libc::O_RDWR | libc::O_CREAT, Some(0o644), OpenKind::Open64)
            .unwrap();
        assert_eq!(
            ctx.ops().opens.borrow()[0],
            (
                "disk.img".to_string(),
                libc::O_RDWR | libc::O_CREAT,
                Some(0o644)
            )
        );
    }

    #[test]
    fn test_close_unregisters_even_when_real_close_fails() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        ctx.ops().close_result.set(-1);
        assert_eq!(ctx.close(fd).unwrap(), -1);
        assert!(!ctx.is_tracked(fd));
    }

    #[test]
    fn test_close_of_untracked_descriptor_leaves_registry_alone() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        assert_eq!(ctx.close(fd + 1).unwrap(), 0);
        assert!(ctx.is_tracked(fd));
    }

    #[test]
    fn test_seventeenth_tracked_open_is_fatal() {
        let ctx = interceptor();
        for _ in 0..16 {
            open_target(&ctx);
        }
        let err = ctx
            .open(c"disk.img", libc::O_RDWR, None, OpenKind::Open)
            .unwrap_err();
        assert_eq!(err, InterceptError::RegistryFull { capacity: 16 });
        assert!(err.is_fatal());
    }

    #[test]
    fn test_seek_translates_and_reports_relative_position() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        assert_eq!(ctx.seek(fd, 0, SEEK_SET, SeekKind::Seek64).unwrap(), 0);
        let (seek_fd, absolute, whence) = ctx.ops().seeks.borrow()[0];
        assert_eq!(seek_fd, fd);
        assert_eq!(absolute, i64::try_from(BASE).unwrap());
        assert_eq!(whence, SEEK_SET);
    }

    #[test]
    fn test_seek_to_window_boundary_is_valid() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        let rel = i64::try_from(LENGTH).unwrap();
        assert_eq!(ctx.seek(fd, rel, SEEK_SET, SeekKind::Seek).unwrap(), rel);
    }

    #[test]
    fn test_seek_past_window_is_rejected_without_moving() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        let err = ctx
            .seek(fd, i64::try_from(LENGTH).unwrap() + 1, SEEK_SET, SeekKind::Seek64)
            .unwrap_err();
        assert_eq!(err.errno(), Errno::EINVAL);
        assert!(!err.is_fatal());
        // The real seek was never issued.
        assert!(ctx.ops().seeks.borrow().is_empty());
    }

    #[test]
    fn test_seek_with_negative_offset_is_rejected() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        assert!(matches!(
            ctx.seek(fd, -8, SEEK_SET, SeekKind::Seek),
            Err(InterceptError::OutOfWindow { offset: -8, .. })
        ));
    }

    #[test]
    fn test_seek_with_other_origin_is_fatal_for_tracked_descriptor() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        let err = ctx.seek(fd, 0, libc::SEEK_CUR, SeekKind::Seek).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, InterceptError::UnsupportedWhence { .. }));
    }

    #[test]
    fn test_seek_on_untracked_descriptor_passes_any_origin_through() {
        let ctx = interceptor();
        assert_eq!(
            ctx.seek(9, 123, libc::SEEK_END, SeekKind::Seek).unwrap(),
            123
        );
        assert_eq!(ctx.ops().seeks.borrow()[0], (9, 123, libc::SEEK_END));
    }

    #[test]
    fn test_short_seek_surfaces_as_io_error() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        ctx.ops().seek_skew.set(-512);
        let err = ctx.seek(fd, 4096, SEEK_SET, SeekKind::Seek64).unwrap_err();
        assert!(matches!(err, InterceptError::SeekMismatch { .. }));
        assert_eq!(err.errno(), Errno::EINVAL);
    }

    #[test]
    fn test_pwrite_translates_offset_but_not_count() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        let data = [7u8; 512];
        assert_eq!(ctx.pwrite(fd, &data, 8192).unwrap(), 512);
        let (write_fd, written, absolute) = ctx.ops().writes.borrow()[0].clone();
        assert_eq!(write_fd, fd);
        assert_eq!(written.len(), 512);
        assert_eq!(absolute, i64::try_from(BASE + 8192).unwrap());
    }

    #[test]
    fn test_pwrite_at_exact_window_end_is_forwarded() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        let rel = i64::try_from(LENGTH).unwrap();
        ctx.pwrite(fd, &[1, 2, 3], rel).unwrap();
        let (_, _, absolute) = ctx.ops().writes.borrow()[0].clone();
        assert_eq!(absolute, i64::try_from(BASE + LENGTH).unwrap());
    }

    #[test]
    fn test_pwrite_past_window_is_rejected() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        let err = ctx
            .pwrite(fd, &[0u8; 16], i64::try_from(LENGTH).unwrap() + 1)
            .unwrap_err();
        assert_eq!(err.errno(), Errno::EINVAL);
        assert!(ctx.ops().writes.borrow().is_empty());
    }

    #[test]
    fn test_pread_translates_offset() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        let mut buf = [0u8; 64];
        assert_eq!(ctx.pread(fd, &mut buf, 0).unwrap(), 64);
        assert_eq!(
            ctx.ops().reads.borrow()[0],
            (fd, 64, i64::try_from(BASE).unwrap())
        );
        assert_eq!(buf[0], 0xab);
    }

    #[test]
    fn test_pread_on_untracked_descriptor_keeps_raw_offset() {
        let ctx = interceptor();
        let mut buf = [0u8; 8];
        ctx.pread(11, &mut buf, 4096).unwrap();
        assert_eq!(ctx.ops().reads.borrow()[0], (11, 8, 4096));
    }

    #[test]
    fn test_allocate_out_of_window_reports_no_space() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        let err = ctx
            .allocate(fd, 0, i64::try_from(LENGTH).unwrap() + 1, 512)
            .unwrap_err();
        assert_eq!(err.errno(), Errno::ENOSPC);
        assert!(!err.is_fatal());
        assert!(ctx.ops().allocs.borrow().is_empty());
    }

    #[test]
    fn test_allocate_translates_offset_and_keeps_length() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        ctx.allocate(fd, 0, 1024, 2048).unwrap();
        assert_eq!(
            ctx.ops().allocs.borrow()[0],
            (fd, 0, i64::try_from(BASE + 1024).unwrap(), 2048)
        );
    }

    #[test]
    fn test_stat_size_overrides_only_the_target() {
        let ctx = interceptor();
        assert_eq!(ctx.stat_size(c"disk.img"), Some(LENGTH));
        assert_eq!(ctx.stat_size(c"other.img"), None);
    }

    #[test]
    fn test_fstat_size_overrides_only_tracked_descriptors() {
        let ctx = interceptor();
        let fd = open_target(&ctx);
        assert_eq!(ctx.fstat_size(fd), Some(LENGTH));
        assert_eq!(ctx.fstat_size(fd + 1), None);
        ctx.close(fd).unwrap();
        assert_eq!(ctx.fstat_size(fd), None);
    }
}
