//! Byte-range window virtualization for one target file.
//!
//! porthole makes a contiguous window of a larger file behave like an
//! independent, whole file for unmodified filesystem tools (mke2fs, e2fsck,
//! populatefs and friends), so they can build or inspect a filesystem image
//! embedded inside a disk image without partition awareness. This crate is
//! the decision core: window configuration, descriptor tracking, offset
//! translation and the per-operation interception rules. The companion
//! `porthole-preload` crate binds it to the real glibc entry points via
//! `LD_PRELOAD` symbol interposition.
//!
//! # Example
//!
//! ```
//! use porthole_core::{translate, Window};
//!
//! let window: Window = "disk.img,44040192,33554944".parse().unwrap();
//! assert_eq!(translate::to_absolute(&window, 0).unwrap(), 44040192);
//! assert!(translate::to_absolute(&window, 33554945).is_err());
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

/// Best-effort diagnostic sink.
pub mod diag;
/// Error types, split into fatal and recoverable classes.
pub mod error;
/// The operation interceptor and its context object.
pub mod intercept;
/// The real-file-operations capability the interceptor delegates through.
pub mod ops;
/// Bounded registry of descriptors referencing the target file.
pub mod registry;
/// Window-relative to absolute offset translation.
pub mod translate;
/// Window configuration parsed once at process start.
pub mod window;

pub use diag::{DiagLevel, DiagSink, LOG_FILE_NAME};
pub use error::{InterceptError, InterceptResult, WindowError};
pub use intercept::Interceptor;
pub use ops::{FileOps, OpenKind, SeekKind};
pub use registry::FdRegistry;
pub use window::{DESCRIPTOR_VAR, Verbosity, Window};
