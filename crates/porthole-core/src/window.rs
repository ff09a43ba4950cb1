use std::ffi::CStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::WindowError;

/// Environment variable holding the window descriptor,
/// `path,offset,length[,mode]`.
pub const DESCRIPTOR_VAR: &str = "PORTHOLE_FILE";

/// How much interception traffic the diagnostic sink emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// Nothing at all.
    Quiet,
    /// Errors only.
    #[default]
    Errors,
    /// Every intercepted call, plus errors.
    Info,
    /// Every observed call, intercepted or not.
    Debug,
}

/// The byte range of the target file exposed as an independent file.
///
/// Built once at process start from the [`DESCRIPTOR_VAR`] descriptor and
/// immutable afterwards. Construction guarantees `length > 0` and that
/// `base + length` fits in the signed 64-bit file-offset domain, so
/// translated offsets can never wrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    path: PathBuf,
    base: u64,
    length: u64,
    verbosity: Verbosity,
}

impl Window {
    /// Create a window, validating the size invariants.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::EmptyWindow`] for a zero-length window and
    /// [`WindowError::Overflow`] when `base + length` exceeds what an
    /// `off64_t` can address.
    pub fn new(
        path: impl Into<PathBuf>,
        base: u64,
        length: u64,
        verbosity: Verbosity,
    ) -> Result<Self, WindowError> {
        if length == 0 {
            return Err(WindowError::EmptyWindow);
        }
        let end = base
            .checked_add(length)
            .ok_or(WindowError::Overflow { base, length })?;
        if end > i64::MAX.unsigned_abs() {
            return Err(WindowError::Overflow { base, length });
        }
        Ok(Self {
            path: path.into(),
            base,
            length,
            verbosity,
        })
    }

    /// Read and parse the descriptor from [`DESCRIPTOR_VAR`].
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::Missing`] when the variable is unset, or any
    /// parse error from the descriptor itself.
    pub fn from_env() -> Result<Self, WindowError> {
        std::env::var(DESCRIPTOR_VAR)
            .map_err(|_| WindowError::Missing(DESCRIPTOR_VAR))?
            .parse()
    }

    /// Path of the real target file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute offset of the window start in the target file.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Length of the window; also the size reported for the target file.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Configured diagnostic verbosity.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Exact byte comparison of a caller-supplied path against the target.
    #[must_use]
    pub fn matches_path(&self, path: &CStr) -> bool {
        self.path.as_os_str().as_bytes() == path.to_bytes()
    }
}

impl FromStr for Window {
    type Err = WindowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.splitn(4, ',');
        let path = match fields.next() {
            Some(p) if !p.is_empty() => p,
            _ => return Err(WindowError::MissingField("path")),
        };
        let base = parse_u64(fields.next(), "offset")?;
        let length = parse_u64(fields.next(), "length")?;
        let verbosity = match fields.next() {
            None => Verbosity::Errors,
            Some("q") => Verbosity::Quiet,
            Some("i") => Verbosity::Info,
            Some("d") => Verbosity::Debug,
            Some(other) => {
                tracing::warn!(mode = other, "unknown verbosity mode, using errors-only");
                Verbosity::Errors
            }
        };
        Self::new(path, base, length, verbosity)
    }
}

fn parse_u64(field: Option<&str>, name: &'static str) -> Result<u64, WindowError> {
    let raw = field.ok_or(WindowError::MissingField(name))?;
    raw.trim().parse().map_err(|_| WindowError::BadNumber {
        field: name,
        value: raw.to_string(),
    })
}
