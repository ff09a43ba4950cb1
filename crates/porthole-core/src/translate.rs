//! Pure coordinate translation between window-relative and absolute offsets.

use crate::error::{InterceptError, InterceptResult};
use crate::window::Window;

/// Map a window-relative offset into the target file's coordinate space.
///
/// Valid iff `0 <= rel <= length`. The window boundary itself is
/// addressable so that an access ending exactly at the window end can start
/// there; anything past it is rejected, never wrapped.
///
/// # Errors
///
/// Returns [`InterceptError::OutOfWindow`] for negative offsets and offsets
/// past the window length.
pub fn to_absolute(window: &Window, rel: i64) -> InterceptResult<u64> {
    let length = window.length();
    match u64::try_from(rel) {
        // Cannot wrap: base + length fits in the offset domain by construction.
        Ok(rel) if rel <= length => Ok(window.base().saturating_add(rel)),
        _ => Err(InterceptError::OutOfWindow {
            offset: rel,
            length,
        }),
    }
}

/// Inverse translation, applied to successful seek results.
#[must_use]
pub fn from_absolute(window: &Window, abs: u64) -> u64 {
    abs.saturating_sub(window.base())
}
