//! Best-effort diagnostic sink.
//!
//! One line per intercepted call (or every observed call in debug mode),
//! written to stdout and optionally duplicated into a log file that is
//! flushed after every line. Write failures are swallowed: diagnostics must
//! never change the outcome of an intercepted operation.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::window::Verbosity;

/// Default name of the duplicate log file created by the preload shim.
pub const LOG_FILE_NAME: &str = "porthole.log";

/// Severity of a single diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagLevel {
    /// An interception failure worth reporting even at default verbosity.
    Error,
    /// Startup banner and similar one-off notices.
    Info,
    /// Per-call traces.
    Debug,
}

/// Line-oriented diagnostic sink.
#[derive(Debug)]
pub struct DiagSink {
    verbosity: Verbosity,
    log_file: Option<Mutex<File>>,
}

impl DiagSink {
    /// A sink writing to stdout only.
    #[must_use]
    pub const fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            log_file: None,
        }
    }

    /// A sink duplicating every emitted line into the file at `path`,
    /// created (truncating any previous run's log) immediately.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the log file cannot be created. Callers
    /// treat this as fatal when file logging is enabled.
    pub fn with_log_file(verbosity: Verbosity, path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            verbosity,
            log_file: Some(Mutex::new(file)),
        })
    }

    /// A sink duplicating lines into an already-open log file handle.
    ///
    /// The preload shim opens the file through the real `open` entry point
    /// to keep log creation out of its own interception path.
    #[must_use]
    pub fn with_log_handle(verbosity: Verbosity, file: File) -> Self {
        Self {
            verbosity,
            log_file: Some(Mutex::new(file)),
        }
    }

    /// Configured verbosity.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Whether a line at `level` would be emitted.
    ///
    /// At [`Verbosity::Info`] every intercepted call is logged regardless of
    /// level; at [`Verbosity::Debug`] everything is.
    #[must_use]
    pub fn enabled(&self, level: DiagLevel, intercepted: bool) -> bool {
        match self.verbosity {
            Verbosity::Quiet => false,
            Verbosity::Errors => level <= DiagLevel::Error,
            Verbosity::Info => intercepted || level <= DiagLevel::Error,
            Verbosity::Debug => true,
        }
    }

    /// Emit one line, best effort.
    pub fn line(&self, level: DiagLevel, intercepted: bool, text: &str) {
        if !self.enabled(level, intercepted) {
            return;
        }
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{text}");
        drop(stdout);
        if let Some(file) = &self.log_file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = writeln!(file, "{text}");
            let _ = file.flush();
        }
    }

    /// Flush the duplicate log file; used by the process-exit hook.
    pub fn flush(&self) {
        if let Some(file) = &self.log_file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_emits_nothing() {
        let sink = DiagSink::new(Verbosity::Quiet);
        assert!(!sink.enabled(DiagLevel::Error, true));
        assert!(!sink.enabled(DiagLevel::Debug, true));
    }

    #[test]
    fn test_errors_only_filters_traces() {
        let sink = DiagSink::new(Verbosity::Errors);
        assert!(sink.enabled(DiagLevel::Error, false));
        assert!(!sink.enabled(DiagLevel::Info, false));
        assert!(!sink.enabled(DiagLevel::Debug, true));
    }

    #[test]
    fn test_info_logs_every_intercepted_call() {
        let sink = DiagSink::new(Verbosity::Info);
        assert!(sink.enabled(DiagLevel::Debug, true));
        assert!(!sink.enabled(DiagLevel::Debug, false));
        assert!(sink.enabled(DiagLevel::Error, false));
    }

    #[test]
    fn test_debug_logs_everything() {
        let sink = DiagSink::new(Verbosity::Debug);
        assert!(sink.enabled(DiagLevel::Debug, false));
    }

    #[test]
    fn test_log_file_receives_lines_and_is_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);
        let sink = DiagSink::with_log_file(Verbosity::Debug, &path).unwrap();
        sink.line(DiagLevel::Debug, true, "lseek(3, 0, 0) => 0");
        sink.line(DiagLevel::Error, true, "lseek offset out of bounds");
        // Flushed per line, so the contents are visible without dropping.
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "lseek(3, 0, 0) => 0\nlseek offset out of bounds\n"
        );
    }

    #[test]
    fn test_suppressed_lines_do_not_reach_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);
        let sink = DiagSink::with_log_file(Verbosity::Info, &path).unwrap();
        sink.line(DiagLevel::Debug, false, "close(9) => 0");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.is_empty());
    }
}
