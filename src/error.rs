//! Central error handling for the cinder3d driver.
//!
//! Provides a unified `DriverError` enum with consistent categorization plus
//! the per-device `ErrorSink` that latches the first error message while
//! logging every subsequent one.

use std::sync::Mutex;

/// Centralized error type for all driver operations
#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("platform discovery failed: {0}")]
    PlatformDiscovery(String),

    #[error("no compute devices found")]
    NoDevicesFound,

    #[error("driver version too low: {0}")]
    VersionTooLow(String),

    #[error("context creation failed: {0}")]
    ContextCreation(String),

    #[error("buffer allocation failed: {0}")]
    BufferAllocation(String),

    #[error("kernel launch failed: {0}")]
    KernelLaunch(String),

    #[error("cached kernel binary load failed: {0}")]
    BinaryLoadFailed(String),

    #[error("kernel source compile failed: {0}")]
    SourceCompileFailed(String),

    #[error("kernel binary save failed: {0}")]
    BinarySaveFailed(String),

    #[error("memory transfer failed: {0}")]
    MemoryTransfer(String),

    #[error("device readback failed: {0}")]
    ReadbackFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Latches the first error message seen on a device instance.
///
/// Later errors are still logged but never overwrite the latched message,
/// so the caller that eventually polls the device sees the root cause.
#[derive(Debug, Default)]
pub struct ErrorSink {
    first: Mutex<Option<String>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error message; the first one wins.
    pub fn report(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("{message}");
        let mut slot = self.first.lock().unwrap();
        if slot.is_none() {
            *slot = Some(message);
        }
    }

    pub fn report_err(&self, err: &DriverError) {
        self.report(err.to_string());
    }

    /// The latched first error, if any.
    pub fn first(&self) -> Option<String> {
        self.first.lock().unwrap().clone()
    }

    pub fn has_error(&self) -> bool {
        self.first.lock().unwrap().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_is_latched() {
        let sink = ErrorSink::new();
        assert!(!sink.has_error());

        sink.report("first failure");
        sink.report("second failure");

        assert_eq!(sink.first().as_deref(), Some("first failure"));
    }

    #[test]
    fn report_err_formats_variant() {
        let sink = ErrorSink::new();
        sink.report_err(&DriverError::NoDevicesFound);
        assert_eq!(sink.first().as_deref(), Some("no compute devices found"));
    }
}
