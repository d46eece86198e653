// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for cache setup and allocator bookkeeping.

/// An error raised while building a [`Nap`](crate::Nap) or managing its persistent memory.
///
/// Cache operations (`put`, `get`, `del`) never return this type. Failures on those paths are
/// unrecoverable and abort the process after logging.
///
/// # Example
///
/// ```
/// use nap::Error;
///
/// let error = Error::from_message("pool directory is not writable");
/// assert!(error.to_string().contains("not writable"));
/// ```
#[ohno::error]
pub struct Error {}

impl Error {
    /// Creates a new error from any type that can be converted to an error.
    pub fn from_message(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(cause)
    }
}

/// A specialized [`Result`] type for cache setup operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Logs `reason` and aborts the process.
///
/// Used where the cache cannot continue without risking lost or torn data: livelocked reads and
/// persistent allocation failures.
#[cold]
pub(crate) fn fatal(reason: &str) -> ! {
    tracing::error!(reason, "nap cannot continue, aborting");
    std::process::abort()
}
