//! Error taxonomy shared by every subsystem in this crate.

use std::io;

/// Flat, per-subsystem failure taxonomy. Every public fallible operation in
/// this crate returns `CoreResult<T>` rather than a subsystem-local error
/// type, the way [`crate::storage`] and [`crate::appletalk`] would otherwise
/// each want their own.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Offset not block-aligned, bad block_count, unsupported address_bits,
    /// invalid NBP field, and similar caller mistakes.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown volume, missing catalog entry, unknown ROM checksum with a
    /// non-matching size.
    #[error("not found: {0}")]
    NotFound(String),

    /// NBP registry full, ATP slot table full, XO cache full.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// MMU walk yielded an invalid descriptor, or a supervisor-only /
    /// write-protected violation. The caller is expected to raise a guest
    /// exception in response.
    #[error("bus error: {0}")]
    BusError(String),

    /// Any host-side file operation failing after validation.
    #[error("I/O failure: {0}")]
    IoFailure(#[from] io::Error),

    /// AFP version/UAM rejected, unsupported ASP function, unexpected
    /// checkpoint stream version.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
}

impl CoreError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn capacity_exhausted(msg: impl Into<String>) -> Self {
        Self::CapacityExhausted(msg.into())
    }

    pub fn bus_error(msg: impl Into<String>) -> Self {
        Self::BusError(msg.into())
    }

    pub fn protocol_mismatch(msg: impl Into<String>) -> Self {
        Self::ProtocolMismatch(msg.into())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
