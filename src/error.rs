//! Error types for the tiered memory simulator
//!
//! Errors fall into two classes:
//! - **Recoverable**: the fault path reports [`FaultError::Retry`] and the
//!   caller re-drives the fault later. Nothing was mutated.
//! - **Fatal**: an accounting invariant broke. The domain halts and every
//!   later fault reports [`FaultError::Fatal`] with the recorded violation.

use std::fmt;

/// Page index errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("entry {0} already tracked")]
    Duplicate(String),

    #[error("entry {0} not tracked")]
    NotFound(String),
}

/// Result type for page index operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Broken accounting invariant. Always fatal for the owning domain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("free pages underflow: free={free}, requested={requested}")]
    FreeUnderflow { free: u32, requested: u32 },

    #[error("free pages overflow: free={free} + {credit} exceeds total={total}")]
    FreeOverflow { free: u32, credit: u32, total: u32 },

    #[error("under-reclaim underflow: under_reclaim={under_reclaim}, settled={settled}")]
    UnderReclaimUnderflow { under_reclaim: u32, settled: u32 },

    #[error("reclaim primitive disagreement: reclaimed={reclaimed} + reactivated={reactivated} > batch={batch}")]
    PrimitiveDisagreement { reclaimed: u32, reactivated: u32, batch: u32 },
}

/// Why a fault must be re-driven by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryReason {
    /// Null page-table entry reference
    NullEntry,
    /// Snapshot saw zero free pages; the swapper was woken
    NoFreePages,
    /// Free pool drained between the snapshot and the reservation
    Exhausted,
    /// Domain has not been initialized yet
    NotInitialized,
}

impl RetryReason {
    pub const ALL: [RetryReason; 4] = [
        RetryReason::NullEntry,
        RetryReason::NoFreePages,
        RetryReason::Exhausted,
        RetryReason::NotInitialized,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::NullEntry => "null-entry",
            RetryReason::NoFreePages => "no-free-pages",
            RetryReason::Exhausted => "exhausted",
            RetryReason::NotInitialized => "not-initialized",
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fault path error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("retry fault ({0})")]
    Retry(RetryReason),

    #[error("domain halted: {0}")]
    Fatal(#[from] InvariantViolation),
}

impl FaultError {
    pub fn is_retry(&self) -> bool {
        matches!(self, FaultError::Retry(_))
    }

    pub fn retry_reason(&self) -> Option<RetryReason> {
        match self {
            FaultError::Retry(reason) => Some(*reason),
            FaultError::Fatal(_) => None,
        }
    }
}

/// Result type for the fault path
pub type FaultResult<T> = Result<T, FaultError>;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("configuration source error: {0}")]
    Source(#[from] config::ConfigError),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Domain lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn swapper thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("domain not initialized")]
    NotInitialized,
}

/// Result type for domain lifecycle operations
pub type DomainResult<T> = Result<T, DomainError>;
