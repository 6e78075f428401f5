//! NexaOS Tiered Memory Simulator
//!
//! Simulates memory disaggregation for virtual machines: every guest page is
//! either in a bounded **local** pool or in an unbounded **remote** pool.
//! Faults admit pages into the local pool; a background swap-out worker per
//! domain keeps the number of free local pages at or above a watermark by
//! pushing victims to the remote pool.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               Domain                                 │
//! │                                                                      │
//! │   vCPU threads                             swap-out worker           │
//! │  ┌───────────────┐    wake (free < W)    ┌────────────────────────┐  │
//! │  │  on_fault()   │ ────────────────────▶ │ Swapper                │  │
//! │  │  admit/promote│                       │  select → reclaim →    │  │
//! │  └──────┬────────┘                       │  account               │  │
//! │         │                                └──┬──────────┬──────────┘  │
//! │         ▼                                   │          │             │
//! │  ┌──────────────┐   1. lock   ┌─────────────▼──┐   ┌───▼──────────┐  │
//! │  │  PageIndex   │ ◀────────── │ VictimSelector │   │  Reclaimer   │  │
//! │  │ (hash table) │             └────────────────┘   │ (primitive)  │  │
//! │  └──────┬───────┘                                  └──────────────┘  │
//! │         │ 2. lock                                                    │
//! │  ┌──────▼────────────────────────────┐                               │
//! │  │ FreePool  free / under_reclaim    │                               │
//! │  └───────────────────────────────────┘                               │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Locks are always taken index first, pool second.
//!
//! # Accounting
//!
//! At every quiescent point of a domain:
//!
//! ```text
//! local pages + free pages + pages under reclaim == total pages
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tiermem::{Domain, DomainConfig, SimulatedReclaimer};
//!
//! let domain = Domain::<u64>::with_config(
//!     DomainConfig::new(1024, 64),
//!     SimulatedReclaimer::new(None),
//! )?;
//! domain.on_fault(0x7000, 0x1_0007, 7, 1)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod index;
pub mod page;
pub mod pool;
pub mod reclaim;
pub mod selector;
pub mod stats;
pub mod swapper;
pub mod workload;

pub use config::DomainConfig;
pub use domain::{Domain, DomainId, FaultOutcome};
pub use error::{
    ConfigError, DomainError, FaultError, FaultResult, IndexError, InvariantViolation, RetryReason,
};
pub use index::{IndexTable, PageIndex};
pub use page::{Gfn, LruClass, MemTier, PageKey, PageRecord, Pfn};
pub use pool::{FreePool, FreePoolState};
pub use reclaim::{PageHandle, ReclaimBatch, ReclaimOutcome, Reclaimer, SimulatedReclaimer};
pub use selector::VictimSelector;
pub use stats::{DomainStats, DomainStatsSnapshot};
pub use swapper::{CycleOutcome, CycleReport, WorkerState};
pub use workload::{RetryPolicy, Workload, WorkloadReport};

/// Simulator version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
