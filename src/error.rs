//! Error types for allocation and submission failures.
//!
//! Allocators in this crate return explicit failure values, never partial
//! successes. Transient exhaustion is handled internally (coalescing, and in
//! the heap pool a last-resort device stall); everything that reaches the
//! caller is either a hard capacity failure or a lost device.

use crate::resource::HeapUsage;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The heap has no sufficient contiguous free run, even after coalescing
    /// and a forced device-idle wait. A capacity-planning failure.
    #[error(
        "heap exhausted: {requested_blocks} contiguous blocks requested, \
         {free_blocks} of {total_blocks} free after stall"
    )]
    OutOfHeapMemory {
        requested_blocks: u32,
        free_blocks: u32,
        total_blocks: u32,
    },

    /// The fixed shader-visible descriptor table cannot satisfy the request.
    /// The table size is chosen at startup; callers must size generously.
    #[error("descriptor table exhausted: {requested} slots requested from a table of {table_size}")]
    DescriptorTableExhausted { requested: u32, table_size: u32 },

    /// The staging ring could not be resized to fit a reservation. Staging is
    /// mandatory for all uploads, so this is fatal.
    #[error("staging ring exhausted: {requested} bytes requested, capacity {capacity}")]
    StagingExhausted { requested: u64, capacity: u64 },

    /// The resource description is not allowed in the target heap's category.
    #[error("resource usage {requested:?} not permitted by heap usage {allowed:?}")]
    UsageMismatch {
        requested: HeapUsage,
        allowed: HeapUsage,
    },

    /// A handle referred to a slot that was already released, or whose
    /// generation no longer matches.
    #[error("stale or invalid resource handle")]
    InvalidHandle,

    /// In-place recycling requires the new resource to occupy exactly the
    /// block run of the old one.
    #[error(
        "recycle size class mismatch: {requested_blocks} blocks requested \
         over a {available_blocks}-block range"
    )]
    RecycleMismatch {
        requested_blocks: u32,
        available_blocks: u32,
    },

    /// The device was removed. Not recoverable in-process; carries the
    /// removal reason and, when known, the label of the resource being
    /// processed at the time.
    #[error("device lost ({reason}){}", .label.as_deref().map(|l| format!(" while processing `{l}`")).unwrap_or_default())]
    DeviceLost {
        reason: String,
        label: Option<String>,
    },
}
