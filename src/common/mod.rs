// # Common Types
//
// Shared identifiers and constants used across all LatticeDB modules.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// Unique identifier for transactions. The WAL frame allots four bytes; the
/// allocator wraps back to 1 on overflow.
pub type TransactionId = u32;

/// Unique identifier for pages in the data file. Page 0 is the catalog header.
pub type PageId = u32;

/// Unique identifier for tables in the catalog.
pub type TableOid = u32;

/// Unique identifier for indexes in the catalog.
pub type IndexOid = u32;

/// Slot number within a page.
pub type SlotId = u16;

/// Log sequence number: the byte offset of a record's frame in the WAL.
pub type Lsn = u64;

/// Position in the global commit sequence; the `TX n` of temporal reads.
pub type CommitSeq = u64;

// ============================================================================
// Constants
// ============================================================================

/// Fixed page size for all disk I/O.
pub const PAGE_SIZE: usize = 4096;

/// Sentinel for "no page" in page chain pointers.
pub const INVALID_PAGE_ID: PageId = u32::MAX;

/// Sentinel LSN meaning "no log record".
pub const INVALID_LSN: Lsn = 0;

/// Default number of buffer pool frames.
pub const DEFAULT_POOL_SIZE: usize = 1024;

/// Size of the in-memory WAL buffer before a forced flush.
pub const WAL_BUFFER_SIZE: usize = 1024 * 1024;

// ============================================================================
// Record Identifier
// ============================================================================

/// Physical record identifier: page plus slot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: SlotId,
}

impl Rid {
    pub fn new(page_id: PageId, slot: SlotId) -> Self {
        Self { page_id, slot }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rid_ordering() {
        let a = Rid::new(1, 5);
        let b = Rid::new(2, 0);
        assert!(a < b);
        assert_eq!(format!("{}", a), "(1, 5)");
    }
}
