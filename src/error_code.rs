//! Server error codes the client interprets.
//!
//! Everything else coming back from the server is propagated verbatim; these
//! are the few codes that change control flow on the client side.

/// Duplicate key on INSERT; distinguishes "lock already held" in
/// [`SqlLockManager::acquire`](crate::lock::SqlLockManager::acquire).
pub const ER_DUP_ENTRY: u16 = 1062;

/// Unknown column in the field list. Surfaced as-is; never treated as a
/// connection problem.
pub const ER_BAD_FIELD_ERROR: u16 = 1054;

/// Returned when a cluster statement is sent to a node that is not an
/// aggregator. The routing pool takes it to mean the "cluster" is a single
/// box and collapses its view to the bootstrap node.
pub const ER_DISTRIBUTED_NOT_AGGREGATOR: u16 = 1705;
