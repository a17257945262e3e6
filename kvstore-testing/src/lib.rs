//! Testing utilities for the coordination client.

/// In-memory coordination store with revisions, leases, transactions, watches and error
/// injection.
pub mod simplekvstore;
