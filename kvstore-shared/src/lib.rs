/// Errors reported by a remote coordination store.
pub mod error;

/// The remote coordination store abstraction consumed by the client.
pub mod store;
