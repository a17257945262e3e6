/// Exponential delays with jitter, used for list and lease retries.
pub mod exponential;

/// Fixed delays, used for resubscribing a watch after a clean close.
pub mod fixed;
