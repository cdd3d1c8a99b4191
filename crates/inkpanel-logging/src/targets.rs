//! Tracing targets that get their own log file.

/// Image fetches and catalog discovery.
pub const T_NET: &str = "net";
/// Panel refreshes, sleep and wake.
pub const T_DISPLAY: &str = "display";
