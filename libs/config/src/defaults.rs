//! Default values and constants
//!
//! Used as serde defaults by [`crate::RuntimeConfig`] and directly by code
//! that runs without a loaded configuration (tests, embedded nodes).

/// Queue defaults
pub mod queue {
    /// Configured queue length; physical ring size is one more
    pub const DEFAULT_QUEUE_LENGTH: usize = 4;
}

/// Scheduler defaults
pub mod scheduler {
    /// Soft budget for firing one actor repeatedly (milliseconds)
    pub const FIRE_BUDGET_MS: u64 = 20;

    /// Idle time before the watchdog forces a strategy pass (seconds)
    pub const WATCHDOG_SECS: u64 = 60;

    /// Period of the tunnel sweep maintenance task (seconds)
    pub const MAINTENANCE_SECS: u64 = 30;
}

/// Tunnel endpoint flow control defaults
pub mod tunnel {
    /// First backoff after a NACK (milliseconds)
    pub const BACKOFF_INITIAL_MS: u64 = 100;

    /// Backoff ceiling (milliseconds)
    pub const BACKOFF_MAX_MS: u64 = 1_000;

    /// Inbound frame channel capacity per node
    pub const INBOX_CAPACITY: usize = 1_024;

    /// Tunnel type used for token traffic
    pub const TOKEN_TUNNEL_TYPE: &str = "token";
}

/// Connection handshake retry budgets
pub mod connection {
    /// Retries after a GONE reply (tunnel id changed underneath)
    pub const GONE_RETRIES: u32 = 3;

    /// Retries after NOT_FOUND / BAD_REQUEST / GATEWAY_TIMEOUT (relocate the peer)
    pub const RELOCATE_RETRIES: u32 = 2;

    /// Unanswered requests fail with GATEWAY_TIMEOUT after this (milliseconds)
    pub const REPLY_TIMEOUT_MS: u64 = 10_000;
}

/// Migration defaults
pub mod migration {
    /// Last-resort deadline for draining a node (seconds)
    pub const TIMEOUT_SECS: u64 = 30;
}
