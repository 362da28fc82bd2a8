//! # System Constants
//!
//! Defaults shared across the pipeline. Configuration values override most of
//! these at runtime; the rest are fixed parts of the wire and storage contract.

use std::time::Duration;

/// Suffix appended to the source topic name to derive the dead-letter topic
pub const DEAD_LETTER_TOPIC_SUFFIX: &str = "-dlq";

/// Attempt count recorded for messages dead-lettered by the consumer
pub const CONSUMER_DEAD_LETTER_ATTEMPTS: u32 = 1;

/// Exact length of an order identifier under the strict rule
pub const STRICT_ORDER_UID_LENGTH: usize = 32;

/// Email shape accepted for delivery recipients
pub const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";

pub mod cache {
    use super::Duration;

    /// Lifetime of a cached order
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

    /// Interval between eager sweeps of expired entries
    pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
}

pub mod timeouts {
    use super::Duration;

    /// Minimum budget for a single `ProcessOrder` call
    pub const PROCESS_ORDER: Duration = Duration::from_secs(10);

    /// Minimum budget for a store read on the `GetOrder` slow path
    pub const READ_ORDER: Duration = Duration::from_secs(5);

    /// Slack added on top of a store's reported retry budget to absorb timer
    /// and scheduling drift
    pub const STORE_BUDGET_GRACE: Duration = Duration::from_secs(1);

    /// How long shutdown waits for the consumer task to exit
    pub const CONSUMER_SHUTDOWN: Duration = Duration::from_secs(10);

    /// How long shutdown waits for the test-order producer task to exit
    pub const PRODUCER_SHUTDOWN: Duration = Duration::from_secs(5);

    /// Per-message delivery timeout for broker publishes
    pub const PUBLISH: Duration = Duration::from_secs(10);

    /// Pause after a failed broker fetch before polling again
    pub const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);
}

pub mod database {
    /// Migration ledger table
    pub const MIGRATIONS_TABLE: &str = "schema_migrations";

    /// `pg_advisory_xact_lock` key guarding the migration ledger
    pub const MIGRATIONS_LOCK_KEY: i64 = 0x6f72_6465_7273;

    /// Default connection pool size
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

    /// Concurrent item queries while loading every order at warm-up
    pub const ITEM_LOAD_CONCURRENCY: usize = 4;
}
