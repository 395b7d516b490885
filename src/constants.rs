// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3030;
pub const DEFAULT_BASE_PATH: &str = "ws";

// Heartbeat sweep: a connection that misses one full cycle is evicted on the
// next, bounding ghost-connection lifetime to roughly two intervals.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

// Cluster membership lease. The refresh interval must stay well below the
// record TTL so a live process never lets its own records expire.
pub const DEFAULT_LEASE_TTL_SECS: u64 = 90;
pub const DEFAULT_LEASE_REFRESH_SECS: u64 = 30;

// Client reconnect defaults
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 3.0;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;
pub const DEFAULT_PONG_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_TOKEN_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TOKEN_RETRY_DELAY_MS: u64 = 1_000;
