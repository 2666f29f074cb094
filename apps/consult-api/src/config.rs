const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 41_250;
const MIN_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
const MAX_HEARTBEAT_INTERVAL_MS: u64 = 600_000;

/// Consult API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string for the consultation store.
    pub database_url: String,
    /// Maximum pooled database connections.
    pub database_pool_size: usize,
    /// Shared secret the platform's auth service presents when minting
    /// gateway tickets.
    pub ticket_issuer_secret: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Heartbeat interval sent to clients in READY (ms).
    pub heartbeat_interval_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_var("DATABASE_URL"),
            database_pool_size: parsed_var("DATABASE_POOL_SIZE", 20),
            ticket_issuer_secret: required_var("TICKET_ISSUER_SECRET"),
            port: parsed_var("PORT", 4003),
            heartbeat_interval_ms: heartbeat_interval(parsed_var(
                "HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            )),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| panic!("{name} env var is required"))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Clamp the heartbeat interval into a range the gateway timers can use.
fn heartbeat_interval(requested_ms: u64) -> u64 {
    let clamped = requested_ms.clamp(MIN_HEARTBEAT_INTERVAL_MS, MAX_HEARTBEAT_INTERVAL_MS);
    if clamped != requested_ms {
        tracing::warn!(requested_ms, clamped, "HEARTBEAT_INTERVAL_MS out of range; clamped");
    }
    clamped
}
