use std::time::Duration;

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`). Streamed response
    /// bodies are not subject to it.
    pub request_timeout_secs: u64,
    /// Time allowed for background tasks to stop on shutdown (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// Generation workers run inside the API process (default: `0`).
    pub embedded_workers: usize,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `3000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`| `30`                       |
    /// | `EMBEDDED_WORKERS`     | `0`                        |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let shutdown_timeout_secs: u64 = std::env::var("SHUTDOWN_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("SHUTDOWN_TIMEOUT_SECS must be a valid u64");

        let embedded_workers: usize = std::env::var("EMBEDDED_WORKERS")
            .unwrap_or_else(|_| "0".into())
            .parse()
            .expect("EMBEDDED_WORKERS must be a valid usize");

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
            embedded_workers,
        }
    }
}

/// Shortest allowed heartbeat interval.
pub const MIN_HEARTBEAT: Duration = Duration::from_secs(15);

/// Longest allowed heartbeat interval.
pub const MAX_HEARTBEAT: Duration = Duration::from_secs(30);

/// Stream relay timing, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Heartbeat frame period, kept within 15–30 s (default: `20s`).
    pub heartbeat_interval: Duration,
    /// Progress log poll period (default: `1s`).
    pub poll_interval: Duration,
    /// A write that cannot complete this long after the previous
    /// successful write aborts the connection (default: `60s`).
    pub loss_timeout: Duration,
    /// With no progress frame for this long the relay gives up (default: `600s`).
    pub stall_timeout: Duration,
    /// Log entries read per poll (default: `500`).
    pub batch_limit: i64,
    /// Frames buffered between the relay and the response body (default: `32`).
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            poll_interval: Duration::from_secs(1),
            loss_timeout: Duration::from_secs(60),
            stall_timeout: Duration::from_secs(600),
            batch_limit: 500,
            channel_capacity: 32,
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default |
    /// |--------------------------|---------|
    /// | `RELAY_HEARTBEAT_SECS`   | `20`    |
    /// | `RELAY_POLL_INTERVAL_MS` | `1000`  |
    /// | `RELAY_LOSS_TIMEOUT_SECS`| `60`    |
    /// | `RELAY_STALL_TIMEOUT_SECS` | `600` |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let heartbeat_secs: u64 = std::env::var("RELAY_HEARTBEAT_SECS")
            .unwrap_or_else(|_| "20".into())
            .parse()
            .expect("RELAY_HEARTBEAT_SECS must be a valid u64");

        let poll_interval_ms: u64 = std::env::var("RELAY_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".into())
            .parse()
            .expect("RELAY_POLL_INTERVAL_MS must be a valid u64");

        let loss_timeout_secs: u64 = std::env::var("RELAY_LOSS_TIMEOUT_SECS")
            .unwrap_or_else(|_| "60".into())
            .parse()
            .expect("RELAY_LOSS_TIMEOUT_SECS must be a valid u64");

        let stall_timeout_secs: u64 = std::env::var("RELAY_STALL_TIMEOUT_SECS")
            .unwrap_or_else(|_| "600".into())
            .parse()
            .expect("RELAY_STALL_TIMEOUT_SECS must be a valid u64");

        Self {
            heartbeat_interval: clamp_heartbeat(Duration::from_secs(heartbeat_secs)),
            poll_interval: Duration::from_millis(poll_interval_ms.max(50)),
            loss_timeout: Duration::from_secs(loss_timeout_secs.max(1)),
            stall_timeout: Duration::from_secs(stall_timeout_secs.max(1)),
            ..defaults
        }
    }
}

/// Keep a heartbeat interval within [`MIN_HEARTBEAT`]..=[`MAX_HEARTBEAT`].
pub fn clamp_heartbeat(interval: Duration) -> Duration {
    interval.clamp(MIN_HEARTBEAT, MAX_HEARTBEAT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_clamped() {
        assert_eq!(clamp_heartbeat(Duration::from_secs(5)), MIN_HEARTBEAT);
        assert_eq!(clamp_heartbeat(Duration::from_secs(20)), Duration::from_secs(20));
        assert_eq!(clamp_heartbeat(Duration::from_secs(90)), MAX_HEARTBEAT);
    }
}
