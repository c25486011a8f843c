use std::time::Duration;

use crawlq_core::AppError;

/// Configuration for the database connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Connection attempts before giving up.
    pub connect_attempts: u32,
    /// Pause between connection attempts.
    pub connect_retry_delay: Duration,
    /// How long one attempt waits for a connection.
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            connect_attempts: 3,
            connect_retry_delay: Duration::from_secs(2),
            acquire_timeout: Duration::from_secs(30),
        }
    }

    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 5)
    /// - `DATABASE_CONNECT_ATTEMPTS` (optional, defaults to 3)
    pub fn from_env() -> Result<Self, AppError> {
        let url = std::env::var("DATABASE_URL").map_err(|_| {
            AppError::ConfigError("DATABASE_URL not set. Required for store and queue.".into())
        })?;

        let mut config = Self::new(url);
        if let Some(max) = positive_env("DATABASE_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(attempts) = positive_env("DATABASE_CONNECT_ATTEMPTS")? {
            config.connect_attempts = attempts;
        }
        Ok(config)
    }

    pub fn with_connect_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.connect_retry_delay = delay;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Configuration for the Postgres-backed message queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    /// How long a consumer may hold a message before it becomes claimable again.
    pub lease: Duration,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Deliveries buffered ahead of the workers.
    pub prefetch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "parser_queue".to_string(),
            lease: Duration::from_secs(600),
            poll_interval: Duration::from_millis(500),
            prefetch: 3,
        }
    }
}

impl QueueConfig {
    /// Read configuration from environment variables.
    ///
    /// - `CRAWLQ_QUEUE` (defaults to `parser_queue`)
    /// - `CRAWLQ_QUEUE_LEASE_SECS` (defaults to 600)
    /// - `CRAWLQ_QUEUE_POLL_MS` (defaults to 500)
    /// - `CRAWLQ_QUEUE_PREFETCH` (defaults to 3)
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        Ok(Self {
            name: std::env::var("CRAWLQ_QUEUE").unwrap_or(defaults.name),
            lease: positive_env("CRAWLQ_QUEUE_LEASE_SECS")?
                .map_or(defaults.lease, |s| Duration::from_secs(u64::from(s))),
            poll_interval: positive_env("CRAWLQ_QUEUE_POLL_MS")?
                .map_or(defaults.poll_interval, |ms| Duration::from_millis(u64::from(ms))),
            prefetch: positive_env("CRAWLQ_QUEUE_PREFETCH")?
                .map_or(defaults.prefetch, |n| n as usize),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }
}

fn positive_env(key: &str) -> Result<Option<u32>, AppError> {
    let Ok(raw) = std::env::var(key) else {
        return Ok(None);
    };
    let parsed: u32 = raw.parse().map_err(|_| {
        AppError::ConfigError(format!("Invalid {key} '{raw}': must be a positive integer"))
    })?;
    if parsed == 0 {
        return Err(AppError::ConfigError(format!("{key} must be at least 1")));
    }
    Ok(Some(parsed))
}
