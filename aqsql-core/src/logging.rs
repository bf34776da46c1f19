use std::time::Duration;

/// Controls how loudly the driver narrates itself over `tracing`.
///
/// Mirrors the teacher's `LogSettings` (carried on `PgConnectOptions`):
/// statement execution is logged at `statements_level` unless it ran longer
/// than `slow_statements_duration`, in which case it's promoted to
/// `slow_statements_level` so slow queries stand out in a log stream
/// without needing a separate metrics pipeline.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub statements_level: tracing::Level,
    pub slow_statements_level: tracing::Level,
    pub slow_statements_duration: Duration,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            statements_level: tracing::Level::DEBUG,
            slow_statements_level: tracing::Level::WARN,
            slow_statements_duration: Duration::from_secs(1),
        }
    }
}

impl LogSettings {
    pub fn level_for(&self, elapsed: Duration) -> tracing::Level {
        if elapsed >= self.slow_statements_duration {
            self.slow_statements_level
        } else {
            self.statements_level
        }
    }
}
