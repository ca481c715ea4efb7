//! # Manager Configuration
//!
//! Resolved settings for one `ConnectionManager`. Binaries build this from
//! their layered config; tests shorten the timings freely.

use std::time::Duration;

/// Reconnect delays indexed by `min(reconnect_attempt, len - 1)`.
pub const DEFAULT_BACKOFF: [Duration; 5] = [
    Duration::from_millis(1_000),
    Duration::from_millis(2_000),
    Duration::from_millis(5_000),
    Duration::from_millis(10_000),
    Duration::from_millis(30_000),
];

/// Configuration for the job notification connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// REST base, e.g. `https://mechanic-setu.onrender.com/api`.
    pub api_base_url: String,
    /// Path of the one-time token endpoint, relative to `api_base_url`.
    pub token_path: String,
    /// Socket path, appended to the host derived from `api_base_url`.
    pub notification_path: String,
    pub heartbeat_interval: Duration,
    /// How long a single socket is kept before a planned reconnect.
    pub refresh_interval: Duration,
    /// Pause between the planned close and the next connect.
    pub refresh_delay: Duration,
    pub backoff: Vec<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://mechanic-setu.onrender.com/api".to_string(),
            token_path: "/core/ws-token/".to_string(),
            notification_path: "/ws/job_notifications/".to_string(),
            heartbeat_interval: Duration::from_secs(25),
            refresh_interval: Duration::from_secs(240),
            refresh_delay: Duration::from_millis(500),
            backoff: DEFAULT_BACKOFF.to_vec(),
        }
    }
}

impl ManagerConfig {
    /// Delay to apply before reconnect number `attempt` (0-indexed).
    ///
    /// Clamps to the last entry once the table is exhausted. An empty table
    /// falls back to the built-in schedule.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let table: &[Duration] = if self.backoff.is_empty() {
            &DEFAULT_BACKOFF
        } else {
            &self.backoff
        };
        let idx = (attempt as usize).min(table.len() - 1);
        table[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_table_then_clamps() {
        let cfg = ManagerConfig::default();
        let delays: Vec<u64> = (0..8)
            .map(|n| cfg.backoff_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 5000, 10000, 30000, 30000, 30000, 30000]
        );
    }

    #[test]
    fn empty_backoff_table_uses_builtin_schedule() {
        let cfg = ManagerConfig {
            backoff: Vec::new(),
            ..Default::default()
        };
        assert_eq!(cfg.backoff_delay(2), Duration::from_millis(5_000));
        assert_eq!(cfg.backoff_delay(u32::MAX), Duration::from_millis(30_000));
    }
}
