//! CLI and config handling.

use clap::{Args, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_FORK_ANCESTRY: u64 = 90_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_TARGET_RTT_MS: u64 = 1_000;
pub const DEFAULT_HEADER_CONT_CHECK_MS: u64 = 3_000;
pub const DEFAULT_BACKPRESSURE_CHECK_MS: u64 = 1_000;
pub const DEFAULT_STATE_SYNC_CHECK_MS: u64 = 1_000;
pub const DEFAULT_FETCH_CHECK_INTERVAL_MS: u64 = 100;
pub const DEFAULT_PEER_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RESULT_CACHE_LIMIT: u64 = 8_192;
pub const DEFAULT_PROGRESS_LOG_INTERVAL_SECS: u64 = 8;

/// Synchronisation strategy for a run.
#[derive(ValueEnum, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Replay every block from the common ancestor.
    #[default]
    Full,
    /// Download state at a pivot block, replay only the blocks above it.
    Snap,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Snap => "snap",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log output format.
#[derive(ValueEnum, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Downloader tuning knobs.
#[derive(Args, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    /// Deepest reorg (in blocks) accepted when locating the common ancestor.
    #[arg(long, default_value_t = DEFAULT_MAX_FORK_ANCESTRY)]
    pub max_fork_ancestry: u64,
    /// Per-request deadline; reservations older than this are revoked.
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    pub request_timeout_ms: u64,
    /// Round trip the adaptive reservation size aims for.
    #[arg(long, default_value_t = DEFAULT_TARGET_RTT_MS)]
    pub target_rtt_ms: u64,
    /// Delay before re-polling the anchor peer when no headers are ready.
    #[arg(long, default_value_t = DEFAULT_HEADER_CONT_CHECK_MS)]
    pub header_cont_check_ms: u64,
    /// Re-check interval while the header processor is throttled.
    #[arg(long, default_value_t = DEFAULT_BACKPRESSURE_CHECK_MS)]
    pub backpressure_check_ms: u64,
    /// How long to wait on pivot state before re-checking for pivot moves.
    #[arg(long, default_value_t = DEFAULT_STATE_SYNC_CHECK_MS)]
    pub state_sync_check_ms: u64,
    /// Fetcher housekeeping tick (timeouts, throttling).
    #[arg(long, default_value_t = DEFAULT_FETCH_CHECK_INTERVAL_MS)]
    pub fetch_check_interval_ms: u64,
    /// Consecutive request failures before a peer is dropped.
    #[arg(long, default_value_t = DEFAULT_PEER_FAILURE_THRESHOLD)]
    pub peer_failure_threshold: u32,
    /// Max blocks ahead of the import cursor that may be reserved.
    #[arg(long, default_value_t = DEFAULT_RESULT_CACHE_LIMIT)]
    pub result_cache_limit: u64,
    /// Interval between snap sync progress log lines.
    #[arg(long, default_value_t = DEFAULT_PROGRESS_LOG_INTERVAL_SECS)]
    pub progress_log_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_fork_ancestry: DEFAULT_MAX_FORK_ANCESTRY,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            target_rtt_ms: DEFAULT_TARGET_RTT_MS,
            header_cont_check_ms: DEFAULT_HEADER_CONT_CHECK_MS,
            backpressure_check_ms: DEFAULT_BACKPRESSURE_CHECK_MS,
            state_sync_check_ms: DEFAULT_STATE_SYNC_CHECK_MS,
            fetch_check_interval_ms: DEFAULT_FETCH_CHECK_INTERVAL_MS,
            peer_failure_threshold: DEFAULT_PEER_FAILURE_THRESHOLD,
            result_cache_limit: DEFAULT_RESULT_CACHE_LIMIT,
            progress_log_interval_secs: DEFAULT_PROGRESS_LOG_INTERVAL_SECS,
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn target_rtt(&self) -> Duration {
        Duration::from_millis(self.target_rtt_ms.max(1))
    }

    pub fn header_cont_check(&self) -> Duration {
        Duration::from_millis(self.header_cont_check_ms)
    }

    pub fn backpressure_check(&self) -> Duration {
        Duration::from_millis(self.backpressure_check_ms.max(1))
    }

    pub fn state_sync_check(&self) -> Duration {
        Duration::from_millis(self.state_sync_check_ms.max(1))
    }

    pub fn fetch_check_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_check_interval_ms.max(1))
    }

    pub fn progress_log_interval(&self) -> Duration {
        Duration::from_secs(self.progress_log_interval_secs)
    }
}

/// Simulated sync run configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "chain-sync", about = "Chain synchroniser against simulated peers")]
pub struct NodeConfig {
    /// Sync strategy.
    #[arg(long, value_enum, default_value_t = SyncMode::Full)]
    pub mode: SyncMode,
    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
    /// Height of the simulated remote chain.
    #[arg(long, default_value_t = 2_000)]
    pub sim_remote_blocks: u64,
    /// Height of the local chain before syncing.
    #[arg(long, default_value_t = 0)]
    pub sim_local_blocks: u64,
    /// Block after which the local chain diverges from the remote one.
    #[arg(long)]
    pub sim_fork_at: Option<u64>,
    /// Number of simulated peers serving the remote chain.
    #[arg(long, default_value_t = 4)]
    pub sim_peers: usize,
    /// Artificial latency per simulated peer request.
    #[arg(long, default_value_t = 5)]
    pub sim_latency_ms: u64,
    /// Time the simulated state download takes per pivot root.
    #[arg(long, default_value_t = 500)]
    pub sim_state_delay_ms: u64,
    #[command(flatten)]
    pub sync: SyncConfig,
}

impl NodeConfig {
    /// Parse configuration from CLI args.
    pub fn from_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_match_config_default() {
        let config = NodeConfig::parse_from(["chain-sync"]);
        assert_eq!(config.sync, SyncConfig::default());
        assert_eq!(config.mode, SyncMode::Full);
        assert_eq!(config.verbosity, 0);
    }

    #[test]
    fn parses_snap_mode_and_overrides() {
        let config = NodeConfig::parse_from([
            "chain-sync",
            "--mode",
            "snap",
            "-vv",
            "--max-fork-ancestry",
            "128",
            "--sim-fork-at",
            "40",
        ]);
        assert_eq!(config.mode, SyncMode::Snap);
        assert_eq!(config.verbosity, 2);
        assert_eq!(config.sync.max_fork_ancestry, 128);
        assert_eq!(config.sim_fork_at, Some(40));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = SyncConfig {
            header_cont_check_ms: 10,
            ..SyncConfig::default()
        };
        let json = serde_json::to_string(&config).expect("serialize");
        let decoded: SyncConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, config);
    }
}
