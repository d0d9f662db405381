//! Process-wide configuration (§9 "global tunables belong in one immutable
//! config struct constructed at process start from environment variables
//! with clamped defaults"). Read once; tests inject [`Config::test_default`]
//! rather than mutating the environment, mirroring the teacher's pattern of
//! constructing `AppState` directly in unit tests.

use std::path::PathBuf;
use std::time::Duration;

use orgx_graph::BudgetConstants;

fn env_duration_ms(key: &str, default_ms: u64, min_ms: u64, max_ms: u64) -> Duration {
    let ms = std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|v| v.clamp(min_ms, max_ms))
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

fn default_state_dir() -> PathBuf {
    dirs_home()
        .join(".config")
        .join("useorgx")
        .join("openclaw-plugin")
}

fn default_transcripts_dir() -> PathBuf {
    dirs_home().join(".openclaw").join("agents")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub tick_interval: Duration,
    pub hook_token: Option<String>,
    pub api_token: Option<String>,
    pub state_dir: PathBuf,
    pub transcripts_dir: PathBuf,
    pub sse_keepalive: Duration,
    pub sse_staleness_sweep: Duration,
    pub sse_idle_timeout: Duration,
    pub runtime_stale_horizon: Duration,
    pub command_timeout: Duration,
    pub request_body_timeout: Duration,
    pub request_body_max_bytes: usize,
    pub budget: BudgetConstants,
    pub auto_continue_default_hours: f64,
    pub auto_continue_token_budget: Option<u64>,
    pub activity_summary_model: Option<String>,
}

impl Config {
    /// Reads every `ORGX_*` override once, the way the teacher's
    /// `ConfigStore` resolves its layers at startup rather than per request.
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            tick_interval: env_duration_ms("ORGX_TICK_INTERVAL_MS", 2500, 500, 30_000),
            hook_token: non_empty("ORGX_HOOK_TOKEN"),
            api_token: non_empty("ORGX_API_TOKEN"),
            state_dir: non_empty("ORGX_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_state_dir),
            transcripts_dir: default_transcripts_dir(),
            sse_keepalive: env_duration_ms("ORGX_SSE_KEEPALIVE_MS", 20_000, 5_000, 120_000),
            sse_staleness_sweep: Duration::from_secs(15),
            sse_idle_timeout: Duration::from_secs(60),
            runtime_stale_horizon: env_duration_ms("ORGX_RUNTIME_STALE_MS", 90_000, 1_000, 3_600_000),
            command_timeout: env_duration_ms("ORGX_COMMAND_TIMEOUT_MS", 8_000, 5_000, 10_000),
            request_body_timeout: Duration::from_secs(2),
            request_body_max_bytes: 1024 * 1024,
            budget: BudgetConstants::from_env(),
            auto_continue_default_hours: std::env::var("ORGX_AUTO_CONTINUE_BUDGET_HOURS")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(4.0),
            auto_continue_token_budget: std::env::var("ORGX_AUTO_CONTINUE_TOKEN_BUDGET")
                .ok()
                .and_then(|v| v.parse::<u64>().ok()),
            activity_summary_model: non_empty("ORGX_ACTIVITY_SUMMARY_MODEL"),
        }
    }

    #[cfg(test)]
    pub fn test_default(state_dir: PathBuf, transcripts_dir: PathBuf) -> Self {
        Self {
            tick_interval: Duration::from_millis(2500),
            hook_token: Some("test-hook-token".to_string()),
            api_token: None,
            state_dir,
            transcripts_dir,
            sse_keepalive: Duration::from_secs(20),
            sse_staleness_sweep: Duration::from_secs(15),
            sse_idle_timeout: Duration::from_secs(60),
            runtime_stale_horizon: Duration::from_millis(90_000),
            command_timeout: Duration::from_secs(8),
            request_body_timeout: Duration::from_secs(2),
            request_body_max_bytes: 1024 * 1024,
            budget: BudgetConstants::test_default(),
            auto_continue_default_hours: 4.0,
            auto_continue_token_budget: None,
            activity_summary_model: None,
        }
    }
}
