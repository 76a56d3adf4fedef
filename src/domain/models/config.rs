use serde::{Deserialize, Serialize};

use super::deployment::Deployment;

/// Main configuration structure for Foreman
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Process-wide request quota applied before provider calls
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Ledger write retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Token governance
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Deployment pool and outer call loop
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Liveness monitoring
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Checkpoint storage
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Completion provider
    #[serde(default)]
    pub completion: CompletionConfig,

    /// Workspace indexed by the architect
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// GitHub ticketing and source control
    #[serde(default)]
    pub github: GithubConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".foreman/foreman.db".to_string()
}

const fn default_max_connections() -> u32 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation for file output: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// Number of days to retain logs
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
            retention_days: default_retention_days(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitConfig {
    /// Whether the quota is applied at all
    #[serde(default)]
    pub enabled: bool,

    /// Requests per second allowed
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    /// Burst size for token bucket
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

const fn default_requests_per_second() -> u32 {
    10
}

const fn default_burst_size() -> u32 {
    20
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

/// Retry policy for ledger writes that hit datastore contention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Give up once this much time has been spent retrying
    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
}

const fn default_max_retries() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    50
}

const fn default_max_backoff_ms() -> u64 {
    2_000
}

const fn default_max_elapsed_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_elapsed_ms: default_max_elapsed_ms(),
        }
    }
}

/// Token governance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GovernorConfig {
    /// Per-step prompt ceiling
    #[serde(default = "default_max_prompt_tokens")]
    pub max_prompt_tokens: usize,

    /// Tokens kept free between prompt plus output and the context window
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: usize,

    /// Absolute cap on requested output tokens
    #[serde(default = "default_hard_output_cap")]
    pub hard_output_cap: usize,

    /// Output tokens requested when a caller does not say
    #[serde(default = "default_max_output_tokens")]
    pub default_max_output_tokens: usize,

    /// Tokens kept from the start of a shrunk section on the first attempt
    #[serde(default = "default_shrink_head_tokens")]
    pub shrink_head_tokens: usize,

    /// Tokens kept from the end of a shrunk section on the first attempt
    #[serde(default = "default_shrink_tail_tokens")]
    pub shrink_tail_tokens: usize,

    #[serde(default = "default_max_shrink_attempts")]
    pub max_shrink_attempts: u32,

    /// Total tokens a single step may spend across its calls
    #[serde(default = "default_step_token_budget")]
    pub step_token_budget: usize,
}

const fn default_max_prompt_tokens() -> usize {
    24_000
}

const fn default_safety_buffer() -> usize {
    512
}

const fn default_hard_output_cap() -> usize {
    4_096
}

const fn default_max_output_tokens() -> usize {
    2_048
}

const fn default_shrink_head_tokens() -> usize {
    1_024
}

const fn default_shrink_tail_tokens() -> usize {
    512
}

const fn default_max_shrink_attempts() -> u32 {
    2
}

const fn default_step_token_budget() -> usize {
    100_000
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_prompt_tokens: default_max_prompt_tokens(),
            safety_buffer: default_safety_buffer(),
            hard_output_cap: default_hard_output_cap(),
            default_max_output_tokens: default_max_output_tokens(),
            shrink_head_tokens: default_shrink_head_tokens(),
            shrink_tail_tokens: default_shrink_tail_tokens(),
            max_shrink_attempts: default_max_shrink_attempts(),
            step_token_budget: default_step_token_budget(),
        }
    }
}

/// Deployment pool and outer call loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DispatcherConfig {
    #[serde(default = "default_deployments")]
    pub deployments: Vec<Deployment>,

    /// Attempts per logical completion call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Throttle window used when the provider gives no retry-after
    #[serde(default = "default_retry_after_secs")]
    pub default_retry_after_secs: u64,

    /// Pause before retrying a transient provider failure
    #[serde(default = "default_transient_backoff_ms")]
    pub transient_backoff_ms: u64,
}

fn default_deployments() -> Vec<Deployment> {
    vec![Deployment::new("default", 16_384)]
}

const fn default_max_attempts() -> u32 {
    6
}

const fn default_retry_after_secs() -> u64 {
    60
}

const fn default_transient_backoff_ms() -> u64 {
    500
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            deployments: default_deployments(),
            max_attempts: default_max_attempts(),
            default_retry_after_secs: default_retry_after_secs(),
            transient_backoff_ms: default_transient_backoff_ms(),
        }
    }
}

/// Liveness monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,

    /// Silence after which a running run is considered dead
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_audit_interval_secs")]
    pub audit_interval_secs: u64,
}

const fn default_heartbeat_interval_secs() -> u64 {
    30
}

const fn default_heartbeat_timeout_secs() -> u64 {
    300
}

const fn default_audit_interval_secs() -> u64 {
    60
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            timeout_secs: default_heartbeat_timeout_secs(),
            audit_interval_secs: default_audit_interval_secs(),
        }
    }
}

/// Checkpoint storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub dir: String,
}

fn default_checkpoint_dir() -> String {
    ".foreman/checkpoints".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
        }
    }
}

/// Completion provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CompletionConfig {
    /// `openai` for an OpenAI-compatible HTTP endpoint, `scripted` for canned replies
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Per-call timeout in seconds
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

const fn default_completion_timeout_secs() -> u64 {
    120
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_completion_timeout_secs(),
        }
    }
}

/// Workspace indexed by the architect
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub root: Option<String>,
}

/// GitHub ticketing and source control
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GithubConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub repo: String,

    #[serde(default = "default_base_branch")]
    pub base_branch: String,

    /// Environment variable holding the token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_github_api")]
    pub api_base_url: String,
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            owner: String::new(),
            repo: String::new(),
            base_branch: default_base_branch(),
            token_env: default_token_env(),
            api_base_url: default_github_api(),
        }
    }
}
