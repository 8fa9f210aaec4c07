//! Typed view over the merged config document.
//!
//! Every field has a default so a minimal YAML (database path + oracle base
//! URL) boots a working single-process pipeline. Durations are plain integer
//! seconds in config; conversion to `std::time::Duration` happens at the
//! consumer.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Directory for extracted transcript text, keyed by content hash.
    #[serde(default = "default_content_dir")]
    pub content_dir: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub research: ResearchConfig,
}

impl PipelineConfig {
    /// Deserialise from the merged config document.
    ///
    /// Unknown keys are ignored (extension sections for the UI layer live in
    /// the same files); missing sections take defaults.
    pub fn from_value(v: &Value) -> Result<Self> {
        serde_json::from_value(v.clone()).context("pipeline config deserialise failed")
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig::from_value(&Value::Object(Default::default()))
            .expect("empty config must produce defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Dispatch loop tick.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Max schedule rows claimed per tick.
    #[serde(default = "default_dispatch_batch")]
    pub dispatch_batch: i64,
    /// Schedule-row lease: the row stays invisible to the dispatcher from
    /// claim until the fetcher's completion update or lease expiry.
    #[serde(default = "default_schedule_lease_secs")]
    pub lease_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default())).unwrap()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    #[serde(default = "default_fetcher_workers")]
    pub workers: usize,
    #[serde(default = "default_oracle_base_url")]
    pub oracle_base_url: String,
    /// Process-wide oracle rate, requests per second.
    #[serde(default = "default_oracle_qps")]
    pub oracle_qps: f64,
    #[serde(default = "default_oracle_timeout_secs")]
    pub oracle_timeout_secs: u64,
    #[serde(default = "default_check_lease_secs")]
    pub queue_lease_secs: i64,
    #[serde(default = "default_check_max_attempts")]
    pub max_attempts: i64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default())).unwrap()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_workers")]
    pub workers: usize,
    #[serde(default = "default_analysis_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_analysis_lease_secs")]
    pub queue_lease_secs: i64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Prompt used when the equity belongs to no active group with a
    /// non-empty stock summary prompt.
    #[serde(default = "default_summary_prompt")]
    pub default_prompt: String,
    #[serde(default)]
    pub model: ModelConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default())).unwrap()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider tag — closed set, see `tdk-llm`. "openai_compatible" | "anthropic".
    #[serde(default = "default_model_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default = "default_model_base_url")]
    pub base_url: String,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default)]
    pub thinking_enabled: bool,
    #[serde(default)]
    pub thinking_budget: Option<u32>,
    /// Prices in integer micro-USD per 1000 tokens; cost accounting stays in
    /// integers all the way into the store.
    #[serde(default = "default_price_in")]
    pub price_in_microusd_per_1k: i64,
    #[serde(default = "default_price_out")]
    pub price_out_microusd_per_1k: i64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default())).unwrap()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "default_email_workers")]
    pub workers: usize,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub from_address: String,
    #[serde(default = "default_smtp_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_email_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_email_lease_secs")]
    pub lease_secs: i64,
    #[serde(default = "default_email_batch")]
    pub batch: i64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default())).unwrap()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    /// Reconciliation sweep period; the sweep re-evaluates fan-in for every
    /// active group so a lost member-ready signal cannot wedge a group.
    #[serde(default = "default_research_sweep_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_research_lease_secs")]
    pub queue_lease_secs: i64,
    #[serde(default = "default_research_max_attempts")]
    pub max_attempts: i64,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default())).unwrap()
    }
}

fn default_database_path() -> String {
    "data/transcriptdesk.db".to_string()
}
fn default_content_dir() -> String {
    "data/transcripts".to_string()
}
fn default_bind_addr() -> String {
    "127.0.0.1:8971".to_string()
}
fn default_shutdown_grace_secs() -> u64 {
    30
}
fn default_tick_interval_secs() -> u64 {
    1
}
fn default_dispatch_batch() -> i64 {
    16
}
fn default_schedule_lease_secs() -> i64 {
    600
}
fn default_fetcher_workers() -> usize {
    4
}
fn default_oracle_base_url() -> String {
    "https://transcripts.example.com".to_string()
}
fn default_oracle_qps() -> f64 {
    2.0
}
fn default_oracle_timeout_secs() -> u64 {
    15
}
fn default_check_lease_secs() -> i64 {
    120
}
fn default_check_max_attempts() -> i64 {
    5
}
fn default_analysis_workers() -> usize {
    2
}
fn default_analysis_max_attempts() -> i64 {
    6
}
fn default_analysis_lease_secs() -> i64 {
    300
}
fn default_download_timeout_secs() -> u64 {
    60
}
fn default_summary_prompt() -> String {
    "Summarise this earnings call transcript for a professional investor. \
     Cover results versus expectations, guidance, and management tone."
        .to_string()
}
fn default_model_provider() -> String {
    "openai_compatible".to_string()
}
fn default_model_id() -> String {
    "gpt-4o-mini".to_string()
}
fn default_model_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_model_timeout_secs() -> u64 {
    120
}
fn default_max_output_tokens() -> u32 {
    2048
}
fn default_price_in() -> i64 {
    150
}
fn default_price_out() -> i64 {
    600
}
fn default_email_workers() -> usize {
    2
}
fn default_smtp_port() -> u16 {
    587
}
fn default_smtp_timeout_secs() -> u64 {
    30
}
fn default_email_max_attempts() -> i64 {
    8
}
fn default_email_lease_secs() -> i64 {
    120
}
fn default_email_batch() -> i64 {
    16
}
fn default_research_sweep_secs() -> u64 {
    900
}
fn default_research_lease_secs() -> i64 {
    600
}
fn default_research_max_attempts() -> i64 {
    4
}
