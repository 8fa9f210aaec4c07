//! Language-model boundary.
//!
//! Providers are a closed set dispatched through [`build_model`]; everything
//! downstream holds an `Arc<dyn LanguageModel>` and a [`ModelRef`] naming
//! what produced an output. Token usage and integer micro-USD cost come back
//! with every generation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod http;

pub use http::{AnthropicModel, OpenAiCompatibleModel};

/// Closed provider set. Adding a provider means adding a variant and a
/// branch in [`build_model`] — there is no string-tag dispatch at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAiCompatible,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAiCompatible => "openai_compatible",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "openai_compatible" => Ok(ProviderKind::OpenAiCompatible),
            "anthropic" => Ok(ProviderKind::Anthropic),
            other => Err(ModelError::Config(format!(
                "unknown model provider '{other}'"
            ))),
        }
    }
}

/// Stable identifier of a model: `{provider, model_id, revision}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: ProviderKind,
    pub model_id: String,
    pub revision: Option<String>,
}

/// Integer micro-USD prices per 1000 tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pricing {
    pub in_per_1k_microusd: i64,
    pub out_per_1k_microusd: i64,
}

impl Pricing {
    pub fn cost_microusd(&self, tokens_in: i64, tokens_out: i64) -> i64 {
        (tokens_in * self.in_per_1k_microusd + tokens_out * self.out_per_1k_microusd) / 1000
    }
}

/// Everything needed to construct a provider client.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub model_ref: ModelRef,
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub max_output_tokens: u32,
    pub thinking_enabled: bool,
    pub thinking_budget: Option<u32>,
    pub pricing: Pricing,
}

/// One generation request: instruction prompt plus the document to work on.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub input_text: String,
}

/// A completed generation with usage counters.
#[derive(Debug, Clone)]
pub struct Generation {
    pub output_text: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_microusd: i64,
}

/// Errors from a provider call, pre-classified for the retry policy.
#[derive(Debug)]
pub enum ModelError {
    /// Network or transport failure, including the request deadline.
    Transport(String),
    /// Non-success HTTP status from the provider.
    Http { status: u16, message: String },
    /// Response payload could not be decoded (permanent).
    Decode(String),
    /// Invalid settings (unknown provider, empty prompt) — permanent.
    Config(String),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Transport(_) => true,
            ModelError::Http { status, .. } => *status == 429 || *status >= 500,
            ModelError::Decode(_) | ModelError::Config(_) => false,
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Transport(msg) => write!(f, "model transport error: {msg}"),
            ModelError::Http { status, message } => {
                write!(f, "model http error status={status}: {message}")
            }
            ModelError::Decode(msg) => write!(f, "model decode error: {msg}"),
            ModelError::Config(msg) => write!(f, "model config error: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}

/// Text-in/text-out provider contract.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_ref(&self) -> &ModelRef;

    async fn generate(&self, req: &GenerateRequest) -> Result<Generation, ModelError>;
}

/// The provider dispatch table.
pub fn build_model(settings: ModelSettings) -> Arc<dyn LanguageModel> {
    match settings.model_ref.provider {
        ProviderKind::OpenAiCompatible => Arc::new(OpenAiCompatibleModel::new(settings)),
        ProviderKind::Anthropic => Arc::new(AnthropicModel::new(settings)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_round_trips() {
        for kind in [ProviderKind::OpenAiCompatible, ProviderKind::Anthropic] {
            assert_eq!(ProviderKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(ProviderKind::parse("bedrock").is_err());
    }

    #[test]
    fn pricing_is_integer_microusd() {
        let p = Pricing {
            in_per_1k_microusd: 150,
            out_per_1k_microusd: 600,
        };
        // 2000 in + 500 out → 300 + 300 µUSD
        assert_eq!(p.cost_microusd(2000, 500), 600);
        assert_eq!(p.cost_microusd(0, 0), 0);
    }

    #[test]
    fn transient_classification() {
        assert!(ModelError::Transport("timeout".into()).is_transient());
        assert!(ModelError::Http {
            status: 429,
            message: String::new()
        }
        .is_transient());
        assert!(ModelError::Http {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!ModelError::Http {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(!ModelError::Decode("bad json".into()).is_transient());
    }
}
