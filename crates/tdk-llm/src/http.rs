//! Concrete HTTP providers.
//!
//! Both clients enforce the request deadline through the reqwest client
//! timeout and never log prompt or key material.

use serde::Deserialize;
use serde_json::json;

use crate::{GenerateRequest, Generation, LanguageModel, ModelError, ModelRef, ModelSettings};

fn build_client(settings: &ModelSettings) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(settings.timeout)
        .build()
        .expect("reqwest client build must not fail")
}

async fn read_error_body(resp: reqwest::Response) -> ModelError {
    let status = resp.status().as_u16();
    let message = resp.text().await.unwrap_or_default();
    ModelError::Http { status, message }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions
// ---------------------------------------------------------------------------

pub struct OpenAiCompatibleModel {
    settings: ModelSettings,
    http: reqwest::Client,
}

impl OpenAiCompatibleModel {
    pub fn new(settings: ModelSettings) -> Self {
        let http = build_client(&settings);
        OpenAiCompatibleModel { settings, http }
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<ChatChoice>,
    usage: ChatUsage,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: i64,
    completion_tokens: i64,
}

#[async_trait::async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    fn model_ref(&self) -> &ModelRef {
        &self.settings.model_ref
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<Generation, ModelError> {
        if req.prompt.trim().is_empty() {
            return Err(ModelError::Config("empty prompt".to_string()));
        }

        let body = json!({
            "model": self.settings.model_ref.model_id,
            "max_tokens": self.settings.max_output_tokens,
            "messages": [
                {"role": "system", "content": req.prompt},
                {"role": "user", "content": req.input_text},
            ],
        });

        let resp = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(read_error_body(resp).await);
        }

        let parsed: ChatCompletionsResponse = resp
            .json()
            .await
            .map_err(|e| ModelError::Decode(e.to_string()))?;
        let output_text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ModelError::Decode("response carried no choices".to_string()))?;

        Ok(Generation {
            output_text,
            tokens_in: parsed.usage.prompt_tokens,
            tokens_out: parsed.usage.completion_tokens,
            cost_microusd: self
                .settings
                .pricing
                .cost_microusd(parsed.usage.prompt_tokens, parsed.usage.completion_tokens),
        })
    }
}

// ---------------------------------------------------------------------------
// Anthropic messages
// ---------------------------------------------------------------------------

pub struct AnthropicModel {
    settings: ModelSettings,
    http: reqwest::Client,
}

impl AnthropicModel {
    pub fn new(settings: ModelSettings) -> Self {
        let http = build_client(&settings);
        AnthropicModel { settings, http }
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.settings.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: MessagesUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: i64,
    output_tokens: i64,
}

#[async_trait::async_trait]
impl LanguageModel for AnthropicModel {
    fn model_ref(&self) -> &ModelRef {
        &self.settings.model_ref
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<Generation, ModelError> {
        if req.prompt.trim().is_empty() {
            return Err(ModelError::Config("empty prompt".to_string()));
        }

        let mut body = json!({
            "model": self.settings.model_ref.model_id,
            "max_tokens": self.settings.max_output_tokens,
            "system": req.prompt,
            "messages": [
                {"role": "user", "content": req.input_text},
            ],
        });
        if self.settings.thinking_enabled {
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": self.settings.thinking_budget.unwrap_or(1024),
            });
        }

        let resp = self
            .http
            .post(self.messages_url())
            .header("x-api-key", &self.settings.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(read_error_body(resp).await);
        }

        let parsed: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| ModelError::Decode(e.to_string()))?;
        let output_text = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        if output_text.is_empty() {
            return Err(ModelError::Decode(
                "response carried no text blocks".to_string(),
            ));
        }

        Ok(Generation {
            output_text,
            tokens_in: parsed.usage.input_tokens,
            tokens_out: parsed.usage.output_tokens,
            cost_microusd: self
                .settings
                .pricing
                .cost_microusd(parsed.usage.input_tokens, parsed.usage.output_tokens),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests (mock HTTP server, no network)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Pricing, ProviderKind};
    use httpmock::prelude::*;
    use std::time::Duration;

    fn settings(provider: ProviderKind, base_url: String) -> ModelSettings {
        ModelSettings {
            model_ref: ModelRef {
                provider,
                model_id: "test-model".to_string(),
                revision: None,
            },
            base_url,
            api_key: "test-key".to_string(),
            timeout: Duration::from_secs(120),
            max_output_tokens: 512,
            thinking_enabled: false,
            thinking_budget: None,
            pricing: Pricing {
                in_per_1k_microusd: 1000,
                out_per_1k_microusd: 2000,
            },
        }
    }

    fn request() -> GenerateRequest {
        GenerateRequest {
            prompt: "Summarise the call.".to_string(),
            input_text: "Operator: good afternoon ...".to_string(),
        }
    }

    #[tokio::test]
    async fn openai_compatible_parses_output_and_usage() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer test-key");
                then.status(200).json_body(serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": "Solid quarter."}}],
                    "usage": {"prompt_tokens": 1000, "completion_tokens": 100}
                }));
            })
            .await;

        let model =
            OpenAiCompatibleModel::new(settings(ProviderKind::OpenAiCompatible, server.base_url()));
        let g = model.generate(&request()).await.unwrap();
        assert_eq!(g.output_text, "Solid quarter.");
        assert_eq!((g.tokens_in, g.tokens_out), (1000, 100));
        // 1000·1000/1000 + 100·2000/1000
        assert_eq!(g.cost_microusd, 1200);
    }

    #[tokio::test]
    async fn anthropic_parses_text_blocks() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/messages")
                    .header("x-api-key", "test-key");
                then.status(200).json_body(serde_json::json!({
                    "content": [
                        {"type": "thinking", "thinking": "..."},
                        {"type": "text", "text": "Margins expanded."}
                    ],
                    "usage": {"input_tokens": 500, "output_tokens": 50}
                }));
            })
            .await;

        let model = AnthropicModel::new(settings(ProviderKind::Anthropic, server.base_url()));
        let g = model.generate(&request()).await.unwrap();
        assert_eq!(g.output_text, "Margins expanded.");
        assert_eq!((g.tokens_in, g.tokens_out), (500, 50));
    }

    #[tokio::test]
    async fn provider_529_is_transient() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(529).body("overloaded");
            })
            .await;

        let model = AnthropicModel::new(settings(ProviderKind::Anthropic, server.base_url()));
        let err = model.generate(&request()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn empty_prompt_is_a_permanent_config_error() {
        let server = MockServer::start_async().await;
        let model =
            OpenAiCompatibleModel::new(settings(ProviderKind::OpenAiCompatible, server.base_url()));
        let err = model
            .generate(&GenerateRequest {
                prompt: "  ".to_string(),
                input_text: "body".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Config(_)));
        assert!(!err.is_transient());
    }
}
