use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

use crate::config::ProviderConfig;
use crate::providers::{build_http_client, ProviderError};
use crate::traits::GenerativeService;
use crate::types::{Citation, ContextKind, GenerationOutcome, GenerationRequest};

/// Chat-completions client for any OpenAI-compatible endpoint. Decodes the
/// response into the closed [`GenerationOutcome`] set exactly once, at this
/// boundary; callers never inspect raw provider JSON.
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl Drop for OpenAiCompatibleProvider {
    fn drop(&mut self) {
        self.api_key.zeroize();
    }
}

/// Validate the base URL for security.
/// - HTTPS is required for remote URLs to protect API keys in transit
/// - HTTP is allowed only for localhost/127.0.0.1 (local LLM servers)
fn validate_base_url(base_url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(base_url)
        .map_err(|e| format!("Invalid base_url '{}': {}", base_url, e))?;

    let scheme = parsed.scheme();
    let host = parsed.host_str().unwrap_or("");

    match scheme {
        "https" => Ok(()),
        "http" => {
            let is_localhost =
                host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1";

            if is_localhost {
                warn!(
                    "Using unencrypted HTTP for local LLM server at '{}'. \
                     API key will be transmitted in cleartext.",
                    base_url
                );
                Ok(())
            } else {
                Err(format!(
                    "HTTP is not allowed for remote URLs (base_url: '{}'). \
                     Use HTTPS to protect your API key in transit. \
                     HTTP is only permitted for localhost.",
                    base_url
                ))
            }
        }
        _ => Err(format!(
            "Unsupported URL scheme '{}' in base_url '{}'. Only http and https are allowed.",
            scheme, base_url
        )),
    }
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, String> {
        validate_base_url(&config.base_url)?;

        let client = build_http_client(Duration::from_secs(config.request_timeout_secs))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    fn build_messages(request: &GenerationRequest) -> Vec<Value> {
        let mut messages = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let (role, content) = match item.kind {
                ContextKind::Message => ("user", item.content.clone()),
                ContextKind::ToolResult => {
                    ("system", format!("[tool result]\n{}", item.content))
                }
                ContextKind::Memory => ("system", format!("[memory]\n{}", item.content)),
            };
            messages.push(json!({"role": role, "content": content}));
        }
        messages
    }

    fn parse_outcome(body: &Value) -> Result<GenerationOutcome, ProviderError> {
        let message = &body["choices"][0]["message"];
        if message.is_null() {
            return Err(ProviderError::malformed(format!(
                "response has no choices: {}",
                truncated(body)
            )));
        }

        if let Some(call) = message["tool_calls"].as_array().and_then(|c| c.first()) {
            let id = call["id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let name = call["function"]["name"]
                .as_str()
                .ok_or_else(|| ProviderError::malformed("tool call without a name"))?
                .to_string();
            let raw_args = call["function"]["arguments"].as_str().unwrap_or("{}");
            let arguments: Value = serde_json::from_str(raw_args).unwrap_or_else(|e| {
                debug!(error = %e, "Unparseable tool arguments; passing raw string");
                json!({ "raw": raw_args })
            });
            return Ok(GenerationOutcome::ToolRequest {
                id,
                name,
                arguments,
            });
        }

        let text = message["content"].as_str().unwrap_or("").to_string();
        let citations = message["citations"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| {
                        Some(Citation {
                            url: c["url"].as_str()?.to_string(),
                            title: c["title"].as_str().unwrap_or("").to_string(),
                            snippet: c["snippet"].as_str().unwrap_or("").to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(GenerationOutcome::Final { text, citations })
    }
}

// Cut on a char boundary: serialized bodies are often non-ASCII.
fn truncated(v: &Value) -> String {
    let s = v.to_string();
    match s.char_indices().nth(300) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s,
    }
}

#[async_trait]
impl GenerativeService for OpenAiCompatibleProvider {
    async fn invoke(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "messages": Self::build_messages(request),
            "max_tokens": request.max_tokens,
        });

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        let url = format!("{}/chat/completions", self.base_url);
        info!(
            model = %self.model,
            channel = %request.channel_id,
            tools = request.tools.len(),
            context_tokens = request.total_tokens(),
            "Calling generator"
        );

        let resp = match self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("HTTP request failed: {}", e);
                return Err(ProviderError::network(&e));
            }
        };

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), &text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::malformed(format!("undecodable response: {}", e)))?;
        Self::parse_outcome(&parsed)
    }
}
