//! Gemini API client
//!
//! `KnowledgeSource` backed by Gemini `generateContent`. Open search maps to
//! the Google Search grounding tool.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::error::HedgeError;
use crate::knowledge::KnowledgeSource;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, error};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(180))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        })
    }

    /// `GEMINI_API_KEY` (required), `GEMINI_MODEL` and `GEMINI_BASE_URL` (optional)
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("GEMINI_API_KEY").map_err(|_| {
            HedgeError::ConfigError("GEMINI_API_KEY not configured".to_string())
        })?;

        let mut client = Self::new(api_key)?;
        if let Ok(model) = env::var("GEMINI_MODEL") {
            client = client.with_model(model);
        }
        if let Ok(base_url) = env::var("GEMINI_BASE_URL") {
            client = client.with_base_url(base_url);
        }
        Ok(client)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl KnowledgeSource for GeminiClient {
    async fn ask(
        &self,
        prompt: &str,
        instructions: &str,
        allow_open_search: bool,
        max_output_tokens: u32,
    ) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(HedgeError::ConfigError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let request = build_request(prompt, instructions, allow_open_search, max_output_tokens);

        debug!(
            model = %self.model,
            allow_open_search,
            max_output_tokens,
            prompt_len = prompt.len(),
            "Calling Gemini API"
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                HedgeError::TransportError(format!("Gemini API request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(HedgeError::TransportError(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            HedgeError::LlmError(format!("Gemini parse error: {}", e))
        })?;

        let answer = response_text(&gemini_response)?;

        debug!(
            answer_len = answer.len(),
            finish_reason = ?gemini_response.candidates.first().and_then(|c| c.finish_reason.as_deref()),
            "Gemini response received"
        );

        Ok(answer)
    }
}

fn build_request(
    prompt: &str,
    instructions: &str,
    allow_open_search: bool,
    max_output_tokens: u32,
) -> GeminiRequest {
    GeminiRequest {
        contents: vec![Content {
            parts: vec![Part {
                text: prompt.to_string(),
            }],
        }],
        generation_config: GenerationConfig {
            temperature: 0.3,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens,
        },
        system_instruction: SystemInstruction {
            parts: vec![Part {
                text: instructions.to_string(),
            }],
        },
        tools: if allow_open_search {
            vec![ToolSpec {
                google_search: GoogleSearch {},
            }]
        } else {
            Vec::new()
        },
    }
}

/// Grounded answers come back split over several parts; join them.
fn response_text(response: &GeminiResponse) -> Result<String> {
    let candidate = response
        .candidates
        .first()
        .ok_or_else(|| HedgeError::LlmError("No response from Gemini API".to_string()))?;

    let text: String = candidate
        .content
        .as_ref()
        .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(HedgeError::LlmError("Empty response from Gemini".to_string()));
    }

    Ok(text.trim().to_string())
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSpec>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct ToolSpec {
    google_search: GoogleSearch,
}

#[derive(Debug, Serialize)]
struct GoogleSearch {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}
