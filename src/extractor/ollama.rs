use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::consts::{DEFAULT_OLLAMA_MODEL, DEFAULT_OLLAMA_URL};

use super::{Extractor, encode_base64, parse_receipt_json};

const USER_INSTRUCTION: &str = "Extract the data from this receipt image.";

/// Extractor backed by a vision model on a local Ollama server.
/// Nothing leaves the machine.
pub struct OllamaExtractor {
    client: reqwest::Client,
    base_url: String,
    model: String,
    prompt: String,
}

impl OllamaExtractor {
    pub fn new(base_url: Option<String>, model: Option<String>, prompt: String) -> Self {
        let base_url = base_url.unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string()),
            prompt,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn build_request<'a>(&'a self, image: &[u8]) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            stream: false,
            format: "json",
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.prompt,
                    images: None,
                },
                ChatMessage {
                    role: "user",
                    content: USER_INSTRUCTION,
                    images: Some(vec![encode_base64(image)]),
                },
            ],
        }
    }
}

#[async_trait]
impl Extractor for OllamaExtractor {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn extract(&self, image: &[u8]) -> Result<Value> {
        let body = self.build_request(image);

        let resp = self
            .client
            .post(self.chat_url())
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Ollama request to {} failed", self.base_url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Ollama error ({}): {}", status, text);
        }

        let chat: ChatResponse = resp.json().await?;
        if chat.message.content.trim().is_empty() {
            bail!("Ollama returned empty response");
        }
        parse_receipt_json(&chat.message.content)
    }
}

// --- API types ---

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    stream: bool,
    format: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}
