use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::ImageDelivery;
use crate::consts::DEFAULT_TOGETHER_MODEL;

use super::{Extractor, data_url, parse_receipt_json, sniff_mime};

const API_URL: &str = "https://api.together.xyz/v1/chat/completions";
const TMPFILES_UPLOAD_URL: &str = "https://tmpfiles.org/api/v1/upload";
const MAX_TOKENS: u32 = 4096;

/// Extractor backed by a hosted vision model on Together's
/// OpenAI-compatible chat completions API.
pub struct TogetherExtractor {
    client: reqwest::Client,
    api_key: String,
    model: String,
    prompt: String,
    delivery: ImageDelivery,
}

impl TogetherExtractor {
    pub fn new(
        api_key: String,
        model: Option<String>,
        prompt: String,
        delivery: ImageDelivery,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_TOGETHER_MODEL.to_string()),
            prompt,
            delivery,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Resolve the URL the model will fetch the image from.
    async fn image_url(&self, image: &[u8]) -> Result<String> {
        match self.delivery {
            ImageDelivery::Inline => Ok(data_url(image)),
            ImageDelivery::Tmpfiles => self.upload_to_tmpfiles(image).await,
        }
    }

    async fn upload_to_tmpfiles(&self, image: &[u8]) -> Result<String> {
        let mime = sniff_mime(image);
        let extension = mime.trim_start_matches("image/");
        let part = reqwest::multipart::Part::bytes(image.to_vec())
            .file_name(format!("receipt.{extension}"))
            .mime_str(mime)?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(TMPFILES_UPLOAD_URL)
            .multipart(form)
            .send()
            .await
            .context("failed to upload image to tmpfiles.org")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("tmpfiles.org upload failed ({}): {}", status, text);
        }

        let upload: TmpfilesResponse = resp
            .json()
            .await
            .context("unexpected tmpfiles.org response")?;
        let url = direct_download_url(&upload.data.url);
        tracing::debug!(%url, "image uploaded to tmpfiles.org");
        Ok(url)
    }

    fn build_request<'a>(&'a self, image_url: &str) -> ApiRequest<'a> {
        ApiRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            messages: vec![
                json!({"role": "system", "content": self.prompt}),
                json!({
                    "role": "user",
                    "content": [
                        {"type": "image_url", "image_url": {"url": image_url}}
                    ]
                }),
            ],
        }
    }

    fn response_text(api_resp: ApiResponse) -> Result<String> {
        let text = api_resp
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        if text.trim().is_empty() {
            bail!("Together API returned empty response");
        }
        Ok(text)
    }
}

#[async_trait]
impl Extractor for TogetherExtractor {
    fn name(&self) -> &str {
        "together"
    }

    async fn extract(&self, image: &[u8]) -> Result<Value> {
        let image_url = self.image_url(image).await?;
        let body = self.build_request(&image_url);

        let resp = self
            .client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Together API request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Together API error ({}): {}", status, text);
        }

        let api_resp: ApiResponse = resp.json().await?;
        if let Some(usage) = &api_resp.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "extraction token usage"
            );
        }

        let text = Self::response_text(api_resp)?;
        parse_receipt_json(&text)
    }
}

/// tmpfiles.org hands back a viewer page; the raw file lives under `/dl/`.
pub fn direct_download_url(page_url: &str) -> String {
    if page_url.contains("tmpfiles.org/dl/") {
        return page_url.to_string();
    }
    page_url.replacen("tmpfiles.org/", "tmpfiles.org/dl/", 1)
}

// --- API types ---

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Value>,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct TmpfilesResponse {
    data: TmpfilesData,
}

#[derive(Deserialize)]
struct TmpfilesData {
    url: String,
}
