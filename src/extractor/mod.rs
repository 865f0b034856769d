pub mod mock;
pub mod ollama;
pub mod together;

use anyhow::{Result, bail};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

/// Turns receipt image bytes into structured JSON. Could be a hosted
/// vision model, a local one, or a test script.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Extract the receipt. The returned value is always a JSON object.
    async fn extract(&self, image: &[u8]) -> Result<Value>;
}

/// Parse a model reply into a JSON object.
///
/// Models wrap their output in markdown fences or chat around it despite
/// being told not to, so both are tolerated.
pub fn parse_receipt_json(text: &str) -> Result<Value> {
    let json_str = extract_json(text);
    let value: Value = serde_json::from_str(json_str).map_err(|e| {
        anyhow::anyhow!("failed to parse model response as JSON: {}\nraw: {}", e, text)
    })?;
    if !value.is_object() {
        bail!("model response is JSON but not an object: {}", text);
    }
    Ok(value)
}

/// Extract JSON from text that may be wrapped in markdown code fences
/// or surrounded by prose.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();

    if let Some(after) = trimmed.strip_prefix("```json")
        && let Some(json) = after.strip_suffix("```")
    {
        return json.trim();
    }
    if let Some(after) = trimmed.strip_prefix("```")
        && let Some(json) = after.strip_suffix("```")
    {
        return json.trim();
    }

    // Fall back to the outermost object.
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
    {
        return &trimmed[start..=end];
    }

    trimmed
}

/// Best-effort MIME type from the leading magic bytes. Defaults to JPEG,
/// the format receipts are most often photographed in.
pub fn sniff_mime(image: &[u8]) -> &'static str {
    match image {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/jpeg",
    }
}

pub fn encode_base64(image: &[u8]) -> String {
    STANDARD.encode(image)
}

/// `data:` URL carrying the image inline.
pub fn data_url(image: &[u8]) -> String {
    format!("data:{};base64,{}", sniff_mime(image), encode_base64(image))
}
