//! Gemini `generateContent` client used by the analysis, script and prompt stages.

use crate::api::LanguageModel;
use crate::config::Config;
use crate::error::{GenResult, GenerationError};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

pub struct GeminiClient {
    client: Client,
    api_base: String,
    text_model: String,
    vision_model: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    Inline { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateResponse {
    fn first_text(&self) -> Option<String> {
        let text: String = self
            .candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        if text.trim().is_empty() { None } else { Some(text) }
    }
}

pub fn image_mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

impl GeminiClient {
    pub fn new(client: Client, cfg: &Config, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            text_model: cfg.text_model.clone(),
            vision_model: cfg.vision_model.clone(),
            api_key: api_key.into(),
        }
    }

    async fn generate(&self, model: &str, parts: Vec<Part>) -> GenResult<String> {
        let url = format!("{}/models/{}:generateContent", self.api_base, model);
        let body = GenerateRequest {
            contents: vec![Content { parts }],
        };

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = raw.chars().take(400).collect();
            return Err(GenerationError::backend(format!(
                "Gemini HTTP {}: {}",
                status.as_u16(),
                snippet
            )));
        }

        let parsed: GenerateResponse = serde_json::from_str(&raw)
            .map_err(|e| GenerationError::backend(format!("Gemini response parse failed: {}", e)))?;
        let text = parsed
            .first_text()
            .ok_or_else(|| GenerationError::backend("Gemini returned no text"))?;
        debug!("{} replied with {} chars", model, text.len());
        Ok(text)
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn generate_text(&self, prompt: &str) -> GenResult<String> {
        let parts = vec![Part::Text {
            text: prompt.to_string(),
        }];
        self.generate(&self.text_model, parts).await
    }

    async fn describe_image(&self, image: &Path, instruction: &str) -> GenResult<String> {
        let bytes = tokio::fs::read(image).await.map_err(|e| {
            GenerationError::input(format!("cannot read image {}: {}", image.display(), e))
        })?;
        let parts = vec![
            Part::Inline {
                inline_data: InlineData {
                    mime_type: image_mime_type(image).to_string(),
                    data: STANDARD.encode(bytes),
                },
            },
            Part::Text {
                text: instruction.to_string(),
            },
        ];
        self.generate(&self.vision_model, parts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_shape_matches_rest_api() {
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::Inline {
                        inline_data: InlineData {
                            mime_type: "image/png".into(),
                            data: "AAAA".into(),
                        },
                    },
                    Part::Text { text: "describe".into() },
                ],
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["inline_data"]["mime_type"], "image/png");
        assert_eq!(json["contents"][0]["parts"][1]["text"], "describe");
    }

    #[test]
    fn joins_text_parts_of_first_candidate() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"{\"a\":"},{"text":"1}"}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.first_text().as_deref(), Some("{\"a\":1}"));

        let empty: GenerateResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(empty.first_text().is_none());
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(image_mime_type(Path::new("a.PNG")), "image/png");
        assert_eq!(image_mime_type(Path::new("b.jpg")), "image/jpeg");
        assert_eq!(image_mime_type(Path::new("noext")), "image/jpeg");
    }
}
