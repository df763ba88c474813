use crate::error::GenResult;
use async_trait::async_trait;
use std::path::Path;

pub mod gemini;

pub use gemini::GeminiClient;

/// Text and vision calls the pipeline stages depend on.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate_text(&self, prompt: &str) -> GenResult<String>;

    /// Sends one image with an instruction and returns the model's reply.
    async fn describe_image(&self, image: &Path, instruction: &str) -> GenResult<String>;
}
