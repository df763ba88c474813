use crate::error::{GenResult, GenerationError};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "16:9")]
    Landscape,
    #[default]
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "1:1")]
    Square,
}

impl AspectRatio {
    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
            AspectRatio::Square => "1:1",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    PollingApi,
    Browser,
}

/// Secrets handed to the backend factory. Never logged.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    session_cookie: Option<String>,
}

impl Credentials {
    pub fn new(api_key: Option<String>, session_cookie: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            session_cookie: session_cookie.filter(|c| !c.trim().is_empty()),
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    pub fn session_cookie(&self) -> Option<&str> {
        self.session_cookie.as_deref().filter(|c| !c.trim().is_empty())
    }

    pub fn with_api_key_fallback(mut self, key: Option<String>) -> Self {
        if self.api_key().is_none() {
            self.api_key = key.filter(|k| !k.trim().is_empty());
        }
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |v: Option<&str>| if v.is_some() { "<redacted>" } else { "<none>" };
        f.debug_struct("Credentials")
            .field("api_key", &mask(self.api_key()))
            .field("session_cookie", &mask(self.session_cookie()))
            .finish()
    }
}

fn default_scene_count() -> usize {
    1
}

fn default_scene_duration() -> u32 {
    8
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_output_count() -> usize {
    1
}

fn default_resolution() -> String {
    "720p".to_string()
}

/// One user request: a marketing brief and the two reference images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Brief {
    pub prompt: String,
    /// Character image first, product image second.
    #[serde(default)]
    pub reference_images: Vec<PathBuf>,
    #[serde(default = "default_scene_count")]
    pub scene_count: usize,
    #[serde(default = "default_scene_duration")]
    pub scene_duration_sec: u32,
    #[serde(default)]
    pub is_extended: bool,
    #[serde(default)]
    pub extended_duration_sec: Option<u32>,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub backend_credentials: Credentials,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default = "default_output_count")]
    pub output_count: usize,
    #[serde(default = "default_resolution")]
    pub resolution: String,
}

impl Brief {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read brief: {}", path.as_ref().display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse brief: {}", path.as_ref().display()))
    }

    pub fn character_image(&self) -> Option<&Path> {
        self.reference_images.first().map(PathBuf::as_path)
    }

    pub fn product_image(&self) -> Option<&Path> {
        self.reference_images.get(1).map(PathBuf::as_path)
    }

    /// Shape checks only; file existence is checked by image analysis.
    pub fn validate(&self) -> GenResult<()> {
        if self.prompt.trim().is_empty() {
            return Err(GenerationError::input("brief prompt is empty"));
        }
        if self.reference_images.len() < 2 {
            return Err(GenerationError::input(
                "a character image and a product image are required",
            ));
        }
        if self.scene_count == 0 {
            return Err(GenerationError::input("scene_count must be at least 1"));
        }
        if self.scene_duration_sec == 0 {
            return Err(GenerationError::input("scene_duration_sec must be positive"));
        }
        if self.output_count == 0 {
            return Err(GenerationError::input("output_count must be at least 1"));
        }
        if self.threads == Some(0) {
            return Err(GenerationError::input("threads must be at least 1"));
        }
        match self.backend {
            BackendKind::PollingApi if self.backend_credentials.api_key().is_none() => {
                Err(GenerationError::input("polling backend needs an api_key"))
            }
            BackendKind::Browser if self.backend_credentials.session_cookie().is_none() => {
                Err(GenerationError::input("browser backend needs a session_cookie"))
            }
            _ => Ok(()),
        }
    }
}
