//! The three LLM-backed stages that turn a brief into per-scene prompts.

use crate::api::LanguageModel;
use crate::error::{GenResult, GenerationError};
use crate::events::EventSink;
use crate::retry::RetryPolicy;
use futures::future::join_all;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

pub const STAGE_IMAGE_ANALYSIS: &str = "image_analysis";
pub const STAGE_SCRIPT_GENERATION: &str = "script_generation";
pub const STAGE_PROMPT_CONVERSION: &str = "prompt_conversion";
pub const STAGE_VIDEO_GENERATION: &str = "video_generation";

const CHARACTER_INSTRUCTION: &str = "Describe the person in this image for a video production \
brief. Reply with one JSON object with the keys gender, age_range, appearance, outfit, \
expression and style.";

const PRODUCT_INSTRUCTION: &str = "Describe the product in this image for a video production \
brief. Reply with one JSON object with the keys name, category, colors, materials, \
distinctive_features and selling_points.";

fn fence_regex() -> Option<&'static Regex> {
    static FENCE_RE: OnceCell<Regex> = OnceCell::new();
    FENCE_RE
        .get_or_try_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```"))
        .ok()
}

/// Body of the first code fence, or the whole reply when there is none.
fn unfence(reply: &str) -> &str {
    fence_regex()
        .and_then(|re| re.captures(reply))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(reply)
}

/// Pulls the JSON object out of a model reply that may wrap it in a code
/// fence or surrounding prose.
pub fn extract_json_block(reply: &str) -> Option<&str> {
    let body = unfence(reply);
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&body[start..=end])
}

fn parse_json_object(reply: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(extract_json_block(reply)?).ok()?;
    value.is_object().then_some(value)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisPair {
    pub character: Value,
    pub product: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default, alias = "so_thu_tu")]
    pub index: usize,
    #[serde(default, alias = "hanh_dong")]
    pub action: String,
    #[serde(default, alias = "boi_canh")]
    pub setting: String,
    #[serde(default, alias = "thoi_luong", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(alias = "canh")]
    pub scenes: Vec<Scene>,
}

impl Script {
    /// Parses a model reply, enforcing the requested scene count.
    pub fn from_reply(reply: &str, scene_count: usize, events: &EventSink) -> GenResult<Self> {
        let block = extract_json_block(reply)
            .ok_or_else(|| GenerationError::pipeline("script generation", "reply has no JSON object"))?;
        let mut script: Script = serde_json::from_str(block).map_err(|e| {
            GenerationError::pipeline("script generation", format!("malformed script: {}", e))
        })?;

        if script.scenes.len() < scene_count {
            return Err(GenerationError::pipeline(
                "script generation",
                format!(
                    "malformed script: expected {} scenes, got {}",
                    scene_count,
                    script.scenes.len()
                ),
            ));
        }
        if script.scenes.len() > scene_count {
            events.logw(format!(
                "Script has {} scenes, keeping the first {}",
                script.scenes.len(),
                scene_count
            ));
            script.scenes.truncate(scene_count);
        }

        for (i, scene) in script.scenes.iter_mut().enumerate() {
            if scene.action.trim().is_empty() || scene.setting.trim().is_empty() {
                return Err(GenerationError::pipeline(
                    "script generation",
                    format!("malformed script: scene {} lacks action or setting", i + 1),
                ));
            }
            scene.index = i + 1;
        }
        Ok(script)
    }
}

async fn analyze_one(
    llm: &dyn LanguageModel,
    image: &Path,
    instruction: &'static str,
    label: &str,
) -> GenResult<Value> {
    let reply = llm
        .describe_image(image, instruction)
        .await
        .map_err(|e| GenerationError::pipeline("image analysis", format!("{}: {}", label, e)))?;
    parse_json_object(&reply).ok_or_else(|| {
        GenerationError::pipeline("image analysis", format!("{}: no structured result", label))
    })
}

/// Stage 1. Both images must exist before any model call is made, and a
/// failed call is not retried.
pub async fn analyze_images(
    llm: &dyn LanguageModel,
    character_image: &Path,
    product_image: &Path,
) -> GenResult<AnalysisPair> {
    for (label, path) in [("character image", character_image), ("product image", product_image)] {
        if tokio::fs::metadata(path).await.is_err() {
            return Err(GenerationError::pipeline(
                "image analysis",
                format!("{} not found: {}", label, path.display()),
            ));
        }
    }

    let (character, product) = tokio::try_join!(
        analyze_one(llm, character_image, CHARACTER_INSTRUCTION, "character analysis"),
        analyze_one(llm, product_image, PRODUCT_INSTRUCTION, "product analysis"),
    )?;
    Ok(AnalysisPair { character, product })
}

fn script_prompt(analysis: &AnalysisPair, brief: &str, scene_count: usize, scene_sec: u32) -> String {
    format!(
        "Write a short promotional video script.\n\
         Character: {}\nProduct: {}\nBrief: {}\n\n\
         The video has exactly {} scenes of {} seconds each. Reply with JSON only:\n\
         {{\"scenes\":[{{\"index\":1,\"action\":\"...\",\"setting\":\"...\",\"duration\":\"{}s\"}}]}}",
        analysis.character, analysis.product, brief, scene_count, scene_sec, scene_sec
    )
}

/// Stage 2.
pub async fn generate_script(
    llm: &dyn LanguageModel,
    retry: &RetryPolicy,
    events: &EventSink,
    analysis: &AnalysisPair,
    brief: &str,
    scene_count: usize,
    scene_duration_sec: u32,
) -> GenResult<Script> {
    let prompt = script_prompt(analysis, brief, scene_count, scene_duration_sec);
    let prompt = prompt.as_str();
    let reply = retry
        .run("script generation", move || llm.generate_text(prompt))
        .await
        .map_err(|e| GenerationError::pipeline("script generation", e.to_string()))?;
    Script::from_reply(&reply, scene_count, events)
}

fn conversion_prompt(scene: &Scene, analysis: &AnalysisPair) -> String {
    format!(
        "Turn this scene into one detailed English prompt for a text-to-video model. \
         Keep the character and product consistent with the descriptions. Reply with the \
         prompt text only.\n\nAction: {}\nSetting: {}\nCharacter: {}\nProduct: {}",
        scene.action, scene.setting, analysis.character, analysis.product
    )
}

/// Strips fences and quotes some models wrap a plain-text answer in.
fn clean_prompt_reply(reply: &str) -> String {
    unfence(reply).trim().trim_matches('"').trim().to_string()
}

/// Stage 3 for one scene.
pub async fn convert_prompt(
    llm: &dyn LanguageModel,
    retry: &RetryPolicy,
    scene: &Scene,
    analysis: &AnalysisPair,
) -> GenResult<String> {
    let prompt = conversion_prompt(scene, analysis);
    let prompt = prompt.as_str();
    let reply = retry
        .run("prompt conversion", move || llm.generate_text(prompt))
        .await
        .map_err(|e| {
            GenerationError::pipeline("prompt conversion", format!("scene {}: {}", scene.index, e))
        })?;
    let cleaned = clean_prompt_reply(&reply);
    if cleaned.is_empty() {
        return Err(GenerationError::pipeline(
            "prompt conversion",
            format!("scene {}: empty prompt", scene.index),
        ));
    }
    Ok(cleaned)
}

/// Stage 3. Scenes convert concurrently; the result is in scene order.
pub async fn convert_prompts(
    llm: &dyn LanguageModel,
    retry: &RetryPolicy,
    script: &Script,
    analysis: &AnalysisPair,
) -> GenResult<Vec<String>> {
    let results = join_all(
        script
            .scenes
            .iter()
            .map(|scene| convert_prompt(llm, retry, scene, analysis)),
    )
    .await;
    results.into_iter().collect()
}
