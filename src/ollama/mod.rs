//! Ollama integration for segment classification
//!
//! Calls the Ollama REST API with the active preset's prompts and parses the
//! JSON verdicts it returns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ClassifierConfig;
use crate::database::{ClassificationDraft, PromptPreset, TranscriptSegment};
use crate::error::ClassifierError;
use crate::worker::classify::{
    render_user_prompt, validate_response, ClassificationResponse, Classifier,
};

/// Verdicts are short JSON objects; this caps runaway generations.
const MAX_PREDICT_TOKENS: i32 = 2048;
const TEMPERATURE: f32 = 0.1;

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(config: &ClassifierConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: config.ollama_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Whether the server answers and has the configured model pulled.
    pub async fn health_check(&self) -> Result<ModelStatus, ClassifierError> {
        let response = self
            .http
            .get(self.endpoint("/api/tags"))
            .send()
            .await
            .map_err(|e| ClassifierError::Request(e.to_string()))?;
        let response = check_status(response).await?;
        let tags: TagList = response
            .json()
            .await
            .map_err(|e| ClassifierError::Parse(e.to_string()))?;

        // "llama3.2:3b" matches an installed "llama3.2:latest"
        let family = self.model.split(':').next().unwrap_or(&self.model);
        let available_models: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
        Ok(ModelStatus {
            model: self.model.clone(),
            model_available: available_models.iter().any(|name| name.starts_with(family)),
            available_models,
        })
    }

    /// One non-streaming completion with the output constrained to JSON.
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, ClassifierError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            system,
            stream: false,
            format: "json",
            options: SamplingOptions {
                temperature: TEMPERATURE,
                num_predict: MAX_PREDICT_TOKENS,
            },
        };
        log::debug!("Ollama generate: model={} prompt_len={}", self.model, prompt.len());

        let response = self
            .http
            .post(self.endpoint("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ClassifierError::Request(e.to_string()))?;
        let completion: Completion = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ClassifierError::Parse(e.to_string()))?;

        log::debug!(
            "Ollama returned {} chars in {:?}ms",
            completion.response.len(),
            completion.eval_duration.map(|ns| ns / 1_000_000)
        );
        Ok(completion.response)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClassifierError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ClassifierError::Status { status, body })
}

/// Classifier backed by a local Ollama model.
pub struct OllamaClassifier {
    client: OllamaClient,
}

impl OllamaClassifier {
    pub fn new(client: OllamaClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Classifier for OllamaClassifier {
    async fn classify(
        &self,
        preset: &PromptPreset,
        podcast_title: &str,
        batch: &[TranscriptSegment],
    ) -> Result<Vec<ClassificationDraft>, ClassifierError> {
        let prompt = render_user_prompt(&preset.user_prompt_template, podcast_title, batch);
        let raw = self
            .client
            .generate(&prompt, Some(&preset.system_prompt))
            .await?;
        validate_response(parse_classification_response(&raw)?, batch)
    }
}

pub fn parse_classification_response(raw: &str) -> Result<ClassificationResponse, ClassifierError> {
    let object = find_json_object(raw).ok_or_else(|| {
        let preview: String = raw.chars().take(200).collect();
        ClassifierError::Parse(format!("no JSON object in response: {:?}", preview))
    })?;
    serde_json::from_value(object).map_err(|e| ClassifierError::Parse(e.to_string()))
}

/// Models sometimes wrap the object in a code fence or chatter despite
/// `format: "json"`. Tries the whole text, then a fenced block, then the
/// outermost braces.
fn find_json_object(raw: &str) -> Option<serde_json::Value> {
    let text = raw.trim();
    let fenced = text
        .split_once("```")
        .and_then(|(_, rest)| rest.split_once("```"))
        .map(|(block, _)| block.trim_start_matches("json").trim());
    let braced = match (text.find('{'), text.rfind('}')) {
        (Some(open), Some(close)) if close > open => Some(&text[open..=close]),
        _ => None,
    };

    [Some(text), fenced, braced]
        .into_iter()
        .flatten()
        .find_map(|candidate| serde_json::from_str::<serde_json::Value>(candidate).ok())
        .filter(serde_json::Value::is_object)
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    format: &'static str,
    options: SamplingOptions,
}

#[derive(Debug, Serialize)]
struct SamplingOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct Completion {
    response: String,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<TaggedModel>,
}

#[derive(Debug, Deserialize)]
struct TaggedModel {
    name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub model: String,
    pub model_available: bool,
    pub available_models: Vec<String>,
}
