//! Client for an OpenAI-compatible chat/vision and embeddings API.
//!
//! Calls are blocking and are not retried; callers decide whether to retry
//! the whole operation.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::LlmConfig;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API key not set: environment variable {0} is empty or missing")]
    MissingApiKey(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// One chat completion call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    /// `data:` URL or remote URL of an image attached to the user turn
    pub image_url: Option<String>,
    /// Ask the API to constrain output to a JSON object
    pub json_mode: bool,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn new(model: &str, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            system: system.into(),
            user: user.into(),
            image_url: None,
            json_mode: true,
            temperature: 0.2,
        }
    }

    pub fn with_image(mut self, image_url: String) -> Self {
        self.image_url = Some(image_url);
        self
    }

    fn to_body(&self) -> Value {
        let user_content = match &self.image_url {
            Some(url) => json!([
                {"type": "text", "text": self.user},
                {"type": "image_url", "image_url": {"url": url}},
            ]),
            None => Value::String(self.user.clone()),
        };

        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": self.system},
                {"role": "user", "content": user_content},
            ],
        });
        if self.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

/// A language model that answers chat requests with text.
pub trait ChatModel: Send + Sync {
    fn complete(&self, request: &ChatRequest) -> Result<String, LlmError>;
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::blocking::Client,
    api_base: String,
    api_key: String,
}

impl OpenAiClient {
    /// Build a client, reading the API key from the configured environment variable.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| LlmError::MissingApiKey(config.api_key_env.clone()))?;

        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn post(&self, path: &str, body: &Value) -> Result<reqwest::blocking::Response, LlmError> {
        let response = self
            .http
            .post(format!("{}/{}", self.api_base, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        Ok(response)
    }

    /// Embed `texts` with `model`, returning vectors in input order.
    pub fn embeddings(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let body = json!({"model": model, "input": texts});
        let mut data = self.post("embeddings", &body)?.json::<EmbeddingResponse>()?.data;

        if data.len() != texts.len() {
            return Err(LlmError::Malformed(format!(
                "requested {} embeddings, got {}",
                texts.len(),
                data.len()
            )));
        }
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

impl ChatModel for OpenAiClient {
    fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
        log::debug!("chat completion with model '{}'", request.model);
        let response = self
            .post("chat/completions", &request.to_body())?
            .json::<ChatResponse>()?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Malformed("response has no message content".to_string()))
    }
}

/// Parse a JSON object out of model output.
///
/// Accepts bare JSON, fenced code blocks, and prose around a single object
/// (first `{` to last `}`). Returns `None` when no object can be recovered.
pub fn extract_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        return Some(map);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Read a string-or-array field as a list of non-empty strings.
pub fn string_list(map: &serde_json::Map<String, Value>, key: &str) -> Vec<String> {
    match map.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Read a string field, trimmed; `None` when absent or blank.
pub fn string_field(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bare_object() {
        let map = extract_json_object(r#"{"title": "Vestido"}"#).unwrap();
        assert_eq!(string_field(&map, "title").as_deref(), Some("Vestido"));
    }

    #[test]
    fn test_extract_from_fenced_block() {
        let text = "Claro! Aqui está:\n```json\n{\"colors\": [\"azul\"]}\n```\nAbraços";
        let map = extract_json_object(text).unwrap();
        assert_eq!(string_list(&map, "colors"), vec!["azul"]);
    }

    #[test]
    fn test_extract_rejects_garbage() {
        assert!(extract_json_object("").is_none());
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("} backwards {").is_none());
        assert!(extract_json_object("[1, 2, 3]").is_none());
        assert!(extract_json_object("{not: valid}").is_none());
    }

    #[test]
    fn test_string_list_accepts_string_or_array() {
        let map = extract_json_object(r#"{"a": "gala", "b": ["x", " ", 3, "y"], "c": 1}"#).unwrap();
        assert_eq!(string_list(&map, "a"), vec!["gala"]);
        assert_eq!(string_list(&map, "b"), vec!["x", "y"]);
        assert!(string_list(&map, "c").is_empty());
        assert!(string_list(&map, "missing").is_empty());
    }

    #[test]
    fn test_chat_body_with_image() {
        let request = ChatRequest::new("gpt-4o", "sys", "describe")
            .with_image("data:image/webp;base64,AAAA".to_string());
        let body = request.to_body();

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][1]["content"][1]["type"], "image_url");
    }

    #[test]
    fn test_missing_api_key() {
        let config = LlmConfig {
            api_key_env: "CATALOG_SEARCH_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..LlmConfig::default()
        };
        assert!(matches!(
            OpenAiClient::from_config(&config),
            Err(LlmError::MissingApiKey(_))
        ));
    }
}
