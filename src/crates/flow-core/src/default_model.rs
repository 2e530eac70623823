//! Default-model inference: when a flow's `default_model` ValueSpec renders with an
//! empty `model` field, fall back to whatever provider the environment suggests.
//!
//! Grounded on the teacher's provider probing idiom (`llm::local::OllamaClient::check_health`
//! hits `GET {base_url}/api/tags` and treats any non-success response or connection
//! failure as "not available", never as a hard error) and its remote clients'
//! `RemoteLlmConfig::from_env` convention of reading a named API-key environment
//! variable. Provider order is fixed by the spec: OpenAI, then Anthropic, then a
//! local Ollama probe, then Bedrock.

use std::env;
use std::time::Duration;

use tracing::debug;

const OLLAMA_BASE_URL: &str = "http://localhost:11434";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o";
const ANTHROPIC_DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
const BEDROCK_DEFAULT_MODEL: &str = "bedrock/anthropic.claude-3-5-sonnet-20241022-v2:0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelProvider {
    OpenAi,
    Anthropic,
    Ollama,
    Bedrock,
}

/// Infer a default model id from the process environment, in the fixed provider
/// order the spec lays out. Returns `None` if nothing matches — callers treat a
/// `None` exactly like an explicitly empty `model` field that can't be resolved.
pub async fn infer_default_model() -> Option<String> {
    if env::var_os("OPENAI_API_KEY").is_some() {
        debug!(provider = ?ModelProvider::OpenAi, "inferred default model from environment");
        return Some(OPENAI_DEFAULT_MODEL.to_string());
    }
    if env::var_os("ANTHROPIC_API_KEY").is_some() {
        debug!(provider = ?ModelProvider::Anthropic, "inferred default model from environment");
        return Some(ANTHROPIC_DEFAULT_MODEL.to_string());
    }
    if let Some(model) = probe_ollama().await {
        debug!(provider = ?ModelProvider::Ollama, %model, "inferred default model from local probe");
        return Some(model);
    }
    if env::var_os("AWS_ACCESS_KEY_ID").is_some() || env::var_os("AWS_PROFILE").is_some() {
        debug!(provider = ?ModelProvider::Bedrock, "inferred default model from environment");
        return Some(BEDROCK_DEFAULT_MODEL.to_string());
    }
    None
}

/// `GET /api/tags` against a local Ollama endpoint; the first listed model name,
/// prefixed `ollama/`. Any failure (no server running, malformed response) is
/// treated as "not available", matching `OllamaClient::check_health`'s leniency.
async fn probe_ollama() -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()
        .ok()?;
    let url = format!("{OLLAMA_BASE_URL}/api/tags");
    let response = client.get(&url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    let body: OllamaTagsResponse = response.json().await.ok()?;
    let first = body.models.into_iter().next()?;
    Some(format!("ollama/{}", first.name))
}

#[derive(serde::Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelEntry>,
}

#[derive(serde::Deserialize)]
struct OllamaModelEntry {
    name: String,
}
