//! OpenAI-compatible chat client for the demo pipeline's LLM steps.
//!
//! The model is instructed to answer with strict JSON; anything that fails to
//! parse into the required shape is a hard error surfaced as a step-level
//! failure, never silently defaulted.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl LlmConfig {
    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            api_key: must_env("TRAIL_LLM_API_KEY")?,
            model: must_env("TRAIL_LLM_MODEL")?,
            base_url: std::env::var("TRAIL_LLM_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
        })
    }
}

fn must_env(key: &str) -> Result<String, String> {
    std::env::var(key).map_err(|_| format!("Missing required env var: {}", key))
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Result of a keyword-generation call, with the full prompt and raw model
/// text kept for the audit trail.
#[derive(Debug, Clone)]
pub struct KeywordResult {
    pub keywords: Vec<String>,
    pub reasoning: String,
    pub raw_text: String,
    pub prompt: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelevanceEvaluation {
    pub asin: String,
    #[serde(default)]
    pub is_competitor: Option<bool>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RelevanceResult {
    pub evaluations: Vec<RelevanceEvaluation>,
    pub reasoning: String,
    pub raw_text: String,
    pub prompt: String,
    pub model: String,
}

pub async fn generate_keywords(
    client: &reqwest::Client,
    config: &LlmConfig,
    title: &str,
    category: &str,
) -> Result<KeywordResult, String> {
    let prompt = format!(
        "You generate search keywords for competitor discovery.\n\
         Product title: {}\n\
         Category: {}\n\n\
         Return STRICT JSON:\n\
         {{\n  \"keywords\": [\"...\"],\n  \"reasoning\": \"...\"\n}}\n\
         No markdown. No extra keys.",
        title, category
    );

    let raw_text = chat(client, config, &prompt).await?;
    parse_keyword_response(&raw_text, &prompt, &config.model)
}

pub async fn relevance_check(
    client: &reqwest::Client,
    config: &LlmConfig,
    reference_title: &str,
    reference_category: &str,
    candidates: &[(String, String)],
) -> Result<RelevanceResult, String> {
    let payload = json!({
        "reference": { "title": reference_title, "category": reference_category },
        "candidates": candidates
            .iter()
            .map(|(asin, title)| json!({"asin": asin, "title": title}))
            .collect::<Vec<_>>(),
        "instructions":
            "Mark true competitors only (same product type). \
             Reject accessories/replacement parts/bundles.\n\
             Return STRICT JSON:\n\
             {\n  \"evaluations\": [{\"asin\":\"...\",\"is_competitor\":true,\"confidence\":0.0}],\n  \"reasoning\": \"...\"\n}\n\
             No markdown. No extra keys.",
    });
    let prompt = payload.to_string();

    let raw_text = chat(client, config, &prompt).await?;
    parse_relevance_response(&raw_text, &prompt, &config.model)
}

async fn chat(
    client: &reqwest::Client,
    config: &LlmConfig,
    prompt: &str,
) -> Result<String, String> {
    let request = ChatRequest {
        model: config.model.clone(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        }],
    };

    let url = format!("{}/chat/completions", config.base_url);
    log::debug!("[TRAIL] LLM request to {} (model {})", url, config.model);

    let response = client
        .post(&url)
        .bearer_auth(&config.api_key)
        .timeout(Duration::from_secs(60))
        .json(&request)
        .send()
        .await
        .map_err(|e| format!("LLM request failed: {}", e))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| format!("Failed to read LLM response: {}", e))?;
    if !status.is_success() {
        return Err(format!("LLM API error ({}): {}", status, truncate(&body, 800)));
    }

    let parsed: ChatResponse = serde_json::from_str(&body)
        .map_err(|e| format!("Failed to parse LLM response envelope: {}", e))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| "LLM API returned no content".to_string())
}

// =====================================================
// Strict-JSON output validation
// =====================================================

fn parse_strict_json(text: &str) -> Result<Value, String> {
    serde_json::from_str(text).map_err(|_| {
        format!(
            "LLM did not return valid JSON. Raw output: {}",
            truncate(text, 800)
        )
    })
}

fn parse_keyword_response(text: &str, prompt: &str, model: &str) -> Result<KeywordResult, String> {
    let obj = parse_strict_json(text)?;

    let keywords = obj
        .get("keywords")
        .and_then(|k| k.as_array())
        .and_then(|items| {
            items
                .iter()
                .map(|v| v.as_str().map(|s| s.to_string()))
                .collect::<Option<Vec<String>>>()
        })
        .ok_or_else(|| {
            format!(
                "Invalid keywords format from LLM. Raw: {}",
                truncate(text, 800)
            )
        })?;
    let reasoning = obj
        .get("reasoning")
        .and_then(|r| r.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(KeywordResult {
        keywords,
        reasoning,
        raw_text: text.to_string(),
        prompt: prompt.to_string(),
        model: model.to_string(),
    })
}

fn parse_relevance_response(
    text: &str,
    prompt: &str,
    model: &str,
) -> Result<RelevanceResult, String> {
    let obj = parse_strict_json(text)?;

    let evaluations = obj
        .get("evaluations")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            format!(
                "Invalid evaluations format from LLM. Raw: {}",
                truncate(text, 800)
            )
        })?
        .iter()
        .filter_map(|v| serde_json::from_value::<RelevanceEvaluation>(v.clone()).ok())
        .collect();
    let reasoning = obj
        .get("reasoning")
        .and_then(|r| r.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(RelevanceResult {
        evaluations,
        reasoning,
        raw_text: text.to_string(),
        prompt: prompt.to_string(),
        model: model.to_string(),
    })
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
