//! Completion Provider backed by the Gemini `generateContent` REST endpoint.

use std::time::Duration;

use async_trait::async_trait;
use relay_config::Prompt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("api error: status={status} body={body}")]
    Api { status: u16, body: String },
    #[error("parse error: {0}")]
    Parse(String),
}

/// `instruction` may be empty. The call is not bounded here; callers race it
/// against their own deadline.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn generate(&self, instruction: &str, question: &str) -> Result<String, ProviderError>;
}

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    history: Vec<Content>,
}

impl GeminiProvider {
    pub fn new(cfg: &relay_config::Gemini) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self {
            client,
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            base_url: cfg.api_base.trim_end_matches('/').to_string(),
            history: cfg.prompts.iter().map(Content::from_prompt).collect(),
        })
    }

    fn request<'a>(&'a self, instruction: &str, question: &str) -> GenerateContentRequest<'a> {
        let mut contents = self.history.clone();
        contents.push(Content::text("user", question));
        GenerateContentRequest {
            system_instruction: (!instruction.is_empty()).then(|| Content {
                role: None,
                parts: vec![Part {
                    text: Some(instruction.to_string()),
                }],
            }),
            contents,
            safety_settings: &SAFETY_SETTINGS,
        }
    }
}

#[async_trait]
impl CompletionProvider for GeminiProvider {
    async fn generate(&self, instruction: &str, question: &str) -> Result<String, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        debug!(model = %self.model, has_instruction = !instruction.is_empty(), "calling gemini");

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request(instruction, question))
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(response_text(&parsed))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    safety_settings: &'a [SafetySetting],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            parts: vec![Part {
                text: Some(text.to_string()),
            }],
        }
    }

    fn from_prompt(prompt: &Prompt) -> Self {
        Self::text(&prompt.role, &prompt.text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

// Every harm filter is turned off; blocked prompts are reported back as text.
static SAFETY_SETTINGS: [SafetySetting; 4] = [
    SafetySetting {
        category: "HARM_CATEGORY_HARASSMENT",
        threshold: "BLOCK_NONE",
    },
    SafetySetting {
        category: "HARM_CATEGORY_HATE_SPEECH",
        threshold: "BLOCK_NONE",
    },
    SafetySetting {
        category: "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        threshold: "BLOCK_NONE",
    },
    SafetySetting {
        category: "HARM_CATEGORY_DANGEROUS_CONTENT",
        threshold: "BLOCK_NONE",
    },
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

fn response_text(resp: &GenerateContentResponse) -> String {
    let joined: String = resp
        .candidates
        .iter()
        .filter_map(|c| c.content.as_ref())
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| p.text.as_deref())
        .collect();
    let text = joined.replace("**", " ").trim().to_string();
    if !text.is_empty() {
        return text;
    }

    match resp
        .prompt_feedback
        .as_ref()
        .and_then(|f| f.block_reason.as_deref())
    {
        Some(reason) => format!("Blocked with reason {}.", block_reason_name(reason)),
        None => text,
    }
}

fn block_reason_name(reason: &str) -> String {
    match reason {
        "BLOCK_REASON_UNSPECIFIED" => "unspecified".to_string(),
        other => other.to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn gemini_config(base: &str) -> relay_config::Gemini {
        relay_config::Gemini {
            api_key: "k-1".to_string(),
            model: "gemini-test".to_string(),
            api_base: base.to_string(),
            timeout_ms: 2_000,
            prompts: vec![Prompt {
                role: "user".to_string(),
                text: "You are an assistant.".to_string(),
            }],
        }
    }

    fn parse(value: serde_json::Value) -> GenerateContentResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn joins_parts_and_strips_bold_markers() {
        let resp = parse(json!({
            "candidates": [
                {"content": {"role": "model", "parts": [{"text": "**Hello**"}, {"text": " world\n"}]}}
            ]
        }));
        assert_eq!(response_text(&resp), "Hello  world");
    }

    #[test]
    fn blocked_prompt_is_reported() {
        let resp = parse(json!({"promptFeedback": {"blockReason": "SAFETY"}}));
        assert_eq!(response_text(&resp), "Blocked with reason safety.");
        let resp = parse(json!({"promptFeedback": {"blockReason": "BLOCK_REASON_UNSPECIFIED"}}));
        assert_eq!(response_text(&resp), "Blocked with reason unspecified.");
    }

    #[test]
    fn empty_response_stays_empty() {
        assert_eq!(response_text(&parse(json!({}))), "");
    }

    #[test]
    fn request_carries_history_and_instruction() {
        let provider = GeminiProvider::new(&gemini_config("http://unused")).unwrap();
        let body = serde_json::to_value(provider.request("be terse", "Hello")).unwrap();
        assert_eq!(
            body["systemInstruction"],
            json!({"parts": [{"text": "be terse"}]})
        );
        assert_eq!(body["contents"].as_array().unwrap().len(), 2);
        assert_eq!(
            body["contents"][1],
            json!({"role": "user", "parts": [{"text": "Hello"}]})
        );
        assert_eq!(body["safetySettings"].as_array().unwrap().len(), 4);

        let bare = serde_json::to_value(provider.request("", "Hello")).unwrap();
        assert!(bare.get("systemInstruction").is_none());
    }

    #[tokio::test]
    async fn generate_calls_model_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1beta/models/gemini-test:generateContent")
            .match_header("x-goog-api-key", "k-1")
            .match_body(Matcher::PartialJson(json!({
                "contents": [
                    {"role": "user", "parts": [{"text": "You are an assistant."}]},
                    {"role": "user", "parts": [{"text": "Hello"}]}
                ]
            })))
            .with_status(200)
            .with_body(
                json!({"candidates": [{"content": {"parts": [{"text": "Hi!"}]}}]}).to_string(),
            )
            .create_async()
            .await;

        let provider = GeminiProvider::new(&gemini_config(&server.url())).unwrap();
        assert_eq!(provider.generate("", "Hello").await.unwrap(), "Hi!");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn generate_maps_http_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1beta/models/gemini-test:generateContent")
            .with_status(429)
            .with_body("quota")
            .create_async()
            .await;

        let provider = GeminiProvider::new(&gemini_config(&server.url())).unwrap();
        let err = provider.generate("", "Hello").await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 429, .. }));
    }
}
