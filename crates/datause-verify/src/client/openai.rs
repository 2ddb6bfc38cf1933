//! `OpenAI`-compatible chat completions backend.
//!
//! Works with any server exposing `POST {base}/chat/completions` with bearer
//! authentication.
//!
//! ## Example
//!
//! ```no_run
//! use datause_verify::client::{openai::OpenAiBackend, LlmClient};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let backend = OpenAiBackend::new(std::env::var("OPENAI_API_KEY")?, None, Duration::from_secs(180))?;
//! let client = LlmClient::new(Arc::new(backend), Duration::from_secs(1));
//! let answer = client.send("Say hi", Duration::from_secs(30), "gpt-4o-mini").await?;
//! println!("{answer}");
//! # Ok(())
//! # }
//! ```

use super::{Failure, LlmBackend};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

const SYSTEM_PROMPT: &str = "You are an expert research assistant who judges whether a scientific paper actually uses the data of a cited data paper. Follow the requested output format exactly.";

/// Chat completion request
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

/// Chat completion response
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// HTTP backend for `OpenAI`-compatible APIs
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiBackend {
    /// Create a backend.
    ///
    /// `timeout` is a transport-level safety net; [`LlmClient`](super::LlmClient)
    /// applies the authoritative per-request timeout.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        api_key: String,
        api_base: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            base_url: api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, model: &str, prompt: &str) -> Result<String, Failure> {
        let request = build_request(model, prompt);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Failure::from_reqwest(&e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Failure::from_reqwest(&e))?;

        if !status.is_success() {
            return Err(Failure::transport(format!(
                "OpenAI API error ({status}): {body}"
            )));
        }

        extract_content(&body)
    }
}

fn build_request<'a>(model: &'a str, prompt: &'a str) -> ChatRequest<'a> {
    ChatRequest {
        model,
        messages: vec![
            Message {
                role: "system",
                content: SYSTEM_PROMPT,
            },
            Message {
                role: "user",
                content: prompt,
            },
        ],
        temperature: 0.0,
    }
}

fn extract_content(body: &str) -> Result<String, Failure> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| Failure::transport(format!("malformed OpenAI response: {e}")))?;

    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| Failure::transport("OpenAI response has no message content"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FailureKind;

    #[test]
    fn test_build_request_shape() {
        let request = build_request("gpt-4o-mini", "Judge this paper");
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["temperature"], 0.0);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "Judge this paper");
    }

    #[test]
    fn test_extract_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"{\"decision\":\"Used\"}"}}]}"#;
        assert_eq!(extract_content(body).unwrap(), r#"{"decision":"Used"}"#);
    }

    #[test]
    fn test_extract_content_missing() {
        let err = extract_content(r#"{"choices":[]}"#).unwrap_err();
        assert_eq!(err.kind, FailureKind::Transport);

        let err = extract_content("<html>bad gateway</html>").unwrap_err();
        assert_eq!(err.kind, FailureKind::Transport);
    }

    #[test]
    fn test_custom_base_url_trims_slash() {
        let backend = OpenAiBackend::new(
            "test-key".to_string(),
            Some("https://custom.api.com/v1/".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(backend.base_url, "https://custom.api.com/v1");
    }
}
