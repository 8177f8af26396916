//! AI grader client.
//!
//! The pipeline only needs "send a prompt, get text back" from the model.
//! [`OllamaGrader`] does that against Ollama's chat API in JSON mode.

use crate::error::{GradingError, GradingResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Sends one grading prompt and returns the model's raw answer.
#[async_trait]
pub trait AiGrader: Send + Sync {
    async fn grade(&self, prompt: &str) -> GradingResult<String>;
}

/// Configuration for the Ollama grader.
#[derive(Debug, Clone)]
pub struct GraderConfig {
    pub ollama_url: String,
    pub model_name: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
    /// Extra attempts after a transport failure.
    pub retries: usize,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model_name: "llama3.2:latest".to_string(),
            temperature: 0.2,
            timeout_seconds: 300,
            retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: &'static str,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

/// System prompt for every grading pass.
const GRADER_SYSTEM_PROMPT: &str = r#"You are a careful, fair teacher grading a student's written answers.
Grade each question independently against its maximum score and rubric.
Respond with JSON only, no explanations or markdown."#;

/// [`AiGrader`] talking to an Ollama server.
pub struct OllamaGrader {
    config: GraderConfig,
    http_client: reqwest::Client,
}

impl OllamaGrader {
    pub fn new(config: GraderConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn request(&self, prompt: &str) -> OllamaChatRequest {
        OllamaChatRequest {
            model: self.config.model_name.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: GRADER_SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            stream: false,
            format: "json",
            options: OllamaOptions {
                temperature: self.config.temperature,
            },
        }
    }

    async fn send_prompt(&self, prompt: &str) -> GradingResult<String> {
        let url = format!("{}/api/chat", self.config.ollama_url.trim_end_matches('/'));

        let response = self
            .http_client
            .post(&url)
            .json(&self.request(prompt))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GradingError::Grader(format!(
                        "request timed out after {}s",
                        self.config.timeout_seconds
                    ))
                } else if e.is_connect() {
                    GradingError::Grader(format!(
                        "cannot connect to Ollama at {}",
                        self.config.ollama_url
                    ))
                } else {
                    GradingError::Grader(format!("failed to send request: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GradingError::Grader(format!(
                "Ollama API error {}: {}",
                status, body
            )));
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| GradingError::MalformedAiResponse(format!("bad Ollama envelope: {}", e)))?;

        Ok(chat_response.message.content)
    }
}

#[async_trait]
impl AiGrader for OllamaGrader {
    async fn grade(&self, prompt: &str) -> GradingResult<String> {
        let mut attempt = 0;
        loop {
            match self.send_prompt(prompt).await {
                Ok(content) => {
                    debug!("Grader answered with {} characters", content.len());
                    return Ok(content);
                }
                Err(e @ GradingError::Grader(_)) if attempt < self.config.retries => {
                    attempt += 1;
                    warn!("{} (retry {}/{})", e, attempt, self.config.retries);
                    tokio::time::sleep(Duration::from_millis(500u64 << attempt.min(5))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grader_config_default() {
        let config = GraderConfig::default();
        assert_eq!(config.model_name, "llama3.2:latest");
        assert_eq!(config.retries, 2);
    }

    #[test]
    fn test_request_asks_for_json() {
        let grader = OllamaGrader::new(GraderConfig::default()).unwrap();
        let json = serde_json::to_value(grader.request("grade this")).unwrap();

        assert_eq!(json["format"], "json");
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "grade this");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_grader_error() {
        let grader = OllamaGrader::new(GraderConfig {
            ollama_url: "http://127.0.0.1:9".to_string(),
            timeout_seconds: 2,
            retries: 0,
            ..GraderConfig::default()
        })
        .unwrap();

        let err = grader.grade("anything").await.unwrap_err();
        assert!(matches!(err, GradingError::Grader(_)));
    }
}
