//! `LlmClient` trait and the OpenAI-compatible `ChatClient`.
//!
//! `ChatClient` talks to any `/v1/chat/completions` endpoint: LM Studio,
//! Ollama (OpenAI mode), llama.cpp server, OpenAI itself.  All connection
//! details come from [`LlmConfig`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LlmConfig;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One completion request.  Streaming is never requested.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

// ---------------------------------------------------------------------------
// LlmError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmError {
    #[error("language model endpoint refused the connection")]
    ConnectionRefused,

    #[error("language model request timed out")]
    Timeout,

    /// The body was not JSON, or had no `choices[0].message.content`.
    #[error("malformed language model response: {0}")]
    MalformedResponse(String),

    #[error("language model endpoint returned HTTP {status}")]
    Http { status: u16 },

    #[error("language model request failed: {0}")]
    Request(String),
}

impl LlmError {
    /// Fixed, user-facing apology for this failure class.  Never includes
    /// the raw error text.
    pub fn apology(&self) -> &'static str {
        match self {
            Self::ConnectionRefused => {
                "Sorry, I can't reach my language model right now. Please check that it is running."
            }
            Self::Timeout => "Sorry, that took too long to answer. Please try again.",
            Self::MalformedResponse(_) => {
                "Sorry, I got a response I couldn't understand. Please try again."
            }
            Self::Http { .. } => "Sorry, the language model reported an error.",
            Self::Request(_) => "Sorry, something went wrong while asking the language model.",
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else if e.is_connect() {
            LlmError::ConnectionRefused
        } else {
            LlmError::Request(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// LlmClient trait
// ---------------------------------------------------------------------------

/// Object-safe completion interface, held as `Arc<dyn LlmClient>`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Return the raw reply text of the first choice.
    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError>;
}

/// Extract `choices[0].message.content` from a completion body.
pub fn parse_completion(body: &serde_json::Value) -> Result<String, LlmError> {
    let message = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| LlmError::MalformedResponse("no choices[0].message".into()))?;

    let content = message
        .get("content")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| LlmError::MalformedResponse("message has no text content".into()))?
        .trim();

    if content.is_empty() {
        return Err(LlmError::MalformedResponse("empty content".into()));
    }
    Ok(content.to_string())
}

// ---------------------------------------------------------------------------
// ChatClient
// ---------------------------------------------------------------------------

pub struct ChatClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl ChatClient {
    /// Build a client whose requests time out after `config.timeout_ms`.
    pub fn from_config(config: &LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            config: config.clone(),
        }
    }

    fn post(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let req = self.client.post(&self.config.endpoint).json(body);
        match self.config.api_key.as_deref() {
            Some(key) if !key.is_empty() => req.bearer_auth(key),
            _ => req,
        }
    }

    /// One-token request to check that the endpoint answers.
    pub async fn probe(&self) -> Result<(), LlmError> {
        let body = serde_json::json!({
            "model":      self.config.model,
            "messages":   [ { "role": "user", "content": "Hello" } ],
            "max_tokens": 1,
            "stream":     false
        });
        let response = self.post(&body).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(LlmError::Http {
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl LlmClient for ChatClient {
    /// The `Authorization: Bearer …` header is attached only when an API key
    /// is configured, so local servers work without one.
    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model":       self.config.model,
            "messages":    request.messages,
            "temperature": request.temperature,
            "max_tokens":  request.max_tokens,
            "stream":      false
        });

        let response = self.post(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Http {
                status: status.as_u16(),
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
        parse_completion(&json)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
