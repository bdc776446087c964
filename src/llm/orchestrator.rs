//! Builds the prompt from history, asks the model, cleans the reply.
//!
//! ```text
//! system prompt ─┐
//! history turns ─┼─▶ [system, user, assistant, …, user] ─▶ LlmClient ─▶ sanitize_for_speech
//! user text ─────┘
//! ```

use std::sync::Arc;

use super::client::{ChatMessage, ChatRequest, LlmClient, LlmError};
use super::history::ConversationHistory;
use super::sanitize::{sanitize_for_speech, ReplyLimits};
use crate::config::LlmConfig;

pub struct ConversationOrchestrator {
    llm: Arc<dyn LlmClient>,
    temperature: f32,
    max_tokens: u32,
    limits: ReplyLimits,
}

impl ConversationOrchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, config: &LlmConfig) -> Self {
        Self {
            llm,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            limits: ReplyLimits {
                max_sentences: config.max_reply_sentences,
                max_chars: config.max_reply_chars,
            },
        }
    }

    /// System message, each history turn as a user/assistant pair, then the
    /// new user message.  Turns without a reply contribute only the user
    /// message.
    pub fn build_messages(
        history: &ConversationHistory,
        user_text: &str,
        system_prompt: &str,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 2);
        messages.push(ChatMessage::system(system_prompt));
        for turn in history.turns() {
            if !turn.user.is_empty() {
                messages.push(ChatMessage::user(turn.user.clone()));
            }
            if let Some(reply) = turn.assistant.as_deref().filter(|r| !r.is_empty()) {
                messages.push(ChatMessage::assistant(reply));
            }
        }
        messages.push(ChatMessage::user(user_text));
        messages
    }

    /// Ask the model and return the reply cleaned for speech.
    ///
    /// A reply that is empty after cleaning (for example one consisting only
    /// of a reasoning span) is reported as malformed.
    pub async fn ask(
        &self,
        history: &ConversationHistory,
        user_text: &str,
        system_prompt: &str,
    ) -> Result<String, LlmError> {
        let request = ChatRequest {
            messages: Self::build_messages(history, user_text, system_prompt),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        log::debug!(
            "llm: asking with {} message(s) of history",
            request.messages.len() - 2
        );

        let raw = self.llm.complete(&request).await?;
        let reply = sanitize_for_speech(&raw, self.limits);
        if reply.is_empty() {
            return Err(LlmError::MalformedResponse(
                "reply is empty after cleaning".into(),
            ));
        }
        Ok(reply)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
