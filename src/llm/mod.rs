//! Conversation with the language model.
//!
//! This module provides:
//! * [`LlmClient`]: async trait implemented by completion backends.
//! * [`ChatClient`]: OpenAI-compatible chat-completions client.
//! * [`ConversationHistory`] / [`ConversationTurn`]: bounded FIFO history.
//! * [`ConversationOrchestrator`]: prompt assembly, completion, clean-up.
//! * [`sanitize_for_speech`]: markdown/reasoning stripping and length bounds.
//! * [`LlmError`]: failure taxonomy, each with a fixed apology.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mirror_voice::config::AssistantConfig;
//! use mirror_voice::llm::{ChatClient, ConversationHistory, ConversationOrchestrator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AssistantConfig::default();
//!     let client = Arc::new(ChatClient::from_config(&config.llm));
//!     let orchestrator = ConversationOrchestrator::new(client, &config.llm);
//!
//!     let history = ConversationHistory::new(config.llm.max_history);
//!     match orchestrator.ask(&history, "what's the weather?", &config.llm.system_prompt).await {
//!         Ok(reply) => println!("{reply}"),
//!         Err(e) => println!("{}", e.apology()),
//!     }
//! }
//! ```

pub mod client;
pub mod history;
pub mod orchestrator;
pub mod sanitize;

pub use client::{parse_completion, ChatClient, ChatMessage, ChatRequest, LlmClient, LlmError, Role};
pub use history::{ConversationHistory, ConversationTurn};
pub use orchestrator::ConversationOrchestrator;
pub use sanitize::{sanitize_for_speech, ReplyLimits};
