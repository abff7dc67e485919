//! Prompt construction for the language model.
//!
//! The prompt is a chat transcript: the system instructions, the replayed
//! session history, then one user message carrying the numbered evidence
//! and the question. An empty [`ContextBlock`] produces the degraded
//! "no evidence found" variant instead of an error.

use campus_copilot_core::models::{ContextBlock, Turn};
use serde::Serialize;

const NO_EVIDENCE_NOTE: &str = "No relevant sources were found in the campus knowledge base for \
this question. Tell the student you could not find this information and, if you can, suggest \
which campus office or page would know. Do not invent specific facts.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Everything the model sees for one answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub messages: Vec<ChatMessage>,
    /// Built without evidence.
    pub degraded: bool,
}

pub fn build_prompt<'a>(
    system_prompt: &str,
    history: impl IntoIterator<Item = &'a Turn>,
    block: &ContextBlock,
    query: &str,
) -> Prompt {
    let mut messages = vec![ChatMessage::new("system", system_prompt)];
    messages.extend(
        history
            .into_iter()
            .map(|t| ChatMessage::new(t.role.as_str(), t.text.clone())),
    );

    let degraded = block.is_empty();
    let mut user = String::new();
    if degraded {
        user.push_str(NO_EVIDENCE_NOTE);
    } else {
        user.push_str("Sources:\n");
        for entry in &block.entries {
            user.push_str(&format!(
                "[{}] ({}) {}\n\n",
                entry.marker, entry.source_uri, entry.excerpt
            ));
        }
    }
    user.push_str("\nQuestion: ");
    user.push_str(query.trim());
    messages.push(ChatMessage::new("user", user));

    Prompt { messages, degraded }
}
