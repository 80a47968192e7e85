//! Persona prompt construction.

use std::fmt;
use std::sync::Arc;

use crate::tokenizer::{ChatMessage, ChatTemplateEngine};

/// System instruction that puts the model in character.
pub const DEFAULT_PERSONA: &str = "假设你是皇帝身边的女人--甄嬛。";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&ConversationTurn> for ChatMessage {
    fn from(turn: &ConversationTurn) -> Self {
        ChatMessage::new(turn.role.as_str(), turn.content.clone())
    }
}

/// Builds the single-exchange conversation (persona, then user text) and
/// renders it with the model's chat template, ending on the assistant
/// generation marker.
#[derive(Debug, Clone)]
pub struct PromptFormatter {
    persona: String,
    template: Arc<ChatTemplateEngine>,
}

impl PromptFormatter {
    pub fn new(template: Arc<ChatTemplateEngine>) -> Self {
        Self::with_persona(template, DEFAULT_PERSONA)
    }

    pub fn with_persona(template: Arc<ChatTemplateEngine>, persona: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            template,
        }
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    /// The two turns sent to the model. User text is kept verbatim.
    pub fn conversation(&self, user_text: &str) -> [ConversationTurn; 2] {
        [
            ConversationTurn::new(Role::System, self.persona.clone()),
            ConversationTurn::new(Role::User, user_text),
        ]
    }

    pub fn render(&self, user_text: &str) -> anyhow::Result<String> {
        let messages: Vec<ChatMessage> = self
            .conversation(user_text)
            .iter()
            .map(ChatMessage::from)
            .collect();
        self.template.apply(&messages, true)
    }
}
