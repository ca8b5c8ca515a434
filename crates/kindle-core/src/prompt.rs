//! Prompt rendering for completion and chat requests

use crate::config::ModelConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const SYSTEM_ROLE: &str = "system";
pub const USER_ROLE: &str = "user";
pub const ASSISTANT_ROLE: &str = "assistant";

const INPUT: &str = "{{input}}";
const ROLE: &str = "{{role}}";
const CONTENT: &str = "{{content}}";

const DEFAULT_MESSAGE_TEMPLATE: &str = "{{role}}: {{content}}\n";

/// One chat turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            user: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(SYSTEM_ROLE, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(USER_ROLE, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ASSISTANT_ROLE, content)
    }
}

/// Prompt templates of one model
///
/// Recognized keys in `ModelConfig::prompt_templates`:
/// - `completion`: wraps the raw prompt through `{{input}}`
/// - `chat_message`: rendered once per message with `{{role}}` and `{{content}}`
/// - `chat`: wraps the rendered messages through `{{input}}`, which is where
///   an assistant cue belongs
#[derive(Debug, Clone, Default)]
pub struct PromptTemplate {
    completion: Option<String>,
    chat: Option<String>,
    chat_message: Option<String>,
    roles: HashMap<String, String>,
}

impl PromptTemplate {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            completion: config.prompt_templates.get("completion").cloned(),
            chat: config.prompt_templates.get("chat").cloned(),
            chat_message: config.prompt_templates.get("chat_message").cloned(),
            roles: config.roles.clone(),
        }
    }

    pub fn render_completion(&self, prompt: &str) -> String {
        match &self.completion {
            Some(template) => template.replace(INPUT, prompt),
            None => prompt.to_string(),
        }
    }

    pub fn render_chat(&self, messages: &[ChatMessage]) -> String {
        let line = self
            .chat_message
            .as_deref()
            .unwrap_or(DEFAULT_MESSAGE_TEMPLATE);

        let mut rendered = String::new();
        for message in messages {
            let role = self
                .roles
                .get(&message.role)
                .map(String::as_str)
                .unwrap_or(&message.role);
            // Content goes in last so a literal `{{role}}` in it survives.
            rendered.push_str(&line.replace(ROLE, role).replace(CONTENT, &message.content));
        }

        match &self.chat {
            Some(template) => template.replace(INPUT, &rendered),
            None => rendered,
        }
    }
}
