//! Slash-command grammar.
//!
//! Anything starting with `/` is a command; everything else is a chat
//! message for the parent agent. Parsing is pure; execution lives at the
//! HTTP boundary.

use crate::error::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    /// Approve a pending tool call.
    Confirm { permission_id: String },
    /// Deny a pending tool call.
    Cancel { permission_id: String },
    Status,
    History { limit: Option<usize> },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedInput {
    Command(SlashCommand),
    Chat(String),
}

/// Parse one line of user input.
pub fn parse(input: &str) -> Result<ParsedInput, ValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidationError("empty message".to_string()));
    }
    if !trimmed.starts_with('/') {
        return Ok(ParsedInput::Chat(trimmed.to_string()));
    }

    let mut parts = trimmed.split_whitespace();
    let head = parts.next().unwrap_or_default();
    match head {
        "/confirm" => {
            let id = parts
                .next()
                .ok_or_else(|| ValidationError("usage: /confirm <permissionId>".to_string()))?;
            Ok(ParsedInput::Command(SlashCommand::Confirm {
                permission_id: id.to_string(),
            }))
        }
        "/cancel" => {
            let id = parts
                .next()
                .ok_or_else(|| ValidationError("usage: /cancel <permissionId>".to_string()))?;
            Ok(ParsedInput::Command(SlashCommand::Cancel {
                permission_id: id.to_string(),
            }))
        }
        "/status" => Ok(ParsedInput::Command(SlashCommand::Status)),
        "/history" => {
            let limit = match parts.next() {
                None => None,
                Some(raw) => Some(raw.parse().map_err(|_| {
                    ValidationError(format!("invalid history count: '{}'", raw))
                })?),
            };
            Ok(ParsedInput::Command(SlashCommand::History { limit }))
        }
        "/help" => Ok(ParsedInput::Command(SlashCommand::Help)),
        other => Err(ValidationError(format!(
            "unknown command: {} (try /help)",
            other
        ))),
    }
}

/// Static help text for `/help`.
pub fn help_text() -> &'static str {
    "Commands:\n\
     /confirm <permissionId>  approve a pending tool call\n\
     /cancel <permissionId>   deny a pending tool call\n\
     /status                  active tasks, progress, pending approvals\n\
     /history [n]             recent conversation history\n\
     /help                    this message\n\
     Anything else is sent to the orchestrator as a chat message."
}
