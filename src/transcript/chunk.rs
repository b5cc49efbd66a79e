//! Grouping messages into turns.

use serde_json::Value;

use super::{ContentBlock, Message, Role};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub input: Value,
}

/// One user message, every assistant message that answered it, and the tool
/// calls those replies issued.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    /// Position within the chunked window, starting at 0.
    pub index: u32,
    pub user: Message,
    pub assistant: Vec<Message>,
    pub tool_calls: Vec<ToolCall>,
}

impl Turn {
    fn open(index: u32, user: Message) -> Self {
        Self {
            index,
            user,
            assistant: Vec::new(),
            tool_calls: Vec::new(),
        }
    }

    fn absorb(&mut self, reply: Message) {
        self.tool_calls.extend(reply.blocks().iter().filter_map(|block| match block {
            ContentBlock::ToolUse { name, input } => Some(ToolCall {
                name: name.clone(),
                input: input.clone(),
            }),
            _ => None,
        }));
        self.assistant.push(reply);
    }

    pub fn user_text(&self) -> String {
        self.user.text()
    }

    /// Text of all assistant replies, newline-joined.
    pub fn assistant_text(&self) -> String {
        self.assistant
            .iter()
            .map(Message::text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Chunk the last `max_messages` user/assistant messages into turns.
///
/// Assistant messages before the first user message have no turn to join and
/// are dropped.
pub fn chunk_messages(messages: Vec<Message>, max_messages: usize) -> Vec<Turn> {
    let relevant: Vec<Message> = messages
        .into_iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .collect();
    let start = relevant.len().saturating_sub(max_messages);

    let mut turns: Vec<Turn> = Vec::new();
    let mut current: Option<Turn> = None;

    for message in relevant.into_iter().skip(start) {
        match message.role {
            Role::User => {
                if message.is_tool_result_echo() && current.is_some() {
                    continue;
                }
                if let Some(done) = current.take() {
                    turns.push(done);
                }
                current = Some(Turn::open(turns.len() as u32, message));
            }
            Role::Assistant => {
                if let Some(turn) = current.as_mut() {
                    turn.absorb(message);
                }
            }
            Role::Other => {}
        }
    }

    turns.extend(current);
    turns
}
