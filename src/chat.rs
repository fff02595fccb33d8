//! Chat history built from transcription events.
//! Partial text for one speaker turn (same speaker, same `task_id`) is merged into one message.

use serde::{Deserialize, Serialize};

use crate::translator::{ServerEvent, TaskEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSender {
    User,
    Avatar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: MessageSender,
    pub message: String,
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatState {
    pub current_speaker: Option<MessageSender>,
    pub accumulated_text: String,
    pub task_id: Option<String>,
    /// Finished turns, oldest first
    pub messages: Vec<ChatMessage>,
}

impl ChatState {
    /// Finished turns plus the one in progress
    pub fn transcript(&self) -> Vec<ChatMessage> {
        let mut all = self.messages.clone();
        if let Some(sender) = self.current_speaker {
            all.push(ChatMessage {
                sender,
                message: self.accumulated_text.clone(),
                task_id: self.task_id.clone(),
            });
        }
        all
    }

    fn finish_turn(&mut self) {
        if let Some(sender) = self.current_speaker.take() {
            let message = std::mem::take(&mut self.accumulated_text);
            if !message.trim().is_empty() {
                self.messages.push(ChatMessage {
                    sender,
                    message,
                    task_id: self.task_id.take(),
                });
            }
        }
        self.accumulated_text.clear();
        self.task_id = None;
    }

    fn append(&mut self, sender: MessageSender, text: &str, task_id: Option<&String>) {
        let same_turn = self.current_speaker == Some(sender)
            && (task_id.is_none() || self.task_id.as_ref() == task_id);
        if !same_turn {
            self.finish_turn();
            self.current_speaker = Some(sender);
            self.task_id = task_id.cloned();
        }
        self.accumulated_text.push_str(text);
    }
}

/// Fold one event into the chat state
pub fn reduce(mut state: ChatState, event: &TaskEvent) -> ChatState {
    match &event.event {
        ServerEvent::UserMessage { message } => {
            state.append(MessageSender::User, message, event.task_id.as_ref())
        }
        ServerEvent::AvatarMessage { message } => {
            state.append(MessageSender::Avatar, message, event.task_id.as_ref())
        }
        ServerEvent::UserEndMessage => {
            if state.current_speaker == Some(MessageSender::User) {
                state.finish_turn();
            }
        }
        ServerEvent::AvatarEndMessage => {
            if state.current_speaker == Some(MessageSender::Avatar) {
                state.finish_turn();
            }
        }
        _ => {}
    }
    state
}
