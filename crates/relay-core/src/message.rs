use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Payload kind carried by a [`Message`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

/// Which side produced a [`Message`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Client,
    Server,
}

impl Sender {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

/// The unit that is persisted and fanned out to every device of a user.
///
/// `content` is raw text for [`MessageType::Text`] and a
/// `data:image/...;base64,` URL for [`MessageType::Image`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    kind: MessageType,
    content: String,
    sender: Sender,
    owner: UserId,
}

impl Message {
    pub fn new(kind: MessageType, content: impl Into<String>, sender: Sender, owner: UserId) -> Self {
        Self {
            kind,
            content: content.into(),
            sender,
            owner,
        }
    }

    pub fn text(content: impl Into<String>, sender: Sender, owner: UserId) -> Self {
        Self::new(MessageType::Text, content, sender, owner)
    }

    pub fn image(content: impl Into<String>, sender: Sender, owner: UserId) -> Self {
        Self::new(MessageType::Image, content, sender, owner)
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn sender(&self) -> Sender {
        self.sender
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }
}
