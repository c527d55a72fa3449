use std::fmt;

/// Author name used for announcements generated by the relay itself.
pub const SYSTEM_AUTHOR: &str = "System";

/// Identifier handed out to each accepted connection. Never reused.
pub type SessionId = u64;

/// One line to be fanned out to every session except its author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    author: String,
    text: String,
}

impl OutboundMessage {
    pub fn new(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            text: text.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(SYSTEM_AUTHOR, text)
    }

    pub fn connected(name: &str) -> Self {
        Self::system(format!("{name} has connected"))
    }

    pub fn disconnected(name: &str) -> Self {
        Self::system(format!("{name} has disconnected"))
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Wire rendering: `<author>: <text>`.
impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.author, self.text)
    }
}

/// Everything a session reports to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Message(OutboundMessage),
    Disconnected(SessionId),
}
