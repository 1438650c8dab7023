//! Bus wire body shapes: the three message kinds that travel inside an
//! [`Envelope`](crate::bus::Envelope)'s `msg_body`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSender {
    pub name: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BusMessage {
    Privmsg {
        sender: MessageSender,
        recipient: String,
        text: String,
    },
    Join {
        sender: MessageSender,
    },
    Part {
        sender: MessageSender,
        #[serde(default)]
        reason: Option<String>,
    },
}
