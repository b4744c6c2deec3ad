//! Message routing
//!
//! Pure functions deciding who receives what. They take the member names of a
//! registry snapshot (sorted) and return one [`Delivery`] per recipient, in
//! recipient name order. Nothing here touches a socket.

use chrono::{DateTime, Utc};

use crate::message::{ClientMessage, ServerMessage};

/// One outbound line addressed to one member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub recipient: String,
    pub message: ServerMessage,
}

impl Delivery {
    fn new(recipient: &str, message: ServerMessage) -> Self {
        Self {
            recipient: recipient.to_string(),
            message,
        }
    }
}

/// Target set for server-generated messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients<'a> {
    /// Every member
    All,
    /// Every member except the named one
    AllExcept(&'a str),
    /// Only the named member, if present
    Only(&'a str),
}

impl Recipients<'_> {
    fn includes(&self, name: &str) -> bool {
        match self {
            Recipients::All => true,
            Recipients::AllExcept(excluded) => name != *excluded,
            Recipients::Only(target) => name == *target,
        }
    }
}

/// Route a message sent by `sender`
///
/// `from` and `timestamp` on the outbound copies are always `sender` and
/// `timestamp`. A `join` is not routable and yields no deliveries.
pub fn route<I, S>(
    message: &ClientMessage,
    sender: &str,
    timestamp: DateTime<Utc>,
    members: I,
) -> Vec<Delivery>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    match message {
        ClientMessage::Chat { body } => fan_out(
            ServerMessage::Chat {
                from: sender.to_string(),
                body: body.clone(),
                timestamp,
            },
            members,
            Recipients::AllExcept(sender),
        ),
        ClientMessage::Whisper { to, body } => {
            let online = members.into_iter().any(|name| name.as_ref() == to.as_str());
            if !online {
                return vec![Delivery::new(
                    sender,
                    ServerMessage::unknown_recipient(to, timestamp),
                )];
            }

            let whisper = ServerMessage::Whisper {
                from: sender.to_string(),
                to: to.clone(),
                body: body.clone(),
                timestamp,
            };
            let mut recipients = vec![to.as_str(), sender];
            recipients.sort_unstable();
            recipients.dedup();
            recipients
                .into_iter()
                .map(|name| Delivery::new(name, whisper.clone()))
                .collect()
        }
        ClientMessage::Join { .. } => Vec::new(),
    }
}

/// Address a ready-made message to the members selected by `recipients`
pub fn fan_out<I, S>(message: ServerMessage, members: I, recipients: Recipients<'_>) -> Vec<Delivery>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    members
        .into_iter()
        .filter(|name| recipients.includes(name.as_ref()))
        .map(|name| Delivery::new(name.as_ref(), message.clone()))
        .collect()
}

/// Build a presence list from member names
///
/// The names are sorted and deduplicated regardless of input order.
pub fn presence_list<I, S>(members: I, timestamp: DateTime<Utc>) -> ServerMessage
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut names: Vec<String> = members
        .into_iter()
        .map(|name| name.as_ref().to_string())
        .collect();
    names.sort();
    names.dedup();
    ServerMessage::PresenceList { names, timestamp }
}
