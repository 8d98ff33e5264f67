// ABOUTME: Decoded long-poll updates: new messages with their flags, everything else kept raw
// ABOUTME: Handles conference addressing (peer ids above 2e9 with a `from` extra) and forwarded message lists

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Peer ids above this belong to group conversations
pub const CHAT_PEER_OFFSET: i64 = 2_000_000_000;

/// Update code for a new message
pub const NEW_MESSAGE: i64 = 4;

/// Bits of the long-poll message flag mask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    pub unread: bool,
    pub outbox: bool,
    pub replied: bool,
    pub important: bool,
    pub chat: bool,
    pub friends: bool,
    pub spam: bool,
    pub deleted: bool,
    pub fixed: bool,
    pub media: bool,
}

impl MessageFlags {
    pub fn from_bits(bits: u64) -> Self {
        let bit = |n: u32| bits & (1 << n) != 0;
        Self {
            unread: bit(0),
            outbox: bit(1),
            replied: bit(2),
            important: bit(3),
            chat: bit(4),
            friends: bit(5),
            spam: bit(6),
            deleted: bit(7),
            fixed: bit(8),
            media: bit(9),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub message_id: i64,
    pub flags: MessageFlags,
    /// Raw peer id as sent by the server; address replies here
    pub peer_id: i64,
    pub timestamp: i64,
    pub subject: String,
    pub text: String,
    pub extra: Map<String, Value>,
    /// Conversation number for conference messages
    pub chat_id: Option<i64>,
    /// Author of the message
    pub user_id: i64,
    /// Messages quoted in this one, taken out of the `fwd` extra
    #[serde(default)]
    pub forwarded: Vec<ForwardedMessage>,
}

impl MessageEvent {
    pub fn is_conference(&self) -> bool {
        self.chat_id.is_some()
    }
}

/// A forwarded message reference with the messages it forwards in turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedMessage {
    /// `<author>_<message id>` as the server sends it
    pub id: String,
    pub forwarded: Vec<ForwardedMessage>,
}

impl ForwardedMessage {
    pub fn author_id(&self) -> Option<i64> {
        self.id.split_once('_')?.0.parse().ok()
    }

    pub fn message_id(&self) -> Option<i64> {
        self.id.split_once('_')?.1.parse().ok()
    }
}

/// Parse a `fwd` extra such as `1_10,1_11:(2_20,2_21:(3_30))`
pub fn parse_forwarded(list: &str) -> Vec<ForwardedMessage> {
    let mut chars = list.chars().peekable();
    parse_forwarded_list(&mut chars)
}

fn parse_forwarded_list(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> Vec<ForwardedMessage> {
    let mut items = Vec::new();
    loop {
        let mut id = String::new();
        while let Some(&c) = chars.peek() {
            if matches!(c, ',' | ':' | ')') {
                break;
            }
            id.push(c);
            chars.next();
        }

        let mut forwarded = Vec::new();
        if chars.peek() == Some(&':') {
            chars.next();
            if chars.peek() == Some(&'(') {
                chars.next();
                forwarded = parse_forwarded_list(chars);
                if chars.peek() == Some(&')') {
                    chars.next();
                }
            }
        }

        let id = id.trim();
        if !id.is_empty() {
            items.push(ForwardedMessage {
                id: id.to_string(),
                forwarded,
            });
        }

        if chars.peek() == Some(&',') {
            chars.next();
        } else {
            return items;
        }
    }
}

/// One update from the long-poll server
#[derive(Debug, Clone, PartialEq)]
pub enum LongPollEvent {
    NewMessage(MessageEvent),
    Other { code: i64, raw: Value },
}

impl LongPollEvent {
    /// Decode one raw update array. Returns `None` when not even a code can be read.
    pub fn decode(raw: &Value) -> Option<Self> {
        let items = raw.as_array()?;
        let code = items.first().and_then(as_i64)?;

        if code == NEW_MESSAGE {
            if let Some(message) = decode_message(&items[1..]) {
                return Some(Self::NewMessage(message));
            }
            tracing::debug!(update = %raw, "Malformed new message update");
        }

        Some(Self::Other {
            code,
            raw: raw.clone(),
        })
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::NewMessage(_) => NEW_MESSAGE,
            Self::Other { code, .. } => *code,
        }
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn decode_message(fields: &[Value]) -> Option<MessageEvent> {
    let message_id = as_i64(fields.first()?)?;
    let flags = MessageFlags::from_bits(as_i64(fields.get(1)?)? as u64);
    let peer_id = as_i64(fields.get(2)?)?;
    let timestamp = fields.get(3).and_then(as_i64).unwrap_or(0);
    let subject = fields
        .get(4)
        .and_then(Value::as_str)
        .map(unescape_text)
        .unwrap_or_default();
    let text = fields
        .get(5)
        .and_then(Value::as_str)
        .map(unescape_text)
        .unwrap_or_default();
    let mut extra = fields
        .get(6)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let forwarded = extra
        .remove("fwd")
        .and_then(|fwd| fwd.as_str().map(parse_forwarded))
        .unwrap_or_default();

    let from = extra.get("from").and_then(as_i64);
    let (chat_id, user_id) = match from {
        Some(from) if peer_id > CHAT_PEER_OFFSET => (Some(peer_id - CHAT_PEER_OFFSET), from),
        _ => (None, peer_id),
    };

    Some(MessageEvent {
        message_id,
        flags,
        peer_id,
        timestamp,
        subject,
        text,
        extra,
        chat_id,
        user_id,
        forwarded,
    })
}

/// Undo the server's text escaping: `<br>` line breaks and basic HTML entities
pub fn unescape_text(text: &str) -> String {
    text.replace("<br>", "\n")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
