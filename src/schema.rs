use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CollectorError;

/// Chat identifier as reported by the platform (negative for groups).
pub type ChatId = i64;

/// Message identifier, monotonic per chat.
pub type MessageId = i64;

// ------------------------------------------------------------
// Accounts
// ------------------------------------------------------------

/// Store-assigned account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub i64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Serialized platform session string.
///
/// The only way to build one is `Credential::parse`, which is the
/// validation point at the pool boundary. The value is never printed:
/// `Debug` is redacted and there is no `Display`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    pub fn parse(raw: &str) -> Result<Self, CollectorError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CollectorError::AuthInvalid("empty session string".into()));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(CollectorError::AuthInvalid(
                "session string contains whitespace".into(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<{} bytes>)", self.0.len())
    }
}

/// Last known health of an account's credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Unknown,
    Valid,
    Invalid,
    FloodLimited,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::FloodLimited => "flood_limited",
        }
    }

    /// Status an account ends up in after a failed connect / validation.
    pub fn from_error(err: &CollectorError) -> Self {
        match err {
            CollectorError::AuthInvalid(_) => Self::Invalid,
            CollectorError::RateLimited { .. } => Self::FloodLimited,
            _ => Self::Unknown,
        }
    }
}

impl FromStr for AccountStatus {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "valid" => Ok(Self::Valid),
            "invalid" => Ok(Self::Invalid),
            "flood_limited" => Ok(Self::FloodLimited),
            other => Err(CollectorError::Config(format!("unknown account status '{other}'"))),
        }
    }
}

/// Who the platform says we are, as returned by the login handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// A registered account as persisted in the `accounts` table.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,
    pub credential: Credential,
    pub status: AccountStatus,
    pub validated_at: Option<DateTime<Utc>>,
    pub identity: AccountIdentity,
    pub added_at: DateTime<Utc>,
}

// ------------------------------------------------------------
// Links
// ------------------------------------------------------------

/// Classification families, in precedence order.
///
/// A link carries exactly one tag and the tag is derived from the
/// normalized URL only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkClass {
    TelegramPrivateGroup,
    TelegramPublicGroup,
    WhatsappInvite,
    Other,
}

impl LinkClass {
    pub const ALL: [LinkClass; 4] = [
        Self::TelegramPrivateGroup,
        Self::TelegramPublicGroup,
        Self::WhatsappInvite,
        Self::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TelegramPrivateGroup => "telegram_private_group",
            Self::TelegramPublicGroup => "telegram_public_group",
            Self::WhatsappInvite => "whatsapp_invite",
            Self::Other => "other",
        }
    }
}

impl FromStr for LinkClass {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CollectorError::Config(format!("unknown link class '{s}'")))
    }
}

/// A classified link ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub raw_url: String,
    pub normalized_url: String,
    pub class: LinkClass,
    pub account_id: AccountId,
    pub chat_id: ChatId,
    pub discovered_at: DateTime<Utc>,
}

// ------------------------------------------------------------
// Inbound messages
// ------------------------------------------------------------

/// A new message observed on one of a session's conversations.
///
/// `button_urls` carries the URLs of inline keyboard buttons, which
/// channels commonly use to hide invite links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    #[serde(default = "Utc::now")]
    pub sent_at: DateTime<Utc>,
    pub body: MessageBody,
    #[serde(default)]
    pub button_urls: Vec<String>,
}

/// Closed set of message shapes the collector understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        text: String,
    },
    Attachment {
        #[serde(default)]
        caption: Option<String>,
        attachment: Attachment,
    },
}

impl InboundMessage {
    /// Plain text carried by the message (body text or caption).
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text { text } => Some(text),
            MessageBody::Attachment { caption, .. } => caption.as_deref(),
        }
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        match &self.body {
            MessageBody::Attachment { attachment, .. } => Some(attachment),
            MessageBody::Text { .. } => None,
        }
    }
}

/// File attached to a message. Content is fetched on demand through
/// the owning transport session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}
