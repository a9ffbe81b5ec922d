//! Review server events, as delivered by the stream-events feed or a
//! webhook.
//!
//! Only the fields the engine acts on are modeled. Unknown event types
//! deserialize to [`ReviewEvent::Other`].

use serde::{Deserialize, Deserializer, Serialize};

use crate::review::ChangeNumber;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventChange {
    pub project: String,
    pub branch: String,
    #[serde(deserialize_with = "number_or_string")]
    pub number: ChangeNumber,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub subject: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAccount {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPatchSet {
    #[serde(deserialize_with = "number_or_string")]
    pub number: u64,
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventApproval {
    #[serde(rename = "type")]
    pub label: String,
    pub value: String,
    #[serde(rename = "oldValue", default)]
    pub old_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ReviewEvent {
    PatchsetCreated {
        change: EventChange,
        #[serde(rename = "patchSet")]
        patch_set: EventPatchSet,
        #[serde(default)]
        uploader: Option<EventAccount>,
    },
    TopicChanged {
        change: EventChange,
        #[serde(rename = "oldTopic", default)]
        old_topic: Option<String>,
        #[serde(default)]
        changer: Option<EventAccount>,
    },
    CommentAdded {
        change: EventChange,
        #[serde(default)]
        approvals: Vec<EventApproval>,
        #[serde(default)]
        author: Option<EventAccount>,
    },
    ChangeRestored {
        change: EventChange,
        #[serde(default)]
        restorer: Option<EventAccount>,
    },
    #[serde(other)]
    Other,
}

impl ReviewEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PatchsetCreated { .. } => "patchset-created",
            Self::TopicChanged { .. } => "topic-changed",
            Self::CommentAdded { .. } => "comment-added",
            Self::ChangeRestored { .. } => "change-restored",
            Self::Other => "other",
        }
    }

    pub fn change(&self) -> Option<&EventChange> {
        match self {
            Self::PatchsetCreated { change, .. }
            | Self::TopicChanged { change, .. }
            | Self::CommentAdded { change, .. }
            | Self::ChangeRestored { change, .. } => Some(change),
            Self::Other => None,
        }
    }

    /// The account that caused the event.
    pub fn actor(&self) -> Option<&EventAccount> {
        match self {
            Self::PatchsetCreated { uploader, .. } => uploader.as_ref(),
            Self::TopicChanged { changer, .. } => changer.as_ref(),
            Self::CommentAdded { author, .. } => author.as_ref(),
            Self::ChangeRestored { restorer, .. } => restorer.as_ref(),
            Self::Other => None,
        }
    }

    /// Whether `username` caused this event.
    pub fn is_from(&self, username: &str) -> bool {
        self.actor()
            .and_then(|a| a.username.as_deref())
            .is_some_and(|u| u == username)
    }

    /// Parse one line of the stream-events feed.
    pub fn from_json(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

fn number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
