use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ChatId = String;
pub type UserId = String;

/// Opaque credential issued by the session/auth layer. The chat subsystem
/// only carries it; it never inspects or validates it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(pub String);

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log the token itself.
        write!(f, "Credential(..)")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub blocked: bool,
}

/// A two-party conversation container. The participant pair is fixed at
/// creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub participants: [UserId; 2],
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub settings: ChatSettings,
}

impl Chat {
    /// The other participant, from `me`'s point of view.
    pub fn peer_of(&self, me: &str) -> Option<&UserId> {
        match self.participants.iter().position(|p| p.as_str() == me) {
            Some(idx) => self.participants.get(1 - idx),
            None => None,
        }
    }

    pub fn has_participant(&self, user: &str) -> bool {
        self.participants.iter().any(|p| p.as_str() == user)
    }
}
