//! Reaction aggregation: merges add/remove events into a message's
//! reaction set. Only ever invoked on entries already present in the
//! store; it never creates or deletes messages.

use crate::types::message::Reaction;
use chrono::{DateTime, Utc};

/// Applies a reaction event. `Some(emoji)` sets the user's reaction,
/// replacing any earlier one (the replacement is a new event, so the entry
/// moves to the tail of the arrival-ordered list). `None` clears it.
///
/// Returns whether the set changed, so duplicate/replayed events are
/// no-ops observers never hear about.
pub fn apply(
    reactions: &mut Vec<Reaction>,
    user_id: &str,
    emoji: Option<String>,
    at: DateTime<Utc>,
) -> bool {
    let existing = reactions.iter().position(|r| r.user_id == user_id);
    match emoji {
        Some(emoji) => {
            if let Some(idx) = existing {
                if reactions[idx].emoji == emoji {
                    // Redelivered event; nothing to change.
                    return false;
                }
                reactions.remove(idx);
            }
            reactions.push(Reaction {
                user_id: user_id.to_owned(),
                emoji,
                reacted_at: at,
            });
            true
        }
        None => match existing {
            Some(idx) => {
                reactions.remove(idx);
                true
            }
            None => false,
        },
    }
}

pub fn find<'a>(reactions: &'a [Reaction], user_id: &str) -> Option<&'a Reaction> {
    reactions.iter().find(|r| r.user_id == user_id)
}
