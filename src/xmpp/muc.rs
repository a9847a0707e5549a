/// Multi-User Chat room state (XEP-0045).
///
/// One state machine per configured room: Joining until the server echoes
/// our own occupant presence, Joined while in the room, Left after a join
/// failure, an explicit leave, or stream loss. Groupchat messages are only
/// handed to the command layer for rooms in Joined, and never for our own
/// nickname — the room reflects everything we say (and replays history),
/// and answering ourselves would loop forever.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::jid::Jid;
use super::stanza::{self, ns, Element};

/// How long a room may sit in Joining before the join is abandoned.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Joining,
    Joined,
    Left,
}

#[derive(Debug)]
struct MucRoom {
    nick: String,
    state: RoomState,
    join_deadline: Option<Instant>,
}

/// State transitions surfaced to the runtime (for logging; none of them
/// crash anything).
#[derive(Debug, Clone, PartialEq)]
pub enum MucEvent {
    Joined { room: Jid },
    JoinFailed { room: Jid, condition: String },
    Left { room: Jid },
}

#[derive(Default)]
pub struct MucManager {
    /// Keyed by bare room JID string.
    rooms: HashMap<String, MucRoom>,
}

impl MucManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a join for `room` as `nick` and returns the presence to send.
    /// Returns None if a join is already in progress or completed.
    pub fn join(&mut self, room: &Jid, nick: &str, now: Instant) -> Option<Element> {
        let key = room.bare().to_string();
        if let Some(existing) = self.rooms.get(&key) {
            if existing.state != RoomState::Left {
                debug!("room {key} already {:?}, not rejoining", existing.state);
                return None;
            }
        }
        info!("joining room {key} as {nick}");
        self.rooms.insert(
            key,
            MucRoom {
                nick: nick.to_string(),
                state: RoomState::Joining,
                join_deadline: Some(now + JOIN_TIMEOUT),
            },
        );
        Some(stanza::muc_join(&room.bare(), nick))
    }

    /// Leaves a joined room; returns the unavailable presence to send.
    pub fn leave(&mut self, room: &Jid) -> Option<Element> {
        let key = room.bare().to_string();
        let entry = self.rooms.get_mut(&key)?;
        if entry.state == RoomState::Left {
            return None;
        }
        info!("leaving room {key}");
        entry.state = RoomState::Left;
        entry.join_deadline = None;
        Some(stanza::muc_leave(&room.bare(), &entry.nick))
    }

    pub fn state(&self, room: &Jid) -> Option<RoomState> {
        self.rooms.get(&room.bare().to_string()).map(|r| r.state)
    }

    /// Applies a presence stanza from a tracked room.
    pub fn handle_presence(&mut self, from: &Jid, presence: &Element) -> Option<MucEvent> {
        let key = from.bare().to_string();
        let entry = self.rooms.get_mut(&key)?;

        let is_self = from.resource() == Some(entry.nick.as_str())
            || has_self_status_code(presence);

        match presence.get_attr("type") {
            Some("error") => {
                if entry.state == RoomState::Joining {
                    let condition = presence
                        .find_child("error")
                        .and_then(|e| e.child_elements().find(|c| c.name != "text"))
                        .map(|c| c.name.clone())
                        .unwrap_or_else(|| "undefined-condition".to_string());
                    warn!("join to {key} failed: {condition}");
                    entry.state = RoomState::Left;
                    entry.join_deadline = None;
                    return Some(MucEvent::JoinFailed {
                        room: from.bare(),
                        condition,
                    });
                }
                None
            }
            Some("unavailable") if is_self => {
                if entry.state != RoomState::Left {
                    entry.state = RoomState::Left;
                    entry.join_deadline = None;
                    return Some(MucEvent::Left { room: from.bare() });
                }
                None
            }
            None if is_self && entry.state == RoomState::Joining => {
                // The room may have assigned us a different nickname; the
                // self-filter must track the one we actually occupy.
                if let Some(assigned) = from.resource() {
                    if assigned != entry.nick {
                        info!("room {key} renamed us from {} to {assigned}", entry.nick);
                        entry.nick = assigned.to_string();
                    }
                }
                info!("joined room {key} as {}", entry.nick);
                entry.state = RoomState::Joined;
                entry.join_deadline = None;
                Some(MucEvent::Joined { room: from.bare() })
            }
            // Other occupants coming and going — nothing we track.
            _ => None,
        }
    }

    /// Expires joins that never completed. Returns the rooms that gave up.
    pub fn check_join_timeouts(&mut self, now: Instant) -> Vec<Jid> {
        let mut expired = Vec::new();
        for (key, room) in &mut self.rooms {
            if room.state == RoomState::Joining {
                if let Some(deadline) = room.join_deadline {
                    if now >= deadline {
                        warn!("join to {key} timed out");
                        room.state = RoomState::Left;
                        room.join_deadline = None;
                        if let Ok(jid) = key.parse() {
                            expired.push(jid);
                        }
                    }
                }
            }
        }
        expired
    }

    /// Whether a groupchat message from `from` should reach the dispatcher:
    /// the room must be Joined, the sender must not be us, and the body
    /// must carry something.
    pub fn accepts_groupchat(&self, from: &Jid, body: &str) -> bool {
        let Some(entry) = self.rooms.get(&from.bare().to_string()) else {
            return false;
        };
        entry.state == RoomState::Joined
            && from.resource() != Some(entry.nick.as_str())
            && !body.trim().is_empty()
    }
}

/// MUC status code 110 marks the occupant's own presence.
fn has_self_status_code(presence: &Element) -> bool {
    presence
        .children_ns("x", ns::MUC_USER)
        .flat_map(|x| x.child_elements())
        .any(|c| c.name == "status" && c.get_attr("code") == Some("110"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_jid() -> Jid {
        "room@muc.example.com".parse().unwrap()
    }

    fn occupant(nick: &str) -> Jid {
        format!("room@muc.example.com/{nick}").parse().unwrap()
    }

    fn available_presence() -> Element {
        Element::new("presence")
    }

    fn self_presence_110() -> Element {
        Element::new("presence").child(
            Element::new("x")
                .attr("xmlns", ns::MUC_USER)
                .child(Element::new("status").attr("code", "110")),
        )
    }

    fn joined_manager(nick: &str) -> MucManager {
        let mut muc = MucManager::new();
        muc.join(&room_jid(), nick, Instant::now()).unwrap();
        muc.handle_presence(&occupant(nick), &available_presence());
        assert_eq!(muc.state(&room_jid()), Some(RoomState::Joined));
        muc
    }

    #[test]
    fn test_join_emits_presence_and_enters_joining() {
        let mut muc = MucManager::new();
        let presence = muc.join(&room_jid(), "Bot", Instant::now()).unwrap();
        assert_eq!(presence.get_attr("to"), Some("room@muc.example.com/Bot"));
        assert_eq!(muc.state(&room_jid()), Some(RoomState::Joining));
        // A second join attempt while Joining is a no-op
        assert!(muc.join(&room_jid(), "Bot", Instant::now()).is_none());
    }

    #[test]
    fn test_self_echo_completes_join() {
        let mut muc = MucManager::new();
        muc.join(&room_jid(), "Bot", Instant::now());
        // Another occupant's presence does not complete the join
        assert!(muc
            .handle_presence(&occupant("alice"), &available_presence())
            .is_none());
        assert_eq!(muc.state(&room_jid()), Some(RoomState::Joining));

        let event = muc
            .handle_presence(&occupant("Bot"), &available_presence())
            .unwrap();
        assert_eq!(event, MucEvent::Joined { room: room_jid() });
        assert_eq!(muc.state(&room_jid()), Some(RoomState::Joined));
    }

    #[test]
    fn test_status_110_completes_join_with_renamed_nick() {
        // Some rooms rename occupants; status 110 still marks the echo as ours
        let mut muc = MucManager::new();
        muc.join(&room_jid(), "Bot", Instant::now());
        let event = muc.handle_presence(&occupant("Bot_2"), &self_presence_110());
        assert_eq!(
            event,
            Some(MucEvent::Joined { room: room_jid() })
        );
    }

    #[test]
    fn test_renamed_nick_still_filters_own_messages() {
        // After a room-side rename, groupchat traffic under the assigned
        // nick is ours and must never reach the dispatcher.
        let mut muc = MucManager::new();
        muc.join(&room_jid(), "Bot", Instant::now());
        muc.handle_presence(&occupant("Bot_2"), &self_presence_110());
        assert_eq!(muc.state(&room_jid()), Some(RoomState::Joined));

        assert!(!muc.accepts_groupchat(&occupant("Bot_2"), "!xmpp help"));
        assert!(muc.accepts_groupchat(&occupant("alice"), "!xmpp help"));
    }

    #[test]
    fn test_error_presence_fails_join() {
        let mut muc = MucManager::new();
        muc.join(&room_jid(), "Bot", Instant::now());
        let error = Element::new("presence").attr("type", "error").child(
            Element::new("error").attr("type", "auth").child(
                Element::new("registration-required")
                    .attr("xmlns", ns::STANZA_ERRORS),
            ),
        );
        let event = muc.handle_presence(&occupant("Bot"), &error).unwrap();
        assert_eq!(
            event,
            MucEvent::JoinFailed {
                room: room_jid(),
                condition: "registration-required".to_string()
            }
        );
        assert_eq!(muc.state(&room_jid()), Some(RoomState::Left));
    }

    #[test]
    fn test_join_timeout_expires_to_left() {
        let mut muc = MucManager::new();
        let start = Instant::now();
        muc.join(&room_jid(), "Bot", start);
        assert!(muc.check_join_timeouts(start + Duration::from_secs(1)).is_empty());
        let expired = muc.check_join_timeouts(start + JOIN_TIMEOUT);
        assert_eq!(expired, vec![room_jid()]);
        assert_eq!(muc.state(&room_jid()), Some(RoomState::Left));
        // Left is terminal until an explicit retry
        assert!(muc.join(&room_jid(), "Bot", Instant::now()).is_some());
    }

    #[test]
    fn test_own_nickname_never_dispatched() {
        let muc = joined_manager("Bot");
        // Even a body carrying the trigger prefix must not come back to us
        assert!(!muc.accepts_groupchat(&occupant("Bot"), "!xmpp version x.example.com"));
        assert!(muc.accepts_groupchat(&occupant("alice"), "!xmpp help"));
    }

    #[test]
    fn test_groupchat_gating_rules() {
        let muc = joined_manager("Bot");
        // Blank bodies are dropped
        assert!(!muc.accepts_groupchat(&occupant("alice"), "   "));
        // Untracked rooms are dropped
        let other: Jid = "other@muc.example.com/alice".parse().unwrap();
        assert!(!muc.accepts_groupchat(&other, "!xmpp help"));
    }

    #[test]
    fn test_not_joined_rooms_drop_messages() {
        let mut muc = MucManager::new();
        muc.join(&room_jid(), "Bot", Instant::now());
        // Still Joining: history replay must not trigger commands
        assert!(!muc.accepts_groupchat(&occupant("alice"), "!xmpp help"));
    }

    #[test]
    fn test_self_unavailable_leaves_room() {
        let mut muc = joined_manager("Bot");
        let unavailable = Element::new("presence").attr("type", "unavailable");
        let event = muc.handle_presence(&occupant("Bot"), &unavailable).unwrap();
        assert_eq!(event, MucEvent::Left { room: room_jid() });
        assert!(!muc.accepts_groupchat(&occupant("alice"), "!xmpp help"));
    }

    #[test]
    fn test_explicit_leave() {
        let mut muc = joined_manager("Bot");
        let presence = muc.leave(&room_jid()).unwrap();
        assert_eq!(presence.get_attr("type"), Some("unavailable"));
        assert_eq!(muc.state(&room_jid()), Some(RoomState::Left));
        assert!(muc.leave(&room_jid()).is_none());
    }

    #[test]
    fn test_presence_from_unknown_room_ignored() {
        let mut muc = MucManager::new();
        let stranger: Jid = "other@muc.example.com/nick".parse().unwrap();
        assert!(muc.handle_presence(&stranger, &available_presence()).is_none());
    }
}
