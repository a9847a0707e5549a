/// Bot runtime: drives one connected session until the stream dies.
///
/// Joins the configured rooms, then loops over session events. Trigger
/// messages are dispatched on their own tasks so a slow diagnostic target
/// never blocks the event loop; replies go back to the room (groupchat)
/// or to the sender's full JID (direct chat).
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::commands::{self, queries::DiagnosticQueries, CommandOrigin};
use crate::config::Config;
use crate::xmpp::jid::Jid;
use crate::xmpp::muc::{MucEvent, MucManager};
use crate::xmpp::session::{IncomingMessage, Session, XmppCommand, XmppEvent};
use crate::xmpp::stanza;

const JOIN_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// How a session run ended, as seen by the reconnect loop.
#[derive(Debug)]
pub enum DisconnectReason {
    /// Transport-level loss; reconnect with backoff.
    ConnectionLost(String),
    /// Another client took over our resource; reconnecting would just
    /// kick it off again.
    Conflict,
    /// Any other stream-level error from the server.
    StreamError(String),
}

/// Runs the bot over an established session until the stream is lost.
pub async fn run(mut session: Session, config: &Config) -> DisconnectReason {
    let queries = Arc::new(DiagnosticQueries::new(
        session.iq.clone(),
        Duration::from_secs(config.bot.iq_timeout_secs),
    ));
    let mut muc = MucManager::new();
    let nick = config.bot.nick.clone();
    let own_bare = session.jid.bare();

    for room in &config.rooms {
        match room.parse::<Jid>() {
            Ok(room) => {
                if let Some(presence) = muc.join(&room, &nick, Instant::now()) {
                    send(&session.commands, presence).await;
                }
            }
            Err(e) => warn!("skipping unparseable room JID {room}: {e}"),
        }
    }

    let mut join_check = tokio::time::interval(JOIN_CHECK_INTERVAL);
    join_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = session.events.recv() => {
                let Some(event) = event else {
                    return DisconnectReason::ConnectionLost("session channel closed".into());
                };
                match event {
                    XmppEvent::Message(msg) => {
                        handle_message(msg, &muc, &own_bare, &session.commands, &queries);
                    }
                    XmppEvent::Presence { from, element } => {
                        if let Some(event) = muc.handle_presence(&from, &element) {
                            log_muc_event(&event);
                        }
                    }
                    XmppEvent::StreamError(condition) => {
                        return if condition == "conflict" {
                            DisconnectReason::Conflict
                        } else {
                            DisconnectReason::StreamError(condition)
                        };
                    }
                    XmppEvent::ConnectionLost(reason) => {
                        return DisconnectReason::ConnectionLost(reason);
                    }
                }
            }
            _ = join_check.tick() => {
                for room in muc.check_join_timeouts(Instant::now()) {
                    warn!("giving up on room {room}");
                }
            }
        }
    }
}

/// Routes one inbound message to the dispatcher, if it qualifies.
fn handle_message(
    msg: IncomingMessage,
    muc: &MucManager,
    own_bare: &Jid,
    commands_tx: &mpsc::Sender<XmppCommand>,
    queries: &Arc<DiagnosticQueries>,
) {
    let origin = match msg.msg_type.as_str() {
        "groupchat" => {
            if !muc.accepts_groupchat(&msg.from, &msg.body) {
                return;
            }
            CommandOrigin::Groupchat {
                room: msg.from.bare(),
            }
        }
        "chat" | "normal" => {
            // Carbons and server echoes of our own account are not commands
            if msg.from.bare() == *own_bare {
                return;
            }
            CommandOrigin::Direct {
                peer: msg.from.clone(),
            }
        }
        other => {
            debug!("ignoring message of type {other}");
            return;
        }
    };

    // Direct replies mirror the incoming type (chat stays chat,
    // normal stays normal).
    let direct_reply_type = msg.msg_type.clone();

    let Some(invocation) = commands::parse_invocation(&msg.body, origin) else {
        return;
    };

    let commands_tx = commands_tx.clone();
    let queries = queries.clone();
    tokio::spawn(async move {
        let reply = commands::dispatch(&invocation, &queries).await;
        let (to, msg_type) = match &invocation.origin {
            CommandOrigin::Groupchat { room } => (room.clone(), "groupchat".to_string()),
            CommandOrigin::Direct { peer } => (peer.clone(), direct_reply_type),
        };
        let stanza = stanza::message(&to, &msg_type, &reply);
        if commands_tx
            .send(XmppCommand::SendStanza(stanza))
            .await
            .is_err()
        {
            warn!("session gone before reply to {to} could be sent");
        }
    });
}

fn log_muc_event(event: &MucEvent) {
    match event {
        MucEvent::Joined { room } => info!("now in room {room}"),
        MucEvent::JoinFailed { room, condition } => {
            warn!("could not join room {room}: {condition}")
        }
        MucEvent::Left { room } => info!("left room {room}"),
    }
}

async fn send(commands_tx: &mpsc::Sender<XmppCommand>, element: stanza::Element) {
    if commands_tx
        .send(XmppCommand::SendStanza(element))
        .await
        .is_err()
    {
        warn!("session closed while sending");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::muc::RoomState;
    use crate::xmpp::stanza::Element;

    fn joined_muc(room: &str, nick: &str) -> MucManager {
        let mut muc = MucManager::new();
        let room: Jid = room.parse().unwrap();
        muc.join(&room, nick, Instant::now()).unwrap();
        let echo: Jid = room.with_resource(nick);
        muc.handle_presence(&echo, &Element::new("presence"));
        assert_eq!(muc.state(&room), Some(RoomState::Joined));
        muc
    }

    #[tokio::test]
    async fn test_groupchat_reply_targets_room() {
        let muc = joined_muc("ops@muc.example.com", "Bot");
        let own: Jid = "bot@example.com".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let (iq_tx, mut iq_rx) = mpsc::channel(4);
        let queries = Arc::new(DiagnosticQueries::new(
            Arc::new(crate::xmpp::iq::IqCorrelator::new(iq_tx)),
            Duration::from_secs(1),
        ));

        handle_message(
            IncomingMessage {
                from: "ops@muc.example.com/alice".parse().unwrap(),
                msg_type: "groupchat".to_string(),
                body: "!xmpp help".to_string(),
            },
            &muc,
            &own,
            &tx,
            &queries,
        );

        let XmppCommand::SendStanza(reply) = rx.recv().await.unwrap();
        assert_eq!(reply.get_attr("to"), Some("ops@muc.example.com"));
        assert_eq!(reply.get_attr("type"), Some("groupchat"));
        assert!(iq_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_direct_reply_targets_full_jid() {
        let muc = MucManager::new();
        let own: Jid = "bot@example.com".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let (iq_tx, _iq_rx) = mpsc::channel(4);
        let queries = Arc::new(DiagnosticQueries::new(
            Arc::new(crate::xmpp::iq::IqCorrelator::new(iq_tx)),
            Duration::from_secs(1),
        ));

        handle_message(
            IncomingMessage {
                from: "user@example.com/laptop".parse().unwrap(),
                msg_type: "chat".to_string(),
                body: "!xmpp".to_string(),
            },
            &muc,
            &own,
            &tx,
            &queries,
        );

        let XmppCommand::SendStanza(reply) = rx.recv().await.unwrap();
        assert_eq!(reply.get_attr("to"), Some("user@example.com/laptop"));
        assert_eq!(reply.get_attr("type"), Some("chat"));
        assert_eq!(
            reply.find_child("body").map(|b| b.text_content()),
            Some("Use \"!xmpp help\" to list all commands.".to_string())
        );
    }

    #[tokio::test]
    async fn test_normal_reply_mirrors_type() {
        let muc = MucManager::new();
        let own: Jid = "bot@example.com".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let (iq_tx, _iq_rx) = mpsc::channel(4);
        let queries = Arc::new(DiagnosticQueries::new(
            Arc::new(crate::xmpp::iq::IqCorrelator::new(iq_tx)),
            Duration::from_secs(1),
        ));

        handle_message(
            IncomingMessage {
                from: "user@example.com/laptop".parse().unwrap(),
                msg_type: "normal".to_string(),
                body: "!xmpp help".to_string(),
            },
            &muc,
            &own,
            &tx,
            &queries,
        );

        let XmppCommand::SendStanza(reply) = rx.recv().await.unwrap();
        assert_eq!(reply.get_attr("type"), Some("normal"));
    }

    #[tokio::test]
    async fn test_own_account_echo_ignored() {
        let muc = MucManager::new();
        let own: Jid = "bot@example.com".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let (iq_tx, _iq_rx) = mpsc::channel(4);
        let queries = Arc::new(DiagnosticQueries::new(
            Arc::new(crate::xmpp::iq::IqCorrelator::new(iq_tx)),
            Duration::from_secs(1),
        ));

        handle_message(
            IncomingMessage {
                from: "bot@example.com/other-client".parse().unwrap(),
                msg_type: "chat".to_string(),
                body: "!xmpp help".to_string(),
            },
            &muc,
            &own,
            &tx,
            &queries,
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_groupchat_from_unjoined_room_ignored() {
        let muc = MucManager::new();
        let own: Jid = "bot@example.com".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let (iq_tx, _iq_rx) = mpsc::channel(4);
        let queries = Arc::new(DiagnosticQueries::new(
            Arc::new(crate::xmpp::iq::IqCorrelator::new(iq_tx)),
            Duration::from_secs(1),
        ));

        handle_message(
            IncomingMessage {
                from: "stranger@muc.example.com/someone".parse().unwrap(),
                msg_type: "groupchat".to_string(),
                body: "!xmpp help".to_string(),
            },
            &muc,
            &own,
            &tx,
            &queries,
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_non_trigger_chatter_ignored() {
        let muc = joined_muc("ops@muc.example.com", "Bot");
        let own: Jid = "bot@example.com".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let (iq_tx, _iq_rx) = mpsc::channel(4);
        let queries = Arc::new(DiagnosticQueries::new(
            Arc::new(crate::xmpp::iq::IqCorrelator::new(iq_tx)),
            Duration::from_secs(1),
        ));

        handle_message(
            IncomingMessage {
                from: "ops@muc.example.com/alice".parse().unwrap(),
                msg_type: "groupchat".to_string(),
                body: "good morning everyone".to_string(),
            },
            &muc,
            &own,
            &tx,
            &queries,
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
