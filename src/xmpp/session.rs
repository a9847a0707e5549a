/// XMPP C2S stream session.
///
/// Owns the TCP/TLS connection and the connection handshake: stream open,
/// mandatory STARTTLS, SASL (SCRAM-SHA-1 preferred, PLAIN fallback),
/// resource bind, initial presence. After that a read task demultiplexes
/// inbound stanzas — IQ replies to the correlator, everything else to the
/// event channel — and a write task drains the command channel. A
/// keepalive task pings the server (XEP-0199) when the stream goes idle
/// and tears the session down when the server stops answering.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{split, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_native_tls::TlsConnector;
use tracing::{debug, error, info, warn};

use super::iq::{IqCorrelator, IqFault};
use super::jid::Jid;
use super::sasl::{self, ScramSha1};
use super::stanza::{self, ns, Element, Stanza, StreamItem, StreamParser};
use super::XmppError;
use crate::config::ServerConfig;

/// Idle time on the inbound stream before we probe with a ping.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
/// How long the server gets to answer a keepalive ping.
const KEEPALIVE_GRACE: Duration = Duration::from_secs(30);
const KEEPALIVE_CHECK_INTERVAL: Duration = Duration::from_secs(15);

const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 100;

/// Events surfaced to the bot runtime.
#[derive(Debug)]
pub enum XmppEvent {
    Message(IncomingMessage),
    Presence { from: Jid, element: Element },
    /// `<stream:error>` condition, e.g. `conflict` or `system-shutdown`.
    StreamError(String),
    ConnectionLost(String),
}

/// Commands from the runtime to the session's write task.
#[derive(Debug)]
pub enum XmppCommand {
    SendStanza(Element),
}

/// A message stanza with a non-blank body.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub from: Jid,
    pub msg_type: String,
    pub body: String,
}

/// An established, authenticated stream.
pub struct Session {
    /// The full JID the server bound us to.
    pub jid: Jid,
    pub events: mpsc::Receiver<XmppEvent>,
    pub commands: mpsc::Sender<XmppCommand>,
    pub iq: Arc<IqCorrelator>,
}

/// Connects and authenticates, then spawns the session tasks.
pub async fn connect(config: &ServerConfig) -> Result<Session, XmppError> {
    let domain = config
        .domain()
        .ok_or_else(|| XmppError::Config(format!("JID has no domain: {}", config.jid)))?
        .to_string();
    let username = config
        .jid
        .split('@')
        .next()
        .unwrap_or_default()
        .to_string();

    let addr = config.addr();
    info!("connecting to {addr}...");
    let mut tcp = TcpStream::connect(&addr)
        .await
        .map_err(|e| XmppError::Transient(format!("TCP connect to {addr}: {e}")))?;

    // --- Plaintext stream open, then STARTTLS ---
    send_raw(&mut tcp, &stanza::stream_open(&domain)).await?;
    let features = read_features(&mut tcp).await?;
    if features.find_child_ns("starttls", ns::TLS).is_none() {
        return Err(XmppError::Protocol(
            "server does not offer STARTTLS, refusing plaintext auth".into(),
        ));
    }
    send_raw(&mut tcp, &stanza::encode(&stanza::starttls())).await?;
    let proceed = read_until(&mut tcp, ">").await?;
    if !proceed.contains("<proceed") {
        return Err(XmppError::Protocol(format!("STARTTLS refused: {proceed}")));
    }

    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(!config.tls_verify)
        .build()
        .map_err(|e| XmppError::Transient(format!("TLS setup: {e}")))?;
    let connector = TlsConnector::from(connector);
    let mut tls = connector
        .connect(&domain, tcp)
        .await
        .map_err(|e| XmppError::Transient(format!("TLS handshake: {e}")))?;
    debug!("TLS established");

    // --- SASL over the encrypted stream ---
    send_raw(&mut tls, &stanza::stream_open(&domain)).await?;
    let features = read_features(&mut tls).await?;
    let mechanisms: Vec<String> = features
        .find_child_ns("mechanisms", ns::SASL)
        .map(|m| {
            m.children_ns("mechanism", ns::SASL)
                .map(|e| e.text_content())
                .collect()
        })
        .unwrap_or_default();
    debug!("SASL mechanisms offered: {mechanisms:?}");

    if mechanisms.iter().any(|m| m == "SCRAM-SHA-1") {
        authenticate_scram(&mut tls, &username, &config.password).await?;
    } else if mechanisms.iter().any(|m| m == "PLAIN") {
        authenticate_plain(&mut tls, &username, &config.password).await?;
    } else {
        return Err(XmppError::Auth(format!(
            "no supported SASL mechanism (offered: {mechanisms:?})"
        )));
    }
    info!("authenticated as {username}@{domain}");

    // --- Post-SASL stream restart, resource bind, presence ---
    send_raw(&mut tls, &stanza::stream_open(&domain)).await?;
    let _features = read_features(&mut tls).await?;

    send_raw(&mut tls, &stanza::encode(&stanza::bind_request(&config.resource))).await?;
    let bind_raw = read_until(&mut tls, "</iq>").await?;
    let bound_jid = parse_fragment(&bind_raw, "iq")
        .and_then(|iq| iq.find_child_ns("bind", ns::BIND)?.child_text("jid"))
        .ok_or_else(|| XmppError::Auth(format!("resource bind failed: {bind_raw}")))?;
    let jid: Jid = bound_jid
        .trim()
        .parse()
        .map_err(|e| XmppError::Protocol(format!("server bound malformed JID: {e}")))?;
    info!("bound as {jid}");

    send_raw(&mut tls, &stanza::encode(&stanza::initial_presence())).await?;

    // --- Session tasks ---
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let iq = Arc::new(IqCorrelator::new(cmd_tx.clone()));
    let clock = Arc::new(ActivityClock::new());

    let shared = Shared {
        iq: iq.clone(),
        event_tx,
        shutdown: shutdown_tx,
    };

    let (reader, writer) = split(tls);
    tokio::spawn(read_loop(
        reader,
        shared.clone(),
        cmd_tx.clone(),
        clock.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(write_loop(writer, cmd_rx, shared.clone(), shutdown_rx.clone()));

    let server_jid: Jid = domain
        .parse()
        .map_err(|e| XmppError::Config(format!("bad domain {domain}: {e}")))?;
    tokio::spawn(keepalive_loop(shared, server_jid, clock, shutdown_rx));

    Ok(Session {
        jid,
        events: event_rx,
        commands: cmd_tx,
        iq,
    })
}

/// Handles shared between the session tasks, plus the teardown path:
/// fail every pending IQ, tell the runtime, stop the sibling tasks.
#[derive(Clone)]
struct Shared {
    iq: Arc<IqCorrelator>,
    event_tx: mpsc::Sender<XmppEvent>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    async fn lost(&self, event: XmppEvent) {
        self.iq.fail_all_disconnected().await;
        let _ = self.event_tx.send(event).await;
        let _ = self.shutdown.send(true);
    }
}

/// Wall-clock of the last inbound stream activity, shared lock-free
/// between the read task and the keepalive task.
struct ActivityClock {
    start: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_ms
            .store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let now = self.start.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

async fn read_loop<R>(
    reader: R,
    shared: Shared,
    cmd_tx: mpsc::Sender<XmppCommand>,
    clock: Arc<ActivityClock>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let buf_reader = tokio::io::BufReader::new(reader);
    let mut xml_reader = quick_xml::Reader::from_reader(buf_reader);
    xml_reader.config_mut().trim_text(true);
    let mut parser = StreamParser::new();
    let mut buf = Vec::new();

    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => return,
            event = xml_reader.read_event_into_async(&mut buf) => event,
        };
        match event {
            Ok(event) => {
                clock.touch();
                match parser.feed(event) {
                    Ok(Some(item)) => {
                        if !handle_item(item, &shared, &cmd_tx).await {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // A bad stanza is dropped; the stream itself continues
                        warn!("dropping malformed stanza: {e}");
                        parser.reset();
                    }
                }
            }
            Err(e) => {
                error!("stream read error: {e}");
                shared
                    .lost(XmppEvent::ConnectionLost(format!("read error: {e}")))
                    .await;
                return;
            }
        }
        buf.clear();
    }
}

/// Demultiplexes one parsed stream item. Returns false when the read loop
/// must stop.
async fn handle_item(
    item: StreamItem,
    shared: &Shared,
    cmd_tx: &mpsc::Sender<XmppCommand>,
) -> bool {
    match item {
        StreamItem::Stanza(Stanza::Iq(el)) => {
            match el.get_attr("type") {
                Some("result") | Some("error") => {
                    shared.iq.resolve(el).await;
                }
                Some("get") | Some("set") => {
                    if let Some(reply) = iq_request_reply(&el) {
                        let _ = cmd_tx.send(XmppCommand::SendStanza(reply)).await;
                    }
                }
                other => debug!("ignoring iq with type {other:?}"),
            }
            true
        }
        StreamItem::Stanza(Stanza::Message(el)) => {
            if let Some(msg) = parse_incoming_message(&el) {
                debug!("message from {}: {}", msg.from, msg.body);
                let _ = shared.event_tx.send(XmppEvent::Message(msg)).await;
            }
            true
        }
        StreamItem::Stanza(Stanza::Presence(el)) => {
            let Some(from) = el.get_attr("from").and_then(|f| f.parse().ok()) else {
                debug!("ignoring presence without usable from");
                return true;
            };
            let _ = shared
                .event_tx
                .send(XmppEvent::Presence { from, element: el })
                .await;
            true
        }
        StreamItem::StreamError(condition) => {
            error!("stream error from server: {condition}");
            shared.lost(XmppEvent::StreamError(condition)).await;
            false
        }
        StreamItem::StreamClosed => {
            warn!("stream closed by server");
            shared
                .lost(XmppEvent::ConnectionLost("stream closed by server".into()))
                .await;
            false
        }
        StreamItem::StreamOpen { .. } => true,
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut cmd_rx: mpsc::Receiver<XmppCommand>,
    shared: Shared,
    mut shutdown: watch::Receiver<bool>,
) where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let cmd = tokio::select! {
            _ = shutdown.changed() => return,
            cmd = cmd_rx.recv() => cmd,
        };
        match cmd {
            Some(XmppCommand::SendStanza(el)) => {
                let xml = stanza::encode(&el);
                if let Err(e) = writer.write_all(xml.as_bytes()).await {
                    error!("stream write error: {e}");
                    shared
                        .lost(XmppEvent::ConnectionLost(format!("write error: {e}")))
                        .await;
                    return;
                }
                debug!("sent: {xml}");
            }
            None => return,
        }
    }
}

/// Pings the server when nothing has been heard for a while. A server
/// that answers at all — even with an error — is alive; only silence
/// past the grace period kills the session.
async fn keepalive_loop(
    shared: Shared,
    server: Jid,
    clock: Arc<ActivityClock>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(KEEPALIVE_CHECK_INTERVAL) => {
                if clock.idle() < KEEPALIVE_IDLE {
                    continue;
                }
                debug!("stream idle for {:?}, pinging {server}", clock.idle());
                let ping = Element::new("ping").attr("xmlns", ns::PING);
                match shared.iq.request(&server, ping, KEEPALIVE_GRACE).await {
                    Ok(_) | Err(IqFault::Remote { .. }) => {}
                    Err(fault) => {
                        warn!("keepalive ping failed: {fault}");
                        shared
                            .lost(XmppEvent::ConnectionLost(format!(
                                "keepalive ping failed: {fault}"
                            )))
                            .await;
                        return;
                    }
                }
            }
        }
    }
}

/// Reply to an inbound IQ request: a pong for XEP-0199 pings, a
/// `service-unavailable` error otherwise (RFC 6120 requires every
/// get/set to be answered). None when the request is unanswerable.
fn iq_request_reply(iq: &Element) -> Option<Element> {
    let id = iq.get_attr("id")?;
    let from = iq.get_attr("from")?;
    if iq.find_child_ns("ping", ns::PING).is_some() {
        debug!("answering ping from {from}");
        Some(stanza::ping_result(from, id))
    } else {
        debug!("answering unhandled iq from {from} with service-unavailable");
        Some(stanza::service_unavailable(from, id))
    }
}

/// Extracts a dispatchable message: parseable sender and a non-blank
/// body. Bodyless stanzas (chat states, subjects, receipts) are dropped.
/// The body itself is kept verbatim — the trigger prefix must match the
/// start of what the sender actually typed.
fn parse_incoming_message(el: &Element) -> Option<IncomingMessage> {
    let msg_type = el.get_attr("type").unwrap_or("normal");
    if msg_type == "error" {
        return None;
    }
    let from: Jid = el.get_attr("from")?.parse().ok()?;
    let body = el.find_child("body")?.text_content();
    if body.trim().is_empty() {
        return None;
    }
    Some(IncomingMessage {
        from,
        msg_type: msg_type.to_string(),
        body,
    })
}

// ── Handshake I/O helpers ────────────────────────────────

async fn send_raw<S: AsyncWriteExt + Unpin>(stream: &mut S, xml: &str) -> Result<(), XmppError> {
    stream
        .write_all(xml.as_bytes())
        .await
        .map_err(|e| XmppError::Transient(format!("handshake write: {e}")))
}

/// Reads until `marker` appears in the accumulated data. Servers split
/// the stream header and features across TCP segments at will.
async fn read_until<S: AsyncReadExt + Unpin>(
    stream: &mut S,
    marker: &str,
) -> Result<String, XmppError> {
    let mut buf = vec![0u8; 8192];
    let mut accumulated = String::new();

    loop {
        let read = stream.read(&mut buf);
        let n = match tokio::time::timeout(HANDSHAKE_READ_TIMEOUT, read).await {
            Ok(Ok(0)) => {
                return Err(XmppError::Transient(format!(
                    "connection closed while waiting for {marker}"
                )))
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(XmppError::Transient(format!("handshake read: {e}"))),
            Err(_) => {
                return Err(XmppError::Transient(format!(
                    "timeout waiting for {marker} (got: {accumulated})"
                )))
            }
        };
        accumulated.push_str(&String::from_utf8_lossy(&buf[..n]));
        if accumulated.contains(marker) {
            return Ok(accumulated);
        }
    }
}

async fn read_features<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<Element, XmppError> {
    let raw = read_until(stream, "</stream:features>").await?;
    parse_fragment(&raw, "stream:features")
        .ok_or_else(|| XmppError::Protocol(format!("malformed stream features: {raw}")))
}

/// Locates `<tag ...>` in raw handshake data and decodes that element.
fn parse_fragment(raw: &str, tag: &str) -> Option<Element> {
    let needle = format!("<{tag}");
    let mut search = 0;
    while let Some(pos) = raw[search..].find(&needle) {
        let start = search + pos;
        let next = raw[start + needle.len()..].chars().next();
        if matches!(next, Some(' ') | Some('>') | Some('/') | Some('\t') | Some('\n')) {
            return stanza::decode(&raw[start..]).ok();
        }
        search = start + needle.len();
    }
    None
}

// ── SASL exchanges ───────────────────────────────────────

/// Reads one complete SASL reply element.
async fn read_sasl_reply<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<String, XmppError> {
    let mut buf = vec![0u8; 8192];
    let mut accumulated = String::new();

    loop {
        let read = stream.read(&mut buf);
        let n = match tokio::time::timeout(HANDSHAKE_READ_TIMEOUT, read).await {
            Ok(Ok(0)) => {
                return Err(XmppError::Transient("connection closed during SASL".into()))
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(XmppError::Transient(format!("SASL read: {e}"))),
            Err(_) => return Err(XmppError::Transient("timeout during SASL".into())),
        };
        accumulated.push_str(&String::from_utf8_lossy(&buf[..n]));
        if accumulated.contains("</challenge>")
            || accumulated.contains("</success>")
            || accumulated.contains("</failure>")
            || accumulated.contains("/>")
        {
            return Ok(accumulated);
        }
    }
}

async fn authenticate_plain<S: AsyncReadExt + AsyncWriteExt + Unpin>(
    stream: &mut S,
    username: &str,
    password: &str,
) -> Result<(), XmppError> {
    let auth = stanza::sasl_auth("PLAIN", &sasl::plain_payload(username, password));
    send_raw(stream, &stanza::encode(&auth)).await?;
    let reply = read_sasl_reply(stream).await?;
    if reply.contains("<success") {
        Ok(())
    } else {
        Err(XmppError::Auth(format!("SASL PLAIN failed: {reply}")))
    }
}

async fn authenticate_scram<S: AsyncReadExt + AsyncWriteExt + Unpin>(
    stream: &mut S,
    username: &str,
    password: &str,
) -> Result<(), XmppError> {
    let scram = ScramSha1::new(username, password);
    let auth = stanza::sasl_auth("SCRAM-SHA-1", &scram.client_first());
    send_raw(stream, &stanza::encode(&auth)).await?;

    let reply = read_sasl_reply(stream).await?;
    if !reply.contains("<challenge") {
        return Err(XmppError::Auth(format!(
            "expected SCRAM challenge, got: {reply}"
        )));
    }
    let challenge = parse_fragment(&reply, "challenge")
        .map(|el| el.text_content())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| XmppError::Auth("empty SCRAM challenge".into()))?;

    let client_final = scram
        .respond(challenge.trim())
        .map_err(|e| XmppError::Auth(format!("SCRAM challenge rejected: {e}")))?;
    send_raw(stream, &stanza::encode(&stanza::sasl_response(&client_final))).await?;

    let reply = read_sasl_reply(stream).await?;
    if reply.contains("<success") {
        Ok(())
    } else {
        Err(XmppError::Auth(format!("SCRAM-SHA-1 failed: {reply}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_incoming_message() {
        let el = stanza::decode(
            "<message from='user@example.com/res' to='bot@example.com' \
             type='chat' id='m1'><body>  hello bot  </body></message>",
        )
        .unwrap();
        let msg = parse_incoming_message(&el).unwrap();
        assert_eq!(msg.from.to_string(), "user@example.com/res");
        assert_eq!(msg.msg_type, "chat");
        assert_eq!(msg.body, "hello bot");
    }

    #[test]
    fn test_body_kept_verbatim() {
        // A body starting with whitespace must reach the command layer
        // unchanged: " !xmpp help" is chatter, not an invocation.
        let el = Element::new("message")
            .attr("from", "user@example.com/r")
            .attr("type", "chat")
            .child(Element::new("body").text(" !xmpp help"));
        assert_eq!(parse_incoming_message(&el).unwrap().body, " !xmpp help");
    }

    #[test]
    fn test_bodyless_messages_dropped() {
        // Chat state notification (XEP-0085)
        let composing = stanza::decode(
            "<message from='user@example.com/r' type='chat'>\
             <composing xmlns='http://jabber.org/protocol/chatstates'/></message>",
        )
        .unwrap();
        assert!(parse_incoming_message(&composing).is_none());

        // Room subject
        let subject = stanza::decode(
            "<message from='room@muc.example.com' type='groupchat'>\
             <subject>today</subject></message>",
        )
        .unwrap();
        assert!(parse_incoming_message(&subject).is_none());

        // Blank body
        let blank = stanza::decode(
            "<message from='user@example.com/r' type='chat'><body>  </body></message>",
        )
        .unwrap();
        assert!(parse_incoming_message(&blank).is_none());
    }

    #[test]
    fn test_error_messages_dropped() {
        let el = stanza::decode(
            "<message from='user@example.com/r' type='error'>\
             <body>!xmpp help</body></message>",
        )
        .unwrap();
        assert!(parse_incoming_message(&el).is_none());
    }

    #[test]
    fn test_default_message_type_is_normal() {
        let el = stanza::decode("<message from='user@example.com'><body>hi</body></message>")
            .unwrap();
        assert_eq!(parse_incoming_message(&el).unwrap().msg_type, "normal");
    }

    #[test]
    fn test_ping_gets_pong() {
        let ping = stanza::decode(
            "<iq from='example.com' to='bot@example.com/res' id='p1' type='get'>\
             <ping xmlns='urn:xmpp:ping'/></iq>",
        )
        .unwrap();
        let reply = iq_request_reply(&ping).unwrap();
        assert_eq!(reply.get_attr("type"), Some("result"));
        assert_eq!(reply.get_attr("id"), Some("p1"));
        assert_eq!(reply.get_attr("to"), Some("example.com"));
        assert!(reply.children.is_empty());
    }

    #[test]
    fn test_unhandled_iq_gets_service_unavailable() {
        let query = stanza::decode(
            "<iq from='peer@example.com/r' id='q9' type='get'>\
             <query xmlns='jabber:iq:last'/></iq>",
        )
        .unwrap();
        let reply = iq_request_reply(&query).unwrap();
        assert_eq!(reply.get_attr("type"), Some("error"));
        assert_eq!(reply.get_attr("id"), Some("q9"));
        assert!(reply
            .find_child("error")
            .and_then(|e| e.find_child_ns("service-unavailable", ns::STANZA_ERRORS))
            .is_some());
    }

    #[test]
    fn test_iq_without_origin_is_unanswerable() {
        let anonymous = stanza::decode("<iq id='x' type='get'><ping xmlns='urn:xmpp:ping'/></iq>")
            .unwrap();
        assert!(iq_request_reply(&anonymous).is_none());
        let no_id = stanza::decode(
            "<iq from='a@b' type='get'><ping xmlns='urn:xmpp:ping'/></iq>",
        )
        .unwrap();
        assert!(iq_request_reply(&no_id).is_none());
    }

    #[test]
    fn test_parse_fragment_skips_prefix_garbage() {
        let raw = "<?xml version='1.0'?><stream:stream id='s'>\
                   <stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>\
                   </stream:features>";
        let features = parse_fragment(raw, "stream:features").unwrap();
        assert!(features.find_child_ns("starttls", ns::TLS).is_some());
        // A tag that only appears as a prefix of another name must not match
        assert!(parse_fragment("<streams:x/>", "stream").is_none());
    }

    #[test]
    fn test_activity_clock_idle() {
        let clock = ActivityClock::new();
        clock.touch();
        assert!(clock.idle() < Duration::from_secs(1));
    }
}
