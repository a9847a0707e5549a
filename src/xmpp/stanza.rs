/// Stanza codec: an ordered XML tree model, an encoder/decoder on top of
/// quick-xml, and builders for everything the bot puts on the wire.
///
/// Namespaces are carried as plain `xmlns` attributes so stanzas from
/// extensions we do not understand pass through opaquely instead of
/// erroring. Element and attribute order is preserved for round-trips.
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use thiserror::Error;

/// Wire namespaces the bot knows about.
pub mod ns {
    pub const VERSION: &str = "jabber:iq:version";
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    pub const DATA_FORMS: &str = "jabber:x:data";
    pub const MUC: &str = "http://jabber.org/protocol/muc";
    pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
    pub const PING: &str = "urn:xmpp:ping";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const STANZA_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("invalid attribute: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),
    #[error("closing tag </{0}> does not match open element")]
    MismatchedClose(String),
    #[error("unexpected closing tag at top level")]
    UnexpectedClose,
    #[error("document ended inside an open element")]
    Truncated,
    #[error("no element found")]
    Empty,
}

/// One node of a stanza payload tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element: qualified name, attributes and children in document order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Element {
            name: name.to_string(),
            ..Default::default()
        }
    }

    // Builder-style constructors, consumed left to right.

    pub fn attr(mut self, key: &str, value: &str) -> Self {
        self.attrs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.children.push(Node::Text(text.to_string()));
        self
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The element's own `xmlns` declaration, if any.
    pub fn xmlns(&self) -> Option<&str> {
        self.get_attr("xmlns")
    }

    /// Child elements in document order.
    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn find_child(&self, name: &str) -> Option<&Element> {
        self.child_elements().find(|e| e.name == name)
    }

    /// Children matching `name` in namespace `ns`. A child without its own
    /// `xmlns` inherits the parent's namespace, so it matches too.
    pub fn children_ns<'s, 'a>(
        &'s self,
        name: &'a str,
        ns: &'a str,
    ) -> impl Iterator<Item = &'s Element> + use<'s, 'a> {
        self.child_elements()
            .filter(move |e| e.name == name && e.xmlns().map_or(true, |x| x == ns))
    }

    pub fn find_child_ns(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children_ns(name, ns).next()
    }

    /// Concatenated text content of direct text children.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// Text content of the first child element with the given name.
    pub fn child_text(&self, name: &str) -> Option<String> {
        self.find_child(name).map(|e| e.text_content())
    }
}

// ── Encoding ─────────────────────────────────────────────

/// Serializes an element tree to its wire form.
pub fn encode(el: &Element) -> String {
    let mut out = String::new();
    write_element(el, &mut out);
    out
}

fn write_element(el: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&el.name);
    for (key, value) in &el.attrs {
        out.push(' ');
        out.push_str(key);
        out.push_str("='");
        out.push_str(&escape(value.as_str()));
        out.push('\'');
    }
    if el.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in &el.children {
        match child {
            Node::Element(e) => write_element(e, out),
            Node::Text(t) => out.push_str(&escape(t.as_str())),
        }
    }
    out.push_str("</");
    out.push_str(&el.name);
    out.push('>');
}

// ── Decoding ─────────────────────────────────────────────

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, ParseError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut el = Element::new(&name);
    for attr in start.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        el.attrs.push((key, value));
    }
    Ok(el)
}

/// Parses a single complete element from a string fragment.
/// Content before the first element (XML declaration, whitespace) is
/// skipped; content after the element's close is ignored.
pub fn decode(input: &str) -> Result<Element, ParseError> {
    let mut reader = quick_xml::Reader::from_str(input);
    reader.config_mut().trim_text(true);
    let mut stack: Vec<Element> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                stack.push(element_from_start(&start)?);
            }
            Event::Empty(start) => {
                let el = element_from_start(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(el)),
                    None => return Ok(el),
                }
            }
            Event::End(end) => {
                let el = stack.pop().ok_or(ParseError::UnexpectedClose)?;
                if end.name().as_ref() != el.name.as_bytes() {
                    let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                    return Err(ParseError::MismatchedClose(name));
                }
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(el)),
                    None => return Ok(el),
                }
            }
            Event::Text(text) => {
                if let Some(parent) = stack.last_mut() {
                    parent
                        .children
                        .push(Node::Text(text.unescape()?.into_owned()));
                }
            }
            Event::CData(data) => {
                if let Some(parent) = stack.last_mut() {
                    let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    parent.children.push(Node::Text(text));
                }
            }
            Event::Eof => {
                if stack.is_empty() {
                    return Err(ParseError::Empty);
                }
                return Err(ParseError::Truncated);
            }
            // Declarations, comments, PIs, doctypes carry nothing we keep
            _ => {}
        }
    }
}

// ── Stanza classification ────────────────────────────────

/// A complete top-level stanza, classified by variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Iq(Element),
    Message(Element),
    Presence(Element),
}

impl Stanza {
    pub fn element(&self) -> &Element {
        match self {
            Stanza::Iq(e) | Stanza::Message(e) | Stanza::Presence(e) => e,
        }
    }

    pub fn from_attr(&self) -> Option<&str> {
        self.element().get_attr("from")
    }

    pub fn to_attr(&self) -> Option<&str> {
        self.element().get_attr("to")
    }

    pub fn id(&self) -> Option<&str> {
        self.element().get_attr("id")
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.element().get_attr("type")
    }
}

// ── Incremental stream parsing ───────────────────────────

/// Items produced by [`StreamParser`] from a live connection.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// `<stream:stream ...>` header from the server, with its stream id.
    StreamOpen { id: Option<String> },
    /// A complete `iq`, `message` or `presence` stanza.
    Stanza(Stanza),
    /// `<stream:error>` — the defined condition element name.
    StreamError(String),
    /// `</stream:stream>` or EOF.
    StreamClosed,
}

const STREAM_TAG: &[u8] = b"stream:stream";

/// Incremental parser fed with quick-xml events from the socket reader.
/// Tracks the open-element stack across reads and emits complete
/// top-level stanzas. Top-level elements other than iq/message/presence/
/// stream:error (e.g. stream features re-sent mid-session) are dropped.
#[derive(Default)]
pub struct StreamParser {
    stack: Vec<Element>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops any partially accumulated stanza, e.g. after a parse fault.
    pub fn reset(&mut self) {
        self.stack.clear();
    }

    pub fn feed(&mut self, event: Event<'_>) -> Result<Option<StreamItem>, ParseError> {
        match event {
            Event::Start(start) => {
                if self.stack.is_empty() && start.name().as_ref() == STREAM_TAG {
                    let el = element_from_start(&start)?;
                    let id = el.get_attr("id").map(str::to_string);
                    return Ok(Some(StreamItem::StreamOpen { id }));
                }
                self.stack.push(element_from_start(&start)?);
                Ok(None)
            }
            Event::Empty(start) => {
                let el = element_from_start(&start)?;
                match self.stack.last_mut() {
                    Some(parent) => {
                        parent.children.push(Node::Element(el));
                        Ok(None)
                    }
                    None => Ok(Self::complete(el)),
                }
            }
            Event::End(end) => {
                if end.name().as_ref() == STREAM_TAG {
                    return Ok(Some(StreamItem::StreamClosed));
                }
                let el = self.stack.pop().ok_or(ParseError::UnexpectedClose)?;
                if end.name().as_ref() != el.name.as_bytes() {
                    let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                    return Err(ParseError::MismatchedClose(name));
                }
                match self.stack.last_mut() {
                    Some(parent) => {
                        parent.children.push(Node::Element(el));
                        Ok(None)
                    }
                    None => Ok(Self::complete(el)),
                }
            }
            Event::Text(text) => {
                // Top-level whitespace is the server's keepalive; ignore it.
                if let Some(parent) = self.stack.last_mut() {
                    parent
                        .children
                        .push(Node::Text(text.unescape()?.into_owned()));
                }
                Ok(None)
            }
            Event::CData(data) => {
                if let Some(parent) = self.stack.last_mut() {
                    let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    parent.children.push(Node::Text(text));
                }
                Ok(None)
            }
            Event::Eof => Ok(Some(StreamItem::StreamClosed)),
            _ => Ok(None),
        }
    }

    fn complete(el: Element) -> Option<StreamItem> {
        match el.name.as_str() {
            "iq" => Some(StreamItem::Stanza(Stanza::Iq(el))),
            "message" => Some(StreamItem::Stanza(Stanza::Message(el))),
            "presence" => Some(StreamItem::Stanza(Stanza::Presence(el))),
            "stream:error" => {
                let condition = el
                    .child_elements()
                    .next()
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| "undefined-condition".to_string());
                Some(StreamItem::StreamError(condition))
            }
            _ => None,
        }
    }
}

// ── Wire builders ────────────────────────────────────────

use super::jid::Jid;

/// Opening tag of a C2S stream. Not an element (it never closes),
/// so it stays a raw string.
pub fn stream_open(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?>\
         <stream:stream \
         xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' \
         to='{domain}' \
         version='1.0'>"
    )
}

pub fn starttls() -> Element {
    Element::new("starttls").attr("xmlns", ns::TLS)
}

pub fn sasl_auth(mechanism: &str, payload_b64: &str) -> Element {
    Element::new("auth")
        .attr("xmlns", ns::SASL)
        .attr("mechanism", mechanism)
        .text(payload_b64)
}

pub fn sasl_response(payload_b64: &str) -> Element {
    Element::new("response").attr("xmlns", ns::SASL).text(payload_b64)
}

/// Resource binding request. Sent before the correlator exists,
/// so it carries a fixed id.
pub const BIND_ID: &str = "bind-1";

pub fn bind_request(resource: &str) -> Element {
    Element::new("iq").attr("type", "set").attr("id", BIND_ID).child(
        Element::new("bind")
            .attr("xmlns", ns::BIND)
            .child(Element::new("resource").text(resource)),
    )
}

pub fn initial_presence() -> Element {
    Element::new("presence")
}

/// Chat or groupchat message. No `from`: the server stamps it in C2S.
pub fn message(to: &Jid, msg_type: &str, body: &str) -> Element {
    Element::new("message")
        .attr("to", &to.to_string())
        .attr("type", msg_type)
        .child(Element::new("body").text(body))
}

/// Directed presence joining a MUC room as `nick` (XEP-0045).
pub fn muc_join(room: &Jid, nick: &str) -> Element {
    Element::new("presence")
        .attr("to", &room.with_resource(nick).to_string())
        .child(Element::new("x").attr("xmlns", ns::MUC))
}

pub fn muc_leave(room: &Jid, nick: &str) -> Element {
    Element::new("presence")
        .attr("to", &room.with_resource(nick).to_string())
        .attr("type", "unavailable")
}

pub fn iq_get(id: &str, to: &Jid, payload: Element) -> Element {
    Element::new("iq")
        .attr("type", "get")
        .attr("id", id)
        .attr("to", &to.to_string())
        .child(payload)
}

/// Empty `result` answering a XEP-0199 ping.
pub fn ping_result(to: &str, id: &str) -> Element {
    Element::new("iq")
        .attr("type", "result")
        .attr("id", id)
        .attr("to", to)
}

/// `service-unavailable` error reply for IQ requests we do not handle.
/// RFC 6120 requires every get/set to be answered.
pub fn service_unavailable(to: &str, id: &str) -> Element {
    Element::new("iq")
        .attr("type", "error")
        .attr("id", id)
        .attr("to", to)
        .child(
            Element::new("error").attr("type", "cancel").child(
                Element::new("service-unavailable").attr("xmlns", ns::STANZA_ERRORS),
            ),
        )
}
