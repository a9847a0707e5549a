/// The three well-known diagnostic queries, built atop the IQ correlator:
/// software version (XEP-0092), service discovery items (XEP-0030), and
/// contact addresses carried in disco#info data forms (XEP-0157).
///
/// Wire decoding is split out into pure functions over the reply element.
use std::sync::Arc;
use std::time::Duration;

use crate::xmpp::iq::{IqCorrelator, IqFault};
use crate::xmpp::jid::Jid;
use crate::xmpp::stanza::{ns, Element};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceVersionInfo {
    pub name: String,
    pub version: String,
    pub os: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceItem {
    pub jid: Jid,
    pub name: Option<String>,
}

/// The contact-address categories standardized by XEP-0157. Data-form
/// fields with any other `var` are deliberately ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactCategory {
    Abuse,
    Admin,
    Feedback,
    Sales,
    Security,
    Status,
    Support,
}

impl ContactCategory {
    pub fn from_var(var: &str) -> Option<Self> {
        match var {
            "abuse-addresses" => Some(Self::Abuse),
            "admin-addresses" => Some(Self::Admin),
            "feedback-addresses" => Some(Self::Feedback),
            "sales-addresses" => Some(Self::Sales),
            "security-addresses" => Some(Self::Security),
            "status-addresses" => Some(Self::Status),
            "support-addresses" => Some(Self::Support),
            _ => None,
        }
    }

    /// Human-readable heading used in replies.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Abuse => "Abuse",
            Self::Admin => "Admin",
            Self::Feedback => "Feedback",
            Self::Sales => "Sales",
            Self::Security => "Security",
            Self::Status => "Status",
            Self::Support => "Support",
        }
    }
}

/// Contact addresses per category, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContactInfo {
    pub entries: Vec<(ContactCategory, Vec<String>)>,
}

impl ContactInfo {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Issues the diagnostic IQs with a common per-request deadline.
pub struct DiagnosticQueries {
    iq: Arc<IqCorrelator>,
    timeout: Duration,
}

impl DiagnosticQueries {
    pub fn new(iq: Arc<IqCorrelator>, timeout: Duration) -> Self {
        Self { iq, timeout }
    }

    /// `jabber:iq:version` query (XEP-0092).
    pub async fn version(&self, service: &Jid) -> Result<ServiceVersionInfo, IqFault> {
        let payload = Element::new("query").attr("xmlns", ns::VERSION);
        let reply = self.iq.request(service, payload, self.timeout).await?;
        Ok(parse_version(&reply))
    }

    /// `disco#items` query (XEP-0030).
    pub async fn items(&self, service: &Jid) -> Result<Vec<ServiceItem>, IqFault> {
        let payload = Element::new("query").attr("xmlns", ns::DISCO_ITEMS);
        let reply = self.iq.request(service, payload, self.timeout).await?;
        Ok(parse_items(&reply))
    }

    /// `disco#info` query, keeping only XEP-0157 contact-address forms.
    pub async fn contact_info(&self, service: &Jid) -> Result<ContactInfo, IqFault> {
        let payload = Element::new("query").attr("xmlns", ns::DISCO_INFO);
        let reply = self.iq.request(service, payload, self.timeout).await?;
        Ok(parse_contact_info(&reply))
    }
}

pub fn parse_version(reply: &Element) -> ServiceVersionInfo {
    let query = reply.find_child_ns("query", ns::VERSION);
    let field = |name: &str| {
        query
            .and_then(|q| q.child_text(name))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    };
    ServiceVersionInfo {
        name: field("name").unwrap_or_else(|| "unknown".to_string()),
        version: field("version").unwrap_or_else(|| "unknown".to_string()),
        os: field("os"),
    }
}

pub fn parse_items(reply: &Element) -> Vec<ServiceItem> {
    let Some(query) = reply.find_child_ns("query", ns::DISCO_ITEMS) else {
        return Vec::new();
    };
    query
        .children_ns("item", ns::DISCO_ITEMS)
        .filter_map(|item| {
            let jid: Jid = item.get_attr("jid")?.parse().ok()?;
            let name = item
                .get_attr("name")
                .map(str::to_string)
                .filter(|n| !n.is_empty());
            Some(ServiceItem { jid, name })
        })
        .collect()
}

pub fn parse_contact_info(reply: &Element) -> ContactInfo {
    let mut info = ContactInfo::default();
    let Some(query) = reply.find_child_ns("query", ns::DISCO_INFO) else {
        return info;
    };
    for form in query.children_ns("x", ns::DATA_FORMS) {
        // Only completed result forms carry server info, by design
        if form.get_attr("type") != Some("result") {
            continue;
        }
        for field in form.children_ns("field", ns::DATA_FORMS) {
            let Some(category) = field.get_attr("var").and_then(ContactCategory::from_var)
            else {
                continue;
            };
            let values: Vec<String> = field
                .children_ns("value", ns::DATA_FORMS)
                .map(|v| v.text_content())
                .filter(|v| !v.is_empty())
                .collect();
            if values.is_empty() {
                continue;
            }
            match info.entries.iter_mut().find(|(c, _)| *c == category) {
                Some((_, existing)) => *existing = values,
                None => info.entries.push((category, values)),
            }
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::stanza::decode;

    #[test]
    fn test_parse_version_with_os() {
        let reply = decode(
            "<iq type='result' from='xmpp.example.com' id='v1'>\
             <query xmlns='jabber:iq:version'>\
             <name>ejabberd</name><version>23.10</version><os>FreeBSD</os>\
             </query></iq>",
        )
        .unwrap();
        assert_eq!(
            parse_version(&reply),
            ServiceVersionInfo {
                name: "ejabberd".to_string(),
                version: "23.10".to_string(),
                os: Some("FreeBSD".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_version_os_optional() {
        let reply = decode(
            "<iq type='result' id='v2'><query xmlns='jabber:iq:version'>\
             <name>Prosody</name><version>0.12</version></query></iq>",
        )
        .unwrap();
        let info = parse_version(&reply);
        assert_eq!(info.name, "Prosody");
        assert_eq!(info.os, None);
    }

    #[test]
    fn test_parse_version_tolerates_missing_fields() {
        let reply = decode("<iq type='result' id='v3'/>").unwrap();
        let info = parse_version(&reply);
        assert_eq!(info.name, "unknown");
        assert_eq!(info.version, "unknown");
    }

    #[test]
    fn test_parse_items_keeps_order() {
        let reply = decode(
            "<iq type='result' id='i1'>\
             <query xmlns='http://jabber.org/protocol/disco#items'>\
             <item jid='muc.example.com' name='Chatrooms'/>\
             <item jid='upload.example.com'/>\
             <item jid='pubsub.example.com' name='Publish-Subscribe'/>\
             </query></iq>",
        )
        .unwrap();
        let items = parse_items(&reply);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].jid.to_string(), "muc.example.com");
        assert_eq!(items[0].name.as_deref(), Some("Chatrooms"));
        assert_eq!(items[1].jid.to_string(), "upload.example.com");
        assert_eq!(items[1].name, None);
        assert_eq!(items[2].name.as_deref(), Some("Publish-Subscribe"));
    }

    #[test]
    fn test_parse_items_skips_unusable_entries() {
        let reply = decode(
            "<iq type='result' id='i2'>\
             <query xmlns='http://jabber.org/protocol/disco#items'>\
             <item name='no jid here'/>\
             <item jid='good.example.com'/>\
             </query></iq>",
        )
        .unwrap();
        let items = parse_items(&reply);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].jid.to_string(), "good.example.com");
    }

    #[test]
    fn test_contact_form_filters_unknown_vars() {
        // Recognized var collected with both values in order; foreign
        // var ignored.
        let reply = decode(
            "<iq type='result' id='c1'>\
             <query xmlns='http://jabber.org/protocol/disco#info'>\
             <identity category='server' type='im'/>\
             <x xmlns='jabber:x:data' type='result'>\
             <field var='FORM_TYPE' type='hidden'>\
             <value>http://jabber.org/network/serverinfo</value></field>\
             <field var='admin-addresses'>\
             <value>mailto:admin@example.com</value>\
             <value>xmpp:admin@example.com</value></field>\
             <field var='irrelevant-field'><value>nope</value></field>\
             </x></query></iq>",
        )
        .unwrap();
        let info = parse_contact_info(&reply);
        assert_eq!(
            info.entries,
            vec![(
                ContactCategory::Admin,
                vec![
                    "mailto:admin@example.com".to_string(),
                    "xmpp:admin@example.com".to_string(),
                ]
            )]
        );
    }

    #[test]
    fn test_contact_ignores_non_result_forms() {
        let reply = decode(
            "<iq type='result' id='c2'>\
             <query xmlns='http://jabber.org/protocol/disco#info'>\
             <x xmlns='jabber:x:data' type='form'>\
             <field var='admin-addresses'><value>mailto:x@y</value></field>\
             </x></query></iq>",
        )
        .unwrap();
        assert!(parse_contact_info(&reply).is_empty());
    }

    #[test]
    fn test_contact_empty_when_no_form() {
        let reply = decode(
            "<iq type='result' id='c3'>\
             <query xmlns='http://jabber.org/protocol/disco#info'>\
             <identity category='server' type='im'/>\
             <feature var='urn:xmpp:ping'/>\
             </query></iq>",
        )
        .unwrap();
        assert!(parse_contact_info(&reply).is_empty());
    }

    #[test]
    fn test_contact_preserves_document_order_of_categories() {
        let reply = decode(
            "<iq type='result' id='c4'>\
             <query xmlns='http://jabber.org/protocol/disco#info'>\
             <x xmlns='jabber:x:data' type='result'>\
             <field var='support-addresses'><value>xmpp:help@example.com</value></field>\
             <field var='abuse-addresses'><value>mailto:abuse@example.com</value></field>\
             </x></query></iq>",
        )
        .unwrap();
        let info = parse_contact_info(&reply);
        assert_eq!(info.entries[0].0, ContactCategory::Support);
        assert_eq!(info.entries[1].0, ContactCategory::Abuse);
    }

    #[test]
    fn test_category_var_round_trip() {
        for (var, title) in [
            ("abuse-addresses", "Abuse"),
            ("admin-addresses", "Admin"),
            ("feedback-addresses", "Feedback"),
            ("sales-addresses", "Sales"),
            ("security-addresses", "Security"),
            ("status-addresses", "Status"),
            ("support-addresses", "Support"),
        ] {
            let category = ContactCategory::from_var(var).unwrap();
            assert_eq!(category.title(), title);
        }
        assert_eq!(ContactCategory::from_var("FORM_TYPE"), None);
    }
}
