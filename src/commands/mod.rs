/// Command parsing and dispatch.
///
/// Any message body starting with the `!xmpp` trigger is an invocation:
/// at most one command token and one free-text argument (a single split —
/// embedded spaces in the argument survive verbatim). Dispatch never
/// fails: unknown commands, missing arguments and query faults all come
/// back as a plain text line.
pub mod queries;

use tracing::debug;

use crate::xmpp::jid::Jid;
use queries::{ContactInfo, DiagnosticQueries, ServiceItem, ServiceVersionInfo};

pub const TRIGGER: &str = "!xmpp";

const PROMPT: &str = "Use \"!xmpp help\" to list all commands.";
const UNKNOWN: &str = "Unknown command. Use \"!xmpp help\" to list all commands.";
const HELP: &str = "Available commands:\n\
                    !xmpp version - shows the version of an XMPP service.\n\
                    !xmpp items - shows the items of an XMPP service.\n\
                    !xmpp contact - shows the contact information of an XMPP service.\n\
                    !xmpp help - displays this message.";
const VERSION_USAGE: &str =
    "!xmpp version - shows the version of an XMPP service.\nUsage: !xmpp version <service>";
const ITEMS_USAGE: &str =
    "!xmpp items - shows the items of an XMPP service.\nUsage: !xmpp items <service>";
const CONTACT_USAGE: &str =
    "!xmpp contact - shows the contact information of an XMPP service.\nUsage: !xmpp contact <service>";

/// Where an invocation came from, deciding where the reply goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOrigin {
    /// A joined MUC room; replies go to the room.
    Groupchat { room: Jid },
    /// A direct chat; replies go back to the sender's full JID.
    Direct { peer: Jid },
}

/// One parsed trigger message. Ephemeral — lives for one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub command: Option<String>,
    pub argument: Option<String>,
    pub origin: CommandOrigin,
}

/// Recognizes the trigger prefix. Returns None for everything else.
pub fn parse_invocation(body: &str, origin: CommandOrigin) -> Option<CommandInvocation> {
    if !body.starts_with(TRIGGER) {
        return None;
    }
    let mut parts = body.splitn(3, ' ');
    let _trigger = parts.next();
    let command = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);
    let argument = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);
    Some(CommandInvocation {
        command,
        argument,
        origin,
    })
}

/// Runs one invocation to a reply string. Query faults are rendered,
/// never propagated.
pub async fn dispatch(invocation: &CommandInvocation, queries: &DiagnosticQueries) -> String {
    let Some(command) = invocation.command.as_deref() else {
        return PROMPT.to_string();
    };
    debug!("dispatching command {command} (argument: {:?})", invocation.argument);
    match command {
        "help" => HELP.to_string(),
        "version" => match invocation.argument.as_deref() {
            None => VERSION_USAGE.to_string(),
            Some(service) => run_version(service, queries).await,
        },
        "items" => match invocation.argument.as_deref() {
            None => ITEMS_USAGE.to_string(),
            Some(service) => run_items(service, queries).await,
        },
        "contact" => match invocation.argument.as_deref() {
            None => CONTACT_USAGE.to_string(),
            Some(service) => run_contact(service, queries).await,
        },
        _ => UNKNOWN.to_string(),
    }
}

async fn run_version(service: &str, queries: &DiagnosticQueries) -> String {
    match service.parse::<Jid>() {
        Err(e) => version_fault(service, e),
        Ok(jid) => match queries.version(&jid).await {
            Ok(info) => format_version(service, &info),
            Err(fault) => version_fault(service, fault),
        },
    }
}

async fn run_items(service: &str, queries: &DiagnosticQueries) -> String {
    match service.parse::<Jid>() {
        Err(e) => items_fault(service, e),
        Ok(jid) => match queries.items(&jid).await {
            Ok(items) => format_items(service, &items),
            Err(fault) => items_fault(service, fault),
        },
    }
}

async fn run_contact(service: &str, queries: &DiagnosticQueries) -> String {
    match service.parse::<Jid>() {
        Err(e) => contact_fault(service, e),
        Ok(jid) => match queries.contact_info(&jid).await {
            Ok(info) => format_contact(service, &info),
            Err(fault) => contact_fault(service, fault),
        },
    }
}

fn version_fault(service: &str, fault: impl std::fmt::Display) -> String {
    format!("Could not retrieve version for {service}: {fault}")
}

fn items_fault(service: &str, fault: impl std::fmt::Display) -> String {
    format!("Could not retrieve items for {service}: {fault}")
}

fn contact_fault(service: &str, fault: impl std::fmt::Display) -> String {
    format!("Could not retrieve contact information for {service}: {fault}")
}

pub fn format_version(service: &str, info: &ServiceVersionInfo) -> String {
    match &info.os {
        Some(os) => format!(
            "{service} is running {} {} on {os}.",
            info.name, info.version
        ),
        None => format!("{service} is running {} {}.", info.name, info.version),
    }
}

pub fn format_items(service: &str, items: &[ServiceItem]) -> String {
    if items.is_empty() {
        return format!("No items found for service {service}.");
    }
    let mut out = format!("Items for service {service}:\n");
    let lines: Vec<String> = items
        .iter()
        .map(|item| match &item.name {
            Some(name) => format!("{} - {name}", item.jid),
            None => item.jid.to_string(),
        })
        .collect();
    out.push_str(&lines.join("\n"));
    out
}

pub fn format_contact(service: &str, info: &ContactInfo) -> String {
    if info.is_empty() {
        return format!("No contact information found for service {service}.");
    }
    let mut out = format!("Contact information for service {service}:\n");
    for (category, values) in &info.entries {
        out.push('\n');
        out.push_str(category.title());
        out.push_str(":\n");
        let lines: Vec<String> = values.iter().map(|v| format!("  - {v}")).collect();
        out.push_str(&lines.join("\n"));
        out.push('\n');
    }
    out
}
