/// XMPP addresses (RFC 6120 JIDs): `localpart@domain/resource`,
/// localpart and resource optional.
///
/// No stringprep — two JIDs compare equal iff their string forms match,
/// which is all the bot needs (it never mints JIDs, only echoes them).
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum JidError {
    #[error("empty JID")]
    Empty,
    #[error("empty domain in JID")]
    EmptyDomain,
    #[error("empty localpart in JID")]
    EmptyLocal,
    #[error("empty resource in JID")]
    EmptyResource,
}

impl Jid {
    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The JID without its resource part.
    pub fn bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Same JID with the given resource attached.
    pub fn with_resource(&self, resource: &str) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.to_string()),
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(JidError::Empty);
        }

        let (rest, resource) = match s.split_once('/') {
            Some((rest, res)) => {
                if res.is_empty() {
                    return Err(JidError::EmptyResource);
                }
                (rest, Some(res.to_string()))
            }
            None => (s, None),
        };

        let (local, domain) = match rest.split_once('@') {
            Some((local, domain)) => {
                if local.is_empty() {
                    return Err(JidError::EmptyLocal);
                }
                (Some(local.to_string()), domain)
            }
            None => (None, rest),
        };

        if domain.is_empty() {
            return Err(JidError::EmptyDomain);
        }

        Ok(Jid {
            local,
            domain: domain.to_string(),
            resource,
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{local}@")?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}
