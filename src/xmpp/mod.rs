pub mod iq;
pub mod jid;
pub mod muc;
pub mod sasl;
pub mod session;
pub mod stanza;

use thiserror::Error;

/// Connection-establishment failures, split by whether retrying can help.
#[derive(Debug, Error)]
pub enum XmppError {
    /// Bad local configuration; retrying will not fix it.
    #[error("configuration error: {0}")]
    Config(String),
    /// The server rejected our credentials; retrying will not fix it.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The server violated our expectations of the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Network-level trouble; worth retrying with backoff.
    #[error("connection error: {0}")]
    Transient(String),
}

impl XmppError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, XmppError::Transient(_))
    }
}
