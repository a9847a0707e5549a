/// IQ request/response correlation.
///
/// IQ is XMPP's only request/response primitive: every outbound `get`/`set`
/// must be answered by exactly one `result`/`error` carrying the same id.
/// The correlator owns the pending-request table, hands out stream-unique
/// ids, and parks each caller on a oneshot channel until its reply arrives,
/// its deadline expires, or the stream dies.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use super::jid::Jid;
use super::session::XmppCommand;
use super::stanza::{self, Element};

/// Why an IQ request did not produce a result payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IqFault {
    #[error("request timed out")]
    Timeout,
    #[error("{}", remote_description(.condition, .text))]
    Remote {
        /// Defined error condition, e.g. `service-unavailable`.
        condition: String,
        text: Option<String>,
    },
    #[error("connection lost")]
    Disconnected,
}

fn remote_description(condition: &str, text: &Option<String>) -> String {
    match text {
        Some(text) => format!("service returned {condition} ({text})"),
        None => format!("service returned {condition}"),
    }
}

pub struct IqCorrelator {
    /// The only shared mutable state in the core. Waiters are registered
    /// before the send is issued, so a reply can never beat its entry.
    pending: Mutex<HashMap<String, oneshot::Sender<Element>>>,
    counter: AtomicU64,
    /// Random per-stream prefix; the counter alone would collide across
    /// reconnects with a server still flushing old replies.
    prefix: String,
    outbound: mpsc::Sender<XmppCommand>,
}

impl IqCorrelator {
    pub fn new(outbound: mpsc::Sender<XmppCommand>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(1),
            prefix: format!("{:08x}", rand::random::<u32>()),
            outbound,
        }
    }

    /// Stream-unique id for the next outbound IQ.
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }

    /// Sends `<iq type='get'>` with `payload` to `to` and waits for the
    /// correlated reply. Returns the full result element on success.
    ///
    /// Concurrent requests are independent: a slow target holds up only
    /// its own caller, never the receive loop or other requests.
    pub async fn request(
        &self,
        to: &Jid,
        payload: Element,
        timeout: Duration,
    ) -> Result<Element, IqFault> {
        let id = self.next_id();
        let (reply_tx, reply_rx) = oneshot::channel();

        // Register before sending: the reply could otherwise race the entry.
        self.pending.lock().await.insert(id.clone(), reply_tx);

        let iq = stanza::iq_get(&id, to, payload);
        if self.outbound.send(XmppCommand::SendStanza(iq)).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(IqFault::Disconnected);
        }
        debug!("IQ {id} -> {to}, waiting up to {timeout:?}");

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => {
                if reply.get_attr("type") == Some("error") {
                    Err(decode_iq_error(&reply))
                } else {
                    Ok(reply)
                }
            }
            // Sender dropped without a reply: the stream went down and
            // fail_all_disconnected() drained the table.
            Ok(Err(_)) => Err(IqFault::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                warn!("IQ {id} to {to} timed out after {timeout:?}");
                Err(IqFault::Timeout)
            }
        }
    }

    /// Routes an inbound `result`/`error` iq to its waiter. Returns false
    /// when nothing was waiting (late reply after expiry, or an id we
    /// never issued) — such replies are dropped.
    pub async fn resolve(&self, iq: Element) -> bool {
        let Some(id) = iq.get_attr("id").map(str::to_string) else {
            debug!("dropping iq reply without id");
            return false;
        };
        match self.pending.lock().await.remove(&id) {
            Some(waiter) => {
                // A send error just means the waiter timed out between our
                // table lookup and this send; the reply is dropped either way.
                let _ = waiter.send(iq);
                true
            }
            None => {
                debug!("discarding IQ reply with unknown or expired id {id}");
                false
            }
        }
    }

    /// Fails every pending request with `Disconnected`. Called when the
    /// stream is lost so callers do not sit out their full timeouts.
    pub async fn fail_all_disconnected(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            warn!(
                "connection lost with {} IQ request(s) in flight",
                pending.len()
            );
        }
        // Dropping the senders wakes every waiter with a recv error,
        // which request() maps to Disconnected.
        pending.clear();
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Decodes `<error>` out of an iq of type `error`.
fn decode_iq_error(iq: &Element) -> IqFault {
    let Some(error) = iq.find_child("error") else {
        return IqFault::Remote {
            condition: "undefined-condition".to_string(),
            text: None,
        };
    };
    let condition = error
        .child_elements()
        .find(|c| c.name != "text")
        .map(|c| c.name.clone())
        .unwrap_or_else(|| "undefined-condition".to_string());
    let text = error
        .find_child("text")
        .map(|t| t.text_content())
        .filter(|t| !t.is_empty());
    IqFault::Remote { condition, text }
}
