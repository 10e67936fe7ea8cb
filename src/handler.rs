//! The user-supplied handler capability.

use async_trait::async_trait;
use tracing::{error, info};

use crate::postgres::types::ReplicationEvent;

/// What the handler made of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Applied; the session may acknowledge the transaction.
    Success,
    /// Failed; acknowledgement is withheld and the server replays the
    /// transaction after reconnect.
    Error,
    /// Not applicable to this consumer; acknowledged like a success.
    Ignore,
}

/// Receives decoded row events in commit order.
///
/// The session loop never interrupts a running handler, and never sends a
/// standby status for a transaction whose events have not all succeeded.
#[async_trait]
pub trait DmlHandler: Send {
    async fn handle(&mut self, event: ReplicationEvent) -> HandlerOutcome;
}

/// Logs each event as one JSON line. The default handler of the `pg-relay`
/// binary.
#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl DmlHandler for LogHandler {
    async fn handle(&mut self, event: ReplicationEvent) -> HandlerOutcome {
        match serde_json::to_string(&event) {
            Ok(json) => {
                info!(target: "pg_relay::events", "{json}");
                HandlerOutcome::Success
            }
            Err(e) => {
                error!("failed to serialize event: {e}");
                HandlerOutcome::Error
            }
        }
    }
}
