use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::codec::PgValue;
use crate::{Error, Result};

/// A position in the server's write-ahead log.
pub type Lsn = u64;

/// Renders an LSN in the `XXX/XXX` form used across the wire protocol.
pub fn format_lsn(lsn: Lsn) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// Parses the `XXX/XXX` textual LSN form.
pub fn parse_lsn(s: &str) -> Result<Lsn> {
    let (high, low) = s
        .split_once('/')
        .ok_or_else(|| Error::Replication(format!("invalid LSN {s:?}")))?;
    let high = u64::from_str_radix(high, 16)
        .map_err(|_| Error::Replication(format!("invalid LSN {s:?}")))?;
    let low = u64::from_str_radix(low, 16)
        .map_err(|_| Error::Replication(format!("invalid LSN {s:?}")))?;
    Ok((high << 32) | low)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    /// Synthetic event signalling the stream is live.
    Ready,
    Insert,
    Update,
    Delete,
}

/// The event handed to the user handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicationEvent {
    pub kind: EventKind,
    pub schema: String,
    pub table: String,
    /// Column name to typed value for the new row image. Unchanged-TOAST
    /// columns are absent.
    pub body: HashMap<String, PgValue>,
    /// For updates, the columns whose value differs from the old image.
    pub changed_columns: Vec<String>,
}

impl ReplicationEvent {
    pub(crate) fn ready() -> Self {
        Self {
            kind: EventKind::Ready,
            schema: String::new(),
            table: String::new(),
            body: HashMap::new(),
            changed_columns: Vec::new(),
        }
    }
}
