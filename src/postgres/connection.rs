//! The replication transport.
//!
//! [`ReplicationConn`] is the capability the session loop consumes: simple
//! SQL execution, slot creation, the CopyBoth message stream, and
//! standby-status acknowledgement. [`PgReplicationConn`] implements it over
//! `tokio-postgres`.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio_postgres::{Client, Config, CopyBothDuplex, NoTls, SimpleQueryMessage};
use tracing::{debug, error, info, trace};

use super::codec::PG_EPOCH_OFFSET_MICROS;
use super::types::{format_lsn, parse_lsn, Lsn};
use crate::{Error, Result};

/// One message received over the replication stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// XLogData: a WAL fragment carrying one `pgoutput` frame.
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_clock: i64,
        data: Bytes,
    },
    /// Primary keepalive. `reply_requested` demands an immediate standby
    /// status; not replying risks the server dropping the connection.
    Keepalive {
        wal_end: Lsn,
        server_clock: i64,
        reply_requested: bool,
    },
}

impl ServerMessage {
    /// Parses one CopyData payload received in CopyBoth mode.
    pub fn parse(mut buf: Bytes) -> Result<ServerMessage> {
        if buf.is_empty() {
            return Err(Error::Truncated {
                needed: 1,
                remaining: 0,
            });
        }
        let tag = buf.get_u8();
        match tag {
            b'w' => {
                if buf.remaining() < 24 {
                    return Err(Error::Truncated {
                        needed: 24,
                        remaining: buf.remaining(),
                    });
                }
                let wal_start = buf.get_u64();
                let wal_end = buf.get_u64();
                let server_clock = buf.get_i64();
                Ok(ServerMessage::XLogData {
                    wal_start,
                    wal_end,
                    server_clock,
                    data: buf,
                })
            }
            b'k' => {
                if buf.remaining() < 17 {
                    return Err(Error::Truncated {
                        needed: 17,
                        remaining: buf.remaining(),
                    });
                }
                Ok(ServerMessage::Keepalive {
                    wal_end: buf.get_u64(),
                    server_clock: buf.get_i64(),
                    reply_requested: buf.get_u8() != 0,
                })
            }
            other => Err(Error::UnknownMessage(other)),
        }
    }
}

/// Encodes a standby status update. The written, flushed, and applied
/// positions all carry the same LSN.
pub fn encode_standby_status(lsn: Lsn, client_clock: i64, reply_requested: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(lsn);
    buf.put_u64(lsn);
    buf.put_u64(lsn);
    buf.put_i64(client_clock);
    buf.put_u8(reply_requested);
    buf.freeze()
}

/// Microseconds since the PostgreSQL epoch (2000-01-01 UTC), the clock
/// stamped into standby status updates.
pub fn pg_clock_micros() -> i64 {
    Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

/// The replication-mode connection consumed by the session loop.
#[async_trait]
pub trait ReplicationConn: Send {
    /// Executes a statement over the simple-query protocol. Server errors
    /// surface their SQLSTATE through [`Error::sql_state`].
    async fn exec(&mut self, sql: &str) -> Result<()>;

    /// Issues `CREATE_REPLICATION_SLOT <slot> LOGICAL pgoutput`.
    ///
    /// Returns the slot's consistent point, or `None` when the slot already
    /// exists (SQLSTATE 42710), in which case the server resumes from its
    /// stored confirmed flush position.
    async fn create_replication_slot(&mut self, slot: &str) -> Result<Option<Lsn>>;

    /// Enters CopyBoth mode with `START_REPLICATION SLOT … LOGICAL …`.
    async fn start_replication(
        &mut self,
        slot: &str,
        start_lsn: Lsn,
        plugin_args: &[String],
    ) -> Result<()>;

    /// Waits up to `timeout` for the next server message. `Ok(None)` means
    /// the deadline expired with nothing received.
    async fn wait_for_message(&mut self, timeout: Duration) -> Result<Option<ServerMessage>>;

    /// Sends a standby status update acknowledging `lsn`.
    async fn send_standby_status(&mut self, lsn: Lsn, reply_requested: bool) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// `tokio-postgres` implementation of [`ReplicationConn`].
pub struct PgReplicationConn {
    client: Client,
    connection_task: tokio::task::JoinHandle<()>,
    stream: Option<Pin<Box<CopyBothDuplex<Bytes>>>>,
}

impl PgReplicationConn {
    /// Opens a connection in logical replication mode.
    pub async fn connect(connection_string: &str, connect_timeout: Duration) -> Result<Self> {
        // Replication commands are only accepted on a connection opened with
        // replication=database.
        let replication_string = if connection_string.contains("replication=") {
            connection_string.to_string()
        } else if connection_string.contains('?') {
            format!("{connection_string}&replication=database")
        } else {
            format!("{connection_string}?replication=database")
        };
        let mut config = replication_string.parse::<Config>()?;
        config.connect_timeout(connect_timeout);

        let (client, connection) = config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("replication connection error: {e}");
            }
        });

        info!("connected to PostgreSQL in replication mode");

        Ok(Self {
            client,
            connection_task,
            stream: None,
        })
    }
}

#[async_trait]
impl ReplicationConn for PgReplicationConn {
    async fn exec(&mut self, sql: &str) -> Result<()> {
        trace!(sql, "exec");
        self.client.simple_query(sql).await?;
        Ok(())
    }

    async fn create_replication_slot(&mut self, slot: &str) -> Result<Option<Lsn>> {
        let query = format!("CREATE_REPLICATION_SLOT {slot} LOGICAL pgoutput");

        let messages = match self.client.simple_query(&query).await {
            Ok(messages) => messages,
            Err(e) => {
                let err = Error::from(e);
                if err.sql_state() == Some("42710") {
                    debug!(slot, "replication slot already exists");
                    return Ok(None);
                }
                return Err(err);
            }
        };

        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                if let Some(point) = row.try_get("consistent_point")? {
                    let lsn = parse_lsn(point)?;
                    info!(slot, consistent_point = %format_lsn(lsn), "created replication slot");
                    return Ok(Some(lsn));
                }
            }
        }

        Err(Error::Replication(format!(
            "CREATE_REPLICATION_SLOT {slot} returned no consistent point"
        )))
    }

    async fn start_replication(
        &mut self,
        slot: &str,
        start_lsn: Lsn,
        plugin_args: &[String],
    ) -> Result<()> {
        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} ({})",
            slot,
            format_lsn(start_lsn),
            plugin_args.join(", ")
        );
        debug!(query, "starting replication");

        let duplex = self.client.copy_both_simple::<Bytes>(&query).await?;
        self.stream = Some(Box::pin(duplex));

        info!(slot, start_lsn = %format_lsn(start_lsn), "replication started");
        Ok(())
    }

    async fn wait_for_message(&mut self, timeout: Duration) -> Result<Option<ServerMessage>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Replication("replication not started".to_string()))?;

        match tokio::time::timeout(timeout, stream.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(Error::Connection(
                "replication stream closed by server".to_string(),
            )),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(Some(Ok(buf))) => ServerMessage::parse(buf).map(Some),
        }
    }

    async fn send_standby_status(&mut self, lsn: Lsn, reply_requested: bool) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Replication("replication not started".to_string()))?;

        let frame = encode_standby_status(lsn, pg_clock_micros(), u8::from(reply_requested));
        stream.send(frame).await?;
        trace!(lsn = %format_lsn(lsn), "sent standby status");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.as_mut().close().await {
                debug!("error closing replication stream: {e}");
            }
        }
        self.connection_task.abort();
        Ok(())
    }
}
